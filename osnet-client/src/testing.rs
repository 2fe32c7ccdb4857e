//! In-process server fixture for tests.

use crate::{Client, Connection, ConnectionConfig};
use osnet_server::{Server, ServerConfig, StreamRegistry, StreamsConfig};
use std::net::SocketAddr;
use std::sync::Arc;

pub(crate) async fn in_process() -> (Client, Arc<Server>) {
    in_process_with(StreamsConfig::default()).await
}

pub(crate) async fn in_process_with(streams: StreamsConfig) -> (Client, Arc<Server>) {
    let registry = Arc::new(StreamRegistry::new(streams));
    let server = Arc::new(Server::new(ServerConfig::default(), registry));

    let (client_side, server_side) = tokio::io::duplex(256 * 1024);
    let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve_stream(server_side, peer).await;
    });

    let conn = Connection::from_stream(client_side, ConnectionConfig::default())
        .await
        .unwrap();
    (Client::from_connection(conn), server)
}
