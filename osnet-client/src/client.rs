//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use crate::remote::RemoteStream;
use bytes::Bytes;
use osnet_protocol::message::{from_json_payload, HandleRef, InfoResult};
use osnet_protocol::{MessageType, OpenMode, WireBody};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Session handle for an osnet server.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Connects to the server and performs the handshake.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        Ok(Self::from_connection(Connection::connect(config).await?))
    }

    pub fn from_connection(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.conn.session_id()
    }

    // =========================================================================
    // System operations
    // =========================================================================

    /// Pings the server and returns the round-trip time.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let start = Instant::now();
        self.conn.send_message(MessageType::Ping, Bytes::new()).await?;
        Ok(start.elapsed())
    }

    /// Gets server info.
    pub async fn info(&self) -> Result<InfoResult, ClientError> {
        let reply = self.conn.send_message(MessageType::Info, Bytes::new()).await?;
        Ok(from_json_payload(&reply)?)
    }

    /// Sends an arbitrary request and returns the raw reply payload.
    pub async fn send_message(
        &self,
        msg_type: MessageType,
        payload: Bytes,
    ) -> Result<Bytes, ClientError> {
        self.conn.send_message(msg_type, payload).await
    }

    // =========================================================================
    // Remote streams
    // =========================================================================

    /// Opens a stream on the server. See the server's resource locators.
    pub async fn open_stream(
        &self,
        locator: &str,
        mode: OpenMode,
    ) -> Result<RemoteStream, ClientError> {
        RemoteStream::open(self.conn.clone(), locator, mode).await
    }

    /// Attaches to a handle the server opened on this session's behalf.
    pub async fn attach_stream(&self, handle_id: u32) -> Result<RemoteStream, ClientError> {
        RemoteStream::attach(self.conn.clone(), handle_id).await
    }

    /// Asks the server for its diagnostic test stream and attaches to it.
    pub async fn stream_test(&self) -> Result<RemoteStream, ClientError> {
        let reply = self
            .conn
            .send_message(MessageType::StreamTest, Bytes::new())
            .await?;
        let handle = HandleRef::decode(&reply)?;
        self.attach_stream(handle.handle_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::in_process;
    use osnet_protocol::{ErrorCode, PROTOCOL_VERSION};

    #[tokio::test]
    async fn test_ping_and_info() {
        let (client, _server) = in_process().await;

        client.ping().await.unwrap();
        let info = client.info().await.unwrap();
        assert_eq!(info.server_name, "osnet");
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
        assert_eq!(info.open_handles, 0);

        let _stream = client.stream_test().await.unwrap();
        assert_eq!(client.info().await.unwrap().open_handles, 1);
    }

    #[tokio::test]
    async fn test_session_id_assigned() {
        let (client, _server) = in_process().await;
        let session_id = client.session_id().unwrap();
        assert!(!session_id.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_custom_type() {
        let (client, _server) = in_process().await;

        let err = client
            .send_message(MessageType::custom(0x2000).unwrap(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::ServerError {
                code: ErrorCode::UnknownMessageType,
                ..
            }
        ));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_requests_on_shared_client() {
        let (client, _server) = in_process().await;

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let mut stream = client.stream_test().await.unwrap();
                let length = stream.length() as usize;
                stream.read_exact_len(length).await.unwrap().len()
            }));
        }

        let expected = client.stream_test().await.unwrap().length() as usize;
        for task in tasks {
            assert_eq!(task.await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_close_then_requests_fail() {
        let (client, _server) = in_process().await;
        client.close().await.unwrap();

        assert!(!client.is_connected());
        assert!(matches!(
            client.ping().await,
            Err(ClientError::ConnectionClosed)
        ));
    }
}
