//! TCP server implementation.

use crate::error::ServerError;
use crate::handler::CommandHandler;
use crate::metrics::Metrics;
use crate::registry::StreamRegistry;
use crate::session::{Session, SessionState};
use crate::stream::ServerStream;
use osnet_protocol::message::{to_json_payload, Notice, NoticeKind};
use osnet_protocol::{Decoder, ErrorBody, ErrorCode, Frame, MessageType, DEFAULT_PORT};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(300),
            max_connections: 1000,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// The osnet server.
pub struct Server {
    config: ServerConfig,
    handler: Arc<CommandHandler>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

/// Everything a connection task needs, detached from the `Server` borrow.
#[derive(Clone)]
struct ConnectionContext {
    config: ServerConfig,
    handler: Arc<CommandHandler>,
    stats: Arc<ServerStats>,
}

/// How a connection loop ended.
enum Exit {
    PeerClosed,
    Bye,
    Idle,
    Shutdown,
}

impl Server {
    /// Creates a new server serving streams from `registry`.
    pub fn new(config: ServerConfig, registry: Arc<StreamRegistry>) -> Self {
        let mut handler = CommandHandler::new(registry);
        if let Some(ref metrics) = config.metrics {
            handler = handler.with_metrics(metrics.clone());
        }
        Self::with_handler(config, handler)
    }

    /// Creates a server around a prepared handler.
    pub fn with_handler(config: ServerConfig, handler: CommandHandler) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            handler: Arc::new(handler),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Returns the request handler, e.g. to register custom message types.
    pub fn handler(&self) -> &Arc<CommandHandler> {
        &self.handler
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        self.handler.registry()
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            config: self.config.clone(),
            handler: self.handler.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Binds the configured address and runs until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Accepts connections on `listener` until shutdown.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                if let Some(ref metrics) = self.config.metrics {
                                    metrics.connections_rejected_total.inc();
                                }
                                continue;
                            }

                            if let Err(e) = tcp_stream.set_nodelay(true) {
                                tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
                            }

                            let ctx = self.context();
                            let conn_shutdown = self.shutdown.subscribe();
                            tokio::spawn(async move {
                                let _ = ctx.serve(tcp_stream.into(), addr, conn_shutdown).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Serves one already established connection until it ends.
    ///
    /// Used for in-process peers; accepted TCP connections go through the same path.
    pub async fn serve_stream(
        &self,
        stream: impl Into<ServerStream>,
        peer: SocketAddr,
    ) -> Result<(), ServerError> {
        let shutdown = self.shutdown.subscribe();
        self.context().serve(stream.into(), peer, shutdown).await
    }

    /// Initiates server shutdown. Live sessions get a NOTICE before they close.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

impl ConnectionContext {
    async fn serve(
        self,
        stream: ServerStream,
        addr: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }

        let transport = if stream.is_tcp() { "tcp" } else { "in-process" };
        tracing::info!("Client connected: {} ({})", addr, transport);

        let mut session = Session::new(addr);
        let result = self
            .handle_connection(stream, &mut session, &mut shutdown)
            .await;

        let released = self.handler.registry().close_session(&session.id);
        if released > 0 {
            tracing::debug!("[{}] Released {} stream handles", addr, released);
        }

        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.connections_active.dec();
        }

        match result {
            Ok(exit) => {
                let reason = match exit {
                    Exit::PeerClosed => "closed by client",
                    Exit::Bye => "bye",
                    Exit::Idle => "idle timeout",
                    Exit::Shutdown => "server shutdown",
                };
                tracing::info!(
                    "Client disconnected: {} ({}, {} requests in {:?})",
                    addr,
                    reason,
                    session.request_count(),
                    session.age()
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Connection {} failed: {}", addr, e);
                self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn handle_connection(
        &self,
        mut stream: ServerStream,
        session: &mut Session,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Exit, ServerError> {
        let addr = session.remote_addr;
        let idle_timeout = self.config.idle_timeout;
        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => return Ok(Exit::PeerClosed),
                        Ok(n) => {
                            tracing::trace!("[{}] Received {} bytes", addr, n);
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => return Err(ServerError::Io(e)),
                    }
                }

                _ = tokio::time::sleep(idle_timeout) => {
                    if session.idle_duration() >= idle_timeout {
                        tracing::debug!("[{}] Idle timeout", addr);
                        send_notice(&mut stream, NoticeKind::IdleTimeout, "session idle for too long").await;
                        return Ok(Exit::Idle);
                    }
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    send_notice(&mut stream, NoticeKind::Shutdown, "server shutting down").await;
                    let _ = stream.shutdown().await;
                    return Ok(Exit::Shutdown);
                }
            }

            // Frames are handled in arrival order, one at a time
            while let Some(frame) = decoder.decode_frame()? {
                self.stats.requests_total.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "[{}] Request: {} (id={}, {} bytes)",
                    addr,
                    frame.msg_type,
                    frame.correlation_id,
                    frame.payload.len()
                );

                if let Some(reply) = self.handler.handle(session, &frame).await? {
                    let bytes = match reply.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::warn!("[{}] Reply to {} not encodable: {}", addr, frame.msg_type, e);
                            let body = ErrorBody::new(ErrorCode::InternalError, e.to_string());
                            Frame::error(frame.msg_type, frame.correlation_id, &body)?.encode()?
                        }
                    };
                    stream.write_all(&bytes).await?;
                }

                if session.state() == SessionState::Closing {
                    tracing::debug!("[{}] Session closing", addr);
                    let _ = stream.shutdown().await;
                    return Ok(Exit::Bye);
                }
            }
        }
    }
}

/// Best-effort push telling the client why its connection is about to close.
async fn send_notice(stream: &mut ServerStream, kind: NoticeKind, message: &str) {
    let notice = Notice {
        kind,
        message: message.to_string(),
    };
    let encoded = to_json_payload(&notice)
        .and_then(|payload| Frame::push(MessageType::Notice, payload).encode());
    match encoded {
        Ok(bytes) => {
            if let Err(e) = stream.write_all(&bytes).await {
                tracing::debug!("Failed to deliver notice: {}", e);
            }
        }
        Err(e) => tracing::warn!("Failed to encode notice: {}", e),
    }
}
