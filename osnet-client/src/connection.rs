//! Connection management.

use crate::dispatcher::{Completion, Dispatcher, Resolved};
use crate::error::ClientError;
use crate::stream::ClientStream;
use bytes::{Bytes, BytesMut};
use osnet_protocol::message::{
    from_json_payload, to_json_payload, HandleRef, HelloParams, HelloResult, Notice,
};
use osnet_protocol::{
    Decoder, Encoder, ErrorBody, Frame, MessageType, StreamDescriptor, WireBody, DEFAULT_PORT,
    PROTOCOL_VERSION,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Frames queued for the writer task before senders wait.
const WRITE_QUEUE_DEPTH: usize = 256;

/// Default age after which an unanswered request is failed with `Timeout`.
pub const DEFAULT_PENDING_MAX_AGE: Duration = Duration::from_secs(120);

/// Callback for server-initiated frames. Runs on the receive loop and must not block.
pub type PushHandler = Arc<dyn Fn(Frame) + Send + Sync>;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout used by `send_message`.
    pub request_timeout: Duration,
    /// Client name for HELLO.
    pub client_name: Option<String>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Pending requests older than this are evicted. `None` disables the sweeper.
    pub pending_max_age: Option<Duration>,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client_name: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            pending_max_age: Some(DEFAULT_PENDING_MAX_AGE),
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_pending_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.pending_max_age = max_age;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))
    }
}

/// A connection to an osnet server.
///
/// One background task reads frames off the socket and routes them: replies go
/// to the [`Dispatcher`], pushes go to the handler registered for their type.
/// Any number of tasks may send concurrently through a shared `Arc<Connection>`.
pub struct Connection {
    config: ConnectionConfig,
    /// Queue to the writer task, the only owner of the write half.
    outbound: mpsc::Sender<Outbound>,
    dispatcher: Arc<Dispatcher>,
    push_handlers: Arc<RwLock<HashMap<MessageType, PushHandler>>>,
    connected: Arc<AtomicBool>,
    hello: OnceLock<HelloResult>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Connects to the server at `config.addr` and performs the handshake.
    pub async fn connect(config: ConnectionConfig) -> Result<Arc<Self>, ClientError> {
        tracing::debug!("Connecting to {}...", config.addr);

        let tcp_stream =
            tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
                .await
                .map_err(|_| {
                    tracing::debug!("Connection timeout");
                    ClientError::Timeout
                })?
                .map_err(|e| {
                    tracing::debug!("Connection failed: {}", e);
                    ClientError::Io(e)
                })?;

        tcp_stream.set_nodelay(true).ok();

        Self::from_stream(tcp_stream, config).await
    }

    /// Runs the protocol over an already-established stream.
    pub async fn from_stream(
        stream: impl Into<ClientStream>,
        config: ConnectionConfig,
    ) -> Result<Arc<Self>, ClientError> {
        let (read_half, write_half) = tokio::io::split(stream.into());
        let (outbound, queue) = mpsc::channel(WRITE_QUEUE_DEPTH);

        let conn = Arc::new(Self {
            outbound,
            dispatcher: Arc::new(Dispatcher::new()),
            push_handlers: Arc::new(RwLock::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(true)),
            hello: OnceLock::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            config,
        });

        let writer = WriteLoop {
            writer: write_half,
            queue,
            dispatcher: conn.dispatcher.clone(),
            connected: conn.connected.clone(),
        };

        let receiver = ReceiveLoop {
            reader: read_half,
            buffer_size: conn.config.read_buffer_size,
            dispatcher: conn.dispatcher.clone(),
            push_handlers: conn.push_handlers.clone(),
            connected: conn.connected.clone(),
            outbound: conn.outbound.clone(),
        };

        {
            let mut tasks = conn.tasks.lock();
            tasks.push(tokio::spawn(writer.run()));
            tasks.push(tokio::spawn(receiver.run()));
            if let Some(max_age) = conn.config.pending_max_age {
                tasks.push(tokio::spawn(sweep_expired(conn.dispatcher.clone(), max_age)));
            }
        }

        if let Err(e) = conn.handshake().await {
            let _ = conn.close().await;
            return Err(e);
        }

        Ok(conn)
    }

    async fn handshake(&self) -> Result<(), ClientError> {
        let hello = HelloParams {
            protocol_version: PROTOCOL_VERSION,
            client_name: self.config.client_name.clone(),
        };

        let reply = self
            .send_message(MessageType::Hello, to_json_payload(&hello)?)
            .await?;
        let result: HelloResult = from_json_payload(&reply)?;

        tracing::debug!(
            session_id = %result.session_id,
            server = %result.server_name,
            "Handshake complete"
        );
        let _ = self.hello.set(result);
        Ok(())
    }

    /// Sends a request and returns a handle to wait for its reply.
    pub async fn send(
        &self,
        msg_type: MessageType,
        payload: Bytes,
    ) -> Result<PendingReply, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::ConnectionClosed);
        }

        let (correlation_id, rx) = self.dispatcher.register_next()?;
        let pending = PendingReply {
            correlation_id,
            rx,
            dispatcher: self.dispatcher.clone(),
            completed: false,
        };

        tracing::debug!(correlation_id, %msg_type, len = payload.len(), "Sending request");
        let encoded = Encoder::encode_request(msg_type, correlation_id, payload)?;
        self.write_frame(encoded).await?;

        Ok(pending)
    }

    /// Sends a request and waits for the reply payload, bounded by the request timeout.
    pub async fn send_message(
        &self,
        msg_type: MessageType,
        payload: Bytes,
    ) -> Result<Bytes, ClientError> {
        self.send(msg_type, payload)
            .await?
            .wait_timeout(self.config.request_timeout)
            .await
    }

    /// Sends a frame the server must not answer.
    pub async fn post(&self, msg_type: MessageType, payload: Bytes) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::ConnectionClosed);
        }

        let correlation_id = self.dispatcher.next_correlation_id();
        let encoded = Encoder::encode_oneway(msg_type, correlation_id, payload)?;
        self.write_frame(encoded).await
    }

    /// Queues a frame and waits until it is on the wire.
    ///
    /// Once queued the frame is written whole even if this future is dropped.
    async fn write_frame(&self, bytes: BytesMut) -> Result<(), ClientError> {
        let (written, done) = oneshot::channel();
        self.outbound
            .send(Outbound::Frame {
                bytes,
                written: Some(written),
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        done.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Registers a handler for server-initiated frames of `msg_type`,
    /// replacing any previous one.
    pub fn on_push<F>(&self, msg_type: MessageType, handler: F)
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        self.push_handlers
            .write()
            .insert(msg_type, Arc::new(handler));
    }

    pub fn remove_push_handler(&self, msg_type: MessageType) -> bool {
        self.push_handlers.write().remove(&msg_type).is_some()
    }

    /// Returns the server's handshake reply.
    pub fn hello(&self) -> Option<&HelloResult> {
        self.hello.get()
    }

    /// Returns the session id assigned by the server.
    pub fn session_id(&self) -> Option<&str> {
        self.hello.get().map(|h| h.session_id.as_str())
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes the connection. Pending requests fail with `ConnectionClosed`.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");

        if self.is_connected() {
            let _ = self.post(MessageType::Bye, Bytes::new()).await;
        }
        self.connected.store(false, Ordering::SeqCst);

        let (done_tx, done) = oneshot::channel();
        if self.outbound.send(Outbound::Shutdown(done_tx)).await.is_ok() {
            if tokio::time::timeout(self.config.request_timeout, done).await.is_err() {
                tracing::debug!("Writer did not drain before close");
            }
        }

        let failed = self.dispatcher.fail_all(|| ClientError::ConnectionClosed);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        tracing::debug!(failed, "Connection closed");
        Ok(())
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.dispatcher.pending_count()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispatcher.fail_all(|| ClientError::ConnectionClosed);
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Waitable handle for one in-flight request.
///
/// Dropping it before the reply arrives abandons the request; a reply that
/// shows up afterwards is logged and discarded.
pub struct PendingReply {
    correlation_id: u32,
    rx: oneshot::Receiver<Completion>,
    dispatcher: Arc<Dispatcher>,
    completed: bool,
}

impl PendingReply {
    pub fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    /// Waits for the reply with no deadline other than eviction.
    pub async fn wait(mut self) -> Result<Bytes, ClientError> {
        let completion = (&mut self.rx).await;
        self.completed = true;
        Self::into_payload(completion)
    }

    /// Waits for the reply, abandoning the request after `timeout`.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<Bytes, ClientError> {
        let completion = match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(completion) => completion,
            Err(_) => {
                tracing::debug!(correlation_id = self.correlation_id, "Request timed out");
                return Err(ClientError::Timeout);
            }
        };
        self.completed = true;
        Self::into_payload(completion)
    }

    fn into_payload(
        completion: Result<Completion, oneshot::error::RecvError>,
    ) -> Result<Bytes, ClientError> {
        let frame = completion.map_err(|_| ClientError::ConnectionClosed)??;
        if frame.flags.is_error() {
            let body: ErrorBody = from_json_payload(&frame.payload)?;
            return Err(body.into());
        }
        Ok(frame.payload)
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.completed && self.dispatcher.abandon(self.correlation_id) {
            tracing::debug!(correlation_id = self.correlation_id, "Request abandoned");
        }
    }
}

/// Work for the writer task.
enum Outbound {
    Frame {
        bytes: BytesMut,
        written: Option<oneshot::Sender<Result<(), ClientError>>>,
    },
    /// Flush, shut down the write half and stop.
    Shutdown(oneshot::Sender<()>),
}

fn write_error(e: io::Error) -> ClientError {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => ClientError::ConnectionClosed,
        _ => ClientError::Io(e),
    }
}

/// Background task that owns the write half.
///
/// Frames are written in queue order, each one completely, whether or not
/// the task that queued it is still waiting.
struct WriteLoop {
    writer: WriteHalf<ClientStream>,
    queue: mpsc::Receiver<Outbound>,
    dispatcher: Arc<Dispatcher>,
    connected: Arc<AtomicBool>,
}

impl WriteLoop {
    async fn run(mut self) {
        while let Some(outbound) = self.queue.recv().await {
            match outbound {
                Outbound::Frame { bytes, written } => {
                    let result = self.writer.write_all(&bytes).await;
                    let failed = result.is_err();
                    match (result, written) {
                        (result, Some(written)) => {
                            let _ = written.send(result.map_err(write_error));
                        }
                        (Err(e), None) => tracing::debug!(error = %e, "Queued frame not written"),
                        (Ok(()), None) => {}
                    }
                    if failed {
                        self.connected.store(false, Ordering::SeqCst);
                        let failed = self.dispatcher.fail_all(|| ClientError::ConnectionClosed);
                        tracing::warn!(failed, "write_loop: connection failed");
                        break;
                    }
                }
                Outbound::Shutdown(done) => {
                    let _ = self.writer.shutdown().await;
                    let _ = done.send(());
                    break;
                }
            }
        }
        // Frames still queued are dropped; their senders see ConnectionClosed
        self.queue.close();
        tracing::debug!("write_loop stopped");
    }
}

/// Background task that owns the read half.
struct ReceiveLoop {
    reader: ReadHalf<ClientStream>,
    buffer_size: usize,
    dispatcher: Arc<Dispatcher>,
    push_handlers: Arc<RwLock<HashMap<MessageType, PushHandler>>>,
    connected: Arc<AtomicBool>,
    outbound: mpsc::Sender<Outbound>,
}

impl ReceiveLoop {
    async fn run(mut self) {
        tracing::debug!("read_loop started");
        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; self.buffer_size];

        let reason = 'read: loop {
            let n = match self.reader.read(&mut buf).await {
                Ok(0) => break 'read ClientError::ConnectionClosed,
                Ok(n) => n,
                Err(e) => break 'read ClientError::Io(e),
            };
            decoder.extend(&buf[..n]);

            loop {
                match decoder.decode_frame() {
                    Ok(Some(frame)) => self.dispatch(frame),
                    Ok(None) => break,
                    Err(e) => break 'read ClientError::Protocol(e),
                }
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        let failed = self.dispatcher.fail_all(|| ClientError::ConnectionClosed);
        match reason {
            ClientError::ConnectionClosed => {
                tracing::debug!(failed, "read_loop: connection closed by peer")
            }
            e => tracing::warn!(failed, error = %e, "read_loop: connection failed"),
        }
    }

    fn dispatch(&self, frame: Frame) {
        if frame.flags.is_push() {
            let handler = self.push_handlers.read().get(&frame.msg_type).cloned();
            match handler {
                Some(handler) => handler(frame),
                None if frame.msg_type == MessageType::Notice => log_notice(&frame),
                None => tracing::debug!(msg_type = %frame.msg_type, "No handler for push"),
            }
        } else if frame.flags.is_reply() {
            let correlation_id = frame.correlation_id;
            if let Resolved::Abandoned(frame) = self.dispatcher.resolve(correlation_id, frame) {
                self.release_orphaned_handle(&frame);
            }
        } else {
            tracing::warn!(
                msg_type = %frame.msg_type,
                correlation_id = frame.correlation_id,
                "Ignoring request frame sent by server"
            );
        }
    }
}

impl ReceiveLoop {
    /// Closes a handle the server opened for a request nobody waits for anymore.
    fn release_orphaned_handle(&self, reply: &Frame) {
        if reply.flags.is_error() {
            return;
        }
        let handle_id = match reply.msg_type {
            MessageType::StreamOpen => from_json_payload::<StreamDescriptor>(&reply.payload)
                .map(|descriptor| descriptor.handle_id)
                .ok(),
            MessageType::StreamTest => HandleRef::decode(&reply.payload)
                .map(|handle| handle.handle_id)
                .ok(),
            _ => None,
        };
        let Some(handle_id) = handle_id else {
            return;
        };

        let correlation_id = self.dispatcher.next_correlation_id();
        let bytes = match Encoder::encode_oneway(
            MessageType::StreamClose,
            correlation_id,
            HandleRef { handle_id }.encode(),
        ) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(handle_id, error = %e, "Failed to encode close");
                return;
            }
        };

        tracing::debug!(handle_id, "Closing handle from abandoned open");
        // Never block the receive loop on a full write queue
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let frame = Outbound::Frame {
                bytes,
                written: None,
            };
            if outbound.send(frame).await.is_err() {
                tracing::debug!(handle_id, "Connection gone before orphaned handle was closed");
            }
        });
    }
}

fn log_notice(frame: &Frame) {
    match from_json_payload::<Notice>(&frame.payload) {
        Ok(notice) => tracing::info!(kind = ?notice.kind, "Server notice: {}", notice.message),
        Err(e) => tracing::warn!(error = %e, "Malformed notice"),
    }
}

async fn sweep_expired(dispatcher: Arc<Dispatcher>, max_age: Duration) {
    let period = (max_age / 4).max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if dispatcher.is_closed() {
            break;
        }
        let evicted = dispatcher.evict_expired(max_age);
        if evicted > 0 {
            tracing::warn!(evicted, "Evicted unanswered requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osnet_protocol::message::NoticeKind;
    use osnet_protocol::ErrorCode;
    use tokio::io::DuplexStream;

    struct FakeServer {
        stream: DuplexStream,
        decoder: Decoder,
    }

    impl FakeServer {
        async fn read_frame(&mut self) -> Option<Frame> {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(frame) = self.decoder.decode_frame().unwrap() {
                    return Some(frame);
                }
                let n = self.stream.read(&mut buf).await.ok()?;
                if n == 0 {
                    return None;
                }
                self.decoder.extend(&buf[..n]);
            }
        }

        async fn write(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
        }

        async fn reply(&mut self, request: &Frame, payload: Bytes) {
            let bytes =
                Encoder::encode_reply(request.msg_type, request.correlation_id, payload).unwrap();
            self.write(&bytes).await;
        }
    }

    async fn connect_fake(config: ConnectionConfig) -> (Arc<Connection>, FakeServer) {
        connect_fake_with_capacity(config, 64 * 1024).await
    }

    async fn connect_fake_with_capacity(
        config: ConnectionConfig,
        capacity: usize,
    ) -> (Arc<Connection>, FakeServer) {
        let (client_side, server_side) = tokio::io::duplex(capacity);
        let server = tokio::spawn(async move {
            let mut server = FakeServer {
                stream: server_side,
                decoder: Decoder::new(),
            };
            let hello = server.read_frame().await.unwrap();
            assert_eq!(hello.msg_type, MessageType::Hello);
            let result = HelloResult {
                protocol_version: PROTOCOL_VERSION,
                server_name: "fake".to_string(),
                server_version: "0.0.0".to_string(),
                session_id: "session-1".to_string(),
            };
            server
                .reply(&hello, to_json_payload(&result).unwrap())
                .await;
            server
        });

        let conn = Connection::from_stream(client_side, config).await.unwrap();
        (conn, server.await.unwrap())
    }

    fn custom() -> MessageType {
        MessageType::custom(0x1001).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("127.0.0.1:7420".parse().unwrap());
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.pending_max_age, Some(DEFAULT_PENDING_MAX_AGE));
        assert_eq!(ConnectionConfig::default().addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config = ConnectionConfig::default().with_read_buffer_size(100); // Below minimum
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ConnectionConfig::default().with_read_buffer_size(10 * 1024 * 1024); // Above maximum
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_handshake_records_session() {
        let (conn, _server) = connect_fake(ConnectionConfig::default()).await;
        assert!(conn.is_connected());
        assert_eq!(conn.session_id(), Some("session-1"));
        assert_eq!(conn.hello().unwrap().server_name, "fake");
    }

    #[tokio::test]
    async fn test_replies_out_of_order() {
        let (conn, mut server) = connect_fake(ConnectionConfig::default()).await;

        let mut pending = Vec::new();
        for body in ["a", "b", "c"] {
            pending.push(conn.send(custom(), Bytes::from(body)).await.unwrap());
        }

        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(server.read_frame().await.unwrap());
        }
        for request in requests.iter().rev() {
            let echo = request.payload.clone();
            server.reply(request, echo).await;
        }

        let mut results = Vec::new();
        for reply in pending {
            results.push(reply.wait().await.unwrap());
        }
        assert_eq!(results, vec!["a", "b", "c"]);
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_fails_every_pending_request() {
        let (conn, mut server) = connect_fake(ConnectionConfig::default()).await;

        let mut pending = Vec::new();
        for _ in 0..3 {
            pending.push(conn.send(custom(), Bytes::new()).await.unwrap());
        }
        for _ in 0..3 {
            server.read_frame().await.unwrap();
        }
        assert_eq!(conn.pending_count(), 3);

        drop(server);

        for reply in pending {
            assert!(matches!(
                reply.wait().await,
                Err(ClientError::ConnectionClosed)
            ));
        }
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.send(custom(), Bytes::new()).await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_error_reply_is_typed() {
        let (conn, mut server) = connect_fake(ConnectionConfig::default()).await;

        let reply = conn.send(MessageType::StreamRead, Bytes::new()).await.unwrap();
        let request = server.read_frame().await.unwrap();
        let body = ErrorBody::new(ErrorCode::UnknownHandle, "handle 9 is not open");
        let bytes =
            Encoder::encode_error(request.msg_type, request.correlation_id, &body).unwrap();
        server.write(&bytes).await;

        assert!(matches!(
            reply.wait().await,
            Err(ClientError::UnknownHandle(_))
        ));
        // The connection itself is unaffected
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_timeout_then_late_reply_is_ignored() {
        let config =
            ConnectionConfig::default().with_request_timeout(Duration::from_millis(50));
        let (conn, mut server) = connect_fake(config).await;

        let result = conn.send_message(custom(), Bytes::from("slow")).await;
        assert!(matches!(result, Err(ClientError::Timeout)));
        assert_eq!(conn.pending_count(), 0);

        let late = server.read_frame().await.unwrap();
        server.reply(&late, Bytes::from("late")).await;

        let reply = conn.send(custom(), Bytes::from("next")).await.unwrap();
        let request = server.read_frame().await.unwrap();
        server.reply(&request, Bytes::from("fresh")).await;
        assert_eq!(reply.wait().await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_dropped_pending_reply_is_abandoned() {
        let (conn, _server) = connect_fake(ConnectionConfig::default()).await;
        let reply = conn.send(custom(), Bytes::new()).await.unwrap();
        assert_eq!(conn.pending_count(), 1);
        drop(reply);
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_eviction_sweeper() {
        let config = ConnectionConfig::default()
            .with_pending_max_age(Some(Duration::from_millis(40)));
        let (conn, _server) = connect_fake(config).await;

        let reply = conn.send(custom(), Bytes::new()).await.unwrap();
        assert!(matches!(reply.wait().await, Err(ClientError::Timeout)));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_push_handler_receives_notice() {
        let (conn, mut server) = connect_fake(ConnectionConfig::default()).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.on_push(MessageType::Notice, move |frame| {
            let _ = tx.send(frame);
        });

        let notice = Notice {
            kind: NoticeKind::Message,
            message: "maintenance at noon".to_string(),
        };
        let bytes =
            Encoder::encode_push(MessageType::Notice, to_json_payload(&notice).unwrap()).unwrap();
        server.write(&bytes).await;

        let frame = rx.recv().await.unwrap();
        let parsed: Notice = from_json_payload(&frame.payload).unwrap();
        assert_eq!(parsed.message, "maintenance at noon");
        assert!(conn.remove_push_handler(MessageType::Notice));
    }

    #[tokio::test]
    async fn test_post_sets_no_reply() {
        let (conn, mut server) = connect_fake(ConnectionConfig::default()).await;
        conn.post(MessageType::StreamClose, Bytes::from_static(&[0, 0, 0, 1]))
            .await
            .unwrap();

        let frame = server.read_frame().await.unwrap();
        assert!(frame.flags.is_no_reply());
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_garbage_fails_pending() {
        let (conn, mut server) = connect_fake(ConnectionConfig::default()).await;
        let reply = conn.send(custom(), Bytes::new()).await.unwrap();
        server.read_frame().await.unwrap();

        server.write(&[0u8; 32]).await;
        assert!(matches!(
            reply.wait().await,
            Err(ClientError::ConnectionClosed)
        ));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_cancelled_send_keeps_framing_intact() {
        // Small pipe so the large frame cannot be written in one go
        let (conn, mut server) =
            connect_fake_with_capacity(ConnectionConfig::default(), 1024).await;

        let big = Bytes::from(vec![7u8; 8 * 1024]);
        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), conn.send(custom(), big)).await;
        assert!(cancelled.is_err());
        assert_eq!(conn.pending_count(), 0);

        let pinger = conn.clone();
        let ping = tokio::spawn(async move {
            pinger.send_message(MessageType::Ping, Bytes::new()).await
        });

        let first = server.read_frame().await.unwrap();
        assert_eq!(first.msg_type, custom());
        assert_eq!(first.payload.len(), 8 * 1024);

        let second = server.read_frame().await.unwrap();
        assert_eq!(second.msg_type, MessageType::Ping);
        server.reply(&second, Bytes::new()).await;

        tokio::time::timeout(Duration::from_secs(2), ping)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_late_open_reply_is_closed() {
        let (conn, mut server) = connect_fake(ConnectionConfig::default()).await;

        let pending = conn.send(MessageType::StreamOpen, Bytes::new()).await.unwrap();
        let request = server.read_frame().await.unwrap();
        drop(pending);

        let descriptor = StreamDescriptor {
            handle_id: 42,
            capabilities: osnet_protocol::Capabilities::read_only(),
            length: 0,
            position: 0,
        };
        server
            .reply(&request, to_json_payload(&descriptor).unwrap())
            .await;

        let close = server.read_frame().await.unwrap();
        assert_eq!(close.msg_type, MessageType::StreamClose);
        assert!(close.flags.is_no_reply());
        assert_eq!(HandleRef::decode(&close.payload).unwrap().handle_id, 42);
    }

    #[tokio::test]
    async fn test_close_rejects_later_sends() {
        let (conn, mut server) = connect_fake(ConnectionConfig::default()).await;
        conn.close().await.unwrap();

        let bye = server.read_frame().await.unwrap();
        assert_eq!(bye.msg_type, MessageType::Bye);
        assert!(matches!(
            conn.post(custom(), Bytes::new()).await,
            Err(ClientError::ConnectionClosed)
        ));
    }
}
