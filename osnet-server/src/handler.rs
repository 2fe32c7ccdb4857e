//! Request routing.
//!
//! Maps each incoming frame's message type to its handler and turns the
//! outcome into a reply frame carrying the same correlation id.

use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::registry::StreamRegistry;
use crate::resource::{Locator, Resource};
use crate::session::{Session, SessionState};
use bytes::Bytes;
use osnet_protocol::message::{
    from_json_payload, to_json_payload, HandleRef, HelloParams, HelloResult, InfoResult,
    OpenParams, ReadRequest, SeekRequest, SeekResult, WriteRequest, WriteResult,
};
use osnet_protocol::{
    Capabilities, Frame, MessageType, WireBody, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Server identity reported by HELLO and INFO.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "osnet".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Handler for an application-defined message type.
///
/// Receives the raw request payload and returns the raw reply payload.
pub type CustomHandler = Arc<dyn Fn(&Session, Bytes) -> Result<Bytes, ServerError> + Send + Sync>;

/// Command handler.
pub struct CommandHandler {
    info: ServerInfo,
    registry: Arc<StreamRegistry>,
    custom: RwLock<HashMap<MessageType, CustomHandler>>,
    /// Metrics for request tracking.
    metrics: Option<Arc<Metrics>>,
}

impl CommandHandler {
    /// Creates a new command handler.
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        Self::with_info(registry, ServerInfo::default())
    }

    /// Creates a new command handler with custom server info.
    pub fn with_info(registry: Arc<StreamRegistry>, info: ServerInfo) -> Self {
        Self {
            info,
            registry,
            custom: RwLock::new(HashMap::new()),
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Routes `msg_type` to `handler`. Only custom message types can be registered.
    ///
    /// Replaces any handler previously registered for the same type.
    pub fn register_handler<F>(&self, msg_type: MessageType, handler: F) -> Result<(), ServerError>
    where
        F: Fn(&Session, Bytes) -> Result<Bytes, ServerError> + Send + Sync + 'static,
    {
        if !matches!(msg_type, MessageType::Custom(_)) {
            return Err(ServerError::InvalidRequest(format!(
                "{} is a built-in message type",
                msg_type
            )));
        }
        self.custom.write().insert(msg_type, Arc::new(handler));
        Ok(())
    }

    /// Removes a custom handler. Returns whether one was registered.
    pub fn unregister_handler(&self, msg_type: MessageType) -> bool {
        self.custom.write().remove(&msg_type).is_some()
    }

    /// Handles one request frame.
    ///
    /// Returns the reply frame, or `None` when the request asked for no reply.
    /// Request failures become error replies; `Err` means the reply itself
    /// could not be built.
    pub async fn handle(
        &self,
        session: &mut Session,
        frame: &Frame,
    ) -> Result<Option<Frame>, ServerError> {
        if frame.flags.is_reply() || frame.flags.is_push() {
            tracing::warn!(
                session_id = %session.id,
                msg_type = %frame.msg_type,
                "Ignoring reply or push frame sent by client"
            );
            return Ok(None);
        }

        session.record_request();
        let type_name = frame.msg_type.name();
        let timer = self.metrics.as_ref().map(|m| {
            m.request_duration
                .with_label_values(&[type_name])
                .start_timer()
        });

        let result = self.dispatch(session, frame).await;

        if let Some(ref metrics) = self.metrics {
            metrics.requests_total.with_label_values(&[type_name]).inc();
            if let Err(ref e) = result {
                let code = e.error_code().to_string();
                metrics.errors_total.with_label_values(&[code.as_str()]).inc();
            }
        }
        drop(timer);

        if frame.flags.is_no_reply() {
            if let Err(e) = result {
                tracing::debug!(
                    session_id = %session.id,
                    msg_type = %frame.msg_type,
                    error = %e,
                    "One-way request failed"
                );
            }
            return Ok(None);
        }

        let reply = match result {
            Ok(payload) => Frame::reply(frame.msg_type, frame.correlation_id, payload),
            Err(e) => {
                tracing::debug!(
                    session_id = %session.id,
                    msg_type = %frame.msg_type,
                    correlation_id = frame.correlation_id,
                    error = %e,
                    "Request failed"
                );
                Frame::error(frame.msg_type, frame.correlation_id, &e.to_error_body())?
            }
        };
        Ok(Some(reply))
    }

    async fn dispatch(&self, session: &mut Session, frame: &Frame) -> Result<Bytes, ServerError> {
        let payload = &frame.payload;

        if !session.is_ready()
            && !matches!(
                frame.msg_type,
                MessageType::Hello | MessageType::Ping | MessageType::Bye
            )
        {
            return Err(ServerError::HandshakeRequired(frame.msg_type));
        }

        match frame.msg_type {
            MessageType::Hello => self.handle_hello(session, payload),
            MessageType::Ping => Ok(Bytes::new()),
            MessageType::Bye => {
                session.set_state(SessionState::Closing);
                Ok(Bytes::new())
            }
            MessageType::Info => self.handle_info(session),
            MessageType::StreamTest => self.handle_stream_test(session),
            MessageType::StreamOpen => self.handle_stream_open(session, payload).await,
            MessageType::StreamRead => self.handle_stream_read(session, payload).await,
            MessageType::StreamWrite => self.handle_stream_write(session, payload).await,
            MessageType::StreamSeek => self.handle_stream_seek(session, payload).await,
            MessageType::StreamInfo => self.handle_stream_info(session, payload).await,
            MessageType::StreamClose => self.handle_stream_close(session, payload),
            MessageType::Custom(_) => {
                // Cloned out so the handler runs without holding the lock
                let handler = self.custom.read().get(&frame.msg_type).cloned();
                match handler {
                    Some(handler) => handler(session, payload.clone()),
                    None => Err(ServerError::UnknownMessageType(frame.msg_type)),
                }
            }
            MessageType::Notice => Err(ServerError::UnknownMessageType(frame.msg_type)),
        }
    }

    fn handle_hello(&self, session: &mut Session, payload: &[u8]) -> Result<Bytes, ServerError> {
        if session.is_ready() {
            return Err(ServerError::InvalidRequest(
                "handshake already completed".to_string(),
            ));
        }

        let hello: HelloParams = from_json_payload(payload)?;
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::UnsupportedProtocol(hello.protocol_version));
        }

        session.complete_handshake(hello.protocol_version, hello.client_name);
        tracing::debug!(
            session_id = %session.id,
            client = session.client_name().unwrap_or("-"),
            "Handshake complete"
        );

        let result = HelloResult {
            protocol_version: PROTOCOL_VERSION,
            server_name: self.info.name.clone(),
            server_version: self.info.version.clone(),
            session_id: session.id.clone(),
        };
        Ok(to_json_payload(&result)?)
    }

    fn handle_info(&self, session: &Session) -> Result<Bytes, ServerError> {
        let result = InfoResult {
            server_name: self.info.name.clone(),
            server_version: self.info.version.clone(),
            protocol_version: PROTOCOL_VERSION,
            max_payload_bytes: MAX_PAYLOAD_SIZE,
            max_read_chunk: self.registry.config().max_read_chunk,
            open_handles: self.registry.session_handle_count(&session.id),
        };
        Ok(to_json_payload(&result)?)
    }

    fn handle_stream_test(&self, session: &Session) -> Result<Bytes, ServerError> {
        let handle_id =
            self.registry
                .register(&session.id, Resource::test_stream(), Capabilities::read_only())?;
        tracing::debug!(session_id = %session.id, handle_id, "Opened test stream");
        Ok(HandleRef { handle_id }.encode())
    }

    /// Runs a registry call, on the blocking pool when it touches the filesystem.
    async fn with_registry<T, F>(&self, blocking: bool, op: F) -> Result<T, ServerError>
    where
        F: FnOnce(&StreamRegistry) -> Result<T, ServerError> + Send + 'static,
        T: Send + 'static,
    {
        if !blocking {
            return op(&self.registry);
        }
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || op(&registry))
            .await
            .map_err(|e| ServerError::Handler(format!("stream task failed: {}", e)))?
    }

    async fn handle_stream_open(
        &self,
        session: &Session,
        payload: &[u8],
    ) -> Result<Bytes, ServerError> {
        let params: OpenParams = from_json_payload(payload)?;
        let blocking = matches!(Locator::parse(&params.locator), Ok(Locator::File(_)));
        let owner = session.id.clone();
        let descriptor = self
            .with_registry(blocking, move |registry| {
                registry.open(&owner, &params.locator, params.mode)
            })
            .await?;
        Ok(to_json_payload(&descriptor)?)
    }

    async fn handle_stream_read(
        &self,
        session: &Session,
        payload: &[u8],
    ) -> Result<Bytes, ServerError> {
        let request = ReadRequest::decode(payload)?;
        let blocking = self.registry.is_file_backed(request.handle_id);
        let owner = session.id.clone();
        self.with_registry(blocking, move |registry| {
            registry.read_at(&owner, request.handle_id, request.offset, request.len)
        })
        .await
    }

    async fn handle_stream_write(
        &self,
        session: &Session,
        payload: &[u8],
    ) -> Result<Bytes, ServerError> {
        let request = WriteRequest::decode(payload)?;
        let blocking = self.registry.is_file_backed(request.handle_id);
        let owner = session.id.clone();
        let written = self
            .with_registry(blocking, move |registry| {
                registry.write_at(&owner, request.handle_id, request.offset, &request.data)
            })
            .await?;
        Ok(WriteResult { written }.encode())
    }

    async fn handle_stream_seek(
        &self,
        session: &Session,
        payload: &[u8],
    ) -> Result<Bytes, ServerError> {
        let request = SeekRequest::decode(payload)?;
        let blocking = self.registry.is_file_backed(request.handle_id);
        let owner = session.id.clone();
        let position = self
            .with_registry(blocking, move |registry| {
                registry.seek_from(
                    &owner,
                    request.handle_id,
                    request.origin,
                    request.offset,
                    request.position,
                )
            })
            .await?;
        Ok(SeekResult { position }.encode())
    }

    async fn handle_stream_info(
        &self,
        session: &Session,
        payload: &[u8],
    ) -> Result<Bytes, ServerError> {
        let request = HandleRef::decode(payload)?;
        let blocking = self.registry.is_file_backed(request.handle_id);
        let owner = session.id.clone();
        let descriptor = self
            .with_registry(blocking, move |registry| registry.info(&owner, request.handle_id))
            .await?;
        Ok(to_json_payload(&descriptor)?)
    }

    fn handle_stream_close(&self, session: &Session, payload: &[u8]) -> Result<Bytes, ServerError> {
        let request = HandleRef::decode(payload)?;
        self.registry.close(&session.id, request.handle_id)?;
        Ok(Bytes::new())
    }
}
