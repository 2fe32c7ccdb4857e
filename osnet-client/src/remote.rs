//! Client-side proxy for a byte stream that lives on the server.
//!
//! A [`RemoteStream`] looks like a local seekable stream, but every read,
//! write and seek is one request/reply round trip on the shared connection.
//! The proxy tracks the cursor itself and sends it with each request, so
//! independent proxies never interfere with each other.

use crate::connection::Connection;
use crate::error::ClientError;
use bytes::{Bytes, BytesMut};
use osnet_protocol::message::{
    from_json_payload, to_json_payload, HandleRef, OpenParams, ReadRequest, SeekRequest,
    SeekResult, WriteRequest, WriteResult,
};
use osnet_protocol::{Capabilities, MessageType, OpenMode, SeekOrigin, StreamDescriptor, WireBody};
use std::io::{self, SeekFrom};
use std::sync::Arc;

/// Largest chunk `write_all` sends in one request.
pub const MAX_WRITE_CHUNK: usize = 1024 * 1024;

/// Lifecycle of a [`RemoteStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Unopened,
    /// Open request in flight.
    Opening,
    Open,
    /// Close request in flight.
    Closing,
    Closed,
}

/// Handle to a server-side stream.
pub struct RemoteStream {
    conn: Arc<Connection>,
    handle_id: u32,
    capabilities: Capabilities,
    length: u64,
    position: u64,
    state: StreamState,
    /// Set when the handle id is known before the proxy is open (attach).
    owns_handle_early: bool,
}

impl RemoteStream {
    fn unopened(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            handle_id: 0,
            capabilities: Capabilities::default(),
            length: 0,
            position: 0,
            state: StreamState::Unopened,
            owns_handle_early: false,
        }
    }

    /// Opens `locator` on the server.
    pub async fn open(
        conn: Arc<Connection>,
        locator: &str,
        mode: OpenMode,
    ) -> Result<Self, ClientError> {
        let params = OpenParams {
            locator: locator.to_string(),
            mode,
        };
        let mut stream = Self::unopened(conn);
        stream
            .establish(MessageType::StreamOpen, to_json_payload(&params)?)
            .await?;
        tracing::debug!(handle_id = stream.handle_id, locator, "Opened remote stream");
        Ok(stream)
    }

    /// Attaches to a handle the server already opened for this session.
    ///
    /// The proxy owns the handle from the start: if attaching fails or is
    /// cancelled, the handle is closed.
    pub async fn attach(conn: Arc<Connection>, handle_id: u32) -> Result<Self, ClientError> {
        let mut stream = Self::unopened(conn);
        stream.handle_id = handle_id;
        stream.owns_handle_early = true;
        if let Err(e) = stream
            .establish(MessageType::StreamInfo, HandleRef { handle_id }.encode())
            .await
        {
            let _ = stream
                .conn
                .post(MessageType::StreamClose, HandleRef { handle_id }.encode())
                .await;
            return Err(e);
        }
        Ok(stream)
    }

    async fn establish(&mut self, msg_type: MessageType, payload: Bytes) -> Result<(), ClientError> {
        self.state = StreamState::Opening;
        let descriptor = match self.conn.send_message(msg_type, payload).await {
            Ok(reply) => from_json_payload::<StreamDescriptor>(&reply).map_err(ClientError::from),
            Err(e) => Err(e),
        };

        match descriptor {
            Ok(descriptor) => {
                self.handle_id = descriptor.handle_id;
                self.capabilities = descriptor.capabilities;
                self.length = descriptor.length;
                self.position = descriptor.position;
                self.state = StreamState::Open;
                Ok(())
            }
            Err(e) => {
                self.state = StreamState::Closed;
                Err(e)
            }
        }
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        match self.state {
            StreamState::Open => Ok(()),
            _ => Err(ClientError::StreamClosed),
        }
    }

    /// Reads up to `len` bytes at the current position.
    ///
    /// Returns fewer bytes near the end of the stream and an empty buffer
    /// only at the end. A zero `len` returns empty without a round trip.
    pub async fn read(&mut self, len: usize) -> Result<Bytes, ClientError> {
        self.ensure_open()?;
        if len == 0 {
            return Ok(Bytes::new());
        }

        let request = ReadRequest {
            handle_id: self.handle_id,
            offset: self.position,
            len: u32::try_from(len).unwrap_or(u32::MAX),
        };
        let data = self
            .conn
            .send_message(MessageType::StreamRead, request.encode())
            .await?;

        self.position += data.len() as u64;
        self.length = self.length.max(self.position);
        Ok(data)
    }

    /// Reads until `len` bytes are collected or the stream ends.
    pub async fn read_exact_len(&mut self, len: usize) -> Result<Bytes, ClientError> {
        let mut buf = BytesMut::with_capacity(len);
        while buf.len() < len {
            let chunk = self.read(len - buf.len()).await?;
            if chunk.is_empty() {
                break;
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Writes `data` at the current position and returns the bytes accepted.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<usize, ClientError> {
        self.ensure_open()?;
        let data = data.into();
        if data.is_empty() {
            return Ok(0);
        }

        let request = WriteRequest {
            handle_id: self.handle_id,
            offset: self.position,
            data,
        };
        let reply = self
            .conn
            .send_message(MessageType::StreamWrite, request.encode())
            .await?;
        let result = WriteResult::decode(&reply)?;

        let written = result.written as usize;
        self.position += written as u64;
        self.length = self.length.max(self.position);
        Ok(written)
    }

    /// Writes all of `data`, splitting it into requests of at most [`MAX_WRITE_CHUNK`].
    pub async fn write_all(&mut self, data: impl Into<Bytes>) -> Result<(), ClientError> {
        let mut data = data.into();
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(MAX_WRITE_CHUNK));
            let written = self.write(chunk.clone()).await?;
            if written < chunk.len() {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "short remote write").into());
            }
        }
        Ok(())
    }

    /// Moves the cursor. Seeking past the end is allowed; before the start is not.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64, ClientError> {
        self.ensure_open()?;

        let (origin, offset) = match pos {
            SeekFrom::Start(n) => {
                let offset = i64::try_from(n).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "seek offset out of range")
                })?;
                (SeekOrigin::Start, offset)
            }
            SeekFrom::Current(n) => (SeekOrigin::Current, n),
            SeekFrom::End(n) => (SeekOrigin::End, n),
        };

        let request = SeekRequest {
            handle_id: self.handle_id,
            origin,
            offset,
            position: self.position,
        };
        let reply = self
            .conn
            .send_message(MessageType::StreamSeek, request.encode())
            .await?;
        self.position = SeekResult::decode(&reply)?.position;
        Ok(self.position)
    }

    /// Asks the server for the current length and updates the cached value.
    pub async fn refresh_length(&mut self) -> Result<u64, ClientError> {
        self.ensure_open()?;
        let reply = self
            .conn
            .send_message(
                MessageType::StreamInfo,
                HandleRef {
                    handle_id: self.handle_id,
                }
                .encode(),
            )
            .await?;
        let descriptor: StreamDescriptor = from_json_payload(&reply)?;
        self.capabilities = descriptor.capabilities;
        self.length = descriptor.length;
        Ok(self.length)
    }

    /// Releases the server handle.
    ///
    /// The close request is not acknowledged; the proxy is `Closed` as soon
    /// as it has been handed to the connection, or failed to be.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.state = StreamState::Closing;

        let request = HandleRef {
            handle_id: self.handle_id,
        };
        let sent = self.conn.post(MessageType::StreamClose, request.encode()).await;
        self.state = StreamState::Closed;

        if let Err(e) = sent {
            tracing::debug!(handle_id = self.handle_id, error = %e, "Close request not delivered");
        }
        Ok(())
    }

    pub fn handle_id(&self) -> u32 {
        self.handle_id
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns the cached length. See [`refresh_length`](Self::refresh_length).
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn can_read(&self) -> bool {
        self.capabilities.readable
    }

    pub fn can_write(&self) -> bool {
        self.capabilities.writable
    }

    pub fn can_seek(&self) -> bool {
        self.capabilities.seekable
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        let release = match self.state {
            StreamState::Open | StreamState::Closing => true,
            StreamState::Opening => self.owns_handle_early,
            StreamState::Unopened | StreamState::Closed => false,
        };
        if !release {
            return;
        }
        self.state = StreamState::Closed;

        let handle_id = self.handle_id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let conn = self.conn.clone();
                runtime.spawn(async move {
                    let request = HandleRef { handle_id };
                    if let Err(e) = conn.post(MessageType::StreamClose, request.encode()).await {
                        tracing::debug!(handle_id, error = %e, "Close on drop not delivered");
                    }
                });
            }
            Err(_) => {
                tracing::debug!(handle_id, "Dropped outside a runtime; handle is released with the session");
            }
        }
    }
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("handle_id", &self.handle_id)
            .field("capabilities", &self.capabilities)
            .field("length", &self.length)
            .field("position", &self.position)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{in_process, in_process_with};
    use osnet_protocol::ErrorCode;
    use osnet_server::resource::test_pattern;
    use osnet_server::StreamsConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stream_test_scenario() {
        let (client, _server) = in_process().await;

        let reply = client
            .send_message(MessageType::StreamTest, Bytes::new())
            .await
            .unwrap();
        assert_eq!(reply.len(), 4);
        let handle_id = HandleRef::decode(&reply).unwrap().handle_id;

        let mut stream = client.attach_stream(handle_id).await.unwrap();
        assert_eq!(stream.state(), StreamState::Open);
        assert!(stream.can_read());
        assert!(!stream.can_write());
        let length = stream.length();
        assert!(length > 0);

        let data = stream.read(length as usize).await.unwrap();
        assert_eq!(data.len() as u64, length);
        assert_eq!(data, test_pattern(length as usize));

        assert!(stream.read(16).await.unwrap().is_empty());
        assert_eq!(stream.position(), length);
    }

    #[tokio::test]
    async fn test_close_releases_handle() {
        let (client, server) = in_process().await;

        let mut stream = client
            .open_stream("mem:release", OpenMode::Create)
            .await
            .unwrap();
        stream.write(&b"payload"[..]).await.unwrap();
        let handle_id = stream.handle_id();

        stream.close().await.unwrap();
        assert_eq!(stream.state(), StreamState::Closed);

        assert!(matches!(
            client.attach_stream(handle_id).await,
            Err(ClientError::UnknownHandle(_))
        ));
        let read = ReadRequest {
            handle_id,
            offset: 0,
            len: 4,
        };
        assert!(matches!(
            client.send_message(MessageType::StreamRead, read.encode()).await,
            Err(ClientError::UnknownHandle(_))
        ));
        assert_eq!(server.registry().open_count(), 0);
    }

    #[tokio::test]
    async fn test_read_past_end() {
        let (client, _server) = in_process().await;

        let mut stream = client
            .open_stream("mem:short", OpenMode::Create)
            .await
            .unwrap();
        stream.write(&b"0123456789"[..]).await.unwrap();
        stream.seek(SeekFrom::Start(6)).await.unwrap();

        assert_eq!(stream.read(3).await.unwrap(), "678");
        assert_eq!(stream.read(3).await.unwrap(), "9");
        assert!(stream.read(3).await.unwrap().is_empty());
        assert!(stream.read(3).await.unwrap().is_empty());

        assert_eq!(stream.position(), 10);
        assert_eq!(stream.refresh_length().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_write_to_read_only_handle() {
        let (client, _server) = in_process().await;

        let mut stream = client.stream_test().await.unwrap();
        let length = stream.length();
        stream.read(10).await.unwrap();

        assert!(matches!(
            stream.write(&b"nope"[..]).await,
            Err(ClientError::Capability(_))
        ));
        assert_eq!(stream.position(), 10);
        assert_eq!(stream.length(), length);
        assert_eq!(stream.refresh_length().await.unwrap(), length);

        // Still usable after a scoped failure
        assert_eq!(stream.read(5).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let (client, _server) = in_process().await;

        let mut stream = client.open_stream("scratch:", OpenMode::ReadWrite).await.unwrap();
        stream.close().await.unwrap();

        assert!(matches!(stream.read(1).await, Err(ClientError::StreamClosed)));
        assert!(matches!(
            stream.write(&b"x"[..]).await,
            Err(ClientError::StreamClosed)
        ));
        assert!(matches!(
            stream.seek(SeekFrom::Start(0)).await,
            Err(ClientError::StreamClosed)
        ));
        assert!(matches!(
            stream.refresh_length().await,
            Err(ClientError::StreamClosed)
        ));
        assert!(matches!(stream.close().await, Err(ClientError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_seek_origins() {
        let (client, _server) = in_process().await;

        let mut stream = client.open_stream("scratch:", OpenMode::ReadWrite).await.unwrap();
        stream.write_all(Bytes::from_static(b"abcdefghij")).await.unwrap();

        assert_eq!(stream.seek(SeekFrom::Start(2)).await.unwrap(), 2);
        assert_eq!(stream.seek(SeekFrom::Current(3)).await.unwrap(), 5);
        assert_eq!(stream.seek(SeekFrom::End(-1)).await.unwrap(), 9);
        assert_eq!(stream.read(4).await.unwrap(), "j");

        let err = stream.seek(SeekFrom::Current(-100)).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::ServerError {
                code: ErrorCode::InvalidSeek,
                ..
            }
        ));
        assert_eq!(stream.position(), 10);

        // Past the end is allowed, writes there extend the stream
        assert_eq!(stream.seek(SeekFrom::End(2)).await.unwrap(), 12);
        stream.write(&b"!"[..]).await.unwrap();
        assert_eq!(stream.refresh_length().await.unwrap(), 13);
    }

    #[tokio::test]
    async fn test_open_unknown_resource() {
        let (client, _server) = in_process().await;

        assert!(matches!(
            client.open_stream("mem:missing", OpenMode::Read).await,
            Err(ClientError::ResourceUnavailable(_))
        ));
        assert!(matches!(
            client.open_stream("tape:0", OpenMode::Read).await,
            Err(ClientError::ResourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_releases_handle() {
        let (client, server) = in_process().await;

        let stream = client.open_stream("scratch:", OpenMode::ReadWrite).await.unwrap();
        assert_eq!(server.registry().open_count(), 1);
        drop(stream);

        let released = async {
            while server.registry().open_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), released)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_independent_streams_interleave() {
        let (client, _server) = in_process().await;

        let mut a = client.open_stream("mem:a", OpenMode::Create).await.unwrap();
        let mut b = client.open_stream("mem:b", OpenMode::Create).await.unwrap();
        a.write(&b"aaaa"[..]).await.unwrap();
        b.write(&b"bbbbbbbb"[..]).await.unwrap();
        a.seek(SeekFrom::Start(0)).await.unwrap();
        b.seek(SeekFrom::Start(0)).await.unwrap();

        let (ra, rb) = tokio::join!(a.read(100), b.read(100));
        assert_eq!(ra.unwrap(), "aaaa");
        assert_eq!(rb.unwrap(), "bbbbbbbb");
    }

    #[tokio::test]
    async fn test_reads_are_chunked() {
        let config = StreamsConfig {
            max_read_chunk: 1024,
            ..StreamsConfig::default()
        };
        let (client, _server) = in_process_with(config).await;

        let mut stream = client.stream_test().await.unwrap();
        let length = stream.length() as usize;
        assert!(length > 1024);

        let first = stream.read(length).await.unwrap();
        assert_eq!(first.len(), 1024);

        let rest = stream.read_exact_len(length).await.unwrap();
        assert_eq!(rest.len(), length - 1024);
        assert_eq!(stream.position() as usize, length);
    }

    #[tokio::test]
    async fn test_file_backed_stream() {
        let dir = tempfile::tempdir().unwrap();
        let config = StreamsConfig {
            root_dir: Some(dir.path().to_path_buf()),
            ..StreamsConfig::default()
        };
        let (client, _server) = in_process_with(config).await;

        let mut stream = client
            .open_stream("file:notes.txt", OpenMode::Create)
            .await
            .unwrap();
        stream.write_all(Bytes::from_static(b"saved remotely")).await.unwrap();
        stream.close().await.unwrap();

        let mut reader = client
            .open_stream("file:notes.txt", OpenMode::Read)
            .await
            .unwrap();
        assert!(!reader.can_write());
        assert_eq!(reader.length(), 14);
        assert_eq!(reader.read(64).await.unwrap(), "saved remotely");
        reader.close().await.unwrap();

        // Round trip above guarantees the server processed the close
        client.ping().await.unwrap();
        let on_disk = std::fs::read(dir.path().join("notes.txt")).unwrap();
        assert_eq!(on_disk, b"saved remotely");

        assert!(matches!(
            client.open_stream("file:../escape", OpenMode::Create).await,
            Err(ClientError::ResourceUnavailable(_))
        ));
    }

    async fn wait_until_released(server: &osnet_server::Server) {
        let released = async {
            while server.registry().open_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), released)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_opens_release_handles() {
        let (client, server) = in_process().await;

        for _ in 0..5 {
            let mut open =
                tokio_test::task::spawn(client.open_stream("scratch:", OpenMode::ReadWrite));
            assert!(open.poll().is_pending());
        }

        client.ping().await.unwrap();
        wait_until_released(&server).await;
        assert_eq!(client.connection().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_open_releases_handle() {
        let (client, server) = in_process().await;

        let open = RemoteStream::open(client.connection(), "scratch:", OpenMode::ReadWrite);
        assert!(tokio::time::timeout(Duration::ZERO, open).await.is_err());

        // Replies arrive in order, so the open's reply has been seen by now
        client.ping().await.unwrap();
        wait_until_released(&server).await;

        let stream = client.open_stream("scratch:", OpenMode::ReadWrite).await.unwrap();
        assert_eq!(stream.state(), StreamState::Open);
    }

    #[tokio::test]
    async fn test_abandoned_stream_test_releases_handle() {
        let (client, server) = in_process().await;

        let mut test_stream = tokio_test::task::spawn(client.stream_test());
        assert!(test_stream.poll().is_pending());
        drop(test_stream);

        client.ping().await.unwrap();
        wait_until_released(&server).await;
    }

    #[tokio::test]
    async fn test_abandoned_attach_releases_handle() {
        let (client, server) = in_process().await;

        let reply = client
            .send_message(MessageType::StreamTest, Bytes::new())
            .await
            .unwrap();
        let handle_id = HandleRef::decode(&reply).unwrap().handle_id;
        assert_eq!(server.registry().open_count(), 1);

        let mut attach = tokio_test::task::spawn(client.attach_stream(handle_id));
        assert!(attach.poll().is_pending());
        drop(attach);

        wait_until_released(&server).await;
    }
}
