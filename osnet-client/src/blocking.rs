//! `std::io` adapter for synchronous callers.

use crate::error::ClientError;
use crate::remote::{RemoteStream, StreamState};
use bytes::Bytes;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tokio::runtime::Handle;

/// Drives a [`RemoteStream`] from blocking code.
///
/// Each call blocks the current thread on the runtime until its round trip
/// completes. Must not be used from inside an async task; use it from
/// `spawn_blocking` or a plain thread holding a runtime [`Handle`].
pub struct BlockingRemoteStream {
    inner: RemoteStream,
    runtime: Handle,
}

impl BlockingRemoteStream {
    pub fn new(inner: RemoteStream, runtime: Handle) -> Self {
        Self { inner, runtime }
    }

    pub fn get_ref(&self) -> &RemoteStream {
        &self.inner
    }

    pub fn length(&self) -> u64 {
        self.inner.length()
    }

    pub fn refresh_length(&mut self) -> Result<u64, ClientError> {
        self.runtime.block_on(self.inner.refresh_length())
    }

    pub fn close(&mut self) -> Result<(), ClientError> {
        self.runtime.block_on(self.inner.close())
    }
}

impl Read for BlockingRemoteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.runtime.block_on(self.inner.read(buf.len()))?;
        if data.len() > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "server returned more bytes than requested",
            ));
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl Write for BlockingRemoteStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let data = Bytes::copy_from_slice(buf);
        Ok(self.runtime.block_on(self.inner.write(data))?)
    }

    /// Writes are applied by the server before they are acknowledged.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for BlockingRemoteStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.runtime.block_on(self.inner.seek(pos))?)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.inner.position())
    }
}

impl Drop for BlockingRemoteStream {
    fn drop(&mut self) {
        if self.inner.state() == StreamState::Open {
            let _ = self.close();
        }
    }
}
