//! Client stream abstraction for TCP and in-process connections.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

pin_project! {
    /// A client stream that can be either a TCP socket or an in-memory duplex pipe.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Tcp { #[pin] stream: TcpStream },
        Memory { #[pin] stream: DuplexStream },
    }
}

impl ClientStream {
    /// Returns whether this stream is a TCP socket.
    pub fn is_tcp(&self) -> bool {
        matches!(self, ClientStream::Tcp { .. })
    }
}

impl From<TcpStream> for ClientStream {
    fn from(stream: TcpStream) -> Self {
        ClientStream::Tcp { stream }
    }
}

impl From<DuplexStream> for ClientStream {
    fn from(stream: DuplexStream) -> Self {
        ClientStream::Memory { stream }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Memory { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Memory { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_flush(cx),
            ClientStreamProj::Memory { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Memory { stream } => stream.poll_shutdown(cx),
        }
    }
}
