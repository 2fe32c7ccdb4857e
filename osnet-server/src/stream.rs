//! Connection stream abstraction for accepted sockets and in-process peers.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

pin_project! {
    /// A server-side connection: an accepted TCP socket or one end of a duplex pipe.
    #[project = ServerStreamProj]
    pub enum ServerStream {
        Tcp { #[pin] stream: TcpStream },
        Memory { #[pin] stream: DuplexStream },
    }
}

impl ServerStream {
    pub fn is_tcp(&self) -> bool {
        matches!(self, ServerStream::Tcp { .. })
    }
}

impl From<TcpStream> for ServerStream {
    fn from(stream: TcpStream) -> Self {
        ServerStream::Tcp { stream }
    }
}

impl From<DuplexStream> for ServerStream {
    fn from(stream: DuplexStream) -> Self {
        ServerStream::Memory { stream }
    }
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ServerStreamProj::Tcp { stream } => stream.poll_read(cx, buf),
            ServerStreamProj::Memory { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ServerStreamProj::Tcp { stream } => stream.poll_write(cx, buf),
            ServerStreamProj::Memory { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ServerStreamProj::Tcp { stream } => stream.poll_flush(cx),
            ServerStreamProj::Memory { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ServerStreamProj::Tcp { stream } => stream.poll_shutdown(cx),
            ServerStreamProj::Memory { stream } => stream.poll_shutdown(cx),
        }
    }
}
