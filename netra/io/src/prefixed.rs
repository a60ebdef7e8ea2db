use bytes::Bytes;
use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// An I/O type that reads from a fixed prefix before reading from the
/// underlying stream.
///
/// This is how buffered bytes are replayed when the proxy falls back from
/// protocol interception to raw forwarding: whatever was consumed while
/// sniffing the stream is served first, then reads continue from the socket.
#[pin_project]
#[derive(Debug)]
pub struct PrefixedIo<I> {
    prefix: Bytes,
    #[pin]
    io: I,
}

impl<I> PrefixedIo<I> {
    pub fn new(prefix: impl Into<Bytes>, io: I) -> Self {
        let prefix = prefix.into();
        Self { prefix, io }
    }

    pub fn prefix(&self) -> &Bytes {
        &self.prefix
    }

    pub fn into_inner(self) -> I {
        self.io
    }
}

impl<I> From<I> for PrefixedIo<I> {
    fn from(io: I) -> Self {
        Self::new(Bytes::default(), io)
    }
}

// === impl AsyncRead ===

impl<I: AsyncRead> AsyncRead for PrefixedIo<I> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        // Serve the prefix in full before touching the underlying stream.
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        this.io.poll_read(cx, buf)
    }
}

// === impl AsyncWrite ===

impl<I: AsyncWrite> AsyncWrite for PrefixedIo<I> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().io.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().io.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().io.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn replays_prefix_before_stream() {
        let inner = std::io::Cursor::new(b"world".to_vec());
        let mut io = PrefixedIo::new(&b"hello "[..], inner);

        let mut out = String::new();
        io.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn empty_prefix_is_transparent() {
        let inner = std::io::Cursor::new(b"bytes".to_vec());
        let mut io = PrefixedIo::from(inner);

        let mut out = Vec::new();
        io.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"bytes");
    }
}
