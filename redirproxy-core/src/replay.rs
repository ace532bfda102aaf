//! Stream replay after sniffing.
//!
//! Bytes pulled off a connection while classifying it are handed back through
//! [`ReplayStream`], which serves them first and then continues reading from
//! the wrapped stream. Writes go straight through.

use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A duplex stream that yields `prefix` before reading from `inner`.
#[derive(Debug)]
pub struct ReplayStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> ReplayStream<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    /// Bytes still waiting to be replayed.
    pub fn pending(&self) -> &[u8] {
        &self.prefix
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwraps the stream, returning unread replay bytes alongside it.
    pub fn into_parts(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefix_then_live() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b" world").await.unwrap();
        drop(client);

        let mut stream = ReplayStream::new(Bytes::from_static(b"hello"), server);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_empty_prefix_passthrough() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"live").await.unwrap();
        drop(client);

        let mut stream = ReplayStream::new(Bytes::new(), server);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"live");
    }

    #[tokio::test]
    async fn test_small_reads_drain_prefix_in_order() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let mut stream = ReplayStream::new(Bytes::from_static(b"abcdef"), server);
        let mut chunk = [0u8; 4];
        let n = stream.read(&mut chunk).await.unwrap();
        assert_eq!(&chunk[..n], b"abcd");
        assert_eq!(stream.pending(), b"ef");
        let n = stream.read(&mut chunk).await.unwrap();
        assert_eq!(&chunk[..n], b"ef");
        assert_eq!(stream.read(&mut chunk).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nested_replay() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"3").await.unwrap();
        drop(client);

        let inner = ReplayStream::new(Bytes::from_static(b"2"), server);
        let mut outer = ReplayStream::new(Bytes::from_static(b"1"), inner);
        let mut out = Vec::new();
        outer.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"123");
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut stream = ReplayStream::new(Bytes::from_static(b"ignored"), server);
        stream.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }
}
