//! Non-destructive protocol classification.
//!
//! [`sniff`] reads just enough of the client stream to tell TLS and HTTP apart
//! from everything else, then hands back a [`ReplayStream`] that yields every
//! consumed byte again before continuing with live data.

use crate::http::{MAX_HEAD_SIZE, header_slots};
use crate::replay::ReplayStream;
use crate::tls::{RECORD_HEADER_LEN, is_handshake_header};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

const READ_CHUNK: usize = 4096;

/// Outcome of classifying the leading bytes of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
    /// Starts with a TLS 1.0-versioned handshake record header
    Tls,
    /// Starts with a complete, well-formed HTTP/1.x request head
    Http,
    /// Anything else, relayed without interpretation
    Opaque,
}

impl Sniffed {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Sniffed::Tls => "tls",
            Sniffed::Http => "http",
            Sniffed::Opaque => "opaque",
        }
    }
}

/// Classifies `stream` and returns it wrapped so no byte is lost.
///
/// Reads are bounded by `deadline`; running out of time, hitting EOF, or a read
/// error all end the probe and fall through to the next classification step.
pub async fn sniff<S>(mut stream: S, deadline: Instant) -> (Sniffed, ReplayStream<S>)
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);

    let complete = fill_to(&mut stream, &mut buf, RECORD_HEADER_LEN, deadline).await;
    if complete && is_handshake_header(&buf) {
        debug!("Detected TLS handshake record");
        return (Sniffed::Tls, ReplayStream::new(buf, stream));
    }

    // A short read still goes through the HTTP probe with what arrived.
    let protocol = if probe_http(&mut stream, &mut buf, deadline).await {
        Sniffed::Http
    } else {
        Sniffed::Opaque
    };
    debug!(protocol = protocol.as_str(), buffered = buf.len(), "Sniffed stream");
    (protocol, ReplayStream::new(buf, stream))
}

/// Reads until `buf` holds at least `want` bytes. Returns false if the stream
/// ended, failed, or the deadline passed first; whatever arrived stays in `buf`.
async fn fill_to<S>(stream: &mut S, buf: &mut Vec<u8>, want: usize, deadline: Instant) -> bool
where
    S: AsyncRead + Unpin,
{
    while buf.len() < want {
        if !read_more(stream, buf, want - buf.len(), deadline).await {
            return false;
        }
    }
    true
}

async fn read_more<S>(stream: &mut S, buf: &mut Vec<u8>, max: usize, deadline: Instant) -> bool
where
    S: AsyncRead + Unpin,
{
    let start = buf.len();
    buf.resize(start + max, 0);
    let result = timeout_at(deadline, stream.read(&mut buf[start..])).await;
    let n = match result {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            trace!(error = %e, "Read failed while sniffing");
            0
        }
        Err(_) => {
            trace!("Sniff deadline reached");
            0
        }
    };
    buf.truncate(start + n);
    n > 0
}

/// Keeps reading until `buf` parses as a full HTTP request head.
async fn probe_http<S>(stream: &mut S, buf: &mut Vec<u8>, deadline: Instant) -> bool
where
    S: AsyncRead + Unpin,
{
    loop {
        let mut headers = header_slots(buf);
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(_)) => return true,
            Ok(httparse::Status::Partial) => {}
            Err(e) => {
                trace!(error = ?e, "Not an HTTP request");
                return false;
            }
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return false;
        }
        if !read_more(stream, buf, READ_CHUNK, deadline).await {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::tests::client_hello;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, duplex};

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    async fn sniff_all(input: &[u8]) -> (Sniffed, Vec<u8>) {
        let (mut client, server) = duplex(input.len().max(1) * 2);
        client.write_all(input).await.unwrap();
        drop(client);

        let (protocol, mut stream) = sniff(server, soon()).await;
        let mut replayed = Vec::new();
        stream.read_to_end(&mut replayed).await.unwrap();
        (protocol, replayed)
    }

    #[tokio::test]
    async fn test_tls_classified_and_replayed() {
        let mut input = client_hello(Some("example.com"));
        input.extend_from_slice(b"more");
        let (protocol, replayed) = sniff_all(&input).await;
        assert_eq!(protocol, Sniffed::Tls);
        assert_eq!(replayed, input);
    }

    #[tokio::test]
    async fn test_tls_header_with_garbage_body_is_still_tls() {
        let input = [0x16, 0x03, 0x01, 0xff, 0xff, 0x00, 0x01];
        let (protocol, replayed) = sniff_all(&input).await;
        assert_eq!(protocol, Sniffed::Tls);
        assert_eq!(replayed, input);
    }

    #[tokio::test]
    async fn test_http_classified_and_replayed() {
        let input = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\nbody-bytes".to_vec();
        let (protocol, replayed) = sniff_all(&input).await;
        assert_eq!(protocol, Sniffed::Http);
        assert_eq!(replayed, input);
    }

    #[tokio::test]
    async fn test_request_with_many_headers_is_http() {
        let mut input = b"GET / HTTP/1.1\r\nHost: example.com\r\n".to_vec();
        for i in 0..100 {
            input.extend_from_slice(format!("X-Trace-{}: abc\r\n", i).as_bytes());
        }
        input.extend_from_slice(b"\r\n");
        let (protocol, replayed) = sniff_all(&input).await;
        assert_eq!(protocol, Sniffed::Http);
        assert_eq!(replayed, input);
    }

    #[tokio::test]
    async fn test_opaque_classified_and_replayed() {
        let input = b"SSH-2.0-OpenSSH_9.6\r\n\x00\x01\x02".to_vec();
        let (protocol, replayed) = sniff_all(&input).await;
        assert_eq!(protocol, Sniffed::Opaque);
        assert_eq!(replayed, input);
    }

    #[tokio::test]
    async fn test_short_stream_is_opaque() {
        let (protocol, replayed) = sniff_all(b"\x16\x03").await;
        assert_eq!(protocol, Sniffed::Opaque);
        assert_eq!(replayed, b"\x16\x03");
    }

    #[tokio::test]
    async fn test_empty_stream_is_opaque() {
        let (client, server) = duplex(8);
        drop(client);
        let (protocol, stream) = sniff(server, soon()).await;
        assert_eq!(protocol, Sniffed::Opaque);
        assert!(stream.pending().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_http_head_is_opaque() {
        let input = b"GET / HTTP/1.1\r\nHost: exa".to_vec();
        let (protocol, replayed) = sniff_all(&input).await;
        assert_eq!(protocol, Sniffed::Opaque);
        assert_eq!(replayed, input);
    }

    #[tokio::test]
    async fn test_deadline_falls_back_to_opaque() {
        let (mut client, server) = duplex(64);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        let (protocol, stream) = sniff(server, deadline).await;
        assert_eq!(protocol, Sniffed::Opaque);
        assert_eq!(stream.pending(), b"GET / HTTP/1.1\r\n");
        drop(client);
    }

    #[tokio::test]
    async fn test_http_head_split_across_writes() {
        let (mut client, server) = duplex(64);
        let writer = tokio::spawn(async move {
            client.write_all(b"POST /a HTTP/1.1\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.write_all(b"Host: x\r\nContent-Length: 0\r\n\r\n").await.unwrap();
            client
        });

        let (protocol, stream) = sniff(server, soon()).await;
        assert_eq!(protocol, Sniffed::Http);
        assert_eq!(
            stream.pending(),
            b"POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n"
        );
        drop(writer.await.unwrap());
    }
}
