//! HTTP/1.x single-exchange relay.
//!
//! Request and response heads are forwarded exactly as received; bodies are
//! copied according to their framing. One request, one final response, then
//! the exchange is over.

use bytes::{Buf, BytesMut};
use std::error::Error;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::time::{Duration, timeout};
use tracing::{Level, trace};

use crate::replay::ReplayStream;

/// Upper bound on a request or response head.
pub const MAX_HEAD_SIZE: usize = 32768;

const READ_BUFFER_SIZE: usize = 16384;
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug)]
pub enum HttpError {
    Io(io::Error),
    NoHostHeader,
    InvalidRequest,
    InvalidResponse,
    HeadersTooLarge,
    Timeout,
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::Io(e) => write!(f, "IO error: {}", e),
            HttpError::NoHostHeader => write!(f, "No Host header found"),
            HttpError::InvalidRequest => write!(f, "Invalid HTTP request"),
            HttpError::InvalidResponse => write!(f, "Invalid HTTP response"),
            HttpError::HeadersTooLarge => write!(f, "HTTP head exceeds {} bytes", MAX_HEAD_SIZE),
            HttpError::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl Error for HttpError {}

impl From<io::Error> for HttpError {
    fn from(err: io::Error) -> Self {
        HttpError::Io(err)
    }
}

impl From<tokio::time::error::Elapsed> for HttpError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        HttpError::Timeout
    }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Empty,
    Length(u64),
    Chunked,
    /// Response body runs until the upstream closes.
    UntilClose,
}

#[derive(Debug)]
pub struct RequestHead {
    /// Head bytes exactly as received, including the blank line
    pub raw: BytesMut,
    pub method: String,
    pub path: String,
    /// `Host` header, or the authority of an absolute-form target
    pub host: Option<String>,
    pub body: BodyLength,
}

impl RequestHead {
    #[inline]
    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }
}

#[derive(Debug)]
pub struct ResponseHead {
    pub raw: BytesMut,
    pub status: u16,
    pub body: BodyLength,
}

/// Buffered reader that parses heads and copies framed bodies.
pub struct HttpReader<R> {
    inner: R,
    buf: BytesMut,
    idle: Option<Duration>,
}

impl<R: AsyncRead + Unpin> HttpReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_buffer(BytesMut::new(), inner)
    }

    /// Starts from bytes that were already read off `inner`.
    pub fn with_buffer(buf: BytesMut, inner: R) -> Self {
        Self {
            inner,
            buf,
            idle: None,
        }
    }

    /// Fails any single read that stays idle for longer than `idle`.
    pub fn idle_timeout(mut self, idle: Duration) -> Self {
        self.idle = Some(idle);
        self
    }

    pub fn into_parts(self) -> (BytesMut, R) {
        (self.buf, self.inner)
    }

    async fn fill(&mut self) -> Result<usize, HttpError> {
        self.buf.reserve(READ_BUFFER_SIZE);
        let n = match self.idle {
            Some(idle) => timeout(idle, self.inner.read_buf(&mut self.buf)).await??,
            None => self.inner.read_buf(&mut self.buf).await?,
        };
        Ok(n)
    }

    async fn read_head(&mut self, incomplete: HttpError) -> Result<BytesMut, HttpError> {
        loop {
            if let Some(end) = find_headers_end(&self.buf) {
                return Ok(self.buf.split_to(end));
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(HttpError::HeadersTooLarge);
            }
            if self.fill().await? == 0 {
                return Err(incomplete);
            }
        }
    }

    pub async fn read_request(&mut self) -> Result<RequestHead, HttpError> {
        let raw = self.read_head(HttpError::InvalidRequest).await?;
        let head = parse_request(raw)?;
        dump_head("request", &head.raw);
        Ok(head)
    }

    pub async fn read_response(&mut self, head_request: bool) -> Result<ResponseHead, HttpError> {
        let raw = self.read_head(HttpError::InvalidResponse).await?;
        let head = parse_response(raw, head_request)?;
        dump_head("response", &head.raw);
        Ok(head)
    }

    /// Copies one body of the given framing to `writer`, byte for byte.
    pub async fn copy_body<W>(&mut self, body: BodyLength, writer: &mut W) -> Result<(), HttpError>
    where
        W: AsyncWrite + Unpin,
    {
        match body {
            BodyLength::Empty => Ok(()),
            BodyLength::Length(n) => self.copy_exact(n, writer).await,
            BodyLength::Chunked => self.copy_chunked(writer).await,
            BodyLength::UntilClose => self.copy_to_end(writer).await,
        }
    }

    async fn copy_exact<W>(&mut self, mut remaining: u64, writer: &mut W) -> Result<(), HttpError>
    where
        W: AsyncWrite + Unpin,
    {
        while remaining > 0 {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            let take = self.buf.len().min(remaining as usize);
            writer.write_all(&self.buf[..take]).await?;
            self.buf.advance(take);
            remaining -= take as u64;
        }
        Ok(())
    }

    async fn copy_line<W>(&mut self, writer: &mut W) -> Result<BytesMut, HttpError>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                writer.write_all(&line).await?;
                return Ok(line);
            }
            if self.buf.len() > MAX_CHUNK_LINE {
                return Err(HttpError::InvalidRequest);
            }
            if self.fill().await? == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    async fn copy_chunked<W>(&mut self, writer: &mut W) -> Result<(), HttpError>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let line = self.copy_line(writer).await?;
            let size = parse_chunk_size(&line)?;
            if size == 0 {
                // Trailer section ends with an empty line.
                loop {
                    let trailer = self.copy_line(writer).await?;
                    if trailer.as_ref() == b"\r\n" || trailer.as_ref() == b"\n" {
                        return Ok(());
                    }
                }
            }
            self.copy_exact(size, writer).await?;
            self.copy_line(writer).await?;
        }
    }

    async fn copy_to_end<W>(&mut self, writer: &mut W) -> Result<(), HttpError>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            if !self.buf.is_empty() {
                writer.write_all(&self.buf).await?;
                self.buf.clear();
            }
            if self.fill().await? == 0 {
                return Ok(());
            }
        }
    }
}

/// What happened to the connection after one exchange.
pub enum Exchange<C, U> {
    Complete,
    /// Upstream answered `101 Switching Protocols`; the caller relays the rest opaquely.
    Upgraded {
        client: ReplayStream<C>,
        upstream: ReplayStream<U>,
    },
}

/// Forwards `request` to `upstream` and relays exactly one final response back.
///
/// Informational (1xx) responses preceding the final one are passed through.
pub async fn exchange<C, U>(
    client: HttpReader<C>,
    request: &RequestHead,
    upstream: U,
    idle: Duration,
) -> Result<Exchange<C, U>, HttpError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (client_buf, client) = client.into_parts();
    let (client_read, mut client_write) = tokio::io::split(client);
    let (upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let mut client_read = HttpReader::with_buffer(client_buf, client_read).idle_timeout(idle);
    let mut upstream_read = HttpReader::new(upstream_read).idle_timeout(idle);

    upstream_write.write_all(&request.raw).await?;

    let send = async {
        client_read.copy_body(request.body, &mut upstream_write).await?;
        upstream_write.flush().await?;
        Ok::<_, HttpError>(())
    };

    let recv = async {
        loop {
            let response = upstream_read.read_response(request.is_head()).await?;
            client_write.write_all(&response.raw).await?;
            if response.status == 101 {
                client_write.flush().await?;
                return Ok::<_, HttpError>(true);
            }
            if (100..200).contains(&response.status) {
                continue;
            }
            upstream_read.copy_body(response.body, &mut client_write).await?;
            client_write.flush().await?;
            return Ok(false);
        }
    };

    let ((), upgraded) = tokio::try_join!(send, recv)?;
    if !upgraded {
        return Ok(Exchange::Complete);
    }

    Ok(Exchange::Upgraded {
        client: rejoin(client_read, client_write),
        upstream: rejoin(upstream_read, upstream_write),
    })
}

fn rejoin<T>(reader: HttpReader<ReadHalf<T>>, writer: tokio::io::WriteHalf<T>) -> ReplayStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (buf, read_half) = reader.into_parts();
    ReplayStream::new(buf.freeze(), read_half.unsplit(writer))
}

/// Header slots for parsing `buf`. Each header takes its own line, so the
/// head size limit is the only bound on the header count.
pub(crate) fn header_slots<'b>(buf: &[u8]) -> Vec<httparse::Header<'b>> {
    let lines = buf.iter().filter(|&&b| b == b'\n').count();
    vec![httparse::EMPTY_HEADER; lines.max(1)]
}

fn parse_request(raw: BytesMut) -> Result<RequestHead, HttpError> {
    let mut headers = header_slots(&raw);
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(HttpError::InvalidRequest),
    }

    let method = req.method.ok_or(HttpError::InvalidRequest)?.to_string();
    let path = req.path.ok_or(HttpError::InvalidRequest)?.to_string();
    // An absolute-form target overrides the Host header.
    let host = absolute_form_authority(&path).or_else(|| {
        header_value(req.headers, "host")
            .filter(|h| !h.is_empty())
            .map(|h| h.to_string())
    });

    let body = match header_value(req.headers, "transfer-encoding") {
        Some(te) if is_chunked(te) => BodyLength::Chunked,
        Some(_) => return Err(HttpError::InvalidRequest),
        None => match content_length(req.headers).map_err(|_| HttpError::InvalidRequest)? {
            Some(0) | None => BodyLength::Empty,
            Some(n) => BodyLength::Length(n),
        },
    };

    Ok(RequestHead {
        method,
        path,
        host,
        body,
        raw,
    })
}

fn parse_response(raw: BytesMut, head_request: bool) -> Result<ResponseHead, HttpError> {
    let mut headers = header_slots(&raw);
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(HttpError::InvalidResponse),
    }
    let status = resp.code.ok_or(HttpError::InvalidResponse)?;

    let body = if head_request || (100..200).contains(&status) || status == 204 || status == 304 {
        BodyLength::Empty
    } else {
        match header_value(resp.headers, "transfer-encoding") {
            Some(te) if is_chunked(te) => BodyLength::Chunked,
            Some(_) => BodyLength::UntilClose,
            None => match content_length(resp.headers).map_err(|_| HttpError::InvalidResponse)? {
                Some(0) => BodyLength::Empty,
                Some(n) => BodyLength::Length(n),
                None => BodyLength::UntilClose,
            },
        }
    };

    Ok(ResponseHead { raw, status, body })
}

fn header_value<'a>(headers: &[httparse::Header<'a>], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::trim)
}

/// Conflicting `Content-Length` values are rejected.
fn content_length(headers: &[httparse::Header<'_>]) -> Result<Option<u64>, ()> {
    let mut length = None;
    for h in headers.iter().filter(|h| h.name.eq_ignore_ascii_case("content-length")) {
        let value = std::str::from_utf8(h.value)
            .map_err(|_| ())?
            .trim()
            .parse::<u64>()
            .map_err(|_| ())?;
        match length {
            Some(prev) if prev != value => return Err(()),
            _ => length = Some(value),
        }
    }
    Ok(length)
}

fn is_chunked(transfer_encoding: &str) -> bool {
    transfer_encoding
        .rsplit(',')
        .next()
        .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
}

fn absolute_form_authority(path: &str) -> Option<String> {
    let rest = path
        .strip_prefix("http://")
        .or_else(|| path.strip_prefix("https://"))?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit('@').next()?;
    (!authority.is_empty()).then(|| authority.to_string())
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let line = std::str::from_utf8(line).map_err(|_| HttpError::InvalidRequest)?;
    let size = line.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16).map_err(|_| HttpError::InvalidRequest)
}

#[inline]
fn find_headers_end(buffer: &[u8]) -> Option<usize> {
    buffer.iter().enumerate().find_map(|(i, &b)| {
        if b != b'\n' {
            return None;
        }
        match &buffer[i + 1..] {
            [b'\n', ..] => Some(i + 2),
            [b'\r', b'\n', ..] => Some(i + 3),
            _ => None,
        }
    })
}

fn dump_head(kind: &str, raw: &[u8]) {
    if tracing::enabled!(Level::TRACE) {
        trace!(kind, head = %String::from_utf8_lossy(raw), "HTTP head");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn reader(data: &[u8]) -> HttpReader<&[u8]> {
        HttpReader::new(data)
    }

    #[test]
    fn test_find_headers_end_simple() {
        let buffer = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(find_headers_end(buffer), Some(buffer.len()));
    }

    #[test]
    fn test_find_headers_end_with_body() {
        let buffer = b"POST / HTTP/1.1\r\nHost: example.com\r\n\r\nBody data here";
        let end = find_headers_end(buffer).unwrap();
        assert_eq!(&buffer[end..], b"Body data here");
    }

    #[test]
    fn test_find_headers_end_bare_lf() {
        let buffer = b"GET / HTTP/1.1\nHost: a\n\nrest";
        assert_eq!(&buffer[find_headers_end(buffer).unwrap()..], b"rest");
        assert_eq!(find_headers_end(b"GET / HTTP/1.1\r\nHost: a\r\n"), None);
    }

    #[tokio::test]
    async fn test_read_request_host_and_length() {
        let data = b"POST /upload HTTP/1.1\r\nHost: example.com:8080\r\nContent-Length: 5\r\n\r\nhello";
        let mut r = reader(data);
        let head = r.read_request().await.unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/upload");
        assert_eq!(head.host.as_deref(), Some("example.com:8080"));
        assert_eq!(head.body, BodyLength::Length(5));
        assert_eq!(&head.raw[..], &data[..data.len() - 5]);
    }

    #[tokio::test]
    async fn test_read_request_absolute_form() {
        let mut r = reader(b"GET http://user@proxy.test:81/x?y HTTP/1.1\r\n\r\n");
        let head = r.read_request().await.unwrap();
        assert_eq!(head.host.as_deref(), Some("proxy.test:81"));
        assert_eq!(head.body, BodyLength::Empty);
    }

    #[tokio::test]
    async fn test_absolute_form_overrides_host_header() {
        let mut r = reader(b"GET http://blocked.example/x HTTP/1.1\r\nHost: allowed.example\r\n\r\n");
        let head = r.read_request().await.unwrap();
        assert_eq!(head.host.as_deref(), Some("blocked.example"));
    }

    #[tokio::test]
    async fn test_many_headers_accepted() {
        let mut data = b"GET / HTTP/1.1\r\nHost: example.com\r\n".to_vec();
        for i in 0..200 {
            data.extend_from_slice(format!("X-Header-{}: {}\r\n", i, i).as_bytes());
        }
        data.extend_from_slice(b"\r\n");
        let mut r = reader(&data);
        let head = r.read_request().await.unwrap();
        assert_eq!(head.host.as_deref(), Some("example.com"));
        assert_eq!(head.raw.len(), data.len());
    }

    #[tokio::test]
    async fn test_conflicting_content_length_rejected() {
        let mut r = reader(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n");
        assert!(matches!(r.read_request().await, Err(HttpError::InvalidRequest)));
    }

    #[tokio::test]
    async fn test_truncated_head_rejected() {
        let mut r = reader(b"GET / HTTP/1.1\r\nHost: a\r\n");
        assert!(matches!(r.read_request().await, Err(HttpError::InvalidRequest)));
    }

    #[tokio::test]
    async fn test_response_framing() {
        let mut r = reader(b"HTTP/1.1 204 No Content\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(r.read_response(false).await.unwrap().body, BodyLength::Empty);

        let mut r = reader(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(r.read_response(true).await.unwrap().body, BodyLength::Empty);

        let mut r = reader(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n");
        assert_eq!(r.read_response(false).await.unwrap().body, BodyLength::Chunked);

        let mut r = reader(b"HTTP/1.0 200 OK\r\nServer: x\r\n\r\n");
        assert_eq!(r.read_response(false).await.unwrap().body, BodyLength::UntilClose);
    }

    #[tokio::test]
    async fn test_copy_chunked_body_verbatim() {
        let body = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: y\r\n\r\nNEXT";
        let mut r = reader(body);
        let mut out = Vec::new();
        r.copy_body(BodyLength::Chunked, &mut out).await.unwrap();
        assert_eq!(out, &body[..body.len() - 4]);
        let (rest, _) = r.into_parts();
        assert_eq!(&rest[..], b"NEXT");
    }

    #[tokio::test]
    async fn test_copy_exact_premature_eof() {
        let mut r = reader(b"abc");
        let mut out = Vec::new();
        let err = r.copy_body(BodyLength::Length(10), &mut out).await.unwrap_err();
        assert!(matches!(err, HttpError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn test_exchange_single_request() {
        let (client, mut client_peer) = duplex(4096);
        let (upstream, mut upstream_peer) = duplex(4096);

        let request = b"POST /a HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\nabcGET /second HTTP/1.1\r\n\r\n";
        client_peer.write_all(request).await.unwrap();

        let server = tokio::spawn(async move {
            let mut received = vec![0u8; 61];
            upstream_peer.read_exact(&mut received).await.unwrap();
            upstream_peer
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            (received, upstream_peer)
        });

        let mut reader = HttpReader::new(client);
        let head = reader.read_request().await.unwrap();
        let outcome = exchange(reader, &head, upstream, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(outcome, Exchange::Complete));
        drop(outcome);

        let (received, mut upstream_peer) = server.await.unwrap();
        assert_eq!(&received[..], &request[..61]);

        // The pipelined second request never reaches upstream.
        let mut rest = Vec::new();
        upstream_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let mut response = Vec::new();
        client_peer.read_to_end(&mut response).await.unwrap();
        assert_eq!(
            response,
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"
        );
    }
}
