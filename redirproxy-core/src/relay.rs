//! Full-duplex byte relay between the client and the upstream connection.
//!
//! Both directions run concurrently. The first direction to finish, through
//! EOF, error or idle timeout, ends the whole relay: both write halves are
//! shut down and both streams are dropped when [`relay`] returns.

use prometheus::IntCounter;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Duration, Instant, timeout};
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 32768;

/// Byte counters fed while relaying, one per direction.
#[derive(Clone, Default)]
pub struct RelayCounters {
    pub upstream: Option<IntCounter>,
    pub downstream: Option<IntCounter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream
    Upstream,
    /// Upstream to client
    Downstream,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelayStats {
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
    /// Direction that ended the relay
    pub finished_by: Direction,
    pub duration: Duration,
}

/// Relays bytes both ways until either side closes, fails, or idles out.
///
/// Relay I/O errors are logged at debug level and not surfaced; they end the
/// relay the same way a clean close does.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    idle: Duration,
    counters: &RelayCounters,
) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();
    let (mut client_read, mut client_write) = io::split(client);
    let (mut upstream_read, mut upstream_write) = io::split(upstream);
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let (finished_by, result) = tokio::select! {
        r = copy_half(&mut client_read, &mut upstream_write, idle, &sent, counters.upstream.as_ref()) => {
            (Direction::Upstream, r)
        }
        r = copy_half(&mut upstream_read, &mut client_write, idle, &received, counters.downstream.as_ref()) => {
            (Direction::Downstream, r)
        }
    };

    if let Err(e) = result {
        debug!(direction = finished_by.as_str(), error = %e, "Relay I/O error");
    }

    // Best effort: the peer may already be gone.
    let _ = timeout(Duration::from_secs(1), upstream_write.shutdown()).await;
    let _ = timeout(Duration::from_secs(1), client_write.shutdown()).await;

    RelayStats {
        bytes_upstream: sent.load(Ordering::Relaxed),
        bytes_downstream: received.load(Ordering::Relaxed),
        finished_by,
        duration: start.elapsed(),
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
    total: &AtomicU64,
    counter: Option<&IntCounter>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = timeout(idle, reader.read(&mut buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout"))??;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        total.fetch_add(n as u64, Ordering::Relaxed);
        if let Some(counter) = counter {
            counter.inc_by(n as u64);
        }
    }
}
