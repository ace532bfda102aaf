pub mod admission;
pub mod connection;
pub mod dialer;
pub mod http;
pub mod original_dst;
pub mod relay;
pub mod replay;
pub mod sniff;
pub mod target;
pub mod tls;

pub use admission::{Admission, AdmissionControl, Bypass, BypassList, HostRateLimiter, Limiter, RateLimiter};
pub use connection::{ConnectionError, ConnectionHandler, HandlerOptions, Outcome};
pub use dialer::{BoxedStream, DialError, Dialer, DirectDialer};
pub use original_dst::{LocalAddrResolver, OriginalDst, PfStateResolver, ResolveError};
pub use sniff::Sniffed;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use prometheus::Registry;
use redirproxy_config::Config;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info, warn};

const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

pub async fn run_proxy(
    config: Config,
    registry: Option<Registry>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handler = ConnectionHandler::from_config(&config, registry.as_ref())?;
    info!(
        transparent = config.transparent,
        sniffing = config.sniffing,
        "Connection handler ready"
    );

    let mut listeners: Vec<TcpListener> = Vec::new();
    for addr_str in &config.listen_addrs {
        let addr: SocketAddr = addr_str.parse()?;
        info!("Starting listener on {}", addr);
        listeners.push(TcpListener::bind(addr).await?);
    }

    let limits = ServeLimits {
        max_connections: config.max_connections,
        shutdown_timeout: Duration::from_secs(
            config.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
        ),
    };

    serve(listeners, handler, limits, async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    })
    .await;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ServeLimits {
    /// Accepting pauses while this many connections are in flight
    pub max_connections: Option<usize>,
    /// How long in-flight connections get to finish after shutdown starts
    pub shutdown_timeout: Duration,
}

impl Default for ServeLimits {
    fn default() -> Self {
        Self {
            max_connections: None,
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT),
        }
    }
}

/// Accepts on every listener until `shutdown` resolves, handling each
/// connection in its own task.
///
/// On shutdown, accepting stops and in-flight connections get up to
/// `limits.shutdown_timeout` to finish before they are cancelled.
pub async fn serve<F>(
    listeners: Vec<TcpListener>,
    handler: ConnectionHandler,
    limits: ServeLimits,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    let (cancel_tx, cancel_rx) = watch::channel(false);
    // Each task holds a sender; recv() returns None once all of them are gone.
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
    let permits = limits.max_connections.map(|n| Arc::new(Semaphore::new(n)));

    info!("Proxy started, waiting for connections...");
    tokio::pin!(shutdown);

    loop {
        let permit = match permits {
            Some(ref semaphore) => tokio::select! {
                _ = &mut shutdown => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
            },
            None => None,
        };

        let mut accepts = FuturesUnordered::new();
        for listener in &listeners {
            accepts.push(async move { (listener.accept().await, listener.local_addr()) });
        }

        tokio::select! {
            _ = &mut shutdown => break,
            Some((result, listen_addr)) = accepts.next() => {
                let (socket, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                };
                let _ = socket.set_nodelay(true);
                // The socket's local address is the original destination under TPROXY.
                let local = match socket.local_addr().or(listen_addr) {
                    Ok(local) => local,
                    Err(e) => {
                        error!(%peer, "Failed to read local address: {}", e);
                        continue;
                    }
                };

                let handler = handler.clone();
                let mut cancel = cancel_rx.clone();
                let done = done_tx.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = handler.handle_connection(socket, peer, local) => {}
                        _ = cancel.changed() => debug!(%peer, "Connection cancelled by shutdown"),
                    }
                    drop(permit);
                    drop(done);
                });
            }
        }
    }

    info!("Received shutdown signal, draining connections");
    drop(listeners);
    drop(done_tx);

    if timeout(limits.shutdown_timeout, done_rx.recv()).await.is_err() {
        warn!(
            timeout_secs = limits.shutdown_timeout.as_secs(),
            "Shutdown timeout reached, cancelling remaining connections"
        );
        let _ = cancel_tx.send(true);
        // Cancelled tasks exit at their next poll.
        let _ = timeout(Duration::from_secs(1), done_rx.recv()).await;
    }

    info!("Shutting down proxy");
}
