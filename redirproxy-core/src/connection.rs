use crate::admission::{
    Admission, AdmissionControl, Bypass, BypassList, HostRateLimiter, RateLimiter,
};
use crate::dialer::{DialError, Dialer, DirectDialer};
use crate::http::{self, Exchange, HttpError, HttpReader};
use crate::original_dst::{
    CommandSource, LocalAddrResolver, OriginalDst, PfStateResolver, ResolveError,
};
use crate::relay::{RelayCounters, relay};
use crate::replay::ReplayStream;
use crate::sniff::{Sniffed, sniff};
use crate::target::{http_target, tls_target};
use crate::tls::{self, SniError};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use redirproxy_config::Config;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Duration, Instant, timeout_at};
use tracing::{Instrument, debug, error, info, info_span};

const NETWORK_TCP: &str = "tcp";

/// Per-connection failure. Admission rejections are not errors; see [`Outcome`].
#[derive(Debug)]
pub enum ConnectionError {
    Resolve(ResolveError),
    Decode(SniError),
    Http(HttpError),
    Dial(DialError),
    /// The sniff deadline passed while reading a ClientHello or request head
    Timeout(&'static str),
}

impl ConnectionError {
    fn kind(&self) -> &'static str {
        match self {
            ConnectionError::Resolve(_) => "resolve",
            ConnectionError::Decode(_) => "decode",
            ConnectionError::Http(_) => "http",
            ConnectionError::Dial(_) => "dial",
            ConnectionError::Timeout(_) => "timeout",
        }
    }

    /// Malformed or slow clients, as opposed to proxy-side failures.
    fn is_client_error(&self) -> bool {
        matches!(
            self,
            ConnectionError::Http(_) | ConnectionError::Timeout(_)
        )
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Resolve(e) => write!(f, "{}", e),
            ConnectionError::Decode(e) => write!(f, "ClientHello decode failed: {}", e),
            ConnectionError::Http(e) => write!(f, "{}", e),
            ConnectionError::Dial(e) => write!(f, "{}", e),
            ConnectionError::Timeout(stage) => write!(f, "timeout reading {}", stage),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Resolve(e) => Some(e),
            ConnectionError::Decode(e) => Some(e),
            ConnectionError::Http(e) => Some(e),
            ConnectionError::Dial(e) => Some(e),
            ConnectionError::Timeout(_) => None,
        }
    }
}

impl From<ResolveError> for ConnectionError {
    fn from(err: ResolveError) -> Self {
        ConnectionError::Resolve(err)
    }
}

impl From<SniError> for ConnectionError {
    fn from(err: SniError) -> Self {
        ConnectionError::Decode(err)
    }
}

impl From<HttpError> for ConnectionError {
    fn from(err: HttpError) -> Self {
        ConnectionError::Http(err)
    }
}

impl From<DialError> for ConnectionError {
    fn from(err: DialError) -> Self {
        ConnectionError::Dial(err)
    }
}

/// How a connection that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Relayed to `target` along the given path
    Completed { path: Sniffed, target: String },
    RateLimited,
    Bypassed { path: Sniffed, target: String },
}

impl Outcome {
    fn status(&self) -> &'static str {
        match self {
            Outcome::Completed { .. } => "success",
            Outcome::RateLimited => "rate_limited",
            Outcome::Bypassed { .. } => "bypassed",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            Outcome::Completed { path, .. } | Outcome::Bypassed { path, .. } => path.as_str(),
            Outcome::RateLimited => "none",
        }
    }
}

/// Behaviour switches and deadlines for connection handling.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Classify TLS and HTTP; when off every connection is relayed opaquely
    pub sniffing: bool,
    /// Bound on classification plus ClientHello / request head reads
    pub sniff_timeout: Duration,
    /// Idle bound on every relay read
    pub idle_timeout: Duration,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            sniffing: true,
            sniff_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

struct ConnectionMetrics {
    bytes_transferred: IntCounterVec,
    connections_total: IntCounterVec,
    connections_active: IntGauge,
    connection_duration: HistogramVec,
    errors_total: IntCounterVec,
    admission_total: IntCounterVec,
    protocol_distribution: IntCounterVec,
}

impl ConnectionMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let bytes_transferred = IntCounterVec::new(
            Opts::new(
                "redirproxy_bytes_transferred_total",
                "Total bytes relayed per direction",
            ),
            &["direction"],
        )?;
        registry.register(Box::new(bytes_transferred.clone()))?;

        let connections_total = IntCounterVec::new(
            Opts::new(
                "redirproxy_connections_total",
                "Total number of connections handled",
            ),
            &["path", "status"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = IntGauge::new(
            "redirproxy_connections_active",
            "Number of currently active connections",
        )?;
        registry.register(Box::new(connections_active.clone()))?;

        let connection_duration = HistogramVec::new(
            HistogramOpts::new(
                "redirproxy_connection_duration_seconds",
                "Connection duration in seconds",
            )
            .buckets(vec![
                0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0,
            ]),
            &["path"],
        )?;
        registry.register(Box::new(connection_duration.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("redirproxy_errors_total", "Total number of errors by type"),
            &["error_type"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let admission_total = IntCounterVec::new(
            Opts::new(
                "redirproxy_admission_total",
                "Admission control decisions",
            ),
            &["decision"],
        )?;
        registry.register(Box::new(admission_total.clone()))?;

        let protocol_distribution = IntCounterVec::new(
            Opts::new(
                "redirproxy_protocol_distribution_total",
                "Distribution of sniffed protocols",
            ),
            &["protocol"],
        )?;
        registry.register(Box::new(protocol_distribution.clone()))?;

        Ok(Self {
            bytes_transferred,
            connections_total,
            connections_active,
            connection_duration,
            errors_total,
            admission_total,
            protocol_distribution,
        })
    }
}

/// Holds one unit of the active-connections gauge, released on drop so a
/// cancelled connection task still decrements it.
struct ActiveGuard(IntGauge);

impl ActiveGuard {
    fn new(gauge: &IntGauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// Handles redirected connections: resolve, sniff, admit, dial, relay.
///
/// Shared collaborators are injected at construction and cloned cheaply into
/// every connection task.
#[derive(Clone)]
pub struct ConnectionHandler {
    resolver: Arc<dyn OriginalDst>,
    dialer: Arc<dyn Dialer>,
    admission: AdmissionControl,
    options: HandlerOptions,
    metrics: Option<Arc<ConnectionMetrics>>,
}

impl ConnectionHandler {
    pub fn new(
        resolver: Arc<dyn OriginalDst>,
        dialer: Arc<dyn Dialer>,
        options: HandlerOptions,
    ) -> Self {
        Self {
            resolver,
            dialer,
            admission: AdmissionControl::default(),
            options,
            metrics: None,
        }
    }

    pub fn with_admission(mut self, admission: AdmissionControl) -> Self {
        self.admission = admission;
        self
    }

    /// Registers connection metrics in `registry`.
    pub fn with_metrics(mut self, registry: &Registry) -> Result<Self, prometheus::Error> {
        self.metrics = Some(Arc::new(ConnectionMetrics::new(registry)?));
        Ok(self)
    }

    /// Wires the default collaborators from configuration: direct dialing, the
    /// local-address or pf state-table resolver, and optional admission control.
    pub fn from_config(
        config: &Config,
        registry: Option<&Registry>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let resolver: Arc<dyn OriginalDst> = if config.transparent {
            Arc::new(LocalAddrResolver)
        } else {
            let command = config
                .state_command()
                .ok_or("no state table command configured for this platform")?;
            let source = CommandSource::new(&command).ok_or("empty state table command")?;
            Arc::new(PfStateResolver::new(source))
        };

        let dialer = Arc::new(DirectDialer::new(Duration::from_secs(config.timeouts.connect)));

        let rate_limiter = match config.rate_limit {
            Some(ref limit) => Some(
                HostRateLimiter::from_config(limit)
                    .ok_or("rate_limit.requests_per_second must be greater than zero")?,
            ),
            None => None,
        };
        let admission = AdmissionControl::new(
            rate_limiter.map(|l| Arc::new(l) as Arc<dyn RateLimiter>),
            config
                .bypass
                .as_ref()
                .map(|b| Arc::new(BypassList::from_config(b)) as Arc<dyn Bypass>),
        );

        let options = HandlerOptions {
            sniffing: config.sniffing,
            sniff_timeout: Duration::from_secs(config.timeouts.sniff),
            idle_timeout: Duration::from_secs(config.timeouts.idle),
        };

        let handler = Self::new(resolver, dialer, options).with_admission(admission);
        match registry {
            Some(registry) => Ok(handler.with_metrics(registry)?),
            None => Ok(handler),
        }
    }

    /// Handles one inbound connection to completion. The stream is dropped,
    /// and with it closed, on every return path.
    pub async fn handle_connection<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> Result<Outcome, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let span = info_span!("conn", remote = %peer, local = %local);
        self.handle_inner(stream, peer, local).instrument(span).await
    }

    async fn handle_inner<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> Result<Outcome, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let start = std::time::Instant::now();
        info!("{} <> {}", peer, local);

        let active = self
            .metrics
            .as_ref()
            .map(|m| ActiveGuard::new(&m.connections_active));

        let result = self.process_connection(stream, peer, local).await;
        let duration = start.elapsed().as_secs_f64();
        drop(active);

        if let Some(ref metrics) = self.metrics {
            match result {
                Ok(ref outcome) => {
                    metrics
                        .connections_total
                        .with_label_values(&[outcome.path(), outcome.status()])
                        .inc();
                    metrics
                        .connection_duration
                        .with_label_values(&[outcome.path()])
                        .observe(duration);
                }
                Err(ref e) => {
                    metrics
                        .connections_total
                        .with_label_values(&["unknown", "failure"])
                        .inc();
                    metrics.errors_total.with_label_values(&[e.kind()]).inc();
                }
            }
        }

        match result {
            Ok(ref outcome) => {
                info!(duration_secs = %duration, status = outcome.status(), "{} >< {}", peer, local)
            }
            Err(ref e) if e.is_client_error() => {
                debug!(error = %e, duration_secs = %duration, "Client request rejected")
            }
            Err(ref e) => error!(error = %e, duration_secs = %duration, "Connection error"),
        }

        result
    }

    async fn process_connection<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> Result<Outcome, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.admit(self.admission.check_client(peer)) == Admission::RateLimited {
            return Ok(Outcome::RateLimited);
        }

        let dst = self.resolver.resolve(peer, local).await?;
        debug!(dst = %dst, "Original destination");

        if !self.options.sniffing {
            let stream = ReplayStream::new(bytes::Bytes::new(), stream);
            return self.handle_opaque(stream, peer, dst).await;
        }

        let deadline = Instant::now() + self.options.sniff_timeout;
        let (protocol, stream) = sniff(stream, deadline).await;
        if let Some(ref metrics) = self.metrics {
            metrics
                .protocol_distribution
                .with_label_values(&[protocol.as_str()])
                .inc();
        }

        match protocol {
            Sniffed::Tls => self.handle_tls(stream, peer, dst, deadline).await,
            Sniffed::Http => self.handle_http(stream, peer, deadline).await,
            Sniffed::Opaque => self.handle_opaque(stream, peer, dst).await,
        }
    }

    fn admit(&self, decision: Admission) -> Admission {
        if let Some(ref metrics) = self.metrics {
            metrics
                .admission_total
                .with_label_values(&[decision.as_str()])
                .inc();
        }
        decision
    }

    async fn handle_opaque<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        dst: SocketAddr,
    ) -> Result<Outcome, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let target = dst.to_string();
        debug!("{} >> {}", peer, target);

        if self.admit(self.admission.check_destination(&target)) == Admission::Bypassed {
            return Ok(Outcome::Bypassed {
                path: Sniffed::Opaque,
                target,
            });
        }

        let upstream = self.dialer.dial(NETWORK_TCP, &target).await?;
        self.transport(stream, upstream, peer, &target).await;
        Ok(Outcome::Completed {
            path: Sniffed::Opaque,
            target,
        })
    }

    async fn handle_http<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        deadline: Instant,
    ) -> Result<Outcome, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut reader = HttpReader::new(stream).idle_timeout(self.options.idle_timeout);
        let request = timeout_at(deadline, reader.read_request())
            .await
            .map_err(|_| ConnectionError::Timeout("HTTP request head"))??;

        let host = request.host.as_deref().ok_or(HttpError::NoHostHeader)?;
        let target = http_target(host);
        debug!(host = %target, method = %request.method, path = %request.path, "HTTP request");

        if self.admit(self.admission.check_destination(&target)) == Admission::Bypassed {
            return Ok(Outcome::Bypassed {
                path: Sniffed::Http,
                target,
            });
        }

        let upstream = self.dialer.dial(NETWORK_TCP, &target).await?;
        debug!("{} <-> {}", peer, target);
        let exchanged = http::exchange(reader, &request, upstream, self.options.idle_timeout)
            .await
            .inspect_err(|e| error!(host = %target, error = %e, "HTTP exchange failed"))?;
        if let Exchange::Upgraded { client, upstream } = exchanged {
            debug!(host = %target, "Connection upgraded, relaying");
            self.transport(client, upstream, peer, &target).await;
        }

        Ok(Outcome::Completed {
            path: Sniffed::Http,
            target,
        })
    }

    async fn handle_tls<S>(
        &self,
        mut stream: ReplayStream<S>,
        peer: SocketAddr,
        dst: SocketAddr,
        deadline: Instant,
    ) -> Result<Outcome, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut record = Vec::with_capacity(1024);
        timeout_at(deadline, tls::read_record(&mut stream, &mut record))
            .await
            .map_err(|_| ConnectionError::Timeout("TLS ClientHello"))??;

        let sni = tls::extract_sni(&record)?;
        // The original destination is always known here, so a target exists.
        let target = tls_target(sni.as_deref(), Some(dst)).unwrap_or_else(|| dst.to_string());
        debug!(sni = sni.as_deref().unwrap_or(""), host = %target, "TLS ClientHello");

        if self.admit(self.admission.check_destination(&target)) == Admission::Bypassed {
            return Ok(Outcome::Bypassed {
                path: Sniffed::Tls,
                target,
            });
        }

        let upstream = self.dialer.dial(NETWORK_TCP, &target).await?;
        self.transport(ReplayStream::new(record, stream), upstream, peer, &target)
            .await;

        Ok(Outcome::Completed {
            path: Sniffed::Tls,
            target,
        })
    }

    async fn transport<C, U>(&self, client: C, upstream: U, peer: SocketAddr, target: &str)
    where
        C: AsyncRead + AsyncWrite + Unpin,
        U: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("{} <-> {}", peer, target);
        let stats = relay(client, upstream, self.options.idle_timeout, &self.counters()).await;
        debug!(
            finished_by = ?stats.finished_by,
            duration_secs = %stats.duration.as_secs_f64(),
            bytes_up = stats.bytes_upstream,
            bytes_down = stats.bytes_downstream,
            "{} >-< {}",
            peer,
            target
        );
    }

    fn counters(&self) -> RelayCounters {
        match self.metrics {
            Some(ref m) => RelayCounters {
                upstream: Some(m.bytes_transferred.with_label_values(&["tx"])),
                downstream: Some(m.bytes_transferred.with_label_values(&["rx"])),
            },
            None => RelayCounters::default(),
        }
    }
}
