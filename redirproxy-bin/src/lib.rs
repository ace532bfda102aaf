use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use redirproxy_config::Config;
use redirproxy_core::run_proxy;
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt};

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Command-line settings layered over the configuration file.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    /// Force transparent mode on
    pub transparent: bool,
    /// Force sniffing off
    pub no_sniffing: bool,
}

impl RunOptions {
    /// Applies command-line overrides; flags only ever switch a setting one way.
    pub fn apply(&self, config: &mut Config) {
        if self.transparent {
            config.transparent = true;
        }
        if self.no_sniffing {
            config.sniffing = false;
        }
    }
}

pub fn init_logging() -> Result<(), BoxError> {
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("redirproxy=debug".parse()?),
        )
        .with_target(false)
        .json()
        .try_init()?;
    Ok(())
}

pub async fn run(options: RunOptions) -> Result<(), BoxError> {
    init_logging()?;

    let mut config = Config::read_file(&options.config_path)?;
    options.apply(&mut config);
    config.validate()?;
    info!(config = %options.config_path.display(), "Configuration loaded");

    let registry = if config.metrics.enabled {
        let registry = Registry::new();
        let metrics_addr: SocketAddr = config.metrics.address.parse()?;
        let metrics_listener = TcpListener::bind(metrics_addr).await?;
        info!("Metrics listening on {}", metrics_addr);
        tokio::spawn(serve_metrics(metrics_listener, registry.clone()));
        Some(registry)
    } else {
        None
    };

    run_proxy(config, registry).await
}

/// Serves `/metrics` in the Prometheus text format and `/health`.
pub async fn serve_metrics(listener: TcpListener, registry: Registry) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                debug!("Metrics accept error: {}", e);
                continue;
            }
        };
        let registry = registry.clone();
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
                let registry = registry.clone();
                async move { Ok::<_, String>(route(req.uri().path(), &registry)?) }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server error: {}", err);
            }
        });
    }
}

fn route(path: &str, registry: &Registry) -> Result<Response<Full<bytes::Bytes>>, String> {
    let (status, body) = match path {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let mut buffer = vec![];
            encoder
                .encode(&registry.gather(), &mut buffer)
                .map_err(|e| format!("Metrics encoding error: {}", e))?;
            (StatusCode::OK, buffer)
        }
        "/health" => (StatusCode::OK, b"ok".to_vec()),
        _ => (StatusCode::NOT_FOUND, b"not found".to_vec()),
    };
    Response::builder()
        .status(status)
        .body(Full::new(bytes::Bytes::from(body)))
        .map_err(|e| e.to_string())
}
