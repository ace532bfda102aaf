use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

/// Redirect proxy configuration loaded from YAML.
///
/// Covers listen addresses, the two behaviour switches (transparent mode and
/// protocol sniffing), timeouts, metrics, and the optional admission control
/// and original-destination lookup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// List of addresses to listen on (e.g., "0.0.0.0:12345", "[::]:12345")
    pub listen_addrs: Vec<String>,
    /// Use the local socket address as the original destination (TPROXY style)
    /// instead of querying the firewall state table.
    #[serde(default)]
    pub transparent: bool,
    /// Classify TLS and HTTP traffic before relaying. When disabled every
    /// connection is relayed opaquely to its original destination.
    #[serde(default = "default_sniffing")]
    pub sniffing: bool,
    /// Timeout configuration for various operations
    pub timeouts: Timeouts,
    /// Prometheus metrics configuration
    pub metrics: Metrics,
    /// Maximum number of concurrent connections (unbounded if not specified)
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// Graceful shutdown timeout in seconds (default: 30 if not specified)
    #[serde(default)]
    pub shutdown_timeout: Option<u64>,
    /// Firewall state-table lookup used to recover original destinations
    #[serde(default)]
    pub state_table: Option<StateTable>,
    /// Per-client rate limiting
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    /// Destinations that are silently dropped instead of dialed
    #[serde(default)]
    pub bypass: Option<Bypass>,
}

fn default_sniffing() -> bool {
    true
}

/// Timeout settings for proxy operations (all values in seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Maximum time to establish the upstream connection (default: 10s)
    pub connect: u64,
    /// Maximum time to classify the stream and read the TLS ClientHello or HTTP head
    pub sniff: u64,
    /// Maximum idle time for established relays (default: 300s)
    pub idle: u64,
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to enable metrics collection
    pub enabled: bool,
    /// Address to bind metrics HTTP server (e.g., "127.0.0.1:9000")
    pub address: String,
}

/// Command producing the firewall state dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTable {
    /// Program and arguments, e.g. `["sudo", "-n", "/sbin/pfctl", "-s", "state"]`
    pub command: Vec<String>,
}

/// Token bucket applied per client host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    /// Sustained connections per second allowed from one host
    pub requests_per_second: u32,
    /// Bucket size; defaults to `requests_per_second`
    #[serde(default)]
    pub burst: Option<u32>,
    /// Hosts that are never limited
    #[serde(default)]
    pub exempt: Vec<String>,
}

/// Bypass rule set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bypass {
    /// Host patterns (`example.com`, `*.example.com`, `*suffix`) or exact
    /// `host:port` destinations
    pub patterns: Vec<String>,
    /// Invert the rule set: only matching destinations are let through
    #[serde(default)]
    pub whitelist: bool,
}

/// The pf state dump command used when none is configured.
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
pub const DEFAULT_STATE_COMMAND: Option<&[&str]> = Some(&["sudo", "-n", "/sbin/pfctl", "-s", "state"]);

/// No state-table command is known for this platform.
#[cfg(not(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd")))]
pub const DEFAULT_STATE_COMMAND: Option<&[&str]> = None;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml_ng::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config: {}", e),
            ConfigError::Yaml(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Yaml(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml_ng::Error> for ConfigError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

impl Config {
    /// Loads and validates configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use redirproxy_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and deserializes a file without validating it, for callers that
    /// layer overrides on top before calling [`Config::validate`].
    pub fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_yaml_ng::from_str(&contents)?)
    }

    /// Parses and validates configuration from a YAML string.
    ///
    /// # Examples
    ///
    /// ```
    /// use redirproxy_config::Config;
    ///
    /// let yaml = r#"
    /// listen_addrs:
    ///   - "0.0.0.0:12345"
    /// transparent: true
    /// timeouts:
    ///   connect: 10
    ///   sniff: 10
    ///   idle: 300
    /// metrics:
    ///   enabled: false
    ///   address: "127.0.0.1:9000"
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.listen_addrs[0], "0.0.0.0:12345");
    /// assert!(config.sniffing);
    /// ```
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml_ng::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addrs.is_empty() {
            return Err(ConfigError::Invalid("listen_addrs must not be empty".into()));
        }
        for addr in &self.listen_addrs {
            addr.parse::<SocketAddr>()
                .map_err(|e| ConfigError::Invalid(format!("listen address {}: {}", addr, e)))?;
        }
        if self.metrics.enabled {
            self.metrics.address.parse::<SocketAddr>().map_err(|e| {
                ConfigError::Invalid(format!("metrics address {}: {}", self.metrics.address, e))
            })?;
        }
        if self.timeouts.connect == 0 || self.timeouts.sniff == 0 || self.timeouts.idle == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than zero".into()));
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid("max_connections must be greater than zero".into()));
        }
        if let Some(ref limit) = self.rate_limit
            && (limit.requests_per_second == 0 || limit.burst == Some(0))
        {
            return Err(ConfigError::Invalid(
                "rate_limit requests_per_second and burst must be greater than zero".into(),
            ));
        }
        if let Some(ref table) = self.state_table
            && table.command.is_empty()
        {
            return Err(ConfigError::Invalid("state_table.command must not be empty".into()));
        }
        if !self.transparent && self.state_command().is_none() {
            return Err(ConfigError::Invalid(
                "state_table.command is required when transparent mode is off on this platform"
                    .into(),
            ));
        }
        Ok(())
    }

    /// The state dump command to run, falling back to the platform default.
    pub fn state_command(&self) -> Option<Vec<String>> {
        match self.state_table {
            Some(ref table) => Some(table.command.clone()),
            None => DEFAULT_STATE_COMMAND.map(|cmd| cmd.iter().map(|s| s.to_string()).collect()),
        }
    }
}

/// Checks if a hostname matches a host pattern.
///
/// - Exact match: `"example.com"` matches only `"example.com"`
/// - Subdomain wildcard: `"*.example.com"` matches `"api.example.com"` and `"example.com"`
/// - Suffix wildcard: `"*api.com"` matches `"api.com"`, `"testapi.com"`, etc.
///
/// # Examples
///
/// ```
/// use redirproxy_config::matches_host_pattern;
///
/// assert!(matches_host_pattern("example.com", "example.com"));
/// assert!(matches_host_pattern("api.example.com", "*.example.com"));
/// assert!(matches_host_pattern("example.com", "*.example.com"));
/// assert!(matches_host_pattern("myapi.com", "*api.com"));
/// ```
pub fn matches_host_pattern(hostname: &str, pattern: &str) -> bool {
    if pattern == hostname {
        return true;
    }

    if let Some(domain) = pattern.strip_prefix("*.") {
        hostname.ends_with(&format!(".{}", domain)) || hostname == domain
    } else if let Some(suffix) = pattern.strip_prefix("*") {
        hostname.ends_with(suffix)
    } else {
        false
    }
}
