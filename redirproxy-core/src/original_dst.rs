//! Original-destination recovery for redirected connections.
//!
//! Two strategies are provided: [`LocalAddrResolver`] for transparent (TPROXY)
//! setups where the socket's local address already is the destination, and
//! [`PfStateResolver`], which looks the client tuple up in the pf state table.
//! The state table is fetched fresh on every lookup.

use futures::future::BoxFuture;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::process::Command;
use tracing::{debug, trace};

const ESTABLISHED: &str = "ESTABLISHED:ESTABLISHED";
const DESTINATION_FIELD: usize = 4;

#[derive(Debug)]
pub enum ResolveError {
    /// No established state entry for the client tuple
    NoMatch(SocketAddr),
    /// The state dump command could not be run
    Command(io::Error),
    /// The state dump command exited unsuccessfully
    CommandStatus(Option<i32>),
    /// A matching entry had an unparseable destination
    Malformed(String),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::NoMatch(client) => {
                write!(f, "could not resolve original destination for {}", client)
            }
            ResolveError::Command(e) => write!(f, "state table query failed: {}", e),
            ResolveError::CommandStatus(Some(code)) => {
                write!(f, "state table query exited with status {}", code)
            }
            ResolveError::CommandStatus(None) => {
                write!(f, "state table query terminated by signal")
            }
            ResolveError::Malformed(entry) => write!(f, "malformed state entry: {}", entry),
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResolveError::Command(e) => Some(e),
            _ => None,
        }
    }
}

/// Recovers where a redirected connection was originally headed.
pub trait OriginalDst: Send + Sync {
    fn resolve(
        &self,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> BoxFuture<'_, Result<SocketAddr, ResolveError>>;
}

/// Transparent mode: the local address is the original destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalAddrResolver;

impl OriginalDst for LocalAddrResolver {
    fn resolve(
        &self,
        _peer: SocketAddr,
        local: SocketAddr,
    ) -> BoxFuture<'_, Result<SocketAddr, ResolveError>> {
        Box::pin(async move { Ok(local) })
    }
}

/// Produces the textual firewall state dump.
pub trait StateSource: Send + Sync {
    fn dump(&self) -> BoxFuture<'_, Result<String, ResolveError>>;
}

/// Runs an external command (by default `pfctl -s state`) and captures stdout.
#[derive(Debug, Clone)]
pub struct CommandSource {
    program: String,
    args: Vec<String>,
}

impl CommandSource {
    /// Builds a source from `[program, args...]`; `None` if `command` is empty.
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl StateSource for CommandSource {
    fn dump(&self) -> BoxFuture<'_, Result<String, ResolveError>> {
        Box::pin(async move {
            let output = Command::new(&self.program)
                .args(&self.args)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(ResolveError::Command)?;
            if !output.status.success() {
                return Err(ResolveError::CommandStatus(output.status.code()));
            }
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
    }
}

/// A fixed dump, for tests and offline tooling.
impl StateSource for String {
    fn dump(&self) -> BoxFuture<'_, Result<String, ResolveError>> {
        Box::pin(async move { Ok(self.clone()) })
    }
}

/// Looks the client tuple up in the pf state table.
#[derive(Debug, Clone)]
pub struct PfStateResolver<S = CommandSource> {
    source: S,
}

impl<S: StateSource> PfStateResolver<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: StateSource> OriginalDst for PfStateResolver<S> {
    fn resolve(
        &self,
        peer: SocketAddr,
        _local: SocketAddr,
    ) -> BoxFuture<'_, Result<SocketAddr, ResolveError>> {
        Box::pin(async move {
            let table = self.source.dump().await?;
            // IPv4-mapped clients appear as plain IPv4 in the table.
            let client = peer.ip().to_canonical();
            trace!(
                %client,
                port = peer.port(),
                entries = table.lines().count(),
                "Querying state table"
            );
            let dst = lookup(&table, client, peer.port())?;
            debug!(%peer, %dst, "Resolved original destination");
            Ok(dst)
        })
    }
}

/// Finds the destination of the established entry whose source is
/// `address:port` (IPv4) or `address[port]` (IPv6). The first match wins.
pub fn lookup(table: &str, address: IpAddr, port: u16) -> Result<SocketAddr, ResolveError> {
    let spec_v4 = format!("{}:{}", address, port);
    let spec_v6 = format!("{}[{}]", address, port);

    for line in table.lines() {
        if !line.contains(ESTABLISHED) {
            continue;
        }
        let destination = if contains_tuple(line, &spec_v4) {
            line.split_whitespace()
                .nth(DESTINATION_FIELD)
                .and_then(parse_v4_tuple)
        } else if contains_tuple(line, &spec_v6) {
            line.split_whitespace()
                .nth(DESTINATION_FIELD)
                .and_then(parse_v6_tuple)
        } else {
            continue;
        };
        return destination.ok_or_else(|| ResolveError::Malformed(line.trim().to_string()));
    }

    Err(ResolveError::NoMatch(SocketAddr::new(address, port)))
}

/// Stricter than a plain substring test: the tuple must be bounded by
/// whitespace, parentheses or the line ends, so `10.0.0.1:80` does not match
/// inside `110.0.0.1:8080`. Parenthesised tuples, as pfctl prints for
/// translated addresses, still match.
fn contains_tuple(line: &str, tuple: &str) -> bool {
    let is_boundary = |c: char| c.is_whitespace() || c == '(' || c == ')';
    line.match_indices(tuple).any(|(start, _)| {
        let end = start + tuple.len();
        let before = line[..start].chars().next_back();
        let after = line[end..].chars().next();
        before.is_none_or(is_boundary) && after.is_none_or(is_boundary)
    })
}

fn parse_v4_tuple(field: &str) -> Option<SocketAddr> {
    let mut parts = field.split(':');
    let (addr, port, rest) = (parts.next()?, parts.next()?, parts.next());
    if rest.is_some() {
        return None;
    }
    Some(SocketAddr::new(addr.parse().ok()?, port.parse().ok()?))
}

fn parse_v6_tuple(field: &str) -> Option<SocketAddr> {
    let (addr, rest) = field.split_once('[')?;
    let port = rest.strip_suffix(']')?;
    Some(SocketAddr::new(addr.parse().ok()?, port.parse().ok()?))
}
