//! Admission control: per-client rate limiting and destination bypass.
//!
//! Both collaborators are shared by every connection task, so the concrete
//! implementations here are internally synchronised and never mutated per
//! connection beyond consuming rate-limit tokens.

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Governor};
use redirproxy_config::matches_host_pattern;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::target::strip_port;

/// Tracked host count above which idle buckets are swept on insert.
const PURGE_THRESHOLD: usize = 4096;

/// A single rate limiter.
pub trait Limiter: Send + Sync {
    fn allow(&self, weight: u32) -> bool;
}

/// Registry handing out the limiter for a client host, if it has one.
pub trait RateLimiter: Send + Sync {
    fn limiter(&self, key: &str) -> Option<Arc<dyn Limiter>>;
}

/// Destinations that should be dropped instead of dialed.
pub trait Bypass: Send + Sync {
    fn contains(&self, destination: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    RateLimited,
    Bypassed,
}

impl Admission {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Allow => "allow",
            Admission::RateLimited => "rate_limited",
            Admission::Bypassed => "bypassed",
        }
    }
}

/// The rate limiter and bypass set consulted before dialing.
#[derive(Clone, Default)]
pub struct AdmissionControl {
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    bypass: Option<Arc<dyn Bypass>>,
}

impl AdmissionControl {
    pub fn new(
        rate_limiter: Option<Arc<dyn RateLimiter>>,
        bypass: Option<Arc<dyn Bypass>>,
    ) -> Self {
        Self {
            rate_limiter,
            bypass,
        }
    }

    /// Rate-limit check keyed by the client host with its port stripped.
    pub fn check_client(&self, peer: SocketAddr) -> Admission {
        let Some(ref registry) = self.rate_limiter else {
            return Admission::Allow;
        };
        let host = peer.ip().to_canonical().to_string();
        match registry.limiter(&host) {
            Some(limiter) if !limiter.allow(1) => {
                debug!(client = %host, "Rate limited");
                Admission::RateLimited
            }
            _ => Admission::Allow,
        }
    }

    /// Bypass check against a textual destination (address, Host or SNI).
    pub fn check_destination(&self, destination: &str) -> Admission {
        match self.bypass {
            Some(ref bypass) if bypass.contains(destination) => {
                debug!(destination, "Bypassed");
                Admission::Bypassed
            }
            _ => Admission::Allow,
        }
    }
}

type DirectLimiter = Governor<NotKeyed, InMemoryState, DefaultClock>;

/// Token bucket for one client host.
pub struct TokenBucket {
    limiter: DirectLimiter,
    last_used_ms: AtomicU64,
    epoch: Instant,
}

impl TokenBucket {
    fn new(quota: Quota, epoch: Instant) -> Self {
        Self {
            limiter: Governor::direct(quota),
            last_used_ms: AtomicU64::new(epoch.elapsed().as_millis() as u64),
            epoch,
        }
    }

    fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_used_ms.load(Ordering::Relaxed)))
    }
}

impl Limiter for TokenBucket {
    fn allow(&self, weight: u32) -> bool {
        self.last_used_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
        match NonZeroU32::new(weight) {
            None => true,
            Some(n) => matches!(self.limiter.check_n(n), Ok(Ok(()))),
        }
    }
}

/// Per-host token buckets, created lazily on first sight of a host.
pub struct HostRateLimiter {
    quota: Quota,
    refill: Duration,
    exempt: Vec<String>,
    buckets: DashMap<String, Arc<TokenBucket>>,
    epoch: Instant,
    last_purge_ms: AtomicU64,
}

impl HostRateLimiter {
    /// `None` when `per_second` is zero.
    pub fn new(per_second: u32, burst: Option<u32>, exempt: Vec<String>) -> Option<Self> {
        let rate = NonZeroU32::new(per_second)?;
        let burst = burst.and_then(NonZeroU32::new).unwrap_or(rate);
        let refill = Duration::from_secs_f64(burst.get() as f64 / rate.get() as f64);
        Some(Self {
            quota: Quota::per_second(rate).allow_burst(burst),
            refill,
            exempt,
            buckets: DashMap::new(),
            epoch: Instant::now(),
            last_purge_ms: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &redirproxy_config::RateLimit) -> Option<Self> {
        Self::new(
            config.requests_per_second,
            config.burst,
            config.exempt.clone(),
        )
    }

    /// Drops buckets idle long enough to have refilled completely; a fresh
    /// bucket behaves identically, so this only reclaims memory.
    pub fn purge_idle(&self) -> usize {
        // Counted in the sweep itself; other tasks may insert concurrently.
        let mut purged = 0;
        self.buckets.retain(|_, bucket| {
            let keep = bucket.idle_for() <= self.refill;
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }

    pub fn tracked_hosts(&self) -> usize {
        self.buckets.len()
    }

    /// Sweeps at most once per refill period, and only past the threshold.
    fn maybe_purge(&self) {
        if self.buckets.len() < PURGE_THRESHOLD {
            return;
        }
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_purge_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.refill.as_millis() as u64 {
            return;
        }
        if self
            .last_purge_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            let purged = self.purge_idle();
            debug!(purged, remaining = self.buckets.len(), "Purged idle rate limit buckets");
        }
    }
}

impl RateLimiter for HostRateLimiter {
    fn limiter(&self, key: &str) -> Option<Arc<dyn Limiter>> {
        if self.exempt.iter().any(|h| h == key) {
            return None;
        }
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(self.quota, self.epoch)))
            .clone();
        self.maybe_purge();
        Some(bucket)
    }
}

/// Host patterns and exact `host:port` destinations.
#[derive(Debug, Clone, Default)]
pub struct BypassList {
    patterns: Vec<String>,
    whitelist: bool,
}

impl BypassList {
    pub fn new(patterns: Vec<String>, whitelist: bool) -> Self {
        Self {
            patterns: patterns.into_iter().map(|p| p.to_lowercase()).collect(),
            whitelist,
        }
    }

    pub fn from_config(config: &redirproxy_config::Bypass) -> Self {
        Self::new(config.patterns.clone(), config.whitelist)
    }

    fn matches(&self, destination: &str) -> bool {
        let destination = destination.to_lowercase();
        let host = strip_port(&destination);
        self.patterns
            .iter()
            .any(|p| *p == destination || matches_host_pattern(host, p))
    }
}

impl Bypass for BypassList {
    fn contains(&self, destination: &str) -> bool {
        self.matches(destination) != self.whitelist
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_no_collaborators_allows_everything() {
        let control = AdmissionControl::default();
        assert_eq!(control.check_client(peer("10.0.0.1:1")), Admission::Allow);
        assert_eq!(control.check_destination("example.com:80"), Admission::Allow);
    }

    #[test]
    fn test_rate_limit_keyed_by_host_without_port() {
        let limiter = HostRateLimiter::new(1, Some(2), vec![]).unwrap();
        let control = AdmissionControl::new(Some(Arc::new(limiter)), None);

        assert_eq!(control.check_client(peer("10.0.0.1:1000")), Admission::Allow);
        assert_eq!(control.check_client(peer("10.0.0.1:1001")), Admission::Allow);
        assert_eq!(control.check_client(peer("10.0.0.1:1002")), Admission::RateLimited);
        assert_eq!(control.check_client(peer("10.0.0.1:1003")), Admission::RateLimited);
        // Other hosts have their own bucket.
        assert_eq!(control.check_client(peer("10.0.0.2:1000")), Admission::Allow);
    }

    #[test]
    fn test_exempt_host_has_no_limiter() {
        let limiter = HostRateLimiter::new(1, Some(1), vec!["127.0.0.1".into()]).unwrap();
        assert!(limiter.limiter("127.0.0.1").is_none());
        assert!(limiter.limiter("127.0.0.2").is_some());

        let control = AdmissionControl::new(Some(Arc::new(limiter)), None);
        for port in 0..5 {
            assert_eq!(
                control.check_client(SocketAddr::new("127.0.0.1".parse().unwrap(), port)),
                Admission::Allow
            );
        }
    }

    #[test]
    fn test_mapped_client_shares_ipv4_bucket() {
        let limiter = HostRateLimiter::new(1, Some(1), vec![]).unwrap();
        let control = AdmissionControl::new(Some(Arc::new(limiter)), None);
        assert_eq!(control.check_client(peer("10.0.0.9:1")), Admission::Allow);
        assert_eq!(
            control.check_client(peer("[::ffff:10.0.0.9]:2")),
            Admission::RateLimited
        );
    }

    #[test]
    fn test_zero_weight_always_allowed() {
        let limiter = HostRateLimiter::new(1, Some(1), vec![]).unwrap();
        let bucket = limiter.limiter("h").unwrap();
        assert!(bucket.allow(1));
        assert!(bucket.allow(0));
        assert!(!bucket.allow(1));
    }

    #[test]
    fn test_purge_keeps_recent_buckets() {
        let limiter = HostRateLimiter::new(1, Some(1), vec![]).unwrap();
        limiter.limiter("a").unwrap().allow(1);
        assert_eq!(limiter.purge_idle(), 0);
        assert_eq!(limiter.tracked_hosts(), 1);
        assert!(HostRateLimiter::new(0, None, vec![]).is_none());
    }

    #[test]
    fn test_purge_concurrent_with_inserts() {
        let limiter = Arc::new(HostRateLimiter::new(1000, Some(1), vec![]).unwrap());
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    for i in 0..5000 {
                        limiter.limiter(&format!("{}-{}", t, i));
                    }
                })
            })
            .collect();

        let mut purged = 0;
        for _ in 0..20000 {
            purged += limiter.purge_idle();
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(purged + limiter.tracked_hosts() <= 20000);
    }

    #[test]
    fn test_purge_drops_refilled_buckets() {
        let limiter = HostRateLimiter::new(1000, Some(1), vec![]).unwrap();
        limiter.limiter("a").unwrap().allow(1);
        limiter.limiter("b").unwrap().allow(1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(limiter.purge_idle(), 2);
        assert_eq!(limiter.tracked_hosts(), 0);
    }

    #[test]
    fn test_bypass_patterns() {
        let bypass = BypassList::new(vec!["*.Internal.example".into(), "10.0.0.1:443".into()], false);
        assert!(bypass.contains("git.internal.example:443"));
        assert!(bypass.contains("internal.example"));
        assert!(bypass.contains("10.0.0.1:443"));
        assert!(!bypass.contains("10.0.0.1:80"));
        assert!(!bypass.contains("example.com:443"));
    }

    #[test]
    fn test_bypass_whitelist_inverts() {
        let bypass = BypassList::new(vec!["allowed.example".into()], true);
        assert!(!bypass.contains("allowed.example:443"));
        assert!(bypass.contains("other.example:443"));
    }

    #[test]
    fn test_check_destination_bypassed() {
        let bypass = BypassList::new(vec!["example.com".into()], false);
        let control = AdmissionControl::new(None, Some(Arc::new(bypass)));
        assert_eq!(control.check_destination("example.com:80"), Admission::Bypassed);
        assert_eq!(control.check_destination("example.org:80"), Admission::Allow);
    }
}
