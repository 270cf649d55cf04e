//! Reverse DNS (PTR) sub-enricher
//!
//! Caches results with a TTL (negative results included, to shield the
//! resolver from hot miss keys) and gates new lookups behind a one-second
//! QPS window. The lock is released across the network call.

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Lookups per second when the configured cap is non-positive.
const DEFAULT_MAX_QPS: u32 = 10;

struct CacheEntry {
    name: String,
    expires_at: Instant,
}

struct DnsState {
    cache: HashMap<IpAddr, CacheEntry>,
    window_start: Instant,
    window_count: u32,
}

/// Performs reverse DNS lookups with an in-memory TTL cache and a QPS cap.
pub struct DnsEnricher {
    resolver: TokioAsyncResolver,
    cache_ttl: Duration,
    max_qps: u32,
    state: Mutex<DnsState>,
}

impl DnsEnricher {
    /// Create a PTR enricher using the system resolver configuration,
    /// falling back to the default public configuration if unreadable.
    pub fn new(cache_ttl: Duration, max_qps: i64) -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        let max_qps = if max_qps <= 0 {
            DEFAULT_MAX_QPS
        } else {
            max_qps as u32
        };
        Self {
            resolver,
            cache_ttl,
            max_qps,
            state: Mutex::new(DnsState {
                cache: HashMap::new(),
                window_start: Instant::now(),
                window_count: 0,
            }),
        }
    }

    /// Returns the PTR name for `ip`, from cache or a rate-limited lookup.
    /// Empty string when there is no name, the lookup failed, or the QPS
    /// window is exhausted.
    pub async fn lookup_ptr(&self, ip: IpAddr) -> String {
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.cache.get(&ip) {
                if Instant::now() < entry.expires_at {
                    return entry.name.clone();
                }
            }
            let now = Instant::now();
            if now.duration_since(state.window_start) >= Duration::from_secs(1) {
                state.window_start = now;
                state.window_count = 0;
            }
            if state.window_count >= self.max_qps {
                return String::new();
            }
            state.window_count += 1;
        }

        let name = match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|ptr| strip_trailing_dot(&ptr.to_utf8()))
                .unwrap_or_default(),
            Err(_) => String::new(),
        };

        let mut state = self.state.lock();
        state.cache.insert(
            ip,
            CacheEntry {
                name: name.clone(),
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
        name
    }
}

fn strip_trailing_dot(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_string()
}
