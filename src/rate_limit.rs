//! Fixed-window request counting per client address.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::ttl_store::{MemoryTtlStore, TtlStore};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Blocked { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

pub struct RateLimiter {
    windows: MemoryTtlStore<String, Window>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: MemoryTtlStore::new(config.max_entries),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn check(&self, client: &str) -> Decision {
        self.check_at(client, Instant::now())
    }

    /// Count one request from `client`. Counters idle for two windows expire.
    pub fn check_at(&self, client: &str, now: Instant) -> Decision {
        let window = self.config.window;
        let max = self.config.max_requests;
        self.windows
            .update(client.to_string(), window * 2, now, |current| {
                let w = match current {
                    Some(w) if now.saturating_duration_since(w.started) < window => *w,
                    _ => Window {
                        started: now,
                        count: 0,
                    },
                };
                if w.count >= max {
                    let elapsed = now.saturating_duration_since(w.started);
                    let retry_after = window.saturating_sub(elapsed);
                    return (w, Decision::Blocked { retry_after });
                }
                let w = Window {
                    count: w.count + 1,
                    ..w
                };
                (
                    w,
                    Decision::Allowed {
                        remaining: max - w.count,
                    },
                )
            })
    }

    pub fn sweep(&self) -> usize {
        self.windows.sweep(Instant::now())
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

/// First address of the trusted proxy header, else the socket peer, else `unknown`.
pub fn client_ip(forwarded: Option<&str>, remote: Option<IpAddr>) -> String {
    forwarded
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .or_else(|| remote.map(|ip| ip.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Whole seconds for a `Retry-After` header, never zero.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}
