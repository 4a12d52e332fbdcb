//! Per-client fixed-window rate limiting
//!
//! Each client address gets a counter and the instant its window opened.
//! The window resets once more than `window` has passed since it opened, so
//! a client can burst up to twice the limit across a window edge.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Request may proceed
    Allow,
    /// Request exceeds the limit for the current window
    Reject {
        /// Whole seconds until the window resets, at least 1
        retry_after_secs: u64,
    },
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    window_start: Instant,
}

/// Fixed-window rate limiter keyed by client address
pub struct RateLimiter {
    enabled: bool,
    window: Duration,
    max_requests: u32,
    windows: DashMap<IpAddr, RateWindow>,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            window: config.window,
            max_requests: config.max_requests,
            windows: DashMap::new(),
        }
    }

    /// Whether admission checks are enforced
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Window length
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check and count a request from `addr`
    pub fn admit(&self, addr: IpAddr) -> Admission {
        self.admit_at(addr, Instant::now())
    }

    /// Check and count a request from `addr` arriving at `now`
    pub fn admit_at(&self, addr: IpAddr, now: Instant) -> Admission {
        if !self.enabled {
            return Admission::Allow;
        }

        match self.windows.entry(addr) {
            Entry::Vacant(entry) => {
                entry.insert(RateWindow {
                    count: 1,
                    window_start: now,
                });
                Admission::Allow
            }
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                let elapsed = now.saturating_duration_since(state.window_start);

                if elapsed > self.window {
                    state.count = 1;
                    state.window_start = now;
                    Admission::Allow
                } else if state.count < self.max_requests {
                    state.count += 1;
                    Admission::Allow
                } else {
                    Admission::Reject {
                        retry_after_secs: ceil_secs(self.window - elapsed).max(1),
                    }
                }
            }
        }
    }

    /// Drop windows that have fully elapsed; returns how many were removed
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Drop windows that have fully elapsed at `now`
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, state| now.saturating_duration_since(state.window_start) <= self.window);
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked client addresses
    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    /// Run [`sweep`](Self::sweep) once per window until shutdown
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.window.max(Duration::from_millis(1)));
            // First tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = self.tracked_clients(), "Swept stale rate-limit windows");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Rate-limit sweeper stopping");
                        break;
                    }
                }
            }
        })
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
