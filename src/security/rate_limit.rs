//! Fixed-window request counting per identifier.
//!
//! A window opens on the first request for an identifier and lasts `window`.
//! Once it has elapsed the next request opens a fresh window starting at
//! that request, so windows are discrete rather than rolling.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

/// Outcome of a rejected request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitExceeded {
    pub limit: u32,
    pub window: Duration,
    pub count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: HashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: HashMap::new(),
        }
    }

    /// Count a request against the default limit.
    pub fn check(&mut self, identifier: &str) -> Result<u32, RateLimitExceeded> {
        self.check_with(identifier, self.max_requests, self.window)
    }

    /// Count a request against an explicit limit. Returns the count within
    /// the current window.
    pub fn check_with(
        &mut self,
        identifier: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<u32, RateLimitExceeded> {
        let now = Instant::now();
        let entry = self
            .windows
            .entry(identifier.to_string())
            .and_modify(|w| {
                if now.duration_since(w.started) > window {
                    *w = Window {
                        count: 0,
                        started: now,
                    };
                }
            })
            .or_insert(Window {
                count: 0,
                started: now,
            });

        entry.count = entry.count.saturating_add(1);
        if entry.count > max_requests {
            return Err(RateLimitExceeded {
                limit: max_requests,
                window,
                count: entry.count,
            });
        }
        Ok(entry.count)
    }

    /// Drop identifiers whose window has elapsed. Returns how many were removed.
    pub fn sweep_expired(&mut self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.duration_since(w.started) <= window);
        before - self.windows.len()
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}
