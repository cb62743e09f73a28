//! Fixed-window per-tenant request limiter.
//!
//! Advisory throttling for the inbound API. `check` and `increment` are separate
//! calls, so concurrent requests for the same tenant may interleave and slightly
//! over- or under-count; that race is accepted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use surveyline_core::{Clock, SystemClock, TenantId};

/// Result of a limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u32,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
    pub limit: u32,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, never less than one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.reset_at - now).num_seconds().max(1) as u64
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Per-tenant fixed-window counter.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<TenantId, Window>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit,
            window,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter on the system clock.
    pub fn with_system_clock(limit: u32, window: Duration) -> Self {
        Self::new(limit, window, Arc::new(SystemClock))
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TenantId, Window>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh_window(&self, now: DateTime<Utc>) -> Window {
        Window {
            count: 0,
            reset_at: now + chrono::Duration::from_std(self.window).unwrap_or_default(),
        }
    }

    /// Current standing of `tenant_id`. Does not consume a request.
    pub fn check(&self, tenant_id: TenantId) -> RateLimitDecision {
        let now = self.clock.now();
        let mut windows = self.lock();
        let window = windows
            .entry(tenant_id)
            .and_modify(|w| {
                if w.reset_at <= now {
                    *w = self.fresh_window(now);
                }
            })
            .or_insert_with(|| self.fresh_window(now));

        RateLimitDecision {
            allowed: window.count < self.limit,
            remaining: self.limit.saturating_sub(window.count),
            reset_at: window.reset_at,
            limit: self.limit,
        }
    }

    /// Consume one request from the current window.
    pub fn increment(&self, tenant_id: TenantId) {
        let now = self.clock.now();
        let mut windows = self.lock();
        let window = windows
            .entry(tenant_id)
            .or_insert_with(|| self.fresh_window(now));
        if window.reset_at <= now {
            *window = self.fresh_window(now);
        }
        window.count = window.count.saturating_add(1);
    }

    /// Drop expired windows. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, w| w.reset_at > now);
        before - windows.len()
    }

    /// Sweep periodically until the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let removed = limiter.sweep_expired();
                if removed > 0 {
                    debug!(removed, "swept expired rate-limit windows");
                }
            }
        })
    }
}
