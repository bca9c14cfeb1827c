//! Per-source and global info query rate limiting
//!
//! Both limits use fixed windows. A source's window opens with its first
//! query and resets once the configured window length has elapsed; the
//! global window is always one second long. A query has to fit within both
//! budgets to be served.
//!
//! The per-source table is capped. When it fills up, windows that already
//! expired are swept out; if it is still full afterwards, the window that
//! opened first is evicted. A new source is always admitted.

use log::{debug, info};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

const GLOBAL_WINDOW: Duration = Duration::from_secs(1);

/// Rate limiter settings, adjustable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_per_window: u32,
    pub global_max_per_second: u32,
    pub max_tracked_sources: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_per_window: 60,
            global_max_per_second: 50,
            max_tracked_sources: 4096,
        }
    }
}

/// Query count accumulated since the window opened.
#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    pub start: Instant,
    pub count: u32,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self {
            start: now,
            count: 0,
        }
    }

    fn is_expired(&self, now: Instant, length: Duration) -> bool {
        now.saturating_duration_since(self.start) >= length
    }

    /// Counts one query, reopening the window first if it elapsed.
    /// Returns true while the count stays within `max`.
    fn hit(&mut self, now: Instant, length: Duration, max: u32) -> bool {
        if self.is_expired(now, length) {
            self.start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count <= max
    }
}

pub struct QueryRateLimiter {
    enabled: bool,
    config: RateLimitConfig,
    sources: HashMap<IpAddr, RateWindow>,
    global: Option<RateWindow>,
}

impl QueryRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            enabled: false,
            config,
            sources: HashMap::new(),
            global: None,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub fn set_window(&mut self, window: Duration) {
        self.config.window = window;
    }

    pub fn set_max_per_window(&mut self, max: u32) {
        self.config.max_per_window = max;
    }

    pub fn set_global_max_per_second(&mut self, max: u32) {
        self.config.global_max_per_second = max;
    }

    pub fn set_max_tracked_sources(&mut self, max: usize) {
        self.config.max_tracked_sources = max;
    }

    /// Number of sources currently holding a window.
    pub fn tracked_sources(&self) -> usize {
        self.sources.len()
    }

    /// Decides whether `source` may be answered right now.
    pub fn check(&mut self, source: IpAddr, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }

        let RateLimitConfig {
            window,
            max_per_window,
            global_max_per_second,
            ..
        } = self.config;

        if !self.sources.contains_key(&source) {
            self.make_room(now);
        }

        let entry = self
            .sources
            .entry(source)
            .or_insert_with(|| RateWindow::new(now));
        if !entry.hit(now, window, max_per_window) {
            debug!(
                "Query rate exceeded by {} ({} in window)",
                source, entry.count
            );
            return false;
        }

        let global = self.global.get_or_insert_with(|| RateWindow::new(now));
        if !global.hit(now, GLOBAL_WINDOW, global_max_per_second) {
            debug!("Global query rate exceeded ({} this second)", global.count);
            return false;
        }

        true
    }

    /// Ensures there is space for one more source, sweeping expired windows
    /// first and then evicting the oldest live one.
    fn make_room(&mut self, now: Instant) {
        if self.sources.len() < self.config.max_tracked_sources {
            return;
        }

        let before = self.sources.len();
        let window = self.config.window;
        self.sources
            .retain(|_, entry| !entry.is_expired(now, window));
        let swept = before - self.sources.len();
        if swept > 0 {
            info!("Swept {} expired query windows", swept);
        }

        while !self.sources.is_empty() && self.sources.len() >= self.config.max_tracked_sources {
            let oldest = self
                .sources
                .iter()
                .min_by_key(|(_, entry)| entry.start)
                .map(|(source, _)| *source);
            match oldest {
                Some(source) => {
                    debug!("Query source table full, evicting {}", source);
                    self.sources.remove(&source);
                }
                None => break,
            }
        }
    }

    /// Forgets every window, used when the limiter settings are reset.
    pub fn clear(&mut self) {
        self.sources.clear();
        self.global = None;
    }
}
