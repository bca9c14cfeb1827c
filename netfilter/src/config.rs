//! Filter configuration
//!
//! Loaded from TOML and then adjusted from the command line. Every feature
//! starts disabled so an empty file leaves traffic untouched apart from the
//! always-on malformed packet checks.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::rate_limiter::RateLimitConfig;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_SAMPLE_CAPACITY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub allow_list_enabled: bool,
    pub deny_list_enabled: bool,
    pub allow_list: Vec<Ipv4Addr>,
    pub deny_list: Vec<Ipv4Addr>,
    pub strict_validation: bool,
    pub threaded_socket: bool,
    pub reply_cache: bool,
    pub reply_cache_ttl_secs: u64,
    pub query_limiter: bool,
    pub query_window_secs: u64,
    pub max_queries_per_window: u32,
    pub global_max_queries_per_second: u32,
    pub max_tracked_sources: usize,
    pub packet_sampling: bool,
    pub queue_capacity: usize,
    pub sample_capacity: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        let limits = RateLimitConfig::default();
        Self {
            allow_list_enabled: false,
            deny_list_enabled: false,
            allow_list: Vec::new(),
            deny_list: Vec::new(),
            strict_validation: false,
            threaded_socket: false,
            reply_cache: false,
            reply_cache_ttl_secs: 5,
            query_limiter: false,
            query_window_secs: limits.window.as_secs(),
            max_queries_per_window: limits.max_per_window,
            global_max_queries_per_second: limits.global_max_per_second,
            max_tracked_sources: limits.max_tracked_sources,
            packet_sampling: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            sample_capacity: DEFAULT_SAMPLE_CAPACITY,
        }
    }
}

impl FilterConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn rate_limits(&self) -> RateLimitConfig {
        RateLimitConfig {
            window: Duration::from_secs(self.query_window_secs),
            max_per_window: self.max_queries_per_window,
            global_max_per_second: self.global_max_queries_per_second,
            max_tracked_sources: self.max_tracked_sources,
        }
    }

    pub fn reply_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.reply_cache_ttl_secs)
    }
}
