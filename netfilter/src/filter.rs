//! Screening context shared by the receive thread, the consumer and the
//! control surface
//!
//! All screening state sits behind one lock: toggles, address lists, rate
//! windows, the reply cache and the sample ring. A datagram takes the lock
//! once, so control changes are never observed half-applied.

use log::{debug, warn};
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::address_filter::{address_key, AddressFilter};
use crate::classifier::{classify, PacketType};
use crate::config::FilterConfig;
use crate::error::Result;
use crate::rate_limiter::QueryRateLimiter;
use crate::reply_cache::{ReplyCache, ServerInfo};
use crate::sampler::{SampleRing, SampledPacket};
use crate::stats::{FilterStats, StatsSnapshot};

/// Where cached replies are written.
pub trait ReplySender {
    fn send_reply(&self, data: &[u8], to: SocketAddr) -> io::Result<usize>;
}

impl ReplySender for UdpSocket {
    fn send_reply(&self, data: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.send_to(data, to)
    }
}

impl ReplySender for tokio::net::UdpSocket {
    fn send_reply(&self, data: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.try_send_to(data, to)
    }
}

/// Outcome of screening one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Hand the datagram to the game server.
    Deliver,
    /// An info query was answered from the cache, nothing left to do.
    Answered,
    /// Source rejected by the allow/deny lists.
    Denied,
    /// Malformed or abusive datagram.
    Invalid,
    /// Info query over the per-source or global budget. The whole datagram
    /// is dropped, not only the cached answer.
    RateLimited,
}

impl Disposition {
    pub fn is_delivered(self) -> bool {
        self == Disposition::Deliver
    }
}

struct ScreenState {
    addresses: AddressFilter,
    strict_validation: bool,
    threaded_socket: bool,
    limiter: QueryRateLimiter,
    cache: ReplyCache,
    sampler: SampleRing,
}

pub struct Netfilter {
    state: Mutex<ScreenState>,
    stats: FilterStats,
}

impl Netfilter {
    pub fn new(config: &FilterConfig, server: Arc<dyn ServerInfo>) -> Self {
        let mut addresses = AddressFilter::new();
        addresses.allow.set_enabled(config.allow_list_enabled);
        addresses.deny.set_enabled(config.deny_list_enabled);
        for ip in &config.allow_list {
            addresses.allow.insert(address_key(*ip));
        }
        for ip in &config.deny_list {
            addresses.deny.insert(address_key(*ip));
        }

        let mut limiter = QueryRateLimiter::new(config.rate_limits());
        limiter.set_enabled(config.query_limiter);

        let mut cache = ReplyCache::new(server, config.reply_cache_ttl());
        cache.set_enabled(config.reply_cache);

        let mut sampler = SampleRing::new(config.sample_capacity);
        sampler.set_enabled(config.packet_sampling);

        Self {
            state: Mutex::new(ScreenState {
                addresses,
                strict_validation: config.strict_validation,
                threaded_socket: config.threaded_socket,
                limiter,
                cache,
                sampler,
            }),
            stats: FilterStats::default(),
        }
    }

    pub fn screen(
        &self,
        data: &[u8],
        from: SocketAddr,
        replies: &dyn ReplySender,
    ) -> Disposition {
        self.screen_at(data, from, replies, Instant::now())
    }

    /// Runs a received datagram through sampling, the address lists, the
    /// classifier and, for info queries, the rate limiter and reply cache.
    pub fn screen_at(
        &self,
        data: &[u8],
        from: SocketAddr,
        replies: &dyn ReplySender,
        now: Instant,
    ) -> Disposition {
        FilterStats::bump(&self.stats.received);
        let mut state = self.state.lock();

        if state.sampler.record(from, data) {
            FilterStats::bump(&self.stats.sampled);
        }

        if !state.addresses.is_allowed(&from) {
            FilterStats::bump(&self.stats.denied);
            return Disposition::Denied;
        }

        let disposition = match classify(data, from, state.strict_validation) {
            PacketType::Invalid => Disposition::Invalid,
            PacketType::Good => Disposition::Deliver,
            PacketType::InfoQuery => Self::handle_info_query(&mut state, from, replies, now),
        };

        let counter = match disposition {
            Disposition::Deliver => &self.stats.delivered,
            Disposition::Answered => &self.stats.answered,
            Disposition::Denied => &self.stats.denied,
            Disposition::Invalid => &self.stats.invalid,
            Disposition::RateLimited => &self.stats.rate_limited,
        };
        FilterStats::bump(counter);
        disposition
    }

    fn handle_info_query(
        state: &mut ScreenState,
        from: SocketAddr,
        replies: &dyn ReplySender,
        now: Instant,
    ) -> Disposition {
        if !state.limiter.check(from.ip(), now) {
            return Disposition::RateLimited;
        }

        if !state.cache.is_enabled() {
            return Disposition::Deliver;
        }

        let reply = state.cache.get_or_build(now);
        match replies.send_reply(reply, from) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("Socket busy, cached reply to {} dropped", from);
            }
            Err(e) => warn!("Failed to send cached reply to {}: {}", from, e),
        }
        Disposition::Answered
    }

    /// Records a receive iteration skipped because the accepted queue was full.
    pub(crate) fn note_stall(&self) {
        FilterStats::bump(&self.stats.stalls);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn set_allow_list_enabled(&self, enabled: bool) {
        self.state.lock().addresses.allow.set_enabled(enabled);
    }

    /// `key` is the address in network byte order.
    pub fn add_allowed(&self, key: u32) {
        self.state.lock().addresses.allow.insert(key);
    }

    pub fn remove_allowed(&self, key: u32) {
        self.state.lock().addresses.allow.remove(key);
    }

    pub fn reset_allow_list(&self) {
        self.state.lock().addresses.allow.reset();
    }

    pub fn set_deny_list_enabled(&self, enabled: bool) {
        self.state.lock().addresses.deny.set_enabled(enabled);
    }

    pub fn add_denied(&self, key: u32) {
        self.state.lock().addresses.deny.insert(key);
    }

    pub fn remove_denied(&self, key: u32) {
        self.state.lock().addresses.deny.remove(key);
    }

    pub fn reset_deny_list(&self) {
        self.state.lock().addresses.deny.reset();
    }

    pub fn is_source_allowed(&self, from: &SocketAddr) -> bool {
        self.state.lock().addresses.is_allowed(from)
    }

    pub fn set_strict_validation(&self, enabled: bool) {
        self.state.lock().strict_validation = enabled;
    }

    pub fn set_threaded(&self, enabled: bool) {
        self.state.lock().threaded_socket = enabled;
    }

    pub fn is_threaded(&self) -> bool {
        self.state.lock().threaded_socket
    }

    pub fn set_reply_cache_enabled(&self, enabled: bool) {
        self.state.lock().cache.set_enabled(enabled);
    }

    pub fn set_reply_cache_ttl(&self, ttl: Duration) {
        self.state.lock().cache.set_ttl(ttl);
    }

    /// Rereads static and dynamic reply fields right away.
    pub fn refresh_reply_cache(&self) {
        self.state.lock().cache.refresh(Instant::now());
    }

    pub fn set_query_limiter_enabled(&self, enabled: bool) {
        self.state.lock().limiter.set_enabled(enabled);
    }

    pub fn set_query_window(&self, window: Duration) {
        self.state.lock().limiter.set_window(window);
    }

    pub fn set_max_queries_per_window(&self, max: u32) {
        self.state.lock().limiter.set_max_per_window(max);
    }

    pub fn set_global_max_queries_per_second(&self, max: u32) {
        self.state.lock().limiter.set_global_max_per_second(max);
    }

    pub fn set_sampling_enabled(&self, enabled: bool) {
        self.state.lock().sampler.set_enabled(enabled);
    }

    /// Takes the oldest sample, if any.
    pub fn next_sample(&self) -> Option<SampledPacket> {
        self.state.lock().sampler.pop()
    }

    pub fn drain_samples(&self) -> Vec<SampledPacket> {
        self.state.lock().sampler.drain()
    }

    /// Drains every sample into `path` as a bincode-encoded list.
    /// Returns how many samples were written.
    pub fn save_samples(&self, path: &Path) -> Result<usize> {
        let samples = self.drain_samples();
        let encoded = bincode::serialize(&samples)?;
        std::fs::write(path, encoded)?;
        Ok(samples.len())
    }
}
