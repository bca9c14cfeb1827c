//! Source address allow/deny lists
//!
//! Addresses are keyed by their raw 32-bit value in network byte order, the
//! same representation the control surface exchanges. IPv6 sources that are
//! not IPv4-mapped have no key: they are never on a list.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Converts an IPv4 address into its network-order key.
pub fn address_key(ip: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(ip.octets())
}

/// Converts a network-order key back into an IPv4 address.
pub fn key_to_ip(key: u32) -> Ipv4Addr {
    Ipv4Addr::from(key.to_ne_bytes())
}

/// Key of a datagram source, if it is reachable over IPv4.
pub fn source_key(addr: &SocketAddr) -> Option<u32> {
    match addr.ip() {
        IpAddr::V4(ip) => Some(address_key(ip)),
        IpAddr::V6(ip) => ip.to_ipv4_mapped().map(address_key),
    }
}

/// A set of address keys that can be switched on and off without losing
/// its contents.
#[derive(Debug, Default, Clone)]
pub struct AddressSet {
    keys: HashSet<u32>,
    enabled: bool,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn insert(&mut self, key: u32) -> bool {
        self.keys.insert(key)
    }

    pub fn remove(&mut self, key: u32) -> bool {
        self.keys.remove(&key)
    }

    /// Drops every entry and releases the memory held by the set.
    pub fn reset(&mut self) {
        self.keys = HashSet::new();
    }

    pub fn contains(&self, key: u32) -> bool {
        self.keys.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Allow-list and deny-list gate applied to every datagram source.
#[derive(Debug, Default, Clone)]
pub struct AddressFilter {
    pub allow: AddressSet,
    pub deny: AddressSet,
}

impl AddressFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Passes when the source is on the allow-list (or it is disabled) and
    /// not on the deny-list (or it is disabled).
    pub fn is_allowed(&self, source: &SocketAddr) -> bool {
        let key = source_key(source);
        let allowed = !self.allow.is_enabled() || key.is_some_and(|k| self.allow.contains(k));
        let denied = self.deny.is_enabled() && key.is_some_and(|k| self.deny.contains(k));
        allowed && !denied
    }
}
