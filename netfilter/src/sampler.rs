//! Diagnostic ring buffer of recently received datagrams

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::address_filter::source_key;

/// A captured datagram as handed to diagnostics.
///
/// `address` and `port` are raw network-order values, matching the
/// control surface address convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampledPacket {
    pub address: u32,
    pub port: u16,
    pub data: Vec<u8>,
}

impl SampledPacket {
    pub fn new(from: SocketAddr, data: &[u8]) -> Self {
        Self {
            address: source_key(&from).unwrap_or(0),
            port: u16::from_ne_bytes(from.port().to_be_bytes()),
            data: data.to_vec(),
        }
    }

    /// Port in host order.
    pub fn host_port(&self) -> u16 {
        u16::from_be_bytes(self.port.to_ne_bytes())
    }
}

/// Bounded FIFO that evicts the oldest sample to make room for a new one.
#[derive(Debug)]
pub struct SampleRing {
    enabled: bool,
    capacity: usize,
    samples: VecDeque<SampledPacket>,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            enabled: false,
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Disabling sampling also discards whatever was captured.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.samples.clear();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Records a datagram if sampling is on. Returns true when it was kept.
    pub fn record(&mut self, from: SocketAddr, data: &[u8]) -> bool {
        if !self.enabled || self.capacity == 0 {
            return false;
        }
        self.push(SampledPacket::new(from, data));
        true
    }

    pub fn push(&mut self, sample: SampledPacket) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn pop(&mut self) -> Option<SampledPacket> {
        self.samples.pop_front()
    }

    pub fn drain(&mut self) -> Vec<SampledPacket> {
        self.samples.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
