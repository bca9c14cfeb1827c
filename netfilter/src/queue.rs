//! Bounded hand-off queue between the receive thread and the consumer

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// A screened datagram waiting for the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub from: SocketAddr,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(from: SocketAddr, data: &[u8]) -> Self {
        Self {
            from,
            data: data.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// FIFO that refuses new packets once full instead of evicting old ones.
///
/// Refusal is the producer's cue to stop draining the socket, leaving excess
/// load to the kernel buffer.
#[derive(Debug)]
pub struct AcceptedQueue {
    capacity: usize,
    packets: Mutex<VecDeque<Packet>>,
}

impl AcceptedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            packets: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Appends a packet, handing it back if the queue is full.
    pub fn push(&self, packet: Packet) -> Result<(), Packet> {
        let mut packets = self.packets.lock();
        if packets.len() >= self.capacity {
            return Err(packet);
        }
        packets.push_back(packet);
        Ok(())
    }

    pub fn pop(&self) -> Option<Packet> {
        self.packets.lock().pop_front()
    }

    pub fn is_full(&self) -> bool {
        self.packets.lock().len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
