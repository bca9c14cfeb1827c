//! Connectionless packet classification
//!
//! Every datagram is sorted into one of three buckets before anything else
//! looks at it. Ordinary in-stream traffic is passed through untouched; only
//! packets carrying the connectionless marker get their type byte inspected,
//! and with strict validation enabled each known query type must match its
//! exact length and payload.

use log::debug;
use shared::{
    channel_of, query_type, CONNECTIONLESS_HEADER, INFO_QUERY_PAYLOAD, SPLIT_PACKET_HEADER,
    STATUS_RESPONSE_PAYLOAD,
};
use std::net::SocketAddr;

/// Challenge packets longer than this are never legitimate.
const MAX_CHALLENGE_LEN: usize = 100;
/// Exact size of a well-formed info request.
const INFO_QUERY_LEN: usize = 25;
/// Exact size of a player or rules request.
const CHALLENGED_QUERY_LEN: usize = 9;
/// Anything shorter cannot hold a channel field plus a type byte.
const MIN_OOB_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Malformed or abusive, dropped silently.
    Invalid,
    /// Passed on to the game server.
    Good,
    /// Server info request, candidate for the cached reply.
    InfoQuery,
}

/// Classifies one datagram.
pub fn classify(data: &[u8], from: SocketAddr, strict: bool) -> PacketType {
    let len = data.len();
    if len == 0 {
        debug!("Bad OOB! len: {} from {}", len, from);
        return PacketType::Invalid;
    }

    if len < MIN_OOB_LEN {
        return PacketType::Good;
    }

    let channel = match channel_of(data) {
        Some(channel) => channel,
        None => return PacketType::Good,
    };

    if channel == SPLIT_PACKET_HEADER {
        debug!(
            "Bad OOB! len: {}, channel: 0x{:X} from {}",
            len, channel, from
        );
        return PacketType::Invalid;
    }

    if channel != CONNECTIONLESS_HEADER {
        return PacketType::Good;
    }

    let kind = data[4];
    if !strict {
        return if kind == query_type::INFO {
            PacketType::InfoQuery
        } else {
            PacketType::Good
        };
    }

    let result = classify_strict(data, kind);
    if result == PacketType::Invalid {
        debug!(
            "Bad OOB! len: {}, channel: 0x{:X}, type: {} from {}",
            len,
            channel,
            char::from(kind),
            from
        );
    }
    result
}

fn classify_strict(data: &[u8], kind: u8) -> PacketType {
    let len = data.len();
    match kind {
        query_type::SERVER_CHALLENGE | query_type::MASTER_CHALLENGE => {
            if len > MAX_CHALLENGE_LEN || data[5..].starts_with(STATUS_RESPONSE_PAYLOAD) {
                PacketType::Invalid
            } else {
                PacketType::Good
            }
        }
        query_type::INFO => {
            if len == INFO_QUERY_LEN && &data[5..24] == INFO_QUERY_PAYLOAD {
                PacketType::InfoQuery
            } else {
                PacketType::Invalid
            }
        }
        query_type::PLAYER | query_type::RULES => {
            if len == CHALLENGED_QUERY_LEN {
                PacketType::Good
            } else {
                PacketType::Invalid
            }
        }
        query_type::CONNECT | query_type::AUTH => PacketType::Good,
        _ => PacketType::Invalid,
    }
}
