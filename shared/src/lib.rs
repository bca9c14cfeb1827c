//! Out-of-band (connectionless) packet vocabulary shared by the filter and
//! the probe tool.
//!
//! Only the parts of the game protocol needed to classify connectionless
//! traffic and to build or read an info reply live here. In-stream gameplay
//! traffic is never parsed.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Channel marker of a connectionless packet.
pub const CONNECTIONLESS_HEADER: i32 = -1;
/// Channel marker of a split packet. Never valid on the query path.
pub const SPLIT_PACKET_HEADER: i32 = -2;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Payload that must follow an info request type byte.
pub const INFO_QUERY_PAYLOAD: &[u8] = b"Source Engine Query";
/// Payload a peer sends when it tries to reflect a status response at us.
pub const STATUS_RESPONSE_PAYLOAD: &[u8] = b"statusResponse";

pub const PROTOCOL_VERSION: u8 = 17;
pub const DEFAULT_GAME_VERSION: &str = "16.12.01";

/// Server type byte for a dedicated server.
pub const SERVER_TYPE_DEDICATED: u8 = b'd';

pub const EDF_PORT: u8 = 0x80;
pub const EDF_STEAM_ID: u8 = 0x10;
pub const EDF_TAGS: u8 = 0x20;
pub const EDF_GAME_ID: u8 = 0x01;

/// Type byte found at offset 4 of a connectionless packet.
pub mod query_type {
    pub const SERVER_CHALLENGE: u8 = b'W';
    pub const MASTER_CHALLENGE: u8 = b's';
    pub const INFO: u8 = b'T';
    pub const PLAYER: u8 = b'U';
    pub const RULES: u8 = b'V';
    pub const CONNECT: u8 = b'q';
    pub const AUTH: u8 = b'k';
    pub const INFO_REPLY: u8 = b'I';
}

/// Platform identifier written into info replies.
#[cfg(target_os = "windows")]
pub const OS_CHAR: u8 = b'w';
#[cfg(target_os = "macos")]
pub const OS_CHAR: u8 = b'm';
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const OS_CHAR: u8 = b'l';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reply truncated while reading {0}")]
    Truncated(&'static str),

    #[error("not a connectionless packet (channel {0})")]
    NotConnectionless(i32),

    #[error("unexpected reply type 0x{0:02X}")]
    UnexpectedType(u8),

    #[error("string field {0} is not terminated")]
    UnterminatedString(&'static str),
}

/// Builds a well-formed info request, 25 bytes long.
pub fn info_query() -> Vec<u8> {
    let mut buf = Vec::with_capacity(25);
    buf.put_i32_le(CONNECTIONLESS_HEADER);
    buf.put_u8(query_type::INFO);
    buf.put_slice(INFO_QUERY_PAYLOAD);
    buf.put_u8(0);
    buf
}

/// Reads the little-endian channel field of a datagram, if it has one.
pub fn channel_of(data: &[u8]) -> Option<i32> {
    data.get(..4)
        .map(|bytes| i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Info reply as sent to game-discovery clients.
///
/// Multi-byte integers are little-endian, strings are NUL terminated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoReply {
    pub protocol: u8,
    pub server_name: String,
    pub map_name: String,
    pub game_dir: String,
    pub game_description: String,
    pub app_id: u32,
    pub num_clients: u8,
    pub max_clients: u8,
    pub num_bots: u8,
    pub os: u8,
    pub has_password: bool,
    pub is_secure: bool,
    pub game_version: String,
    pub udp_port: u16,
    pub steam_id: u64,
    pub tags: String,
}

impl InfoReply {
    /// Extra data flags announced by this reply.
    pub fn flags(&self) -> u8 {
        let tags = if self.tags.is_empty() { 0 } else { EDF_TAGS };
        EDF_PORT | EDF_STEAM_ID | tags | EDF_GAME_ID
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.tags.len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(CONNECTIONLESS_HEADER);
        buf.put_u8(query_type::INFO_REPLY);
        buf.put_u8(self.protocol);
        put_cstr(buf, &self.server_name);
        put_cstr(buf, &self.map_name);
        put_cstr(buf, &self.game_dir);
        put_cstr(buf, &self.game_description);
        // Short app id is truncated on purpose, the long one follows at the end.
        buf.put_u16_le(self.app_id as u16);
        buf.put_u8(self.num_clients);
        buf.put_u8(self.max_clients);
        buf.put_u8(self.num_bots);
        buf.put_u8(SERVER_TYPE_DEDICATED);
        buf.put_u8(self.os);
        buf.put_u8(u8::from(self.has_password));
        buf.put_u8(u8::from(self.is_secure));
        put_cstr(buf, &self.game_version);

        let flags = self.flags();
        buf.put_u8(flags);
        buf.put_u16_le(self.udp_port);
        buf.put_u64_le(self.steam_id);
        if flags & EDF_TAGS != 0 {
            put_cstr(buf, &self.tags);
        }
        buf.put_u64_le(u64::from(self.app_id));
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        let buf = &mut data;

        let channel = get_i32(buf, "header")?;
        if channel != CONNECTIONLESS_HEADER {
            return Err(ProtocolError::NotConnectionless(channel));
        }
        let kind = get_u8(buf, "type")?;
        if kind != query_type::INFO_REPLY {
            return Err(ProtocolError::UnexpectedType(kind));
        }

        let protocol = get_u8(buf, "protocol")?;
        let server_name = get_cstr(buf, "server_name")?;
        let map_name = get_cstr(buf, "map_name")?;
        let game_dir = get_cstr(buf, "game_dir")?;
        let game_description = get_cstr(buf, "game_description")?;
        let _short_app_id = get_u16(buf, "app_id")?;
        let num_clients = get_u8(buf, "num_clients")?;
        let max_clients = get_u8(buf, "max_clients")?;
        let num_bots = get_u8(buf, "num_bots")?;
        let _server_type = get_u8(buf, "server_type")?;
        let os = get_u8(buf, "os")?;
        let has_password = get_u8(buf, "has_password")? != 0;
        let is_secure = get_u8(buf, "is_secure")? != 0;
        let game_version = get_cstr(buf, "game_version")?;
        let flags = get_u8(buf, "flags")?;

        let udp_port = if flags & EDF_PORT != 0 {
            get_u16(buf, "udp_port")?
        } else {
            0
        };
        let steam_id = if flags & EDF_STEAM_ID != 0 {
            get_u64(buf, "steam_id")?
        } else {
            0
        };
        let tags = if flags & EDF_TAGS != 0 {
            get_cstr(buf, "tags")?
        } else {
            String::new()
        };
        let app_id = if flags & EDF_GAME_ID != 0 {
            get_u64(buf, "game_id")? as u32
        } else {
            0
        };

        Ok(Self {
            protocol,
            server_name,
            map_name,
            game_dir,
            game_description,
            app_id,
            num_clients,
            max_clients,
            num_bots,
            os,
            has_password,
            is_secure,
            game_version,
            udp_port,
            steam_id,
            tags,
        })
    }
}

fn put_cstr<B: BufMut>(buf: &mut B, value: &str) {
    // Interior NULs would end the string early on the reading side.
    let bytes = value.as_bytes();
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    buf.put_slice(&bytes[..end]);
    buf.put_u8(0);
}

fn get_u8(buf: &mut &[u8], field: &'static str) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::Truncated(field));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8], field: &'static str) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Truncated(field));
    }
    Ok(buf.get_u16_le())
}

fn get_i32(buf: &mut &[u8], field: &'static str) -> Result<i32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated(field));
    }
    Ok(buf.get_i32_le())
}

fn get_u64(buf: &mut &[u8], field: &'static str) -> Result<u64, ProtocolError> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::Truncated(field));
    }
    Ok(buf.get_u64_le())
}

fn get_cstr(buf: &mut &[u8], field: &'static str) -> Result<String, ProtocolError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::UnterminatedString(field))?;
    let value = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reply() -> InfoReply {
        InfoReply {
            protocol: PROTOCOL_VERSION,
            server_name: "Test".to_string(),
            map_name: "gm_flat".to_string(),
            game_dir: "garrysmod".to_string(),
            game_description: "Sandbox".to_string(),
            app_id: 4000,
            num_clients: 3,
            max_clients: 16,
            num_bots: 1,
            os: b'l',
            has_password: true,
            is_secure: false,
            game_version: "16.12.01".to_string(),
            udp_port: 27015,
            steam_id: 0x0110_0001_0000_0001,
            tags: " gm:sandbox".to_string(),
        }
    }

    #[test]
    fn test_info_query_layout() {
        let query = info_query();
        assert_eq!(query.len(), 25);
        assert_eq!(&query[..4], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(query[4], b'T');
        assert_eq!(&query[5..24], INFO_QUERY_PAYLOAD);
        assert_eq!(query[24], 0);
    }

    #[test]
    fn test_channel_of() {
        assert_eq!(channel_of(&[0xFF, 0xFF, 0xFF, 0xFF, b'T']), Some(-1));
        assert_eq!(channel_of(&[0xFE, 0xFF, 0xFF, 0xFF]), Some(-2));
        assert_eq!(channel_of(&[1, 0, 0, 0]), Some(1));
        assert_eq!(channel_of(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn test_encode_exact_bytes() {
        let reply = InfoReply {
            protocol: 17,
            server_name: "S".to_string(),
            map_name: "M".to_string(),
            game_dir: "D".to_string(),
            game_description: "G".to_string(),
            app_id: 4000,
            num_clients: 2,
            max_clients: 8,
            num_bots: 0,
            os: b'l',
            has_password: false,
            is_secure: true,
            game_version: "V".to_string(),
            udp_port: 27015,
            steam_id: 1,
            tags: String::new(),
        };

        let mut expected = vec![0xFF, 0xFF, 0xFF, 0xFF, b'I', 17];
        expected.extend_from_slice(b"S\0M\0D\0G\0");
        expected.extend_from_slice(&4000u16.to_le_bytes());
        expected.extend_from_slice(&[2, 8, 0, b'd', b'l', 0, 1]);
        expected.extend_from_slice(b"V\0");
        expected.push(0x80 | 0x10 | 0x01);
        expected.extend_from_slice(&27015u16.to_le_bytes());
        expected.extend_from_slice(&1u64.to_le_bytes());
        expected.extend_from_slice(&4000u64.to_le_bytes());

        assert_eq!(reply.encode(), expected);
    }

    #[test]
    fn test_tags_set_flag_and_field() {
        let reply = sample_reply();
        assert_eq!(reply.flags(), 0x80 | 0x10 | 0x20 | 0x01);

        let encoded = reply.encode();
        let tags_at = encoded.len() - 8 - (reply.tags.len() + 1);
        assert_eq!(&encoded[tags_at..encoded.len() - 8], b" gm:sandbox\0");
    }

    #[test]
    fn test_decode_reads_back_fields() {
        let reply = sample_reply();
        let decoded = InfoReply::decode(&reply.encode()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_decode_rejects_truncated_reply() {
        let encoded = sample_reply().encode();
        let result = InfoReply::decode(&encoded[..encoded.len() - 3]);
        assert_eq!(result, Err(ProtocolError::Truncated("game_id")));
    }

    #[test]
    fn test_decode_rejects_wrong_type() {
        let mut encoded = sample_reply().encode();
        encoded[4] = b'm';
        assert_eq!(
            InfoReply::decode(&encoded),
            Err(ProtocolError::UnexpectedType(b'm'))
        );
    }

    #[test]
    fn test_interior_nul_is_cut() {
        let mut reply = sample_reply();
        reply.server_name = "evil\0name".to_string();
        let decoded = InfoReply::decode(&reply.encode()).unwrap();
        assert_eq!(decoded.server_name, "evil");
    }
}
