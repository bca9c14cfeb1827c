//! Cached info query replies
//!
//! Answering info queries straight from the receive path keeps them away
//! from the game simulation. Fields split in two groups: static ones (game
//! directory, description, gamemode tags, version, port, max clients) are
//! only reread on an explicit refresh, while dynamic ones (name, map, player
//! counts, password, secure flag, Steam id) are reread every time the cached
//! reply expires.

use log::debug;
use shared::{InfoReply, DEFAULT_GAME_VERSION, OS_CHAR, PROTOCOL_VERSION};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Active gamemode as reported by the game server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Gamemode {
    pub name: String,
    pub workshop_id: Option<String>,
}

/// Read-only view of the game server, supplied by the host.
pub trait ServerInfo: Send + Sync {
    fn server_name(&self) -> String;
    fn map_name(&self) -> String;
    /// Game directory, possibly a full path.
    fn game_dir(&self) -> String;
    fn game_description(&self) -> String;
    fn app_id(&self) -> u32;
    fn num_clients(&self) -> u32;
    fn num_bots(&self) -> u32;
    fn max_clients(&self) -> u32;
    /// Operator override of the advertised slot count.
    fn visible_max_players(&self) -> Option<u32> {
        None
    }
    fn has_password(&self) -> bool;
    /// Anti-cheat status. May turn on some time after startup.
    fn is_secure(&self) -> bool;
    fn steam_id(&self) -> Option<u64>;
    fn udp_port(&self) -> u16;
    fn gamemode(&self) -> Gamemode;
    /// Build version string, `None` when it cannot be determined.
    fn game_version(&self) -> Option<String>;
}

/// Fields that only change on an explicit refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticReplyInfo {
    pub game_dir: String,
    pub game_description: String,
    pub game_version: String,
    pub max_clients: u32,
    pub udp_port: u16,
    pub tags: String,
}

impl StaticReplyInfo {
    pub fn collect(info: &dyn ServerInfo) -> Self {
        let game_dir = info.game_dir();
        let game_dir = game_dir
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .to_string();

        let gamemode = info.gamemode();
        let mut tags = format!(" gm:{}", gamemode.name);
        if let Some(workshop_id) = gamemode.workshop_id.filter(|id| !id.is_empty()) {
            tags.push_str(" gmws:");
            tags.push_str(&workshop_id);
        }

        let game_version = info.game_version().unwrap_or_else(|| {
            debug!("Game version unavailable, using {}", DEFAULT_GAME_VERSION);
            DEFAULT_GAME_VERSION.to_string()
        });

        Self {
            game_dir,
            game_description: info.game_description(),
            game_version,
            max_clients: info.max_clients(),
            udp_port: info.udp_port(),
            tags,
        }
    }
}

pub struct ReplyCache {
    server: Arc<dyn ServerInfo>,
    enabled: bool,
    ttl: Duration,
    static_info: StaticReplyInfo,
    encoded: Vec<u8>,
    last_build: Option<Instant>,
}

impl ReplyCache {
    pub fn new(server: Arc<dyn ServerInfo>, ttl: Duration) -> Self {
        let static_info = StaticReplyInfo::collect(server.as_ref());
        Self {
            server,
            enabled: false,
            ttl,
            static_info,
            encoded: Vec::new(),
            last_build: None,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    pub fn static_info(&self) -> &StaticReplyInfo {
        &self.static_info
    }

    /// Returns the cached reply, rebuilding it first once the TTL elapsed.
    pub fn get_or_build(&mut self, now: Instant) -> &[u8] {
        let stale = match self.last_build {
            Some(built) => now.saturating_duration_since(built) >= self.ttl,
            None => true,
        };
        if stale {
            self.rebuild(now);
        }
        &self.encoded
    }

    /// Rereads the static fields, then rebuilds the reply.
    pub fn refresh(&mut self, now: Instant) {
        self.static_info = StaticReplyInfo::collect(self.server.as_ref());
        self.rebuild(now);
    }

    fn rebuild(&mut self, now: Instant) {
        let reply = self.snapshot();
        self.encoded.clear();
        reply.encode_into(&mut self.encoded);
        self.last_build = Some(now);
        debug!(
            "Rebuilt info reply: {} bytes, {}/{} players",
            self.encoded.len(),
            reply.num_clients,
            reply.max_clients
        );
    }

    fn snapshot(&self) -> InfoReply {
        let server = self.server.as_ref();
        let max_clients = server
            .visible_max_players()
            .unwrap_or(self.static_info.max_clients);

        InfoReply {
            protocol: PROTOCOL_VERSION,
            server_name: server.server_name(),
            map_name: server.map_name(),
            game_dir: self.static_info.game_dir.clone(),
            game_description: self.static_info.game_description.clone(),
            app_id: server.app_id(),
            num_clients: clamp_u8(server.num_clients()),
            max_clients: clamp_u8(max_clients),
            num_bots: clamp_u8(server.num_bots()),
            os: OS_CHAR,
            has_password: server.has_password(),
            is_secure: server.is_secure(),
            game_version: self.static_info.game_version.clone(),
            udp_port: self.static_info.udp_port,
            steam_id: server.steam_id().unwrap_or(0),
            tags: self.static_info.tags.clone(),
        }
    }
}

fn clamp_u8(value: u32) -> u8 {
    value.min(u32::from(u8::MAX)) as u8
}
