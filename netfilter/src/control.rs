//! Operator control commands
//!
//! One command per line, e.g. `deny add 192.0.2.7`, `limiter window 30`,
//! `cache refresh` or `sample next`. Addresses may be dotted IPv4 or the raw
//! network-order integer the filter stores.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::address_filter::{address_key, key_to_ip};
use crate::error::{FilterError, Result};
use crate::filter::Netfilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressList {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    EnableList { list: AddressList, enabled: bool },
    AddAddress { list: AddressList, key: u32 },
    RemoveAddress { list: AddressList, key: u32 },
    ResetList { list: AddressList },
    StrictValidation(bool),
    ThreadedSocket(bool),
    ReplyCache(bool),
    ReplyCacheTtl(Duration),
    RefreshReplyCache,
    QueryLimiter(bool),
    QueryWindow(Duration),
    MaxQueriesPerWindow(u32),
    GlobalMaxQueriesPerSecond(u32),
    PacketSampling(bool),
    NextSample,
    SaveSamples(PathBuf),
    Stats,
}

fn parse_toggle(word: Option<&str>) -> Result<bool> {
    match word {
        Some("on") | Some("true") | Some("1") => Ok(true),
        Some("off") | Some("false") | Some("0") => Ok(false),
        other => Err(FilterError::Command(format!(
            "expected on/off, got {:?}",
            other.unwrap_or("")
        ))),
    }
}

fn parse_number<T: FromStr>(word: Option<&str>, what: &str) -> Result<T> {
    word.and_then(|w| w.parse().ok())
        .ok_or_else(|| FilterError::Command(format!("expected {}", what)))
}

/// Accepts dotted IPv4 or a raw network-order key.
pub fn parse_address(word: &str) -> Result<u32> {
    if let Ok(ip) = word.parse::<Ipv4Addr>() {
        return Ok(address_key(ip));
    }
    word.parse::<u32>()
        .map_err(|_| FilterError::Command(format!("invalid address {:?}", word)))
}

impl FromStr for ControlCommand {
    type Err = FilterError;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let head = words
            .next()
            .ok_or_else(|| FilterError::Command("empty command".to_string()))?;
        let verb = words.next();

        let command = match head {
            "allow" | "deny" => {
                let list = if head == "allow" {
                    AddressList::Allow
                } else {
                    AddressList::Deny
                };
                match verb {
                    Some("add") => ControlCommand::AddAddress {
                        list,
                        key: parse_address(words.next().unwrap_or(""))?,
                    },
                    Some("remove") => ControlCommand::RemoveAddress {
                        list,
                        key: parse_address(words.next().unwrap_or(""))?,
                    },
                    Some("reset") => ControlCommand::ResetList { list },
                    toggle => ControlCommand::EnableList {
                        list,
                        enabled: parse_toggle(toggle)?,
                    },
                }
            }
            "validation" => ControlCommand::StrictValidation(parse_toggle(verb)?),
            "threaded" => ControlCommand::ThreadedSocket(parse_toggle(verb)?),
            "cache" => match verb {
                Some("ttl") => ControlCommand::ReplyCacheTtl(Duration::from_secs(parse_number(
                    words.next(),
                    "seconds",
                )?)),
                Some("refresh") => ControlCommand::RefreshReplyCache,
                toggle => ControlCommand::ReplyCache(parse_toggle(toggle)?),
            },
            "limiter" => match verb {
                Some("window") => ControlCommand::QueryWindow(Duration::from_secs(parse_number(
                    words.next(),
                    "seconds",
                )?)),
                Some("max") => ControlCommand::MaxQueriesPerWindow(parse_number(
                    words.next(),
                    "query count",
                )?),
                Some("global") => ControlCommand::GlobalMaxQueriesPerSecond(parse_number(
                    words.next(),
                    "query count",
                )?),
                toggle => ControlCommand::QueryLimiter(parse_toggle(toggle)?),
            },
            "sampling" => ControlCommand::PacketSampling(parse_toggle(verb)?),
            "sample" => match verb {
                Some("next") | None => ControlCommand::NextSample,
                Some("save") => {
                    let path = words
                        .next()
                        .ok_or_else(|| FilterError::Command("expected a file path".to_string()))?;
                    ControlCommand::SaveSamples(PathBuf::from(path))
                }
                Some(other) => {
                    return Err(FilterError::Command(format!("unknown sample action {}", other)))
                }
            },
            "stats" => ControlCommand::Stats,
            other => return Err(FilterError::Command(format!("unknown command {}", other))),
        };

        Ok(command)
    }
}

impl ControlCommand {
    /// Parses one raw input line. Blank lines yield `None`.
    pub fn from_line(raw: &[u8]) -> Result<Option<Self>> {
        let line = std::str::from_utf8(raw)
            .map_err(|_| FilterError::Command("input is not valid UTF-8".to_string()))?;
        if line.trim().is_empty() {
            return Ok(None);
        }
        line.parse().map(Some)
    }

    /// Applies the command, returning text for the operator when there is
    /// something to report.
    pub fn apply(self, filter: &Netfilter) -> Result<Option<String>> {
        match self {
            ControlCommand::EnableList { list, enabled } => match list {
                AddressList::Allow => filter.set_allow_list_enabled(enabled),
                AddressList::Deny => filter.set_deny_list_enabled(enabled),
            },
            ControlCommand::AddAddress { list, key } => match list {
                AddressList::Allow => filter.add_allowed(key),
                AddressList::Deny => filter.add_denied(key),
            },
            ControlCommand::RemoveAddress { list, key } => match list {
                AddressList::Allow => filter.remove_allowed(key),
                AddressList::Deny => filter.remove_denied(key),
            },
            ControlCommand::ResetList { list } => match list {
                AddressList::Allow => filter.reset_allow_list(),
                AddressList::Deny => filter.reset_deny_list(),
            },
            ControlCommand::StrictValidation(enabled) => filter.set_strict_validation(enabled),
            ControlCommand::ThreadedSocket(enabled) => filter.set_threaded(enabled),
            ControlCommand::ReplyCache(enabled) => filter.set_reply_cache_enabled(enabled),
            ControlCommand::ReplyCacheTtl(ttl) => filter.set_reply_cache_ttl(ttl),
            ControlCommand::RefreshReplyCache => filter.refresh_reply_cache(),
            ControlCommand::QueryLimiter(enabled) => filter.set_query_limiter_enabled(enabled),
            ControlCommand::QueryWindow(window) => filter.set_query_window(window),
            ControlCommand::MaxQueriesPerWindow(max) => filter.set_max_queries_per_window(max),
            ControlCommand::GlobalMaxQueriesPerSecond(max) => {
                filter.set_global_max_queries_per_second(max)
            }
            ControlCommand::PacketSampling(enabled) => filter.set_sampling_enabled(enabled),
            ControlCommand::NextSample => {
                let text = match filter.next_sample() {
                    Some(sample) => format!(
                        "{}:{} {} bytes {:02x?}",
                        key_to_ip(sample.address),
                        sample.host_port(),
                        sample.data.len(),
                        sample.data
                    ),
                    None => "no samples".to_string(),
                };
                return Ok(Some(text));
            }
            ControlCommand::SaveSamples(path) => {
                let count = filter.save_samples(&path)?;
                return Ok(Some(format!("saved {} samples to {}", count, path.display())));
            }
            ControlCommand::Stats => return Ok(Some(filter.stats().to_string())),
        }
        Ok(None)
    }
}
