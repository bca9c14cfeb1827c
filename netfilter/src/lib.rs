//! # Game Server Network Filter
//!
//! This library sits between a game server's UDP socket and the code that
//! reads from it. Every datagram is screened before the game sees it, and
//! info queries can be answered without ever reaching the game simulation.
//!
//! ## Core Responsibilities
//!
//! ### Packet Screening
//! Each datagram passes through the same checks in the same order:
//! - Optional sampling of the raw datagram, before any rejection
//! - Allow/deny list check on the source IPv4 address
//! - Out-of-band packet classification (malformed, abusive, info query)
//! - For info queries, per-source and global rate limiting
//!
//! ### Info Query Answering
//! When the reply cache is on, info queries are answered from a prebuilt
//! reply that is rebuilt once its TTL expires. Static fields such as the
//! game directory and gamemode tags are only reread on an explicit refresh.
//!
//! ### Threaded Receiving
//! A dedicated receive thread can take over the socket reads, screening
//! datagrams and parking accepted ones in a bounded queue that the game's
//! receive call site drains. A full queue pauses socket reads, so excess
//! traffic stays in the kernel buffer instead of growing memory.
//!
//! ## Module Organization
//!
//! ### Classifier Module (`classifier`)
//! Connectionless packet inspection:
//! - Split packet and empty datagram rejection
//! - Info query detection
//! - Strict length and payload checks for known query types
//!
//! ### Address Filter Module (`address_filter`)
//! Allow and deny sets keyed by the network-order IPv4 address.
//!
//! ### Rate Limiter Module (`rate_limiter`)
//! Fixed-window query budgets per source and across all sources.
//!
//! ### Reply Cache Module (`reply_cache`)
//! The [`ServerInfo`] trait the host implements, and the TTL cache built on it.
//!
//! ### Sampler Module (`sampler`)
//! Fixed-capacity ring of recent raw datagrams for offline inspection.
//!
//! ### Filter Module (`filter`)
//! [`Netfilter`], the lock-guarded screening context shared by every thread.
//!
//! ### Pipeline Module (`pipeline`)
//! [`ReceivePipeline`], the receive thread plus the consumer-facing read.
//!
//! ### Control Module (`control`)
//! Text commands for toggling features and editing lists at runtime.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use netfilter::{FilterConfig, Netfilter, ReceivePipeline, ServerInfo};
//! use std::net::UdpSocket;
//! use std::sync::Arc;
//!
//! fn attach(server: Arc<dyn ServerInfo>) -> netfilter::Result<()> {
//!     let config = FilterConfig {
//!         threaded_socket: true,
//!         reply_cache: true,
//!         ..FilterConfig::default()
//!     };
//!     let filter = Arc::new(Netfilter::new(&config, server));
//!     let socket = UdpSocket::bind("0.0.0.0:27015")?;
//!
//!     let mut pipeline = ReceivePipeline::new(socket, filter, config.queue_capacity)?;
//!     pipeline.start()?;
//!
//!     // The game's receive loop now reads screened datagrams.
//!     let mut buf = [0u8; 2048];
//!     while let Ok((len, from)) = pipeline.recv_from(&mut buf) {
//!         println!("{} bytes from {}", len, from);
//!     }
//!
//!     pipeline.stop();
//!     Ok(())
//! }
//! ```

pub mod address_filter;
pub mod classifier;
pub mod config;
pub mod control;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod queue;
pub mod rate_limiter;
pub mod reply_cache;
pub mod sampler;
pub mod stats;

pub use classifier::{classify, PacketType};
pub use config::FilterConfig;
pub use control::ControlCommand;
pub use error::{FilterError, Result};
pub use filter::{Disposition, Netfilter, ReplySender};
pub use pipeline::{DatagramSocket, PacketSource, PipelineState, ReceivePipeline};
pub use reply_cache::{Gamemode, ServerInfo};
pub use sampler::SampledPacket;
pub use stats::StatsSnapshot;
