//! Error types for the filter and its receive pipeline

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("game socket unavailable: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to build receive runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("failed to spawn receive thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error("receive pipeline is already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid control command: {0}")]
    Command(String),

    #[error("failed to encode samples: {0}")]
    SampleEncode(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FilterError {
    /// Startup failures leave the filter unusable and must abort initialisation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FilterError::Socket(_) | FilterError::Runtime(_) | FilterError::ThreadSpawn(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
