use crate::config::ConfigError;
use shared::CodecError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Conditions that stop the server before the first tick.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("could not create UDP socket: {0}")]
    Socket(#[source] io::Error),
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl StartupError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Socket(_) => 2,
            StartupError::Bind { .. } => 3,
            StartupError::Config(_) => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no free session slot")]
    Full,
    #[error("player could not be created")]
    PlayerRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("frame of {needed} bytes does not fit ({used}/{capacity} bytes used)")]
    Overflow {
        needed: usize,
        used: usize,
        capacity: usize,
    },
    #[error("no session in slot {0}")]
    NoSession(usize),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("send failed: {0}")]
    Transport(#[from] io::Error),
    #[error("no session in slot {0}")]
    NoSession(usize),
}
