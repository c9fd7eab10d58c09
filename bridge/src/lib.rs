//! Single-connection relay between the local process stdio and an agent
//! that dials back from inside a job container.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod listener;
pub mod relay;

pub use listener::{bind_listener, retry_on_addr_in_use, BridgeListener};
pub use relay::{relay, RelayReport, CHUNK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peer socket to local output.
    Inbound,
    /// Local input to peer socket.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("peer -> stdout"),
            Direction::Outbound => f.write_str("stdin -> peer"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
    #[error("No agent connected to {address} within {timeout:?}")]
    AcceptTimeout { address: String, timeout: Duration },
    #[error("Failed to accept agent connection on {address}: {source}")]
    Accept {
        address: String,
        source: std::io::Error,
    },
    #[error("Relay {direction} failed: {source}")]
    Io {
        direction: Direction,
        source: std::io::Error,
    },
    #[error("Relay {direction} task failed: {message}")]
    Task {
        direction: Direction,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub address: String,
    pub port: u16,
    pub accept_timeout: Duration,
    pub bind_retry_delay: Duration,
}

impl BridgeConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}
