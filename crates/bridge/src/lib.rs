mod client;
mod process;

pub use client::BridgeClient;
pub use process::{minimum_version, parse_version, BridgeProcess};

use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("could not connect to bridge hypervisor on {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("not connected to bridge hypervisor on {host}:{port}")]
    NotConnected { host: String, port: u16 },

    #[error(
        "lost communication with {host}:{port}: {reason}, bridge process running: {running}"
    )]
    Disconnected {
        host: String,
        port: u16,
        reason: String,
        running: bool,
    },

    /// A `2xx-` error line returned by the hypervisor, prefix stripped.
    #[error("{0}")]
    Hypervisor(String),

    #[error("could not determine bridge hypervisor version for {path}: {reason}")]
    Version { path: String, reason: String },

    #[error("bridge hypervisor version {found} is below the required {required}")]
    VersionTooOld { found: String, required: String },

    #[error("could not start bridge hypervisor: {0}")]
    Spawn(String),

    #[error("timed out after {0:?} while {1}")]
    Timeout(Duration, String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
