//! Process-level error types.
//!
//! Per-connection trouble never reaches these: it is turned into a
//! [`Disconnection`](crate::types::Disconnection) inside the loop.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unable to parse {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unable to bind to port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("not bound to any ports")]
    NoListeners,

    #[error("reboot manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("unable to install signal handlers: {0}")]
    Signal(#[source] std::io::Error),

    #[error("exec of new server image failed: {0}")]
    Exec(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
