//! Typed errors for each stage of the watch pipeline.
//!
//! A [`CycleError`] aborts only the cycle it occurred in. Delivery errors
//! never surface as a cycle error; the notifier records them per recipient.

use schedule_watch_core::extract::ExtractError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out after {secs}s")]
    Timeout { url: String, secs: u64 },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed snapshot {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid snapshot name: {0}")]
    InvalidName(String),

    #[error("snapshot not found: {0}")]
    NotFound(String),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed user record {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl RegistryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a single message could not be delivered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The recipient blocked the bot, was deactivated, or the chat is gone.
    #[error("recipient unreachable: {0}")]
    Unreachable(String),

    #[error("rejected by provider (HTTP {status}): {description}")]
    Rejected { status: u16, description: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out")]
    Timeout,

    #[error("recipient has no chat address")]
    NoAddress,
}

impl DeliveryError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, DeliveryError::Unreachable(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("transport token is not configured (set transport.token or {})", crate::config::TOKEN_ENV)]
    MissingToken,

    #[error("invalid transport setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("user {0} not found")]
    UnknownUser(i64),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stop worker: {0}")]
    Stop(#[source] std::io::Error),
}

/// Failure of one fetch → extract → persist → notify cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("snapshot store: {0}")]
    Persistence(#[from] PersistenceError),
}
