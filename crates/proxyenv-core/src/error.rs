//! Core error types.

use std::time::Duration;

use thiserror::Error;

use crate::settings::MIN_CHECK_INTERVAL;

/// Errors raised while running an external OS command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The program could not be started at all.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program did not finish within its time budget.
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    /// The program exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

/// Errors that can occur in proxy detection and environment sync.
#[derive(Debug, Error)]
pub enum ProxyEnvError {
    /// The running OS has no reader/writer implementation.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Poll interval below the allowed minimum.
    #[error(
        "check interval must be at least {min}ms, got {0}ms",
        min = MIN_CHECK_INTERVAL.as_millis()
    )]
    InvalidInterval(u128),

    /// The user's home directory could not be determined.
    #[error("home directory not found")]
    HomeDirNotFound,

    /// An OS command failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Command output did not have the expected shape.
    #[error("unexpected {what} output: {detail}")]
    Parse { what: &'static str, detail: String },

    /// Filesystem error while reading or writing the shell profile.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Windows environment store access failed.
    #[error("registry error: {0}")]
    Registry(String),

    /// Settings store failure.
    #[error("settings error: {0}")]
    Settings(String),

    /// A blocking environment task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ProxyEnvError {
    pub(crate) fn parse(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Parse {
            what,
            detail: detail.into(),
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, ProxyEnvError>;
