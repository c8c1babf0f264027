//! Platform selection.
//!
//! The reader and writer variants are chosen once from the running OS and
//! stay fixed for the lifetime of the process.

use crate::error::{ProxyEnvError, Result};

/// Operating systems with a proxy reader and environment writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Windows: Internet Settings registry key and per-user environment.
    Windows,
    /// macOS: `networksetup` and `~/.zshrc`.
    MacOs,
    /// Linux: GNOME proxy settings and the login shell profile.
    Linux,
}

impl Platform {
    /// Returns the platform of the running process.
    pub fn current() -> Result<Self> {
        Self::from_os(std::env::consts::OS)
    }

    /// Maps an OS name (as in `std::env::consts::OS`) to a platform.
    pub fn from_os(os: &str) -> Result<Self> {
        match os {
            "windows" => Ok(Self::Windows),
            "macos" => Ok(Self::MacOs),
            "linux" => Ok(Self::Linux),
            other => Err(ProxyEnvError::UnsupportedPlatform(other.to_string())),
        }
    }

    /// Returns the platform as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::MacOs => "macos",
            Self::Linux => "linux",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
