//! Proxy snapshot and environment state types.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The OS-level proxy configuration as detected on one read.
///
/// A fresh snapshot is produced on every successful read. `port` is only
/// meaningful when `enabled` is true and `host` is non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Whether the OS routes traffic through a proxy.
    pub enabled: bool,
    /// Proxy host, if configured.
    pub host: Option<String>,
    /// Proxy port (1-65535), if configured.
    pub port: Option<u16>,
}

impl ProxySettings {
    /// A disabled snapshot with no host or port.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// An enabled snapshot for `host:port`.
    pub fn enabled(host: impl Into<String>, port: u16) -> Self {
        Self::from_parts(true, Some(host.into()), Some(port))
    }

    /// Builds a snapshot from raw parsed parts.
    ///
    /// An enabled flag without a usable host and port is downgraded to
    /// disabled; whatever host/port was parsed is kept for display. A host
    /// that is not a plain domain name or IP address is dropped, since it
    /// ends up inside shell startup files.
    pub fn from_parts(enabled: bool, host: Option<String>, port: Option<u16>) -> Self {
        let host = host
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .filter(|h| {
                let valid = is_valid_host(h);
                if !valid {
                    tracing::warn!("Ignoring invalid proxy host {:?}", h);
                }
                valid
            });
        let port = port.filter(|p| *p != 0);
        let usable = host.is_some() && port.is_some();

        Self {
            enabled: enabled && usable,
            host,
            port,
        }
    }

    /// Returns the `http://host:port` URL when the proxy is usable.
    pub fn proxy_url(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        match (&self.host, self.port) {
            (Some(host), Some(port)) if !host.is_empty() => {
                if host.contains(':') && !host.starts_with('[') {
                    Some(format!("http://[{}]:{}", host, port))
                } else {
                    Some(format!("http://{}:{}", host, port))
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for ProxySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.enabled, &self.host, self.port) {
            (true, Some(host), Some(port)) => write!(f, "enabled ({}:{})", host, port),
            _ => write!(f, "disabled"),
        }
    }
}

/// Accepts IP addresses and domain names made of letters, digits, `.`, `-`
/// and `_`.
fn is_valid_host(host: &str) -> bool {
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    match url::Host::parse(host) {
        Ok(url::Host::Domain(domain)) => domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')),
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Parses a port string, accepting only 1-65535.
pub(crate) fn parse_port(raw: &str) -> Option<u16> {
    raw.trim().parse::<u16>().ok().filter(|p| *p != 0)
}

/// Environment variables managed by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProxyVar {
    #[serde(rename = "http_proxy")]
    HttpProxy,
    #[serde(rename = "https_proxy")]
    HttpsProxy,
    #[serde(rename = "all_proxy")]
    AllProxy,
    #[serde(rename = "HTTP_PROXY")]
    HttpProxyUpper,
    #[serde(rename = "HTTPS_PROXY")]
    HttpsProxyUpper,
    #[serde(rename = "ALL_PROXY")]
    AllProxyUpper,
}

impl ProxyVar {
    /// All tracked variables, in the order they are written.
    pub const ALL: [ProxyVar; 6] = [
        ProxyVar::HttpProxy,
        ProxyVar::HttpsProxy,
        ProxyVar::AllProxy,
        ProxyVar::HttpProxyUpper,
        ProxyVar::HttpsProxyUpper,
        ProxyVar::AllProxyUpper,
    ];

    /// Lower-case variables only, for case-insensitive stores.
    pub const LOWERCASE: [ProxyVar; 3] = [
        ProxyVar::HttpProxy,
        ProxyVar::HttpsProxy,
        ProxyVar::AllProxy,
    ];

    /// Returns the variable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpProxy => "http_proxy",
            Self::HttpsProxy => "https_proxy",
            Self::AllProxy => "all_proxy",
            Self::HttpProxyUpper => "HTTP_PROXY",
            Self::HttpsProxyUpper => "HTTPS_PROXY",
            Self::AllProxyUpper => "ALL_PROXY",
        }
    }

    /// Looks up a variable by its exact name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == name)
    }
}

impl fmt::Display for ProxyVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is currently persisted for the tracked proxy variables.
///
/// Derived from a single read of the shell profile or environment store;
/// never cached.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentProxyState {
    vars: BTreeMap<ProxyVar, String>,
}

impl EnvironmentProxyState {
    /// Creates a state where every tracked variable is unset.
    pub fn unset(tracked: &[ProxyVar]) -> Self {
        Self {
            vars: tracked.iter().map(|v| (*v, String::new())).collect(),
        }
    }

    /// Records a value for a variable.
    pub fn set(&mut self, var: ProxyVar, value: impl Into<String>) {
        self.vars.insert(var, value.into());
    }

    /// Returns the value of a variable, if set and non-empty.
    pub fn get(&self, var: ProxyVar) -> Option<&str> {
        self.vars
            .get(&var)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Returns true if no tracked variable has a value.
    pub fn is_empty(&self) -> bool {
        self.vars.values().all(String::is_empty)
    }

    /// The persisted proxy URL, taken from `http_proxy`.
    pub fn proxy_url(&self) -> Option<&str> {
        self.get(ProxyVar::HttpProxy)
    }

    /// Iterates over `(variable, value)` pairs in write order.
    pub fn iter(&self) -> impl Iterator<Item = (ProxyVar, &str)> {
        self.vars.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

/// Payload delivered to observers after a tick or policy change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyChangeEvent {
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// The detected OS proxy.
    pub system_proxy: ProxySettings,
    /// The persisted environment after any write.
    pub environment_state: EnvironmentProxyState,
    /// Whether the event bypassed the unchanged-state check.
    pub forced: bool,
}

impl ProxyChangeEvent {
    /// Creates a new event stamped with the current time.
    pub fn new(
        system_proxy: ProxySettings,
        environment_state: EnvironmentProxyState,
        forced: bool,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            system_proxy,
            environment_state,
            forced,
        }
    }
}
