//! Platform proxy reader.
//!
//! Queries the OS for its current proxy configuration:
//! - Windows: Internet Settings registry key (PowerShell JSON, `reg query` fallback)
//! - macOS: `networksetup` web proxy of the active network service
//! - Linux: GNOME proxy settings, falling back to the inherited `http_proxy`
//!
//! Parsing is kept in free functions so every platform's output format is
//! covered by tests on any host.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, SystemCommandRunner};
use crate::error::{ProxyEnvError, Result};
use crate::model::{parse_port, ProxySettings};
use crate::platform::Platform;

/// Registry key holding the WinINet proxy settings.
const INTERNET_SETTINGS_KEY: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// PowerShell query emitting `ProxyEnable`/`ProxyServer` as JSON.
const INTERNET_SETTINGS_QUERY: &str = r"Get-ItemProperty -Path 'HKCU:\Software\Microsoft\Windows\CurrentVersion\Internet Settings' | Select-Object ProxyEnable,ProxyServer | ConvertTo-Json";

/// Service used when the active macOS service cannot be resolved.
const DEFAULT_MACOS_SERVICE: &str = "Wi-Fi";

static REG_DWORD_ENABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*ProxyEnable\s+REG_DWORD\s+0x([0-9a-f]+)").expect("Invalid regex pattern")
});

static REG_SZ_SERVER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*ProxyServer\s+REG_SZ\s+(.+?)\s*$").expect("Invalid regex pattern")
});

/// Source of OS proxy snapshots.
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Reads the current OS proxy, reporting failures.
    ///
    /// A successful read of a proxy that is enabled but unusable (no host or
    /// an invalid port) returns a disabled snapshot, not an error.
    async fn try_read(&self) -> Result<ProxySettings>;

    /// Drops cached OS lookups so the next read starts fresh.
    async fn reinitialize(&self) {}

    /// Reads the current OS proxy, failing closed to a disabled snapshot.
    async fn read(&self) -> ProxySettings {
        match self.try_read().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to read system proxy, treating as disabled: {}", e);
                ProxySettings::disabled()
            }
        }
    }
}

/// Reads the proxy of the running OS.
pub struct SystemProxyReader {
    platform: Platform,
    runner: Arc<dyn CommandRunner>,
    inherited_http_proxy: Option<String>,
    network_service: Mutex<Option<String>>,
}

impl std::fmt::Debug for SystemProxyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProxyReader")
            .field("platform", &self.platform)
            .field("inherited_http_proxy", &self.inherited_http_proxy)
            .finish()
    }
}

impl SystemProxyReader {
    /// Creates a reader for the running OS.
    ///
    /// Fails with `UnsupportedPlatform` on any OS without an implementation.
    pub fn new() -> Result<Self> {
        let platform = Platform::current()?;
        Ok(Self::with_runner(platform, Arc::new(SystemCommandRunner::new())))
    }

    /// Creates a reader for `platform` that runs commands through `runner`.
    pub fn with_runner(platform: Platform, runner: Arc<dyn CommandRunner>) -> Self {
        let inherited_http_proxy = std::env::var("http_proxy")
            .or_else(|_| std::env::var("HTTP_PROXY"))
            .ok()
            .filter(|v| !v.trim().is_empty());

        Self {
            platform,
            runner,
            inherited_http_proxy,
            network_service: Mutex::new(None),
        }
    }

    /// Overrides the inherited `http_proxy` used by the Linux fallback.
    pub fn with_inherited_proxy(mut self, value: Option<String>) -> Self {
        self.inherited_http_proxy = value;
        self
    }

    /// Returns the platform this reader targets.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    async fn read_windows(&self) -> Result<ProxySettings> {
        let structured = match self
            .runner
            .run(
                "powershell",
                &["-NoProfile", "-NonInteractive", "-Command", INTERNET_SETTINGS_QUERY],
            )
            .await
        {
            Ok(stdout) => parse_windows_json(&stdout),
            Err(e) => Err(e.into()),
        };

        match structured {
            Ok(settings) => Ok(settings),
            Err(e) => {
                debug!("Structured proxy query failed ({}), falling back to reg query", e);
                let stdout = self
                    .runner
                    .run("reg", &["query", INTERNET_SETTINGS_KEY])
                    .await?;
                parse_reg_query(&stdout)
            }
        }
    }

    async fn read_macos(&self) -> Result<ProxySettings> {
        let service = self.network_service().await;

        match self.query_networksetup("-getwebproxy", &service).await {
            Ok(settings) => Ok(settings),
            Err(e) => {
                debug!(
                    "Web proxy query for {} failed ({}), trying secure web proxy",
                    service, e
                );
                self.query_networksetup("-getsecurewebproxy", &service).await
            }
        }
    }

    async fn query_networksetup(&self, flag: &str, service: &str) -> Result<ProxySettings> {
        let stdout = self.runner.run("networksetup", &[flag, service]).await?;
        parse_networksetup_proxy(&stdout)
    }

    async fn network_service(&self) -> String {
        let mut cached = self.network_service.lock().await;
        if let Some(service) = cached.as_ref() {
            return service.clone();
        }

        let service = self.resolve_network_service().await;
        info!("Using network service: {}", service);
        *cached = Some(service.clone());
        service
    }

    async fn resolve_network_service(&self) -> String {
        let ports = match self
            .runner
            .run("networksetup", &["-listallhardwareports"])
            .await
        {
            Ok(stdout) => parse_hardware_ports(&stdout),
            Err(e) => {
                warn!("Failed to list hardware ports: {}", e);
                return DEFAULT_MACOS_SERVICE.to_string();
            }
        };

        match self.runner.run("route", &["-n", "get", "default"]).await {
            Ok(stdout) => {
                if let Some(device) = parse_route_interface(&stdout) {
                    if let Some(port) = ports.iter().find(|p| p.device == device) {
                        return port.name.clone();
                    }
                    debug!("No hardware port for default interface {}", device);
                }
            }
            Err(e) => debug!("Default route lookup failed: {}", e),
        }

        ports
            .iter()
            .find(|p| p.name.contains("Wi-Fi") || p.name.contains("Ethernet"))
            .map(|p| p.name.clone())
            .unwrap_or_else(|| DEFAULT_MACOS_SERVICE.to_string())
    }

    async fn read_linux(&self) -> Result<ProxySettings> {
        let mode = match self
            .runner
            .run("gsettings", &["get", "org.gnome.system.proxy", "mode"])
            .await
        {
            Ok(mode) => mode,
            Err(e) => {
                debug!("gsettings unavailable ({}), using inherited environment", e);
                return self.inherited_proxy();
            }
        };

        if unquote(&mode) != "manual" {
            return Ok(ProxySettings::disabled());
        }

        let host = self
            .runner
            .run("gsettings", &["get", "org.gnome.system.proxy.http", "host"])
            .await?;
        let port = self
            .runner
            .run("gsettings", &["get", "org.gnome.system.proxy.http", "port"])
            .await?;

        Ok(ProxySettings::from_parts(
            true,
            Some(unquote(&host)),
            parse_port(&unquote(&port)),
        ))
    }

    fn inherited_proxy(&self) -> Result<ProxySettings> {
        match self.inherited_http_proxy.as_deref() {
            Some(raw) => parse_proxy_url(raw),
            None => Ok(ProxySettings::disabled()),
        }
    }
}

#[async_trait]
impl ProxySource for SystemProxyReader {
    async fn try_read(&self) -> Result<ProxySettings> {
        let settings = match self.platform {
            Platform::Windows => self.read_windows().await?,
            Platform::MacOs => self.read_macos().await?,
            Platform::Linux => self.read_linux().await?,
        };
        debug!("System proxy: {}", settings);
        Ok(settings)
    }

    /// Forgets the cached macOS network service.
    async fn reinitialize(&self) {
        *self.network_service.lock().await = None;
        debug!("Cleared cached network service");
    }
}

// ============================================================================
// Output parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct InternetSettings {
    #[serde(rename = "ProxyEnable")]
    proxy_enable: Option<i64>,
    #[serde(rename = "ProxyServer")]
    proxy_server: Option<String>,
}

/// Parses the JSON emitted by the PowerShell Internet Settings query.
pub fn parse_windows_json(stdout: &str) -> Result<ProxySettings> {
    let parsed: InternetSettings = serde_json::from_str(stdout.trim())
        .map_err(|e| ProxyEnvError::parse("Internet Settings JSON", e.to_string()))?;

    let enabled = parsed.proxy_enable == Some(1);
    let (host, port) = parsed
        .proxy_server
        .as_deref()
        .map(parse_proxy_server)
        .unwrap_or((None, None));

    Ok(ProxySettings::from_parts(enabled, host, port))
}

/// Parses `reg query` text output for the Internet Settings key.
pub fn parse_reg_query(stdout: &str) -> Result<ProxySettings> {
    let mut enabled = None;
    let mut server = None;

    for line in stdout.lines() {
        if let Some(caps) = REG_DWORD_ENABLE.captures(line) {
            enabled = Some(u32::from_str_radix(&caps[1], 16).unwrap_or(0) == 1);
        } else if let Some(caps) = REG_SZ_SERVER.captures(line) {
            server = Some(caps[1].to_string());
        }
    }

    let enabled = enabled.ok_or_else(|| {
        ProxyEnvError::parse("reg query", "ProxyEnable value not present")
    })?;
    let (host, port) = server
        .as_deref()
        .map(parse_proxy_server)
        .unwrap_or((None, None));

    Ok(ProxySettings::from_parts(enabled, host, port))
}

/// Splits a WinINet `ProxyServer` value into host and port.
///
/// Accepts `host:port` and per-protocol lists such as
/// `http=host:port;https=host:port`, preferring the `http=` entry.
pub fn parse_proxy_server(raw: &str) -> (Option<String>, Option<u16>) {
    let entries: Vec<&str> = raw
        .split(';')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .collect();

    let entry = entries
        .iter()
        .find_map(|e| e.strip_prefix("http="))
        .or_else(|| entries.first().map(|e| e.split_once('=').map_or(*e, |(_, v)| v)))
        .unwrap_or("");

    let entry = entry
        .strip_prefix("http://")
        .or_else(|| entry.strip_prefix("https://"))
        .unwrap_or(entry);

    match entry.rsplit_once(':') {
        Some((host, port)) => (Some(host.to_string()), parse_port(port)),
        None if !entry.is_empty() => (Some(entry.to_string()), None),
        None => (None, None),
    }
}

/// Parses `networksetup -getwebproxy` style output.
///
/// `Enabled`, `Server` and `Port` must all be present.
pub fn parse_networksetup_proxy(stdout: &str) -> Result<ProxySettings> {
    let mut enabled = None;
    let mut server = None;
    let mut port = None;

    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Enabled" => enabled = Some(value == "Yes"),
            "Server" => server = Some(value.to_string()),
            "Port" => port = Some(value.to_string()),
            _ => {}
        }
    }

    match (enabled, server, port) {
        (Some(enabled), Some(server), Some(port)) => Ok(ProxySettings::from_parts(
            enabled,
            Some(server),
            parse_port(&port),
        )),
        _ => Err(ProxyEnvError::parse(
            "networksetup",
            "missing Enabled/Server/Port",
        )),
    }
}

/// A `networksetup -listallhardwareports` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwarePort {
    /// Service name, e.g. `Wi-Fi`.
    pub name: String,
    /// BSD device, e.g. `en0`.
    pub device: String,
}

/// Parses the hardware port listing into name/device pairs.
pub fn parse_hardware_ports(stdout: &str) -> Vec<HardwarePort> {
    let mut ports = Vec::new();
    let mut name: Option<String> = None;

    for line in stdout.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("Hardware Port:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Device:") {
            if let Some(name) = name.take() {
                ports.push(HardwarePort {
                    name,
                    device: value.trim().to_string(),
                });
            }
        }
    }

    ports
}

/// Extracts the `interface:` device from `route -n get default`.
pub fn parse_route_interface(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        line.trim()
            .strip_prefix("interface:")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

/// Parses a proxy URL such as `http://127.0.0.1:8080`.
///
/// A bare `host:port` is treated as `http://host:port`.
pub fn parse_proxy_url(raw: &str) -> Result<ProxySettings> {
    let raw = raw.trim();
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };

    let url = url::Url::parse(&candidate)
        .map_err(|e| ProxyEnvError::parse("proxy URL", format!("{}: {}", raw, e)))?;

    Ok(ProxySettings::from_parts(
        true,
        url.host_str().map(str::to_string),
        url.port_or_known_default(),
    ))
}

/// Strips gsettings quoting (`'manual'` -> `manual`).
fn unquote(raw: &str) -> String {
    raw.trim().trim_matches(|c| c == '\'' || c == '"').to_string()
}
