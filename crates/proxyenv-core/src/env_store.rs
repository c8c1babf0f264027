//! Windows per-user environment store (`HKCU\Environment`).
//!
//! Windows variable names are case-insensitive, so only the lower-case
//! proxy variables are tracked.

use crate::error::{ProxyEnvError, Result};
use crate::model::{EnvironmentProxyState, ProxyVar};
use crate::shell_config::ProxyEnvironment;

/// Registry subkey of the per-user environment.
const ENVIRONMENT_KEY: &str = "Environment";

/// Persistent per-user environment variables.
#[derive(Debug, Clone)]
pub struct UserEnvironment {
    vars: Vec<ProxyVar>,
}

impl Default for UserEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl UserEnvironment {
    /// Creates a store tracking the lower-case proxy variables.
    pub fn new() -> Self {
        Self {
            vars: ProxyVar::LOWERCASE.to_vec(),
        }
    }

    /// Returns the tracked variables.
    pub fn vars(&self) -> &[ProxyVar] {
        &self.vars
    }
}

#[cfg(target_os = "windows")]
fn registry_error(e: std::io::Error) -> ProxyEnvError {
    ProxyEnvError::Registry(e.to_string())
}

#[cfg(target_os = "windows")]
impl ProxyEnvironment for UserEnvironment {
    fn apply(&self, proxy_url: Option<&str>) -> Result<()> {
        use tracing::info;
        use winreg::enums::*;
        use winreg::RegKey;

        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let env = hkcu
            .open_subkey_with_flags(ENVIRONMENT_KEY, KEY_READ | KEY_WRITE)
            .map_err(registry_error)?;

        for var in &self.vars {
            match proxy_url {
                Some(url) => env
                    .set_value(var.as_str(), &url.to_string())
                    .map_err(registry_error)?,
                None => match env.delete_value(var.as_str()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(registry_error(e)),
                },
            }
        }

        match proxy_url {
            Some(url) => info!("Set user environment proxy variables to {}", url),
            None => info!("Removed user environment proxy variables"),
        }
        Ok(())
    }

    fn read(&self) -> Result<EnvironmentProxyState> {
        use winreg::enums::*;
        use winreg::RegKey;

        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let env = hkcu
            .open_subkey_with_flags(ENVIRONMENT_KEY, KEY_READ)
            .map_err(registry_error)?;

        let mut state = EnvironmentProxyState::unset(&self.vars);
        for var in &self.vars {
            match env.get_value::<String, _>(var.as_str()) {
                Ok(value) => state.set(*var, value.trim()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(registry_error(e)),
            }
        }
        Ok(state)
    }

    fn location(&self) -> String {
        format!(r"HKCU\{}", ENVIRONMENT_KEY)
    }
}

#[cfg(not(target_os = "windows"))]
impl ProxyEnvironment for UserEnvironment {
    fn apply(&self, _proxy_url: Option<&str>) -> Result<()> {
        Err(ProxyEnvError::UnsupportedPlatform(
            "user environment store requires Windows".to_string(),
        ))
    }

    fn read(&self) -> Result<EnvironmentProxyState> {
        Err(ProxyEnvError::UnsupportedPlatform(
            "user environment store requires Windows".to_string(),
        ))
    }

    fn location(&self) -> String {
        format!(r"HKCU\{}", ENVIRONMENT_KEY)
    }
}
