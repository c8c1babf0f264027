//! Snapshot of engine state for the command line.

use proxyenv_core::{EnvironmentProxyState, ProxySettings, ProxySyncEngine, SyncPolicy};
use serde::Serialize;
use tracing::warn;

/// What `proxyenv status` prints.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Last detected OS proxy, if a read has succeeded.
    pub system_proxy: Option<ProxySettings>,
    /// Proxy URL derived from the detected settings.
    pub proxy_url: Option<String>,
    /// Where the environment is persisted.
    pub environment_location: String,
    /// Persisted variables, or `None` if they could not be read.
    pub environment: Option<EnvironmentProxyState>,
    /// Active sync policy.
    pub policy: SyncPolicy,
}

impl StatusReport {
    /// Collects the report from `engine` without polling.
    pub fn collect(engine: &ProxySyncEngine) -> Self {
        Self::build(engine, engine.current_settings())
    }

    /// Reads the OS proxy once and reports it.
    ///
    /// Unlike a refresh this neither records the snapshot nor notifies, so a
    /// one-shot `status` never pops up a desktop notification.
    pub async fn detect(engine: &ProxySyncEngine) -> Self {
        let system_proxy = match engine.detect_system_proxy().await {
            Ok(settings) => Some(settings),
            Err(e) => {
                warn!("Failed to read system proxy: {}", e);
                engine.current_settings()
            }
        };
        Self::build(engine, system_proxy)
    }

    fn build(engine: &ProxySyncEngine, system_proxy: Option<ProxySettings>) -> Self {
        let environment = match engine.environment_state() {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Failed to read proxy environment: {}", e);
                None
            }
        };

        Self {
            proxy_url: system_proxy.as_ref().and_then(ProxySettings::proxy_url),
            system_proxy,
            environment_location: engine.environment_location(),
            environment,
            policy: engine.policy(),
        }
    }
}
