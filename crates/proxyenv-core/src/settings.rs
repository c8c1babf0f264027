//! Sync policy and the settings store contract.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{ProxyEnvError, Result};

/// Smallest accepted poll interval.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1000);

/// Poll interval used when none is stored.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(20_000);

/// Persisted policy keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    /// Poll interval in milliseconds.
    CheckInterval,
    /// Whether detected proxies are written to the environment.
    SyncEnabled,
    /// Whether desktop notifications are shown on changes.
    NotificationEnabled,
}

impl SettingKey {
    /// Returns the storage key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckInterval => "ProxyEnvSync.checkInterval",
            Self::SyncEnabled => "ProxyEnvSync.syncEnabled",
            Self::NotificationEnabled => "ProxyEnvSync.notificationEnabled",
        }
    }

    /// Returns the value used when the key is absent.
    pub fn default_value(&self) -> Value {
        match self {
            Self::CheckInterval => json!(DEFAULT_CHECK_INTERVAL.as_millis() as u64),
            Self::SyncEnabled => json!(false),
            Self::NotificationEnabled => json!(false),
        }
    }
}

impl std::fmt::Display for SettingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronous key/value persistence for the sync policy.
pub trait SettingsStore: Send + Sync {
    /// Returns the stored value for `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &Value) -> Result<()>;
}

/// Reads `key` as `T`, falling back to its default when absent or undecodable.
pub fn get_or_default<T: DeserializeOwned>(store: &dyn SettingsStore, key: SettingKey) -> T
where
    T: Default,
{
    let fallback = || serde_json::from_value(key.default_value()).unwrap_or_default();

    match store.get(key.as_str()) {
        Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("Ignoring undecodable setting {}: {}", key, e);
            fallback()
        }),
        Ok(None) => fallback(),
        Err(e) => {
            warn!("Failed to read setting {}: {}", key, e);
            fallback()
        }
    }
}

/// Polling and sync behaviour of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// Time between polls.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Whether detected proxies are written to the environment.
    pub sync_enabled: bool,
    /// Whether desktop notifications are shown on changes.
    pub notification_enabled: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_CHECK_INTERVAL,
            sync_enabled: false,
            notification_enabled: false,
        }
    }
}

impl SyncPolicy {
    /// Loads the policy from `store`, using defaults for missing keys.
    ///
    /// A stored interval below the minimum is replaced by the default.
    pub fn load(store: &dyn SettingsStore) -> Self {
        let interval_ms: u64 = get_or_default(store, SettingKey::CheckInterval);
        let poll_interval = match validate_interval(Duration::from_millis(interval_ms)) {
            Ok(interval) => interval,
            Err(e) => {
                warn!("Stored interval rejected ({}), using default", e);
                DEFAULT_CHECK_INTERVAL
            }
        };

        Self {
            poll_interval,
            sync_enabled: get_or_default(store, SettingKey::SyncEnabled),
            notification_enabled: get_or_default(store, SettingKey::NotificationEnabled),
        }
    }
}

/// Checks that `interval` is at least [`MIN_CHECK_INTERVAL`].
pub fn validate_interval(interval: Duration) -> Result<Duration> {
    if interval < MIN_CHECK_INTERVAL {
        return Err(ProxyEnvError::InvalidInterval(interval.as_millis()));
    }
    Ok(interval)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// In-process settings store, for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: RwLock<HashMap<String, Value>>,
}

impl MemorySettingsStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.values.write().insert(key.to_string(), value.clone());
        Ok(())
    }
}
