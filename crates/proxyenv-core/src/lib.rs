//! ProxyEnvSync Core - system proxy detection and shell environment sync.
//!
//! This crate keeps a user's persisted proxy environment in step with the
//! operating system's proxy settings. It handles:
//!
//! - Reading the OS proxy (Windows registry, macOS `networksetup`, GNOME settings)
//! - Editing a fenced `export` block in the shell-startup file
//! - The Windows per-user environment store
//! - The sync policy and its settings-store contract
//! - A polling engine with change detection and observer fan-out
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use proxyenv_core::{MemorySettingsStore, ProxySyncEngine};
//!
//! # async fn demo() -> proxyenv_core::Result<()> {
//! let engine = ProxySyncEngine::for_current_platform(Arc::new(MemorySettingsStore::new()))?;
//! engine.subscribe(|event| println!("proxy: {}", event.system_proxy));
//! engine.set_sync_enabled(true).await?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod engine;
pub mod env_store;
pub mod error;
pub mod fence;
pub mod model;
pub mod notifications;
pub mod platform;
pub mod reader;
pub mod settings;
pub mod shell_config;

pub use command::{CommandRunner, SystemCommandRunner, DEFAULT_COMMAND_TIMEOUT};
pub use engine::{Observer, ObserverId, ProxySyncEngine};
pub use env_store::UserEnvironment;
pub use error::{CommandError, ProxyEnvError, Result};
pub use model::{EnvironmentProxyState, ProxyChangeEvent, ProxySettings, ProxyVar};
pub use notifications::{change_message, DesktopNotifier, NotificationResult, Notifier, NullNotifier};
pub use platform::Platform;
pub use reader::{ProxySource, SystemProxyReader};
pub use settings::{
    MemorySettingsStore, SettingKey, SettingsStore, SyncPolicy, DEFAULT_CHECK_INTERVAL,
    MIN_CHECK_INTERVAL,
};
pub use shell_config::{EnvironmentTarget, ProxyEnvironment, ShellProfile};
