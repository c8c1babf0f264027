//! High-level database interface.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use proxyenv_core::settings::SettingsStore;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::models::Config;
use crate::pool::ConnectionPool;
use crate::repository::ConfigRepo;

/// File name of the settings database.
const DB_FILE_NAME: &str = "settings.db";

/// High-level database interface for ProxyEnvSync.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Create a new database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Create a new database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening settings database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing and ephemeral runs).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Get the application data directory.
    pub fn data_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "proxyenv", "ProxyEnvSync")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().to_path_buf())
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join(DB_FILE_NAME))
    }

    /// Opens the database at `path`, or the default location when `None`.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::with_path(path),
            None => Self::new(),
        }
    }

    // === Config ===

    /// Get a configuration value.
    pub fn get_config(&self, key: &str) -> Result<Option<Config>> {
        let conn = self.pool.get();
        ConfigRepo::get(&conn, key)
    }

    /// Set a configuration value.
    pub fn set_config(&self, key: &str, value: &Value) -> Result<()> {
        let conn = self.pool.get();
        ConfigRepo::set(&conn, key, value)?;
        debug!("Stored config {} = {}", key, value);
        Ok(())
    }

    /// Delete a configuration value. Returns false if it did not exist.
    pub fn delete_config(&self, key: &str) -> Result<bool> {
        let conn = self.pool.get();
        ConfigRepo::delete(&conn, key)
    }

    /// Get all configuration values.
    pub fn get_all_config(&self) -> Result<Vec<Config>> {
        let conn = self.pool.get();
        ConfigRepo::get_all(&conn)
    }

    /// Get a typed configuration value with default.
    pub fn get_config_or_default<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T> {
        let conn = self.pool.get();
        ConfigRepo::get_or_default(&conn, key, default)
    }
}

impl SettingsStore for Database {
    fn get(&self, key: &str) -> proxyenv_core::Result<Option<Value>> {
        Ok(self.get_config(key)?.map(|config| config.value))
    }

    fn set(&self, key: &str, value: &Value) -> proxyenv_core::Result<()> {
        Ok(self.set_config(key, value)?)
    }
}
