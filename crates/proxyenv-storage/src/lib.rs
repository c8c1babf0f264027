//! ProxyEnvSync Storage - SQLite settings store.
//!
//! Persists the sync policy as JSON values in a key/value `config` table and
//! implements [`proxyenv_core::SettingsStore`] on top of it.
//!
//! # Example
//!
//! ```no_run
//! use proxyenv_storage::Database;
//! use serde_json::json;
//!
//! let db = Database::in_memory().unwrap();
//! db.set_config("ProxyEnvSync.syncEnabled", &json!(true)).unwrap();
//! ```

mod database;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
mod schema;

pub use database::Database;
pub use error::{Result, StorageError};
pub use models::Config;
pub use pool::ConnectionPool;
pub use repository::ConfigRepo;
pub use schema::SCHEMA_VERSION;
