//! Configuration repository.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::models::Config;

/// Repository for configuration operations.
pub struct ConfigRepo;

impl ConfigRepo {
    /// Get a configuration value.
    ///
    /// A value whose stored text is not valid JSON reads as `Null`.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<Config>> {
        let config = conn
            .query_row(
                "SELECT key, value FROM config WHERE key = ?1",
                [key],
                Self::from_row,
            )
            .optional()?;

        Ok(config)
    }

    /// Set a configuration value (insert or update).
    pub fn set(conn: &Connection, key: &str, value: &Value) -> Result<()> {
        let value_json = serde_json::to_string(value)?;

        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value_json],
        )?;

        Ok(())
    }

    /// Delete a configuration value. Returns false if it did not exist.
    pub fn delete(conn: &Connection, key: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM config WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }

    /// Get all configuration values, ordered by key.
    pub fn get_all(conn: &Connection) -> Result<Vec<Config>> {
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
        let configs = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(configs)
    }

    /// Get a typed configuration value, or `default` when absent or undecodable.
    pub fn get_or_default<T: serde::de::DeserializeOwned>(
        conn: &Connection,
        key: &str,
        default: T,
    ) -> Result<T> {
        match Self::get(conn, key)? {
            Some(config) => Ok(serde_json::from_value(config.value).unwrap_or(default)),
            None => Ok(default),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Config> {
        let key: String = row.get(0)?;
        let value_str: String = row.get(1)?;
        let value = serde_json::from_str(&value_str).unwrap_or_else(|e| {
            warn!("Stored config {} is not valid JSON: {}", key, e);
            Value::Null
        });
        Ok(Config { key, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;
    use serde_json::json;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn set_and_get() {
        let conn = setup_db();

        ConfigRepo::set(&conn, "ProxyEnvSync.syncEnabled", &json!(true)).unwrap();
        let config = ConfigRepo::get(&conn, "ProxyEnvSync.syncEnabled")
            .unwrap()
            .unwrap();

        assert_eq!(config.key, "ProxyEnvSync.syncEnabled");
        assert_eq!(config.value, json!(true));
    }

    #[test]
    fn update_existing() {
        let conn = setup_db();

        ConfigRepo::set(&conn, "interval", &json!(20000)).unwrap();
        ConfigRepo::set(&conn, "interval", &json!(5000)).unwrap();

        let config = ConfigRepo::get(&conn, "interval").unwrap().unwrap();
        assert_eq!(config.value, json!(5000));
        assert_eq!(ConfigRepo::get_all(&conn).unwrap().len(), 1);
    }

    #[test]
    fn get_nonexistent() {
        let conn = setup_db();
        assert!(ConfigRepo::get(&conn, "nonexistent").unwrap().is_none());
    }

    #[test]
    fn delete() {
        let conn = setup_db();

        ConfigRepo::set(&conn, "to_delete", &json!("value")).unwrap();
        assert!(ConfigRepo::delete(&conn, "to_delete").unwrap());
        assert!(!ConfigRepo::delete(&conn, "to_delete").unwrap());
        assert!(ConfigRepo::get(&conn, "to_delete").unwrap().is_none());
    }

    #[test]
    fn get_all_is_sorted() {
        let conn = setup_db();

        ConfigRepo::set(&conn, "b", &json!(2)).unwrap();
        ConfigRepo::set(&conn, "a", &json!(1)).unwrap();

        let keys: Vec<String> = ConfigRepo::get_all(&conn)
            .unwrap()
            .into_iter()
            .map(|c| c.key)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn get_or_default() {
        let conn = setup_db();

        let value: u64 = ConfigRepo::get_or_default(&conn, "missing", 20000).unwrap();
        assert_eq!(value, 20000);

        ConfigRepo::set(&conn, "wrong_type", &json!("fast")).unwrap();
        let value: u64 = ConfigRepo::get_or_default(&conn, "wrong_type", 20000).unwrap();
        assert_eq!(value, 20000);
    }

    #[test]
    fn corrupt_json_reads_as_null() {
        let conn = setup_db();
        conn.execute(
            "INSERT INTO config (key, value) VALUES ('broken', '{not json')",
            [],
        )
        .unwrap();

        let config = ConfigRepo::get(&conn, "broken").unwrap().unwrap();
        assert_eq!(config.value, Value::Null);
    }
}
