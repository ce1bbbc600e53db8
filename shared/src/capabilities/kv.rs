//! Durable key-value seam, with in-memory and SQLite backends.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        let invalid = |reason: &str| KvError::InvalidKey {
            key: key.chars().take(50).collect(),
            reason: reason.to_string(),
        };

        if key.trim().is_empty() {
            return Err(invalid("key cannot be empty"));
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(invalid("key exceeds maximum length"));
        }
        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(invalid("key cannot look like a path"));
        }
        if key.chars().any(char::is_control) {
            return Err(invalid("key contains control characters"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Outbox,
    Cache,
    Settings,
    Quarantine,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Outbox => "outbox",
            KeyNamespace::Cache => "cache",
            KeyNamespace::Settings => "settings",
            KeyNamespace::Quarantine => "quarantine",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, KvError> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LENGTH {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: format!("custom namespace must be 1..={MAX_PREFIX_LENGTH} bytes"),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("lock poisoned")]
    LockPoisoned,
}

/// Blob storage that survives process restarts.
///
/// Calls are synchronous: `enqueue` must not return before the queue is on
/// disk, and every backend here completes a write in-line.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError>;
    fn delete(&self, key: &KvKey) -> Result<(), KvError>;
}

fn check_value(value: &[u8]) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Process-local store. Contents survive a `SyncEngine` being dropped and
/// reopened against the same `Arc`, which is what restarts look like in tests
/// and in hosts that keep their own persistence.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>, KvError> {
        self.entries.lock().map_err(|_| KvError::LockPoisoned)
    }

    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableStore for MemoryKv {
    fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.entries()?.get(&key.raw()).cloned())
    }

    fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
        check_value(value)?;
        self.entries()?.insert(key.raw(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &KvKey) -> Result<(), KvError> {
        self.entries()?.remove(&key.raw());
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKv;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::{check_value, DurableStore, KvError, KvKey};
    use crate::model::UnixTimeMs;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;
    use std::sync::{Mutex, MutexGuard};

    const SCHEMA: &str = "
        CREATE TABLE IF NOT EXISTS kv (
            key        TEXT PRIMARY KEY NOT NULL,
            value      BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        );
    ";

    impl From<rusqlite::Error> for KvError {
        fn from(e: rusqlite::Error) -> Self {
            KvError::Storage(e.to_string())
        }
    }

    /// SQLite-backed store for mobile and desktop hosts.
    #[derive(Debug)]
    pub struct SqliteKv {
        conn: Mutex<Connection>,
    }

    impl SqliteKv {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
            let conn = Connection::open(path)?;
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            Self::init(Connection::open_in_memory()?)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(SCHEMA)?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn conn(&self) -> Result<MutexGuard<'_, Connection>, KvError> {
            self.conn.lock().map_err(|_| KvError::LockPoisoned)
        }
    }

    impl DurableStore for SqliteKv {
        fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
            let conn = self.conn()?;
            let value = conn
                .query_row(
                    "SELECT value FROM kv WHERE key = ?1",
                    params![key.raw()],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(value)
        }

        fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
            check_value(value)?;
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key.raw(), value, UnixTimeMs::now().0 as i64],
            )?;
            Ok(())
        }

        fn delete(&self, key: &KvKey) -> Result<(), KvError> {
            let conn = self.conn()?;
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key.raw()])?;
            Ok(())
        }
    }
}
