//! # Stage: Spec cache store
//!
//! ## Responsibility
//! Key-value store from a normalized-proposal hash to the serialized
//! specification parsed for it, with per-entry time-to-live.
//!
//! Two backends share the [`SpecStore`] trait:
//! - [`MemorySpecStore`]: `RwLock<HashMap>`; concurrent readers, atomic puts
//! - [`SqliteSpecStore`]: write-through to a SQLite file so warm cache entries
//!   survive across CLI invocations
//!
//! ## Guarantees
//! - Expired entries are never returned
//! - `put` replaces an existing key in a single statement / single lock scope
//! - Non-panicking: lock poisoning surfaces as `PipelineError::Store`

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{PipelineError, PipelineResult};

/// Abstraction over the cache collaborator. Injected into the parser as a
/// handle rather than held as a process-wide singleton.
pub trait SpecStore: Send + Sync {
    fn get(&self, key: &str) -> PipelineResult<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8], ttl: Duration) -> PipelineResult<()>;
}

// ---------------------------------------------------------------------------
// MemorySpecStore
// ---------------------------------------------------------------------------

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process TTL store.
#[derive(Default)]
pub struct MemorySpecStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemorySpecStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including any not yet evicted after expiry.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SpecStore for MemorySpecStore {
    fn get(&self, key: &str) -> PipelineResult<Option<Vec<u8>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| PipelineError::Store("spec cache lock poisoned".into()))?;
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    fn put(&self, key: &str, value: &[u8], ttl: Duration) -> PipelineResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| PipelineError::Store("spec cache lock poisoned".into()))?;
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            key.to_string(),
            MemoryEntry { value: value.to_vec(), expires_at: now + ttl },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SqliteSpecStore
// ---------------------------------------------------------------------------

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS spec_cache (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    expires_at_ms INTEGER NOT NULL
)";

/// SQLite-backed TTL store.
pub struct SqliteSpecStore {
    conn: Mutex<Connection>,
}

impl SqliteSpecStore {
    pub fn open(path: &Path) -> PipelineResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> PipelineResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> PipelineResult<Self> {
        conn.execute(SCHEMA, [])?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Delete expired rows; returns how many were removed.
    pub fn purge_expired(&self) -> PipelineResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM spec_cache WHERE expires_at_ms <= ?1", params![now_ms()])?)
    }

    fn lock(&self) -> PipelineResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Store("sqlite connection lock poisoned".into()))
    }
}

impl SpecStore for SqliteSpecStore {
    fn get(&self, key: &str) -> PipelineResult<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM spec_cache WHERE key = ?1 AND expires_at_ms > ?2",
                params![key, now_ms()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &[u8], ttl: Duration) -> PipelineResult<()> {
        let expires = now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO spec_cache (key, value, expires_at_ms) VALUES (?1, ?2, ?3)",
            params![key, value, expires],
        )?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
