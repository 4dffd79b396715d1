//! Transactional state store backed by `SQLite`.
//!
//! Holds the ingestion cursors, per-actor sessions, domain cache rows and the
//! append-only transaction log. Every mutation goes through
//! [`StateStore::with_transaction`] (or its async wrapper
//! [`StateStore::transact`]): the closure's writes are committed when it
//! returns `Ok` and rolled back on any other exit, including a panic.
//!
//! # Schema
//!
//! - `cursors(stream, value)`
//! - `sessions(actor_id, first_seen_ms, last_active_ms, interaction_count)`
//! - `cache(namespace, key, value_json, updated_at_ms)`
//! - `transaction_log(id, at_ms, actor_id, action, detail_json)`

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    domain::{ActorId, Cursor},
    errors::Error,
    Result,
};

const SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-actor interaction record. Created on first contact, never deleted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub actor: ActorId,
    pub first_seen: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub interaction_count: u64,
}

/// A cached domain value with the time it was written.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub updated_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let age = now.signed_duration_since(self.updated_at);
        age.to_std().map(|a| a < ttl).unwrap_or(true)
    }
}

/// Entry to append to the transaction log.
#[derive(Clone, Debug)]
pub struct NewLogEntry {
    pub actor: Option<ActorId>,
    pub action: String,
    pub detail: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub id: i64,
    pub at: DateTime<Utc>,
    pub actor: Option<ActorId>,
    pub action: String,
    pub detail: serde_json::Value,
}

/// Shared handle to the state database.
///
/// Cloning is cheap; all clones share one connection. After [`close`] every
/// operation fails with [`Error::StoreClosed`].
///
/// [`close`]: StateStore::close
#[derive(Clone, Debug)]
pub struct StateStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        initialize_schema(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Run `f` inside one transaction: commit on `Ok`, roll back otherwise.
    ///
    /// Blocking; from async code prefer [`StateStore::transact`].
    pub fn with_transaction<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        // A panic inside `f` poisons the mutex after the transaction has been
        // rolled back by its drop, so the connection itself is still usable.
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_mut().ok_or(Error::StoreClosed)?;

        let stx = StoreTx {
            tx: conn.transaction()?,
        };
        let out = f(&stx)?;
        stx.tx.commit()?;
        Ok(out)
    }

    /// Async wrapper around [`StateStore::with_transaction`] that runs on the
    /// blocking pool.
    pub async fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_transaction(f))
            .await
            .map_err(|e| Error::Store(format!("transaction task failed: {e}")))?
    }

    /// Close the underlying connection. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| Error::from(e))?;
            tracing::info!("state store closed");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Transactional view handed to [`StateStore::with_transaction`] closures.
pub struct StoreTx<'a> {
    tx: Transaction<'a>,
}

impl StoreTx<'_> {
    // ============== Sessions ==============

    /// Upsert the actor's session: bump the counter and last-active time.
    pub fn touch_session(&self, actor: ActorId, now: DateTime<Utc>) -> Result<SessionRecord> {
        let now_ms = now.timestamp_millis();
        self.tx.execute(
            "INSERT INTO sessions (actor_id, first_seen_ms, last_active_ms, interaction_count)
             VALUES (?1, ?2, ?2, 1)
             ON CONFLICT(actor_id) DO UPDATE SET
                last_active_ms = MAX(sessions.last_active_ms, excluded.last_active_ms),
                interaction_count = sessions.interaction_count + 1",
            params![actor.0, now_ms],
        )?;
        self.session(actor)?
            .ok_or_else(|| Error::Store(format!("session {} vanished after upsert", actor.0)))
    }

    pub fn session(&self, actor: ActorId) -> Result<Option<SessionRecord>> {
        let row = self
            .tx
            .query_row(
                "SELECT first_seen_ms, last_active_ms, interaction_count
                 FROM sessions WHERE actor_id = ?1",
                params![actor.0],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((first_ms, last_ms, count)) = row else {
            return Ok(None);
        };
        Ok(Some(SessionRecord {
            actor,
            first_seen: from_millis(first_ms)?,
            last_active: from_millis(last_ms)?,
            interaction_count: count.max(0) as u64,
        }))
    }

    pub fn session_count(&self) -> Result<u64> {
        let n: i64 = self
            .tx
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    // ============== Cursors ==============

    pub fn cursor(&self, stream: &str) -> Result<Option<Cursor>> {
        let v: Option<i64> = self
            .tx
            .query_row(
                "SELECT value FROM cursors WHERE stream = ?1",
                params![stream],
                |row| row.get(0),
            )
            .optional()?;
        Ok(v.map(Cursor))
    }

    /// Store a new cursor value. Moving backwards is rejected.
    pub fn set_cursor(&self, stream: &str, cursor: Cursor) -> Result<()> {
        if let Some(current) = self.cursor(stream)? {
            if cursor < current {
                return Err(Error::CursorRegression {
                    stream: stream.to_string(),
                    current: current.0,
                    requested: cursor.0,
                });
            }
        }
        self.tx.execute(
            "INSERT INTO cursors (stream, value) VALUES (?1, ?2)
             ON CONFLICT(stream) DO UPDATE SET value = excluded.value",
            params![stream, cursor.0],
        )?;
        Ok(())
    }

    // ============== Domain cache ==============

    pub fn cache_get<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<CacheEntry<T>>> {
        let row = self
            .tx
            .query_row(
                "SELECT value_json, updated_at_ms FROM cache WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        let Some((json, updated_ms)) = row else {
            return Ok(None);
        };
        Ok(Some(CacheEntry {
            value: serde_json::from_str(&json)?,
            updated_at: from_millis(updated_ms)?,
        }))
    }

    pub fn cache_put<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.tx.execute(
            "INSERT INTO cache (namespace, key, value_json, updated_at_ms) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key) DO UPDATE SET
                value_json = excluded.value_json,
                updated_at_ms = excluded.updated_at_ms",
            params![namespace, key, json, now.timestamp_millis()],
        )?;
        Ok(())
    }

    // ============== Transaction log ==============

    /// Append a log entry; returns its id. Entries are never edited.
    pub fn append_log(&self, entry: &NewLogEntry, now: DateTime<Utc>) -> Result<i64> {
        let detail = serde_json::to_string(&entry.detail)?;
        self.tx.execute(
            "INSERT INTO transaction_log (at_ms, actor_id, action, detail_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                now.timestamp_millis(),
                entry.actor.map(|a| a.0),
                entry.action,
                detail
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn log_entries(&self, actor: ActorId) -> Result<Vec<LogRecord>> {
        let mut stmt = self.tx.prepare(
            "SELECT id, at_ms, actor_id, action, detail_json
             FROM transaction_log WHERE actor_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![actor.0], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, at_ms, actor_id, action, detail) = row?;
            out.push(LogRecord {
                id,
                at: from_millis(at_ms)?,
                actor: actor_id.map(ActorId),
                action,
                detail: serde_json::from_str(&detail)?,
            });
        }
        Ok(out)
    }
}

type StagedWrite = Box<dyn FnOnce(&StoreTx<'_>) -> Result<()> + Send>;

/// Domain writes staged while an update is processed.
///
/// The ingestion loop applies them in the same transaction that touches the
/// actor's session and advances the cursor, so either all of them land or
/// none do. Writes run in the order they were pushed.
#[derive(Default)]
pub struct WriteSet {
    writes: Vec<StagedWrite>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: impl FnOnce(&StoreTx<'_>) -> Result<()> + Send + 'static) {
        self.writes.push(Box::new(write));
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Run every staged write inside `tx`; stops at the first error.
    pub fn apply(self, tx: &StoreTx<'_>) -> Result<()> {
        for write in self.writes {
            write(tx)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for WriteSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSet")
            .field("staged", &self.writes.len())
            .finish()
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Store(format!("timestamp out of range: {ms}")))
}

fn initialize_schema(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", [], |row| row.get(0))
        .optional()?;

    match version {
        None => {
            tx.execute(
                "INSERT INTO store_meta (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS cursors (
                    stream TEXT PRIMARY KEY,
                    value INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS sessions (
                    actor_id INTEGER PRIMARY KEY,
                    first_seen_ms INTEGER NOT NULL,
                    last_active_ms INTEGER NOT NULL,
                    interaction_count INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS cache (
                    namespace TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value_json TEXT NOT NULL,
                    updated_at_ms INTEGER NOT NULL,
                    PRIMARY KEY (namespace, key)
                );
                CREATE TABLE IF NOT EXISTS transaction_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    at_ms INTEGER NOT NULL,
                    actor_id INTEGER,
                    action TEXT NOT NULL,
                    detail_json TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_transaction_log_actor
                    ON transaction_log (actor_id, id);",
            )?;
        }
        Some(SCHEMA_VERSION) => {}
        Some(other) => {
            return Err(Error::Store(format!(
                "unsupported schema version {other} (expected {SCHEMA_VERSION})"
            )));
        }
    }

    tx.commit()?;
    Ok(())
}
