//! SQLite-backed store -- durable baselines for single-host deployments.
//!
//! Keys live in `baseline_kv`; `expires_at` is unix milliseconds, `NULL` for
//! no expiry. Expired rows read as absent and are removed by
//! [`BaselineStore::purge_expired`].
//!
//! Every call is bounded by the store's I/O timeout. A call that runs out of
//! time is interrupted and its transaction rolled back before the error is
//! returned, so a failed write never lands later.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, InterruptHandle, OptionalExtension};

use super::{schema, BaselineStore, StoreError};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
    io_timeout: Duration,
}

/// Cancellation shared between an async caller and its blocking worker.
#[derive(Default)]
struct Cancel {
    state: Mutex<CancelState>,
}

#[derive(Default)]
struct CancelState {
    tripped: bool,
    handle: Option<InterruptHandle>,
}

impl Cancel {
    fn state(&self) -> std::sync::MutexGuard<'_, CancelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the worker's connection. Fails if the caller already gave up.
    fn arm(&self, conn: &Connection) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.tripped {
            return Err(StoreError::Unavailable("sqlite call cancelled".into()));
        }
        state.handle = Some(conn.get_interrupt_handle());
        Ok(())
    }

    /// Forget the connection before it goes back to the pool.
    fn disarm(&self) {
        self.state().handle = None;
    }

    /// Called by the worker right before committing.
    fn check(&self) -> Result<(), StoreError> {
        if self.state().tripped {
            return Err(StoreError::Unavailable("sqlite call cancelled".into()));
        }
        Ok(())
    }

    fn trip(&self) {
        let mut state = self.state();
        state.tripped = true;
        if let Some(handle) = &state.handle {
            handle.interrupt();
        }
    }

    fn is_tripped(&self) -> bool {
        self.state().tripped
    }
}

impl SqliteStore {
    /// Open (or create) the database file and run migrations.
    ///
    /// `io_timeout` bounds each call, lock waits included.
    pub fn open(path: &Path, io_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(move |c| {
            c.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;",
            )?;
            c.busy_timeout(io_timeout)
        });

        let pool = R2D2Pool::builder()
            .connection_timeout(io_timeout.max(Duration::from_millis(1)))
            .build(manager)
            .with_context(|| format!("failed to open sqlite store at {}", path.display()))?;

        // Run migrations on a single connection
        let conn = pool.get()?;
        schema::migrate(&conn)?;
        tracing::debug!(
            path = %path.display(),
            version = schema::current_version(&conn)?,
            "sqlite schema ready"
        );

        Ok(Self { pool, io_timeout })
    }

    /// Run a closure on a pooled connection off the async executor.
    ///
    /// Past the I/O timeout the worker is interrupted and awaited, so the
    /// result reflects what actually happened in the database.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &Cancel) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        let cancel = Arc::new(Cancel::default());
        let worker = Arc::clone(&cancel);
        let mut task = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            worker.arm(&conn)?;
            let out = f(&conn, &worker);
            worker.disarm();
            out
        });

        let joined = match tokio::time::timeout(self.io_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                cancel.trip();
                task.await
            }
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) if cancel.is_tripped() => Err(StoreError::Timeout(self.io_timeout)),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(StoreError::Unavailable(format!("sqlite worker failed: {e}"))),
        }
    }

    /// Run a single write statement in a transaction that commits only if
    /// the caller is still waiting.
    async fn write<P>(&self, sql: &'static str, params: P) -> Result<usize, StoreError>
    where
        P: rusqlite::Params + Send + 'static,
    {
        self.with_conn(move |conn, cancel| {
            let tx = conn.unchecked_transaction()?;
            let changed = tx.execute(sql, params)?;
            cancel.check()?;
            tx.commit()?;
            Ok(changed)
        })
        .await
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait]
impl BaselineStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn, _| {
            let value: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT value FROM baseline_kv
                     WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key, now_ms()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.map(Bytes::from))
        })
        .await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(expiry_ms);
        self.write(
            "INSERT INTO baseline_kv (key, value, expires_at, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
            (key.to_string(), value.to_vec(), expires_at),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self
            .write(
                "DELETE FROM baseline_kv
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                (key.to_string(), now_ms()),
            )
            .await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let updated = self
            .write(
                "UPDATE baseline_kv SET expires_at = ?2, updated_at = datetime('now')
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?3)",
                (key.to_string(), expiry_ms(ttl), now_ms()),
            )
            .await?;
        Ok(updated > 0)
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let removed = self
            .write(
                "DELETE FROM baseline_kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                (now_ms(),),
            )
            .await?;
        if removed > 0 {
            tracing::debug!(removed, "purged expired baseline rows");
        }
        Ok(removed)
    }

    fn bounds_own_io(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteStore::open(&dir.path().join("baselines.db"), Duration::from_secs(1)).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_upsert_and_delete() {
        let (_dir, store) = open_temp();
        assert!(store.get("k").await.unwrap().is_none());

        store.set("k", Bytes::from_static(b"one"), None).await.unwrap();
        store.set("k", Bytes::from_static(b"two"), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap(), Bytes::from_static(b"two"));

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_rows_are_absent() {
        let (_dir, store) = open_temp();
        store
            .set("short", Bytes::from_static(b"x"), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        store.set("long", Bytes::from_static(b"y"), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("short").await.unwrap().is_none());
        assert!(!store.expire("short", Duration::from_secs(60)).await.unwrap());
        assert!(store.expire("long", Duration::from_secs(60)).await.unwrap());

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("baselines.db");
        {
            let store = SqliteStore::open(&path, Duration::from_secs(1)).unwrap();
            store.set("k", Bytes::from_static(b"kept"), None).await.unwrap();
        }
        let reopened = SqliteStore::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(reopened.get("k").await.unwrap().unwrap(), Bytes::from_static(b"kept"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_blocked_past_timeout_never_lands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baselines.db");
        let store = SqliteStore::open(&path, Duration::from_millis(100)).unwrap();

        // Another writer holds the database lock for longer than the timeout.
        let holder = Connection::open(&path).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();

        let err = store
            .set("k", Bytes::from_static(b"late"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Timeout(_) | StoreError::Sqlite(_) | StoreError::Unavailable(_)
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        holder.execute_batch("COMMIT").unwrap();

        assert!(store.get("k").await.unwrap().is_none());
        store.set("k", Bytes::from_static(b"now"), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap(), Bytes::from_static(b"now"));
    }
}
