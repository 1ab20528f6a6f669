use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use super::{decode_stored_response, encode_stored_response, Repository, StoreError, StoredResponse};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Embedded-SQL backend: one table, key → JSON payload blob.
///
/// A single connection is shared behind a mutex and every statement runs on
/// the blocking pool, keeping the async workers free while the busy timeout
/// absorbs writer contention. `:memory:` and `file:` URIs pass through to
/// SQLite unchanged.
#[derive(Debug)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    pub fn open(path: &str, busy_timeout: Duration) -> Result<Self, StoreError> {
        if path.is_empty() {
            return Err(StoreError::Config("sqlite path is required".to_string()));
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;

        let timeout = if busy_timeout.is_zero() {
            DEFAULT_BUSY_TIMEOUT
        } else {
            busy_timeout
        };
        conn.busy_timeout(timeout)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                payload BLOB NOT NULL
            )",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn get(&self, key: &str) -> Result<Option<StoredResponse>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let key = key.to_owned();
        let payload: Option<Vec<u8>> = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            conn.query_row(
                "SELECT payload FROM cache_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
        .await??;

        match payload {
            Some(bytes) => Ok(Some(decode_stored_response(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &StoredResponse,
        overwrite: bool,
    ) -> Result<(), StoreError> {
        let payload = encode_stored_response(value)?;
        let conn = Arc::clone(&self.conn);
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            if overwrite {
                conn.execute(
                    "INSERT INTO cache_entries (key, payload)
                     VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET payload = excluded.payload",
                    params![key, payload],
                )
            } else {
                conn.execute(
                    "INSERT OR IGNORE INTO cache_entries (key, payload)
                     VALUES (?1, ?2)",
                    params![key, payload],
                )
            }
        })
        .await??;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        // SQLite flushes on connection drop; the handle goes away with the
        // last Arc reference.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_is_rejected() {
        let err = SqliteRepository::open("", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }
}
