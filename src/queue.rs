//! Durable FIFO queue on a libSQL file.
//!
//! Entries are JSON payloads ordered by an autoincrement sequence. Appends are
//! committed before they return, so nothing is lost between a push and the
//! pop or drain that consumes it.

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SqliteTarget;
use crate::error::DatabaseError;
use crate::store::libsql_backend::{connect, format_datetime};
use crate::store::migrations::{self, QUEUE_MIGRATIONS};

pub struct DurableQueue {
    #[allow(dead_code)]
    db: libsql::Database,
    conn: Mutex<Connection>,
}

impl DurableQueue {
    /// Open (or create) the queue file at `path`.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        let queue = Self::open_target(&SqliteTarget::file(path)).await?;
        info!(path = %path.display(), "Notification queue opened");
        Ok(queue)
    }

    /// In-memory queue (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        Self::open_target(&SqliteTarget::Memory).await
    }

    async fn open_target(target: &SqliteTarget) -> Result<Self, DatabaseError> {
        let (db, conn) = connect(target).await?;
        migrations::run_migrations(&conn, QUEUE_MIGRATIONS).await?;
        Ok(Self {
            db,
            conn: Mutex::new(conn),
        })
    }

    /// Append one entry.
    pub async fn push<T: Serialize>(&self, item: &T) -> Result<(), DatabaseError> {
        self.push_all(std::slice::from_ref(item)).await
    }

    /// Append entries in order, all or nothing.
    pub async fn push_all<T: Serialize>(&self, items: &[T]) -> Result<(), DatabaseError> {
        if items.is_empty() {
            return Ok(());
        }
        let payloads = items
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DatabaseError::Serialization(format!("queue payload: {e}")))?;
        let enqueued_at = format_datetime(Utc::now());

        let conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_push begin: {e}")))?;
        for payload in payloads {
            tx.execute(
                "INSERT INTO queue_entries (payload, enqueued_at) VALUES (?1, ?2)",
                params![payload, enqueued_at.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_push: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_push commit: {e}")))?;
        debug!(count = items.len(), "Queued entries");
        Ok(())
    }

    /// Remove and return the oldest entry.
    pub async fn pop_front<T: DeserializeOwned>(&self) -> Result<Option<T>, DatabaseError> {
        let conn = self.conn.lock().await;
        loop {
            let tx = conn
                .transaction()
                .await
                .map_err(|e| DatabaseError::Query(format!("queue_pop begin: {e}")))?;
            let mut rows = tx
                .query(
                    "SELECT seq, payload FROM queue_entries ORDER BY seq ASC LIMIT 1",
                    (),
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("queue_pop: {e}")))?;
            let Some(row) = rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("queue_pop row: {e}")))?
            else {
                return Ok(None);
            };
            let (seq, payload) = read_entry(&row)?;
            drop(rows);

            tx.execute("DELETE FROM queue_entries WHERE seq = ?1", params![seq])
                .await
                .map_err(|e| DatabaseError::Query(format!("queue_pop delete: {e}")))?;
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("queue_pop commit: {e}")))?;

            match serde_json::from_str(&payload) {
                Ok(item) => return Ok(Some(item)),
                Err(e) => warn!(seq, error = %e, "Dropping undecodable queue entry"),
            }
        }
    }

    /// Remove and return every entry present now, oldest first.
    pub async fn drain<T: DeserializeOwned>(&self) -> Result<Vec<T>, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_drain begin: {e}")))?;

        let mut rows = tx
            .query("SELECT seq, payload FROM queue_entries ORDER BY seq ASC", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_drain: {e}")))?;
        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_drain row: {e}")))?
        {
            entries.push(read_entry(&row)?);
        }
        drop(rows);

        let Some(&(last_seq, _)) = entries.last() else {
            return Ok(Vec::new());
        };
        tx.execute(
            "DELETE FROM queue_entries WHERE seq <= ?1",
            params![last_seq],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("queue_drain delete: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_drain commit: {e}")))?;

        let items = entries
            .into_iter()
            .filter_map(|(seq, payload)| match serde_json::from_str(&payload) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(seq, error = %e, "Dropping undecodable queue entry");
                    None
                }
            })
            .collect::<Vec<T>>();
        debug!(count = items.len(), "Drained queue");
        Ok(items)
    }

    pub async fn len(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM queue_entries", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_len: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_len row: {e}")))?;
        Ok(row.and_then(|r| r.get::<i64>(0).ok()).unwrap_or(0) as usize)
    }

    pub async fn is_empty(&self) -> Result<bool, DatabaseError> {
        Ok(self.len().await? == 0)
    }
}

fn read_entry(row: &libsql::Row) -> Result<(i64, String), DatabaseError> {
    let seq: i64 = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("queue_entry.seq: {e}")))?;
    let payload: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("queue_entry.payload: {e}")))?;
    Ok((seq, payload))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        n: u32,
    }

    #[tokio::test]
    async fn drain_returns_fifo_and_empties() {
        let queue = DurableQueue::new_memory().await.unwrap();
        for n in 0..3 {
            queue.push(&Entry { n }).await.unwrap();
        }
        assert_eq!(queue.len().await.unwrap(), 3);

        let drained: Vec<Entry> = queue.drain().await.unwrap();
        assert_eq!(drained, vec![Entry { n: 0 }, Entry { n: 1 }, Entry { n: 2 }]);
        assert!(queue.is_empty().await.unwrap());

        let again: Vec<Entry> = queue.drain().await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn pop_front_takes_oldest() {
        let queue = DurableQueue::new_memory().await.unwrap();
        queue
            .push_all(&[Entry { n: 7 }, Entry { n: 8 }])
            .await
            .unwrap();

        let first: Option<Entry> = queue.pop_front().await.unwrap();
        assert_eq!(first, Some(Entry { n: 7 }));
        assert_eq!(queue.len().await.unwrap(), 1);

        let second: Option<Entry> = queue.pop_front().await.unwrap();
        assert_eq!(second, Some(Entry { n: 8 }));
        let none: Option<Entry> = queue.pop_front().await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn undecodable_entries_are_skipped() {
        let queue = DurableQueue::new_memory().await.unwrap();
        queue.push(&"not an entry").await.unwrap();
        queue.push(&Entry { n: 1 }).await.unwrap();

        let drained: Vec<Entry> = queue.drain().await.unwrap();
        assert_eq!(drained, vec![Entry { n: 1 }]);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifications/queue.db");
        {
            let queue = DurableQueue::open(&path).await.unwrap();
            queue.push(&Entry { n: 1 }).await.unwrap();
            queue.push(&Entry { n: 2 }).await.unwrap();
        }

        let queue = DurableQueue::open(&path).await.unwrap();
        let drained: Vec<Entry> = queue.drain().await.unwrap();
        assert_eq!(drained, vec![Entry { n: 1 }, Entry { n: 2 }]);
    }
}
