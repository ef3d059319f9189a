use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::io_struct::{HistoryEntry, Role};

/// Append-only sink for completed chat exchanges.
#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    async fn append(&self, role: Role, content: &str) -> Result<()>;

    /// The `limit` most recent entries, oldest first.
    async fn list(&self, limit: usize) -> Result<Vec<HistoryEntry>>;
}

pub type SharedHistoryStore = Arc<dyn HistoryStore>;

/// In-process history, used when no database is configured.
#[derive(Default, Clone)]
pub struct MemoryHistoryStore {
    inner: Arc<RwLock<Vec<HistoryEntry>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, role: Role, content: &str) -> Result<()> {
        self.inner.write().push(HistoryEntry {
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let entries = self.inner.read();
        let start = entries.len().saturating_sub(limit);
        Ok(entries[start..].to_vec())
    }
}

/// Accepts writes and forgets them.
#[derive(Default, Debug, Clone)]
pub struct NoOpHistoryStore;

impl NoOpHistoryStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HistoryStore for NoOpHistoryStore {
    async fn append(&self, _role: Role, _content: &str) -> Result<()> {
        Ok(())
    }

    async fn list(&self, _limit: usize) -> Result<Vec<HistoryEntry>> {
        Ok(Vec::new())
    }
}

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS chat_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
)";

/// SQLite-backed history. Statements run on the blocking pool.
#[derive(Clone)]
pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLE)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || op(&conn.lock()))
            .await
            .map_err(|e| RelayError::Persistence(e.to_string()))?
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, role: Role, content: &str) -> Result<()> {
        let content = content.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chat_history (role, content, created_at) VALUES (?1, ?2, ?3)",
                params![role.as_str(), content, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn list(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT role, content, created_at FROM chat_history ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (role, content, created_at) = row?;
                entries.push(HistoryEntry {
                    role: Role::from(role),
                    content,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map_err(|e| RelayError::Persistence(e.to_string()))?
                        .with_timezone(&Utc),
                });
            }
            entries.reverse();
            Ok(entries)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fill(store: &dyn HistoryStore) {
        for i in 0..5 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store.append(role, &format!("turn {}", i)).await.unwrap();
        }
    }

    fn contents(entries: &[HistoryEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.content.as_str()).collect()
    }

    #[tokio::test]
    async fn memory_store_lists_most_recent_last() {
        let store = MemoryHistoryStore::new();
        fill(&store).await;
        let entries = store.list(3).await.unwrap();
        assert_eq!(contents(&entries), vec!["turn 2", "turn 3", "turn 4"]);
        assert_eq!(entries[1].role, Role::Assistant);
        assert_eq!(store.list(100).await.unwrap().len(), 5);
        assert!(store.list(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn noop_store_forgets() {
        let store = NoOpHistoryStore::new();
        fill(&store).await;
        assert!(store.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sqlite_store_lists_most_recent_last() {
        let store = SqliteHistoryStore::in_memory().unwrap();
        fill(&store).await;
        let entries = store.list(2).await.unwrap();
        assert_eq!(contents(&entries), vec!["turn 3", "turn 4"]);
        assert_eq!(entries[1].role, Role::User);
        assert!(entries[0].created_at <= entries[1].created_at);
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let store = SqliteHistoryStore::open(&path).unwrap();
            store.append(Role::User, "hi").await.unwrap();
            store.append(Role::Assistant, "hello 喵").await.unwrap();
        }
        let store = SqliteHistoryStore::open(&path).unwrap();
        let entries = store.list(10).await.unwrap();
        assert_eq!(contents(&entries), vec!["hi", "hello 喵"]);
    }

    #[tokio::test]
    async fn sqlite_store_keeps_unknown_roles() {
        let store = SqliteHistoryStore::in_memory().unwrap();
        store.append(Role::from("tool"), "lookup").await.unwrap();
        let entries = store.list(10).await.unwrap();
        assert_eq!(entries[0].role, Role::Other("tool".to_string()));
    }

    #[tokio::test]
    async fn sqlite_store_reports_corrupt_rows() {
        let store = SqliteHistoryStore::in_memory().unwrap();
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO chat_history (role, content, created_at) VALUES ('user', 'x', 'now')",
                [],
            )
            .unwrap();
        let err = store.list(10).await.unwrap_err();
        assert!(matches!(err, RelayError::Persistence(_)));
    }
}
