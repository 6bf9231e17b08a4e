//! Local record of fetched messages
//!
//! The fetchers append one [`IndexEntry`] per saved message and read the
//! newest entry back as the incremental-sync watermark. The default store is
//! a newline-delimited JSON file; a SQLite store is available with the
//! `cache` feature.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::Result;

/// Persisted-store read contract used to find the watermark
#[async_trait]
pub trait SyncPointSource: Send + Sync {
    /// ISO-8601 timestamp of the newest stored message, `None` when empty
    async fn query_latest_timestamp(&self) -> Result<Option<String>>;
}

/// Store the fetchers write saved messages into
#[async_trait]
pub trait MessageStore: SyncPointSource {
    async fn record(&self, entries: &[IndexEntry]) -> Result<()>;

    /// Ids already saved, used to skip re-downloads
    async fn known_ids(&self) -> Result<HashSet<String>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// When Gmail received the message
    pub received_at: Option<DateTime<Utc>>,
    pub path: PathBuf,
    pub saved_at: DateTime<Utc>,
}

/// Watermark as a Gmail `after:` date (`YYYY/MM/DD`).
///
/// Empty, unreachable and unparsable stores all yield `None`, which callers
/// treat as "no baseline".
pub async fn get_latest_sync_point(source: &dyn SyncPointSource) -> Option<String> {
    let timestamp = match source.query_latest_timestamp().await {
        Ok(Some(timestamp)) => timestamp,
        Ok(None) => {
            debug!("Local store is empty, no sync point");
            return None;
        }
        Err(e) => {
            warn!("Could not read latest timestamp from local store: {}", e);
            return None;
        }
    };

    match parse_timestamp(&timestamp) {
        Some(datetime) => Some(datetime.format("%Y/%m/%d").to_string()),
        None => {
            warn!("Unparsable timestamp '{}' in local store", timestamp);
            None
        }
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        return Some(datetime.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Newline-delimited JSON index file
#[derive(Debug, Clone)]
pub struct JsonIndexStore {
    path: PathBuf,
}

impl JsonIndexStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All readable entries; malformed lines are skipped
    pub async fn entries(&self) -> Result<Vec<IndexEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IndexEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping malformed index line {}: {}", number + 1, e),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl SyncPointSource for JsonIndexStore {
    async fn query_latest_timestamp(&self) -> Result<Option<String>> {
        let latest = self
            .entries()
            .await?
            .into_iter()
            .filter_map(|entry| entry.received_at)
            .max();
        Ok(latest.map(|timestamp| timestamp.to_rfc3339()))
    }
}

#[async_trait]
impl MessageStore for JsonIndexStore {
    async fn record(&self, entries: &[IndexEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut buffer = String::new();
        for entry in entries {
            buffer.push_str(&serde_json::to_string(entry)?);
            buffer.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;
        debug!("Recorded {} entries in {:?}", entries.len(), self.path);
        Ok(())
    }

    async fn known_ids(&self) -> Result<HashSet<String>> {
        Ok(self.entries().await?.into_iter().map(|entry| entry.id).collect())
    }
}

#[cfg(feature = "cache")]
pub use sqlite::SqliteMessageStore;

#[cfg(feature = "cache")]
mod sqlite {
    use super::*;
    use crate::error::GmailError;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::sync::{Arc, Mutex};

    /// SQLite-backed message store
    #[derive(Clone)]
    pub struct SqliteMessageStore {
        conn: Arc<Mutex<Connection>>,
    }

    fn db_error(e: rusqlite::Error) -> GmailError {
        GmailError::StateError(format!("SQLite error: {}", e))
    }

    impl SqliteMessageStore {
        pub fn open(path: &Path) -> Result<Self> {
            let conn = Connection::open(path).map_err(db_error)?;
            Self::init(conn)
        }

        pub fn in_memory() -> Result<Self> {
            let conn = Connection::open_in_memory().map_err(db_error)?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self> {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    thread_id TEXT,
                    received_at TEXT,
                    path TEXT NOT NULL,
                    saved_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_messages_received ON messages(received_at);",
            )
            .map_err(db_error)?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        async fn with_conn<T, F>(&self, f: F) -> Result<T>
        where
            T: Send + 'static,
            F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || {
                let mut guard = conn
                    .lock()
                    .map_err(|_| GmailError::StateError("SQLite connection poisoned".to_string()))?;
                f(&mut guard)
            })
            .await
            .map_err(|e| GmailError::StateError(format!("SQLite task failed: {}", e)))?
        }
    }

    #[async_trait]
    impl SyncPointSource for SqliteMessageStore {
        async fn query_latest_timestamp(&self) -> Result<Option<String>> {
            self.with_conn(|conn| {
                conn.query_row("SELECT MAX(received_at) FROM messages", [], |row| {
                    row.get::<_, Option<String>>(0)
                })
                .optional()
                .map(Option::flatten)
                .map_err(db_error)
            })
            .await
        }
    }

    #[async_trait]
    impl MessageStore for SqliteMessageStore {
        async fn record(&self, entries: &[IndexEntry]) -> Result<()> {
            let entries = entries.to_vec();
            self.with_conn(move |conn| {
                let tx = conn.transaction().map_err(db_error)?;
                for entry in &entries {
                    tx.execute(
                        "INSERT OR REPLACE INTO messages (id, thread_id, received_at, path, saved_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            entry.id,
                            entry.thread_id,
                            entry.received_at.map(|t| t.to_rfc3339()),
                            entry.path.to_string_lossy().to_string(),
                            entry.saved_at.to_rfc3339(),
                        ],
                    )
                    .map_err(db_error)?;
                }
                tx.commit().map_err(db_error)
            })
            .await
        }

        async fn known_ids(&self) -> Result<HashSet<String>> {
            self.with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM messages").map_err(db_error)?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(db_error)?
                    .collect::<std::result::Result<HashSet<_>, _>>()
                    .map_err(db_error)?;
                Ok(ids)
            })
            .await
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GmailError;
    use chrono::TimeZone;

    struct FixedSource(Result<Option<String>>);

    #[async_trait]
    impl SyncPointSource for FixedSource {
        async fn query_latest_timestamp(&self) -> Result<Option<String>> {
            match &self.0 {
                Ok(value) => Ok(value.clone()),
                Err(e) => Err(GmailError::StateError(e.to_string())),
            }
        }
    }

    fn entry(id: &str, received_at: Option<DateTime<Utc>>) -> IndexEntry {
        IndexEntry {
            id: id.to_string(),
            thread_id: None,
            received_at,
            path: PathBuf::from(format!("backup/{}.eml", id)),
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_sync_point_from_iso_timestamp() {
        let source = FixedSource(Ok(Some("2024-03-15T10:30:00Z".to_string())));
        assert_eq!(
            get_latest_sync_point(&source).await.as_deref(),
            Some("2024/03/15")
        );
    }

    #[tokio::test]
    async fn test_sync_point_converts_offsets_to_utc() {
        let source = FixedSource(Ok(Some("2024-03-15T23:30:00-05:00".to_string())));
        assert_eq!(
            get_latest_sync_point(&source).await.as_deref(),
            Some("2024/03/16")
        );
    }

    #[tokio::test]
    async fn test_sync_point_none_cases() {
        assert!(get_latest_sync_point(&FixedSource(Ok(None))).await.is_none());
        assert!(
            get_latest_sync_point(&FixedSource(Err(GmailError::StateError("down".into()))))
                .await
                .is_none()
        );
        assert!(
            get_latest_sync_point(&FixedSource(Ok(Some("yesterday".to_string()))))
                .await
                .is_none()
        );
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-03-15 10:30:00").is_some());
        assert!(parse_timestamp("2024-03-15T10:30:00").is_some());
        assert!(parse_timestamp("2024-03-15").is_some());
        assert!(parse_timestamp("15/03/2024").is_none());
    }

    #[tokio::test]
    async fn test_json_index_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonIndexStore::new(dir.path().join("meta").join("index.jsonl"));

        assert!(store.query_latest_timestamp().await.unwrap().is_none());

        let older = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 0).unwrap();
        store.record(&[entry("a", Some(older))]).await.unwrap();
        store
            .record(&[entry("b", Some(newer)), entry("c", None)])
            .await
            .unwrap();

        assert_eq!(store.entries().await.unwrap().len(), 3);
        let known = store.known_ids().await.unwrap();
        assert!(known.contains("a") && known.contains("b") && known.contains("c"));
        assert_eq!(
            get_latest_sync_point(&store).await.as_deref(),
            Some("2024/03/15")
        );
    }

    #[tokio::test]
    async fn test_json_index_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.jsonl");
        let good = serde_json::to_string(&entry("a", None)).unwrap();
        tokio::fs::write(&path, format!("garbage\n{}\n\n", good))
            .await
            .unwrap();

        let store = JsonIndexStore::new(&path);
        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "a");
    }
}
