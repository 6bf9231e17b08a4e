//! Durable sync progress
//!
//! A [`Checkpoint`] records the last message a run finished with, keyed by a
//! fingerprint of the query that produced it. Ids that failed individually
//! are kept on it so a resumed run fetches them again, and an incremental
//! run keeps the watermark it started from so a resume lists the same ids. The [`CheckpointStore`] writes
//! it atomically (temp file in the same directory, fsync, rename) so a crash
//! leaves either the previous or the new checkpoint, never a torn one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{GmailError, Result};

/// Lifecycle of one sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    NotStarted,
    InProgress,
    Completed,
    /// `resumable` runs keep their checkpoint for the next attempt
    Failed { resumable: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_processed_id: Option<String>,
    pub last_processed_timestamp: Option<DateTime<Utc>>,
    pub total_processed: u64,
    pub query_fingerprint: String,
    /// Date bound of the incremental run that wrote this checkpoint
    #[serde(default)]
    pub watermark: Option<String>,
    /// Ids passed by the position that were not saved
    #[serde(default)]
    pub failed_ids: Vec<String>,
    pub status: SyncStatus,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(query_fingerprint: impl Into<String>) -> Self {
        Self {
            last_processed_id: None,
            last_processed_timestamp: None,
            total_processed: 0,
            query_fingerprint: query_fingerprint.into(),
            watermark: None,
            failed_ids: Vec::new(),
            status: SyncStatus::NotStarted,
            updated_at: Utc::now(),
        }
    }

    /// Record `count` more items confirmed complete, ending at `last_id`
    pub fn advance(&mut self, last_id: &str, last_timestamp: Option<DateTime<Utc>>, count: u64) {
        self.last_processed_id = Some(last_id.to_string());
        if last_timestamp.is_some() {
            self.last_processed_timestamp = last_timestamp;
        }
        self.total_processed += count;
        self.status = SyncStatus::InProgress;
        self.updated_at = Utc::now();
    }

    /// Fold one finished chunk into the checkpoint.
    ///
    /// `position` is the furthest listed id the chunk covers, if any; ids in
    /// `failed` stay queued for the next run until a later chunk saves them.
    pub fn record_chunk(
        &mut self,
        position: Option<&str>,
        last_timestamp: Option<DateTime<Utc>>,
        saved: &[String],
        failed: &[String],
    ) {
        self.failed_ids.retain(|id| !saved.contains(id));
        for id in failed {
            if !self.failed_ids.contains(id) {
                self.failed_ids.push(id.clone());
            }
        }

        if let Some(position) = position {
            self.last_processed_id = Some(position.to_string());
        }
        if last_timestamp.is_some() {
            self.last_processed_timestamp = last_timestamp;
        }
        self.total_processed += saved.len() as u64;
        self.status = SyncStatus::InProgress;
        self.updated_at = Utc::now();
    }

    /// Anything a later run could pick up
    pub fn has_progress(&self) -> bool {
        self.total_processed > 0 || !self.failed_ids.is_empty()
    }

    pub fn mark_completed(&mut self) {
        self.status = SyncStatus::Completed;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, resumable: bool) {
        self.status = SyncStatus::Failed { resumable };
        self.updated_at = Utc::now();
    }

    /// Whether a later run may continue from this position
    pub fn is_resumable(&self) -> bool {
        (self.last_processed_id.is_some() || !self.failed_ids.is_empty())
            && matches!(
                self.status,
                SyncStatus::InProgress | SyncStatus::Failed { resumable: true }
            )
    }
}

/// SHA-256 hex of the whitespace- and case-normalized query
pub fn query_fingerprint(query: &str) -> String {
    let normalized = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// Single-file checkpoint store
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored checkpoint; `None` when there is none
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint = serde_json::from_str(&content).map_err(|e| {
            GmailError::StateError(format!(
                "Checkpoint at {:?} is unreadable: {}",
                self.path, e
            ))
        })?;
        Ok(Some(checkpoint))
    }

    /// Resumable checkpoint for `fingerprint`; anything else is discarded
    pub async fn load_for(&self, fingerprint: &str) -> Result<Option<Checkpoint>> {
        let checkpoint = match self.load().await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return Ok(None),
            Err(GmailError::StateError(message)) => {
                warn!("{}; discarding", message);
                self.clear().await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if checkpoint.query_fingerprint != fingerprint {
            info!("Checkpoint belongs to a different query, discarding");
            self.clear().await?;
            return Ok(None);
        }
        if !checkpoint.is_resumable() {
            debug!("Checkpoint status {:?} is not resumable", checkpoint.status);
            return Ok(None);
        }

        info!(
            "Resuming after message {} ({} already processed)",
            checkpoint.last_processed_id.as_deref().unwrap_or("-"),
            checkpoint.total_processed
        );
        Ok(Some(checkpoint))
    }

    /// Atomically replace the stored checkpoint
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let json = serde_json::to_vec_pretty(checkpoint)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .map_err(|e| GmailError::StateError(format!("Checkpoint writer panicked: {}", e)))??;

        debug!(
            "Saved checkpoint: {} processed, status {:?}",
            checkpoint.total_processed, checkpoint.status
        );
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
    temp_file.write_all(bytes)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;
    temp_file
        .persist(path)
        .map_err(|e| GmailError::StateError(format!("Failed to persist checkpoint: {}", e)))?;

    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}
