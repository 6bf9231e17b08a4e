//! Sequential incremental fetch
//!
//! [`IncrementalFetcher::fetch_incremental`] reads the newest locally stored
//! message as a watermark, lists everything Gmail has `after:` that date,
//! downloads it chunk by chunk through the [`BatchClient`], saves each
//! message and writes a checkpoint after every chunk. An interrupted run
//! resumes after the last checkpointed message on the next call with the
//! same query; an interrupted incremental run keeps its original watermark
//! for that. Ids that failed individually are fetched again on resume.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::batch::BatchClient;
use crate::checkpoint::{query_fingerprint, Checkpoint, CheckpointStore, SyncStatus};
use crate::config::{FetchConfig, MAX_LIST_PAGE_SIZE};
use crate::error::{GmailError, Result};
use crate::models::{BatchItemError, GmailMessage};
use crate::output::{OutputFormat, OutputWriter};
use crate::quota::{QuotaStatus, SharedQuotaTracker};
use crate::store::{get_latest_sync_point, IndexEntry, MessageStore};

/// Progress callback invoked as `(processed, total)` across a whole run
pub type FetchProgress = Arc<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Cap on ids enumerated per run
    pub max_results: usize,
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    /// Extra Gmail search terms appended to the date bound
    pub extra_query: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::from_config(&FetchConfig::default())
    }
}

impl FetchOptions {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_results: config.max_results,
            output_dir: config.output_dir.clone(),
            format: config.format,
            extra_query: None,
        }
    }
}

/// Outcome of one fetch run
#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub query: String,
    /// Ids the query matched, up to the cap
    pub found: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Already stored or covered by a resumed checkpoint
    pub skipped: usize,
    pub output_location: Option<PathBuf>,
    pub status: SyncStatus,
    pub errors: Vec<BatchItemError>,
    /// Run-level failure that stopped the run early
    pub error: Option<String>,
}

impl FetchReport {
    pub(crate) fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            found: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            output_location: None,
            status: SyncStatus::NotStarted,
            errors: Vec::new(),
            error: None,
        }
    }

    /// False when the run stopped early or nothing succeeded while something failed
    pub fn success(&self) -> bool {
        !matches!(self.status, SyncStatus::Failed { .. })
            && !(self.succeeded == 0 && self.failed > 0)
    }

    /// Some items failed but others made it
    pub fn is_partial(&self) -> bool {
        self.succeeded > 0 && self.failed > 0
    }

    pub fn record_item_failure(&mut self, id: &str, error: impl std::fmt::Display) {
        self.failed += 1;
        self.errors.push(BatchItemError {
            id: id.to_string(),
            error: error.to_string(),
        });
    }
}

/// Work remaining for one run after resume and de-duplication
pub(crate) struct RunPlan {
    pub checkpoint: Checkpoint,
    pub pending: Vec<String>,
    /// Ids before the resume position, queued again after failing last time
    pub requeued: HashSet<String>,
}

/// Furthest listed id a chunk moves the checkpoint to
pub(crate) fn chunk_position<'a>(
    chunk: &'a [String],
    requeued: &HashSet<String>,
) -> Option<&'a str> {
    chunk
        .iter()
        .rev()
        .find(|id| !requeued.contains(*id))
        .map(String::as_str)
}

/// Watermark for an incremental run.
///
/// An interrupted incremental run is continued with the watermark it started
/// from, since the newest stored message has moved on since then.
pub(crate) async fn incremental_watermark(
    store: &dyn MessageStore,
    checkpoints: &CheckpointStore,
    extra: Option<&str>,
) -> Result<String> {
    match checkpoints.load().await {
        Ok(Some(checkpoint)) if checkpoint.is_resumable() => {
            if let Some(watermark) = checkpoint.watermark {
                let query = incremental_query(&watermark, extra);
                if query_fingerprint(&query) == checkpoint.query_fingerprint {
                    info!("Resuming interrupted sync from {}", watermark);
                    return Ok(watermark);
                }
            }
        }
        Ok(_) => {}
        Err(e) => debug!("Ignoring checkpoint while choosing a watermark: {}", e),
    }

    get_latest_sync_point(store)
        .await
        .ok_or(GmailError::NoSyncBaseline)
}

/// Build the `after:` query for a watermark
pub fn incremental_query(watermark: &str, extra: Option<&str>) -> String {
    match extra.map(str::trim).filter(|extra| !extra.is_empty()) {
        Some(extra) => format!("after:{} {}", watermark, extra),
        None => format!("after:{}", watermark),
    }
}

/// Enumerate ids, then drop those a resumable checkpoint or the store already cover
pub(crate) async fn plan_run(
    batch: &BatchClient,
    store: &dyn MessageStore,
    checkpoints: &CheckpointStore,
    quota: &SharedQuotaTracker,
    query: &str,
    max_results: usize,
    report: &mut FetchReport,
) -> Result<Option<RunPlan>> {
    let pages = max_results.div_ceil(MAX_LIST_PAGE_SIZE as usize).max(1) as u64;
    if !quota.check_quota_available("list_messages", pages).await {
        return Err(GmailError::QuotaExceeded(
            "Not enough daily quota left to list messages".to_string(),
        ));
    }

    let ids = batch.list_message_ids(query, max_results).await?;
    let listed_pages = ids.len().div_ceil(MAX_LIST_PAGE_SIZE as usize).max(1) as u64;
    quota.consume_quota("list_messages", listed_pages).await;
    report.found = ids.len();

    if ids.is_empty() {
        info!("No messages match '{}'", query);
        return Ok(None);
    }

    let fingerprint = query_fingerprint(query);
    let (mut checkpoint, start) = match checkpoints.load_for(&fingerprint).await? {
        Some(checkpoint) => {
            let position = checkpoint
                .last_processed_id
                .as_deref()
                .and_then(|last| ids.iter().position(|id| id == last));
            match position {
                Some(position) => (checkpoint, position + 1),
                None => {
                    warn!("Checkpointed message is no longer listed, starting from the top");
                    (checkpoint, 0)
                }
            }
        }
        None => (Checkpoint::new(fingerprint), 0),
    };
    checkpoint.failed_ids.retain(|failed| ids.contains(failed));

    let known = store.known_ids().await.unwrap_or_else(|e| {
        warn!("Could not read stored ids, nothing will be de-duplicated: {}", e);
        Default::default()
    });
    let mut requeued = HashSet::new();
    let mut pending = Vec::new();
    for (index, id) in ids.iter().enumerate() {
        if known.contains(id) {
            continue;
        }
        if index >= start {
            pending.push(id.clone());
        } else if checkpoint.failed_ids.contains(id) {
            requeued.insert(id.clone());
            pending.push(id.clone());
        }
    }
    report.skipped = ids.len() - pending.len();

    if !requeued.is_empty() {
        info!("Retrying {} messages that failed last run", requeued.len());
    }
    if report.skipped > 0 {
        info!(
            "Skipping {} of {} messages (resumed or already stored)",
            report.skipped,
            ids.len()
        );
    }
    Ok(Some(RunPlan {
        checkpoint,
        pending,
        requeued,
    }))
}

pub(crate) fn index_entry(message: &GmailMessage, path: PathBuf) -> IndexEntry {
    IndexEntry {
        id: message.id.clone(),
        thread_id: message.thread_id.clone(),
        received_at: message.received_at(),
        path,
        saved_at: Utc::now(),
    }
}

pub(crate) fn newest(entries: &[IndexEntry]) -> Option<DateTime<Utc>> {
    entries.iter().filter_map(|entry| entry.received_at).max()
}

/// Close out a run that stopped on a run-level error
pub(crate) async fn fail_run(
    checkpoints: &CheckpointStore,
    checkpoint: &mut Checkpoint,
    report: &mut FetchReport,
    error: GmailError,
) {
    let resumable = checkpoint.has_progress();
    checkpoint.mark_failed(resumable);
    report.status = checkpoint.status;
    report.error = Some(error.to_string());

    error!(
        "Fetch stopped after {} messages: {}{}",
        checkpoint.total_processed,
        error,
        if resumable { " (resumable)" } else { "" }
    );
    if let Err(e) = checkpoints.save(checkpoint).await {
        warn!("Failed to persist failed checkpoint: {}", e);
    }
}

/// Sequential fetch orchestrator
pub struct IncrementalFetcher {
    batch: BatchClient,
    store: Arc<dyn MessageStore>,
    writer: Arc<dyn OutputWriter>,
    checkpoints: CheckpointStore,
    quota: SharedQuotaTracker,
    options: FetchOptions,
    progress: Option<FetchProgress>,
}

impl IncrementalFetcher {
    pub fn new(
        batch: BatchClient,
        store: Arc<dyn MessageStore>,
        writer: Arc<dyn OutputWriter>,
        checkpoints: CheckpointStore,
        quota: SharedQuotaTracker,
        options: FetchOptions,
    ) -> Self {
        Self {
            batch,
            store,
            writer,
            checkpoints,
            quota,
            options,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: FetchProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Fetch everything newer than the local watermark.
    ///
    /// Fails with [`GmailError::NoSyncBaseline`] when the store is empty;
    /// falling back to a full fetch is the caller's decision.
    pub async fn fetch_incremental(&self) -> Result<FetchReport> {
        let extra = self.options.extra_query.as_deref();
        let watermark =
            incremental_watermark(self.store.as_ref(), &self.checkpoints, extra).await?;

        let query = incremental_query(&watermark, extra);
        info!("Incremental sync from {}", watermark);
        self.run(&query, Some(&watermark)).await
    }

    /// Fetch every message matching `query`, up to the configured cap
    pub async fn fetch_query(&self, query: &str) -> Result<FetchReport> {
        self.run(query, None).await
    }

    async fn run(&self, query: &str, watermark: Option<&str>) -> Result<FetchReport> {
        let mut report = FetchReport::new(query);

        let plan = plan_run(
            &self.batch,
            self.store.as_ref(),
            &self.checkpoints,
            &self.quota,
            query,
            self.options.max_results,
            &mut report,
        )
        .await?;

        let Some(RunPlan {
            mut checkpoint,
            pending,
            requeued,
        }) = plan
        else {
            report.status = SyncStatus::Completed;
            return Ok(report);
        };

        if let Some(watermark) = watermark {
            checkpoint.watermark = Some(watermark.to_string());
        }
        checkpoint.status = SyncStatus::InProgress;
        self.checkpoints.save(&checkpoint).await?;

        let total = pending.len();
        let format = self.options.format;
        let mut processed = 0usize;

        for chunk in pending.chunks(self.batch.batch_size()) {
            if !self
                .quota
                .try_consume("get_message", chunk.len() as u64)
                .await
            {
                let error = GmailError::QuotaExceeded(format!(
                    "Daily quota exhausted with {} messages left",
                    total - processed
                ));
                fail_run(&self.checkpoints, &mut checkpoint, &mut report, error).await;
                return Ok(report);
            }

            let (messages, result) = match self
                .batch
                .batch_get_messages_detailed(chunk, format.message_format(), None)
                .await
            {
                Ok(fetched) => fetched,
                Err(e) => {
                    fail_run(&self.checkpoints, &mut checkpoint, &mut report, e).await;
                    return Ok(report);
                }
            };

            report.failed += result.failed;
            let mut failed: Vec<String> = result.errors.iter().map(|e| e.id.clone()).collect();
            report.errors.extend(result.errors);

            let mut entries = Vec::with_capacity(messages.len());
            for message in &messages {
                match self
                    .writer
                    .save(message, &self.options.output_dir, format)
                    .await
                {
                    Ok(path) => {
                        entries.push(index_entry(message, path));
                        report.succeeded += 1;
                    }
                    Err(e) => {
                        warn!("Failed to save message {}: {}", message.id, e);
                        failed.push(message.id.clone());
                        report.record_item_failure(&message.id, e);
                    }
                }
            }

            if let Err(e) = self.store.record(&entries).await {
                fail_run(&self.checkpoints, &mut checkpoint, &mut report, e).await;
                return Ok(report);
            }

            let saved: Vec<String> = entries.iter().map(|entry| entry.id.clone()).collect();
            checkpoint.record_chunk(
                chunk_position(chunk, &requeued),
                newest(&entries),
                &saved,
                &failed,
            );
            self.checkpoints.save(&checkpoint).await?;

            processed += chunk.len();
            if let Some(progress) = &self.progress {
                progress(processed, total);
            }
            debug!("Processed {}/{} messages", processed, total);
        }

        checkpoint.mark_completed();
        self.checkpoints.save(&checkpoint).await?;

        report.status = SyncStatus::Completed;
        if report.succeeded > 0 {
            report.output_location = Some(self.options.output_dir.clone());
        }
        info!(
            "Fetch complete: {} found, {} saved, {} failed, {} skipped",
            report.found, report.succeeded, report.failed, report.skipped
        );
        Ok(report)
    }

    pub async fn quota_status(&self) -> QuotaStatus {
        self.quota.quota_status().await
    }

    pub fn batch_client(&self) -> &BatchClient {
        &self.batch
    }
}
