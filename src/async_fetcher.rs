//! Concurrent fetch orchestration
//!
//! Same contract as [`IncrementalFetcher`](crate::fetcher::IncrementalFetcher),
//! but several batch round trips are in flight at once (bounded by a
//! semaphore) and message rendering runs on a small blocking worker pool.
//! Every round trip still goes through the one shared [`RateLimiter`], so
//! more concurrency never means more than the configured request rate.
//!
//! Chunks can finish out of order. The checkpoint only ever advances over the
//! contiguous prefix of finished chunks, so a resumed run never skips work
//! that was still in flight when the previous run stopped.
//!
//! [`RateLimiter`]: crate::rate_limiter::RateLimiter

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::batch::BatchClient;
use crate::checkpoint::{CheckpointStore, SyncStatus};
use crate::config::FetchConfig;
use crate::error::{GmailError, Result};
use crate::fetcher::{
    chunk_position, fail_run, incremental_query, incremental_watermark, index_entry, newest,
    plan_run, FetchOptions, FetchProgress, FetchReport, RunPlan,
};
use crate::models::BatchItemError;
use crate::output::{render, OutputWriter};
use crate::quota::{QuotaStatus, SharedQuotaTracker};
use crate::rate_limiter::RateLimiterStats;
use crate::store::{IndexEntry, MessageStore};

/// Fixed-size pool for CPU-bound work, backed by tokio's blocking threads
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `job` on a blocking thread once a worker is free
    pub async fn run<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GmailError::StateError("Worker pool is closed".to_string()))?;

        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| GmailError::StateError(format!("Worker task failed: {}", e)))?
    }

    /// Refuse further jobs
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Snapshot for tuning concurrency
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    /// Resident set size, where the platform exposes it
    pub memory_rss_bytes: Option<u64>,
    pub rate_limiting: RateLimiterStats,
    pub concurrent_limit: usize,
    pub thread_pool_workers: usize,
}

/// What one finished chunk contributes to the run
struct ChunkOutcome {
    position: Option<String>,
    count: u64,
    entries: Vec<IndexEntry>,
    errors: Vec<BatchItemError>,
}

pub struct AsyncFetcher {
    batch: BatchClient,
    store: Arc<dyn MessageStore>,
    writer: Arc<dyn OutputWriter>,
    checkpoints: CheckpointStore,
    quota: SharedQuotaTracker,
    options: FetchOptions,
    max_concurrent: usize,
    max_workers: usize,
    progress: Option<FetchProgress>,
}

impl AsyncFetcher {
    pub fn new(
        batch: BatchClient,
        store: Arc<dyn MessageStore>,
        writer: Arc<dyn OutputWriter>,
        checkpoints: CheckpointStore,
        quota: SharedQuotaTracker,
        options: FetchOptions,
    ) -> Self {
        let defaults = FetchConfig::default();
        Self {
            batch,
            store,
            writer,
            checkpoints,
            quota,
            options,
            max_concurrent: defaults.max_concurrent,
            max_workers: defaults.max_workers,
            progress: None,
        }
    }

    /// In-flight round trips and render workers; zero is raised to one
    pub fn with_concurrency(mut self, max_concurrent: usize, max_workers: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_progress(mut self, progress: FetchProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub async fn fetch_incremental(&self) -> Result<FetchReport> {
        let extra = self.options.extra_query.as_deref();
        let watermark =
            incremental_watermark(self.store.as_ref(), &self.checkpoints, extra).await?;

        let query = incremental_query(&watermark, extra);
        info!(
            "Incremental sync from {} ({} concurrent requests)",
            watermark, self.max_concurrent
        );
        self.run(&query, Some(&watermark)).await
    }

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

        // Pool and permits live for this call only
        let pool = WorkerPool::new(self.max_workers);
        let in_flight = Semaphore::new(self.max_concurrent);
        let abort = AtomicBool::new(false);

        let total = pending.len();
        let chunks: Vec<&[String]> = pending.chunks(self.batch.batch_size()).collect();
        let mut outcomes = stream::iter(chunks.into_iter().enumerate())
            .map(|(index, chunk)| {
                let pool = &pool;
                let in_flight = &in_flight;
                let abort = &abort;
                let requeued = &requeued;
                async move {
                    let outcome = self
                        .process_chunk(chunk, requeued, pool, in_flight, abort)
                        .await;
                    (index, outcome)
                }
            })
            .buffer_unordered(self.max_concurrent);

        let mut finished: BTreeMap<usize, ChunkOutcome> = BTreeMap::new();
        let mut next_index = 0usize;
        let mut processed = 0usize;
        let mut run_error: Option<GmailError> = None;

        while let Some((index, outcome)) = outcomes.next().await {
            match outcome {
                Ok(Some(outcome)) => {
                    report.succeeded += outcome.entries.len();
                    report.failed += outcome.errors.len();
                    processed += outcome.count as usize;
                    finished.insert(index, outcome);
                }
                Ok(None) => debug!("Chunk {} not started after abort", index),
                Err(e) => {
                    if !abort.swap(true, Ordering::SeqCst) {
                        warn!("Chunk {} failed, letting in-flight chunks finish: {}", index, e);
                    }
                    run_error.get_or_insert(e);
                }
            }

            let mut advanced = false;
            while let Some(outcome) = finished.remove(&next_index) {
                let saved: Vec<String> = outcome.entries.iter().map(|e| e.id.clone()).collect();
                let failed: Vec<String> = outcome.errors.iter().map(|e| e.id.clone()).collect();
                checkpoint.record_chunk(
                    outcome.position.as_deref(),
                    newest(&outcome.entries),
                    &saved,
                    &failed,
                );
                report.errors.extend(outcome.errors);
                next_index += 1;
                advanced = true;
            }
            if advanced {
                self.checkpoints.save(&checkpoint).await?;
            }

            if let Some(progress) = &self.progress {
                progress(processed, total);
            }
        }
        drop(outcomes);
        pool.close();

        // Finished beyond a gap; saved to disk but not covered by the checkpoint
        for outcome in finished.into_values() {
            report.errors.extend(outcome.errors);
        }

        if let Some(error) = run_error {
            fail_run(&self.checkpoints, &mut checkpoint, &mut report, error).await;
            return Ok(report);
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

    /// Fetch, render and save one chunk; `None` when the run was already aborted
    async fn process_chunk(
        &self,
        chunk: &[String],
        requeued: &HashSet<String>,
        pool: &WorkerPool,
        in_flight: &Semaphore,
        abort: &AtomicBool,
    ) -> Result<Option<ChunkOutcome>> {
        let _permit = in_flight
            .acquire()
            .await
            .map_err(|_| GmailError::StateError("Fetch permits closed".to_string()))?;
        if abort.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if chunk.is_empty() {
            return Ok(None);
        }

        if !self
            .quota
            .try_consume("get_message", chunk.len() as u64)
            .await
        {
            return Err(GmailError::QuotaExceeded(
                "Daily quota exhausted mid-run".to_string(),
            ));
        }

        let format = self.options.format;
        let (messages, result) = self
            .batch
            .batch_get_messages_detailed(chunk, format.message_format(), None)
            .await?;

        let rendered = futures::future::join_all(messages.iter().map(|message| {
            let message = message.clone();
            pool.run(move || render(&message, format))
        }))
        .await;

        let mut errors = result.errors;
        let mut entries = Vec::with_capacity(messages.len());
        for (message, bytes) in messages.iter().zip(rendered) {
            let saved = match bytes {
                Ok(bytes) => {
                    self.writer
                        .write_rendered(message, &bytes, &self.options.output_dir, format)
                        .await
                }
                Err(e) => Err(e),
            };
            match saved {
                Ok(path) => entries.push(index_entry(message, path)),
                Err(e) => {
                    warn!("Failed to save message {}: {}", message.id, e);
                    errors.push(BatchItemError {
                        id: message.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.store.record(&entries).await?;
        let position = chunk_position(chunk, requeued).map(str::to_string);
        debug!(
            "Chunk ending at {} saved {} messages",
            position.as_deref().unwrap_or("retried ids"),
            entries.len()
        );

        Ok(Some(ChunkOutcome {
            position,
            count: chunk.len() as u64,
            entries,
            errors,
        }))
    }

    pub async fn performance_stats(&self) -> PerformanceStats {
        PerformanceStats {
            memory_rss_bytes: resident_memory_bytes(),
            rate_limiting: self.batch.rate_limiter().stats().await,
            concurrent_limit: self.max_concurrent,
            thread_pool_workers: self.max_workers,
        }
    }

    pub async fn quota_status(&self) -> QuotaStatus {
        self.quota.quota_status().await
    }
}

fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kib * 1024)
}
