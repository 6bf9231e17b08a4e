//! Gmail Backup
//!
//! Incremental, resumable backup of a Gmail mailbox over the Gmail REST API,
//! with bulk delete/trash/label operations built on the same access layer.
//!
//! # Overview
//!
//! - **Rate limiting**: a shared request-rate gate with exponential-backoff retry
//! - **Quota**: a daily quota ledger that resets at UTC midnight
//! - **Circuit breaker**: fail fast while the API keeps failing
//! - **Batching**: up to 100 sub-requests per multipart round trip
//! - **Checkpoint/resume**: atomic checkpoints keyed by query fingerprint
//! - **Incremental fetch**: sequential and concurrent fetchers that only
//!   download what arrived since the newest stored message
//!
//! # Example Usage
//!
//! ```no_run
//! use gmail_backup::{cli, config::Config, fetcher::{FetchOptions, IncrementalFetcher}};
//! use gmail_backup::{CheckpointStore, FileOutputWriter, JsonIndexStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let api = cli::connect(&config).await?;
//!
//!     let fetcher = IncrementalFetcher::new(
//!         cli::batch_client(api, &config),
//!         Arc::new(JsonIndexStore::new(&config.fetch.store_path)),
//!         Arc::new(FileOutputWriter::new()),
//!         CheckpointStore::new(&config.fetch.checkpoint_path),
//!         cli::quota_tracker(&config),
//!         FetchOptions::from_config(&config.fetch),
//!     );
//!
//!     let report = fetcher.fetch_incremental().await?;
//!     println!("{} saved, {} failed", report.succeeded, report.failed);
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`rate_limiter`] - Request-rate gate and retry loop
//! - [`quota`] - Daily quota ledger
//! - [`circuit_breaker`] - Closed/open/half-open breaker
//! - [`batch`] - Batched message operations
//! - [`multipart`] - `multipart/mixed` batch wire codec
//! - [`client`] - Network seam and the production Gmail client
//! - [`auth`] - OAuth2 credential providers
//! - [`checkpoint`] - Durable run progress
//! - [`store`] - Local index of fetched messages and the sync watermark
//! - [`subprocess`] - Path validation and shell-free subprocess execution
//! - [`fetcher`] - Sequential incremental fetch
//! - [`async_fetcher`] - Concurrent incremental fetch
//! - [`output`] - Writing messages to disk
//! - [`config`] - Configuration management
//! - [`cli`] - Command-line interface
//! - [`error`] - Error types and result aliases

pub mod async_fetcher;
pub mod auth;
pub mod batch;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod multipart;
pub mod output;
pub mod quota;
pub mod rate_limiter;
pub mod store;
pub mod subprocess;

pub use error::{GmailError, Result};

pub use models::{BatchAction, BatchResult, GmailMessage, MessageFormat};

pub use rate_limiter::{RateLimiter, RetryPolicy};
pub use quota::{QuotaStatus, QuotaTracker, SharedQuotaTracker};
pub use circuit_breaker::{CircuitBreaker, CircuitState};

pub use batch::BatchClient;
pub use client::{GmailApi, ProductionGmailClient};
pub use auth::{CredentialProvider, EnvCredentialProvider, FileCredentialProvider};

pub use checkpoint::{Checkpoint, CheckpointStore, SyncStatus};
pub use store::{get_latest_sync_point, JsonIndexStore, MessageStore, SyncPointSource};
pub use subprocess::PathValidator;

pub use fetcher::{FetchOptions, FetchReport, IncrementalFetcher};
pub use async_fetcher::{AsyncFetcher, PerformanceStats, WorkerPool};
pub use output::{FileOutputWriter, OutputFormat, OutputWriter};

pub use config::Config;

pub use cli::{Cli, Commands, ProgressReporter};
