//! Command-line interface

use clap::{Args, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::async_fetcher::AsyncFetcher;
use crate::auth::{CredentialProvider, EnvCredentialProvider, FileCredentialProvider};
use crate::batch::BatchClient;
use crate::checkpoint::CheckpointStore;
use crate::circuit_breaker::CircuitBreaker;
use crate::client::GmailApi;
use crate::config::Config;
use crate::error::{GmailError, Result};
use crate::fetcher::{FetchOptions, FetchReport, IncrementalFetcher};
use crate::models::{BatchAction, BatchResult};
use crate::output::{FileOutputWriter, OutputFormat};
use crate::quota::{QuotaTracker, SharedQuotaTracker};
use crate::rate_limiter::{RateLimiter, RetryPolicy};
use crate::store::JsonIndexStore;
use crate::subprocess::PathValidator;

#[derive(Parser, Debug)]
#[command(name = "gmail-backup")]
#[command(version)]
#[command(about = "Incremental, rate-limited Gmail backup", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// OAuth2 credentials file (overrides config)
    #[arg(long)]
    pub credentials: Option<PathBuf>,

    /// Token cache file (overrides config)
    #[arg(long)]
    pub token_cache: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Maximum API requests per second
    #[arg(long, global = true)]
    pub requests_per_second: Option<f64>,

    /// Retries per request before giving up
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// First backoff delay in seconds
    #[arg(long, global = true)]
    pub base_delay: Option<f64>,

    /// Backoff ceiling in seconds
    #[arg(long, global = true)]
    pub max_delay: Option<f64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate with Gmail API
    Auth {
        /// Force re-authentication even if token exists
        #[arg(long)]
        force: bool,
    },

    /// Download messages to the output directory
    Fetch(FetchArgs),

    /// Permanently delete matching messages
    Delete(ActionArgs),

    /// Move matching messages to the trash
    Trash(ActionArgs),

    /// Mark matching messages as read
    MarkRead(ActionArgs),

    /// Remove matching messages from the inbox
    Archive(ActionArgs),

    /// Show the daily quota ledger and per-operation costs
    Quota,

    /// Show checkpoint and sync watermark
    Status {
        /// Show detailed information
        #[arg(long)]
        detailed: bool,
    },

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct FetchArgs {
    /// Cap on messages enumerated this run
    #[arg(long)]
    pub max: Option<usize>,

    /// Gmail search query (ANDed with the date bound when incremental)
    #[arg(short, long)]
    pub query: Option<String>,

    /// Only fetch messages newer than the newest stored one
    #[arg(long)]
    pub incremental: bool,

    /// Concurrent batch requests; enables the concurrent fetcher when above 1
    #[arg(long)]
    pub concurrent: Option<usize>,

    /// Output format: eml or json
    #[arg(long)]
    pub format: Option<OutputFormat>,

    /// Output directory (overrides config)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Program run with the output directory as its only argument after a successful fetch
    #[arg(long)]
    pub post_hook: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ActionArgs {
    /// Gmail search query selecting the messages
    #[arg(short, long)]
    pub query: String,

    /// Cap on messages affected
    #[arg(long, default_value_t = 500)]
    pub max: usize,

    /// List what would change without changing it
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub force: bool,
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }

    /// Share a `MultiProgress` with the log writer so log lines print above bars
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn add_progress_bar(&self, len: u64, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(len));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold the global command-line knobs into the loaded configuration
pub fn apply_overrides(cli: &Cli, config: &mut Config) {
    if let Some(rps) = cli.requests_per_second {
        config.rate_limit.requests_per_second = rps;
    }
    if let Some(retries) = cli.max_retries {
        config.rate_limit.max_retries = retries;
    }
    if let Some(base) = cli.base_delay {
        config.rate_limit.base_delay_secs = base;
    }
    if let Some(max) = cli.max_delay {
        config.rate_limit.max_delay_secs = max;
    }
    if let Some(credentials) = &cli.credentials {
        config.auth.credentials_file = credentials.clone();
    }
    if let Some(token_cache) = &cli.token_cache {
        config.auth.token_cache = token_cache.clone();
    }
}

/// Load, override and validate the configuration
pub async fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(&cli.config).await?;
    apply_overrides(cli, &mut config);
    config.validate()?;
    Ok(config)
}

/// Pick a credential source: the credentials file when present, else the environment
pub fn credential_provider(config: &Config) -> Result<Box<dyn CredentialProvider>> {
    let auth = &config.auth;
    if auth.credentials_file.exists() {
        return Ok(Box::new(FileCredentialProvider::new(
            &auth.credentials_file,
            &auth.token_cache,
            &auth.batch_endpoint,
        )));
    }
    if EnvCredentialProvider::is_configured() {
        info!("Using client credentials from the environment");
        return Ok(Box::new(EnvCredentialProvider::new(
            &auth.token_cache,
            &auth.batch_endpoint,
        )));
    }
    Err(GmailError::AuthError(format!(
        "No credentials: {:?} does not exist and GMAIL_CLIENT_ID/GMAIL_CLIENT_SECRET are not set",
        auth.credentials_file
    )))
}

/// Authenticate and return the service, failing when the provider is not ready
pub async fn connect(config: &Config) -> Result<Arc<dyn GmailApi>> {
    let provider = credential_provider(config)?;
    if !provider.authenticate().await {
        return Err(GmailError::AuthError(
            "Authentication did not complete".to_string(),
        ));
    }
    provider
        .service()
        .ok_or_else(|| GmailError::AuthError("Authenticated service unavailable".to_string()))
}

/// Batch client wired with the configured rate limiter, retry policy and breaker
pub fn batch_client(api: Arc<dyn GmailApi>, config: &Config) -> BatchClient {
    let breaker = if config.circuit_breaker.enabled {
        CircuitBreaker::new(config.circuit_breaker.clone())
    } else {
        CircuitBreaker::disabled()
    };

    BatchClient::new(
        api,
        RateLimiter::from_config(&config.rate_limit),
        breaker,
        RetryPolicy::from_config(&config.rate_limit),
    )
    .with_batch_size(config.fetch.batch_size)
}

pub fn quota_tracker(config: &Config) -> SharedQuotaTracker {
    SharedQuotaTracker::new(QuotaTracker::new(config.quota.daily_limit_units))
}

/// Validate a user-supplied path against the configured allow-list
pub fn validate_user_path(config: &Config, path: &Path) -> Result<PathBuf> {
    let raw = path.to_str().ok_or_else(|| {
        GmailError::validation(
            crate::subprocess::CHECK_NULL_BYTE,
            format!("{:?} is not valid UTF-8", path),
        )
    })?;
    PathValidator::new(config.security.allowed_base_dirs.clone()).validate(raw)
}

/// Resolve fetch options from config plus command-line flags
pub fn fetch_options(config: &Config, args: &FetchArgs) -> Result<FetchOptions> {
    let mut options = FetchOptions::from_config(&config.fetch);
    if let Some(max) = args.max {
        options.max_results = max;
    }
    if let Some(format) = args.format {
        options.format = format;
    }
    let output = args.output.as_ref().unwrap_or(&config.fetch.output_dir);
    options.output_dir = validate_user_path(config, output)?;
    options.extra_query = args.query.clone();
    Ok(options)
}

/// Run a fetch end to end and return its report
pub async fn run_fetch(
    config: &Config,
    args: &FetchArgs,
    reporter: &ProgressReporter,
) -> Result<FetchReport> {
    let options = fetch_options(config, args)?;
    let output_dir = options.output_dir.clone();

    let auth_spinner = reporter.add_spinner("Authenticating with Gmail API...");
    let api = connect(config).await?;
    reporter.finish_spinner(&auth_spinner, "Gmail API authenticated");

    let batch = batch_client(api, config);
    let store = Arc::new(JsonIndexStore::new(&config.fetch.store_path));
    let writer = Arc::new(FileOutputWriter::new());
    let checkpoints = CheckpointStore::new(&config.fetch.checkpoint_path);
    let quota = quota_tracker(config);

    let bar = reporter.add_progress_bar(0, "Fetching messages...");
    let progress_bar = bar.clone();
    let progress = Arc::new(move |done: usize, total: usize| {
        progress_bar.set_length(total as u64);
        progress_bar.set_position(done as u64);
    });

    let concurrent = args.concurrent.unwrap_or(1);
    let full_query = args.query.clone().unwrap_or_default();

    let report = if concurrent > 1 {
        let fetcher = AsyncFetcher::new(batch, store, writer, checkpoints, quota, options)
            .with_concurrency(concurrent, config.fetch.max_workers)
            .with_progress(progress);
        let report = if args.incremental {
            fetcher.fetch_incremental().await
        } else {
            fetcher.fetch_query(&full_query).await
        };
        let stats = fetcher.performance_stats().await;
        info!(
            "{} requests ({} retried), {} concurrent, {} workers",
            stats.rate_limiting.request_count,
            stats.rate_limiting.total_retries,
            stats.concurrent_limit,
            stats.thread_pool_workers
        );
        report
    } else {
        let fetcher = IncrementalFetcher::new(batch, store, writer, checkpoints, quota, options)
            .with_progress(progress);
        if args.incremental {
            fetcher.fetch_incremental().await
        } else {
            fetcher.fetch_query(&full_query).await
        }
    };
    bar.finish_and_clear();
    let report = report?;

    if let Some(program) = &args.post_hook {
        if report.success() && report.succeeded > 0 {
            run_post_hook(config, program, &output_dir).await?;
        }
    }
    Ok(report)
}

async fn run_post_hook(config: &Config, program: &str, output_dir: &Path) -> Result<()> {
    let validator = PathValidator::new(config.security.allowed_base_dirs.clone());
    let dir = output_dir.to_str().ok_or_else(|| {
        GmailError::validation(
            crate::subprocess::CHECK_NULL_BYTE,
            "output directory is not valid UTF-8",
        )
    })?;

    let output = validator
        .run_validated(
            program,
            &[dir],
            Duration::from_secs(config.security.subprocess_timeout_secs),
        )
        .await?;

    if !output.status.success() {
        warn!(
            "Post-fetch hook {} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Outcome of a bulk modification command
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub matched: usize,
    /// `None` for dry runs and declined confirmations
    pub result: Option<BatchResult>,
}

/// List the messages `args.query` selects and apply `action` to them
pub async fn run_action(
    config: &Config,
    args: &ActionArgs,
    action: BatchAction,
    reporter: &ProgressReporter,
) -> Result<ActionOutcome> {
    let api = connect(config).await?;
    let batch = batch_client(api, config);
    let quota = quota_tracker(config);

    let spinner = reporter.add_spinner(&format!("Listing messages for '{}'...", args.query));
    let ids = batch.list_message_ids(&args.query, args.max).await?;
    reporter.finish_spinner(&spinner, &format!("{} messages match", ids.len()));

    if ids.is_empty() || args.dry_run {
        if args.dry_run {
            let _ = reporter.multi_progress().println(format!(
                "[DRY RUN] Would apply {} to {} messages",
                action.operation_name(),
                ids.len()
            ));
        }
        return Ok(ActionOutcome {
            matched: ids.len(),
            result: None,
        });
    }

    if !args.force {
        let prompt = format!(
            "Apply {} to {} messages?",
            action.operation_name(),
            ids.len()
        );
        let confirmed = reporter.multi_progress().suspend(|| confirm_action(&prompt))?;
        if !confirmed {
            let _ = reporter.multi_progress().println("Aborted.");
            return Ok(ActionOutcome {
                matched: ids.len(),
                result: None,
            });
        }
    }

    let operation = action.operation_name();
    if !quota.try_consume(operation, ids.len() as u64).await {
        return Err(GmailError::QuotaExceeded(format!(
            "Not enough daily quota to {} {} messages",
            operation,
            ids.len()
        )));
    }

    let spinner = reporter.add_spinner(&format!("Applying {}...", operation));
    let result = batch.batch_modify(&ids, &action).await?;
    reporter.finish_spinner(
        &spinner,
        &format!("{} succeeded, {} failed", result.successful, result.failed),
    );

    Ok(ActionOutcome {
        matched: ids.len(),
        result: Some(result),
    })
}

/// Prompt user for confirmation
fn confirm_action(prompt: &str) -> Result<bool> {
    print!("{} [y/N]: ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case("y"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_parses_fetch_flags() {
        let cli = parse(&[
            "gmail-backup",
            "fetch",
            "--incremental",
            "--max",
            "1000",
            "--concurrent",
            "8",
            "--format",
            "json",
            "--query",
            "label:work",
        ]);

        match cli.command {
            Commands::Fetch(args) => {
                assert!(args.incremental);
                assert_eq!(args.max, Some(1000));
                assert_eq!(args.concurrent, Some(8));
                assert_eq!(args.format, Some(OutputFormat::Json));
                assert_eq!(args.query.as_deref(), Some("label:work"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_overrides_apply_to_config() {
        let cli = parse(&[
            "gmail-backup",
            "trash",
            "--query",
            "older_than:1y",
            "--requests-per-second",
            "2.5",
            "--max-retries",
            "3",
            "--base-delay",
            "0.5",
            "--max-delay",
            "30",
        ]);
        let mut config = Config::default();
        apply_overrides(&cli, &mut config);

        assert_eq!(config.rate_limit.requests_per_second, 2.5);
        assert_eq!(config.rate_limit.max_retries, 3);
        assert_eq!(config.rate_limit.base_delay_secs, 0.5);
        assert_eq!(config.rate_limit.max_delay_secs, 30.0);
        assert!(matches!(cli.command, Commands::Trash(ref a) if a.max == 500 && !a.dry_run));
    }

    #[test]
    fn test_action_requires_query() {
        assert!(Cli::try_parse_from(["gmail-backup", "delete"]).is_err());
    }

    #[test]
    fn test_fetch_options_reject_escaping_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.security.allowed_base_dirs = vec![dir.path().to_path_buf()];

        let args = FetchArgs {
            max: Some(50),
            query: None,
            incremental: true,
            concurrent: None,
            format: None,
            output: Some(PathBuf::from("../outside")),
            post_hook: None,
        };
        assert!(matches!(
            fetch_options(&config, &args),
            Err(GmailError::ValidationError { .. })
        ));

        let args = FetchArgs {
            output: Some(dir.path().join("mail")),
            ..args
        };
        let options = fetch_options(&config, &args).unwrap();
        assert_eq!(options.max_results, 50);
        assert!(options.output_dir.ends_with("mail"));
    }

    #[test]
    fn test_batch_client_uses_configured_batch_size() {
        struct NoApi;

        #[async_trait::async_trait]
        impl GmailApi for NoApi {
            async fn list_messages_page(
                &self,
                _query: &str,
                _page_size: u32,
                _page_token: Option<String>,
            ) -> Result<crate::models::MessageListPage> {
                Ok(Default::default())
            }

            async fn execute_batch(
                &self,
                _requests: Vec<crate::models::SubRequest>,
            ) -> Result<Vec<crate::models::SubResponse>> {
                Ok(Vec::new())
            }
        }

        let mut config = Config::default();
        config.fetch.batch_size = 25;
        assert_eq!(batch_client(Arc::new(NoApi), &config).batch_size(), 25);
    }
}
