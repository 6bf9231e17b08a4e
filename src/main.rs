use anyhow::Result;
use clap::Parser;
use gmail_backup::checkpoint::CheckpointStore;
use gmail_backup::cli::{self, ActionOutcome, Cli, Commands, ProgressReporter};
use gmail_backup::config::Config;
use gmail_backup::error::GmailError;
use gmail_backup::fetcher::FetchReport;
use gmail_backup::models::BatchAction;
use gmail_backup::quota::QuotaTracker;
use gmail_backup::store::{get_latest_sync_point, JsonIndexStore};
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: MultiProgress,
    buffer: Vec<u8>,
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            let msg = String::from_utf8_lossy(&self.buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            self.buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: MultiProgress,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter {
            multi: self.multi.clone(),
            buffer: Vec::new(),
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        display_error(&e);
        eprintln!("\nFor help, run: gmail-backup --help");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Several dependencies pull in rustls; pick the provider explicitly
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("gmail_backup=debug,info"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("gmail_backup=info,warn"))
    };

    // Logs print above progress bars
    let multi_progress = MultiProgress::new();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(MultiProgressMakeWriter {
            multi: multi_progress.clone(),
        })
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let reporter = ProgressReporter::with_multi_progress(multi_progress);

    match &cli.command {
        Commands::Auth { force } => {
            let config = cli::load_config(&cli).await?;
            let token_cache = &config.auth.token_cache;

            if *force && token_cache.exists() {
                tokio::fs::remove_file(token_cache).await?;
                tracing::info!("Removed existing token cache");
            }

            cli::connect(&config).await?;
            println!("Successfully authenticated with Gmail API");
            println!("Token cached at: {:?}", token_cache);
            Ok(())
        }

        Commands::Fetch(args) => {
            let config = cli::load_config(&cli).await?;
            let report = cli::run_fetch(&config, args, &reporter).await?;
            print_fetch_report(&report);

            if report.success() {
                Ok(())
            } else {
                Err(anyhow::anyhow!(
                    "Fetch did not complete: {}",
                    report.error.as_deref().unwrap_or("every message failed")
                ))
            }
        }

        Commands::Delete(args) => {
            let config = cli::load_config(&cli).await?;
            let outcome = cli::run_action(&config, args, BatchAction::Delete, &reporter).await?;
            print_action_outcome("Deleted", &outcome);
            Ok(())
        }

        Commands::Trash(args) => {
            let config = cli::load_config(&cli).await?;
            let outcome = cli::run_action(&config, args, BatchAction::Trash, &reporter).await?;
            print_action_outcome("Trashed", &outcome);
            Ok(())
        }

        Commands::MarkRead(args) => {
            let config = cli::load_config(&cli).await?;
            let outcome =
                cli::run_action(&config, args, BatchAction::mark_read(), &reporter).await?;
            print_action_outcome("Marked read", &outcome);
            Ok(())
        }

        Commands::Archive(args) => {
            let config = cli::load_config(&cli).await?;
            let outcome =
                cli::run_action(&config, args, BatchAction::archive(), &reporter).await?;
            print_action_outcome("Archived", &outcome);
            Ok(())
        }

        Commands::Quota => {
            let config = cli::load_config(&cli).await?;
            let tracker = QuotaTracker::new(config.quota.daily_limit_units);
            let status = tracker.quota_status();

            println!("\n========================================");
            println!("Daily Quota");
            println!("========================================");
            println!("Limit: {} units", status.daily_limit);
            println!("Used this process: {} units", status.daily_used);
            println!("Resets at: {}", status.reset_time.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("\nCost per call:");
            for operation in [
                "list_messages",
                "get_message",
                "modify_message",
                "trash_message",
                "delete_message",
            ] {
                println!("  {:<16} {:>3}", operation, tracker.cost_of(operation, 1));
            }
            println!("========================================");
            Ok(())
        }

        Commands::Status { detailed } => {
            let config = cli::load_config(&cli).await?;
            let checkpoints = CheckpointStore::new(&config.fetch.checkpoint_path);
            let store = JsonIndexStore::new(&config.fetch.store_path);

            println!("\n========================================");
            println!("Backup Status");
            println!("========================================");
            match get_latest_sync_point(&store).await {
                Some(watermark) => println!("Incremental sync from: {}", watermark),
                None => println!("No sync baseline yet; the next fetch must be a full fetch"),
            }

            match checkpoints.load().await {
                Ok(Some(checkpoint)) => {
                    println!("Last run: {:?}", checkpoint.status);
                    println!("Messages processed: {}", checkpoint.total_processed);
                    println!("Updated: {}", checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S"));
                    println!("Resumable: {}", checkpoint.is_resumable());
                    if *detailed {
                        if let Some(id) = &checkpoint.last_processed_id {
                            println!("Last processed message: {}", id);
                        }
                        println!("Query fingerprint: {}", checkpoint.query_fingerprint);
                    }
                }
                Ok(None) => println!("No checkpoint at {:?}", checkpoints.path()),
                Err(e) => println!("Checkpoint unreadable: {}", e),
            }

            if *detailed {
                let entries = store.entries().await?;
                println!("Stored messages: {}", entries.len());
                println!("Index: {:?}", store.path());
            }
            println!("========================================");
            Ok(())
        }

        Commands::InitConfig { output, force } => {
            if output.exists() && !force {
                return Err(GmailError::ConfigError(format!(
                    "Configuration file already exists at {:?}. Use --force to overwrite.",
                    output
                ))
                .into());
            }

            Config::create_example(output).await?;

            println!("Created example configuration file at: {:?}", output);
            println!("\nKey settings to review:");
            println!("  - rate_limit.requests_per_second: API request ceiling");
            println!("  - fetch.output_dir: Where messages are written");
            println!("  - fetch.format: 'eml' or 'json'");
            println!("  - security.allowed_base_dirs: Directories paths may resolve into");
            Ok(())
        }
    }
}

fn print_fetch_report(report: &FetchReport) {
    println!("\n========================================");
    println!("Fetch Summary");
    println!("========================================");
    println!("Query: {}", report.query);
    println!("Status: {:?}", report.status);
    println!("Found: {}", report.found);
    println!("Saved: {}", report.succeeded);
    println!("Failed: {}", report.failed);
    println!("Skipped: {}", report.skipped);
    if let Some(location) = &report.output_location {
        println!("Output: {:?}", location);
    }
    for error in report.errors.iter().take(10) {
        println!("  - {}: {}", error.id, error.error);
    }
    if report.errors.len() > 10 {
        println!("  ... and {} more", report.errors.len() - 10);
    }
    println!("========================================");
}

fn print_action_outcome(verb: &str, outcome: &ActionOutcome) {
    match &outcome.result {
        Some(result) => {
            println!(
                "{} {} of {} messages ({} failed)",
                verb, result.successful, outcome.matched, result.failed
            );
            for error in &result.errors {
                println!("  - {}: {}", error.id, error.error);
            }
        }
        None => println!("No changes made ({} messages matched)", outcome.matched),
    }
}

/// Display error with context
fn display_error(error: &anyhow::Error) {
    eprintln!("Error: {}", error);

    let mut cause = error.source();
    while let Some(e) = cause {
        eprintln!("  Caused by: {}", e);
        cause = e.source();
    }

    if let Some(gmail_err) = error.downcast_ref::<GmailError>() {
        match gmail_err {
            GmailError::AuthError(_) => {
                eprintln!("\nHint: Make sure your credentials.json file is valid,");
                eprintln!("      or set GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET.");
                eprintln!("      Try running: gmail-backup auth --force");
            }
            GmailError::NoSyncBaseline => {
                eprintln!("\nHint: Nothing has been backed up yet, so there is no date to sync from.");
                eprintln!("      Run a full fetch first: gmail-backup fetch");
            }
            GmailError::RateLimitExceeded { .. } | GmailError::TooManyRequests { .. } => {
                eprintln!("\nHint: You've hit Gmail API rate limits.");
                eprintln!("      Progress is checkpointed; rerun the same command to resume.");
                eprintln!("      Consider lowering --requests-per-second.");
            }
            GmailError::CircuitBreakerOpen { .. } => {
                eprintln!("\nHint: The Gmail API kept failing, so requests were paused.");
                eprintln!("      Wait a minute and try again.");
            }
            GmailError::QuotaExceeded(_) => {
                eprintln!("\nHint: The daily quota is used up; it resets at midnight UTC.");
            }
            GmailError::ValidationError { .. } => {
                eprintln!("\nHint: Paths must stay inside security.allowed_base_dirs.");
            }
            GmailError::ConfigError(_) => {
                eprintln!("\nHint: Check your configuration file for errors.");
                eprintln!("      Run: gmail-backup init-config --force");
            }
            _ => {}
        }
    }
}
