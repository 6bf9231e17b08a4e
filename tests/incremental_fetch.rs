//! Incremental fetch against a scripted mailbox

mod common;

use common::{quota, test_batch_client, FakeMailbox, Workspace};
use gmail_backup::checkpoint::{query_fingerprint, Checkpoint, SyncStatus};
use gmail_backup::error::GmailError;
use gmail_backup::fetcher::IncrementalFetcher;
use gmail_backup::output::FileOutputWriter;
use gmail_backup::quota::DEFAULT_DAILY_LIMIT;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

fn fetcher(ws: &Workspace, api: Arc<FakeMailbox>, batch_size: usize, limit: u64) -> IncrementalFetcher {
    IncrementalFetcher::new(
        test_batch_client(api, batch_size),
        ws.store.clone(),
        Arc::new(FileOutputWriter::new()),
        ws.checkpoints.clone(),
        quota(limit),
        ws.options(),
    )
}

#[tokio::test]
async fn test_empty_store_reports_no_baseline() {
    let ws = Workspace::new();
    let api = Arc::new(FakeMailbox::with_messages(3));

    let result = fetcher(&ws, api.clone(), 100, DEFAULT_DAILY_LIMIT)
        .fetch_incremental()
        .await;

    assert!(matches!(result, Err(GmailError::NoSyncBaseline)));
    assert_eq!(api.list_calls.load(Ordering::SeqCst), 0);
    assert_eq!(api.batch_calls(), 0);
}

#[tokio::test]
async fn test_fetches_messages_after_watermark() {
    let ws = Workspace::new();
    ws.seed("m000", "2024-03-15T10:30:00Z").await;
    let api = Arc::new(FakeMailbox::with_messages(5));

    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&progress);
    let report = fetcher(&ws, api.clone(), 100, DEFAULT_DAILY_LIMIT)
        .with_progress(Arc::new(move |done: usize, total: usize| seen.lock().unwrap().push((done, total))))
        .fetch_incremental()
        .await
        .unwrap();

    assert_eq!(api.queries.lock().unwrap()[0], "after:2024/03/15");
    assert!(report.success());
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.found, 5);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.succeeded, 4);
    assert_eq!(report.failed, 0);
    assert_eq!(report.output_location.as_deref(), Some(ws.output_dir.as_path()));

    // Already stored, so never downloaded again
    assert!(!api.requested_ids().contains(&"m000".to_string()));
    let saved = tokio::fs::read_to_string(ws.saved_file("m004")).await.unwrap();
    assert_eq!(saved, common::raw_message_text("m004"));

    let checkpoint = ws.checkpoints.load().await.unwrap().unwrap();
    assert_eq!(checkpoint.status, SyncStatus::Completed);
    assert_eq!(checkpoint.last_processed_id.as_deref(), Some("m004"));
    assert_eq!(checkpoint.total_processed, 4);
    assert_eq!(*progress.lock().unwrap(), vec![(4, 4)]);

    assert_eq!(ws.store.entries().await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_extra_query_is_appended() {
    let ws = Workspace::new();
    ws.seed("old", "2024-03-01T08:00:00Z").await;
    let api = Arc::new(FakeMailbox::with_messages(0));

    let mut options = ws.options();
    options.extra_query = Some("label:receipts".to_string());
    let fetcher = IncrementalFetcher::new(
        test_batch_client(api.clone(), 100),
        ws.store.clone(),
        Arc::new(FileOutputWriter::new()),
        ws.checkpoints.clone(),
        quota(DEFAULT_DAILY_LIMIT),
        options,
    );

    fetcher.fetch_incremental().await.unwrap();
    assert_eq!(api.queries.lock().unwrap()[0], "after:2024/03/01 label:receipts");
}

#[tokio::test]
async fn test_zero_matches_is_success_without_output() {
    let ws = Workspace::new();
    ws.seed("old", "2024-03-15T10:30:00Z").await;
    let api = Arc::new(FakeMailbox::with_messages(0));

    let report = fetcher(&ws, api.clone(), 100, DEFAULT_DAILY_LIMIT)
        .fetch_incremental()
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(report.found, 0);
    assert_eq!(report.status, SyncStatus::Completed);
    assert!(report.output_location.is_none());
    assert_eq!(api.batch_calls(), 0);
    assert!(!ws.output_dir.exists());
}

#[tokio::test]
async fn test_per_item_failures_do_not_stop_the_run() {
    let ws = Workspace::new();
    ws.seed("old", "2024-03-15T08:00:00Z").await;
    let api = Arc::new(FakeMailbox::with_messages(4).missing(&["m002"]));

    let report = fetcher(&ws, api, 100, DEFAULT_DAILY_LIMIT)
        .fetch_incremental()
        .await
        .unwrap();

    assert!(report.success());
    assert!(report.is_partial());
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors[0].id, "m002");
    assert!(!ws.saved_file("m002").exists());
    assert!(ws.saved_file("m003").exists());
}

#[tokio::test]
async fn test_transient_errors_are_retried_transparently() {
    let ws = Workspace::new();
    ws.seed("old", "2024-03-15T08:00:00Z").await;
    let api = Arc::new(
        FakeMailbox::with_messages(3)
            .queue_batch_failure(GmailError::ServerError {
                status: 503,
                message: "Backend Error".to_string(),
            })
            .queue_batch_failure(GmailError::TooManyRequests { retry_after: None }),
    );

    let report = fetcher(&ws, api.clone(), 100, DEFAULT_DAILY_LIMIT)
        .fetch_incremental()
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(report.succeeded, 3);
    assert_eq!(api.batch_calls(), 3);
}

#[tokio::test]
async fn test_failure_after_progress_is_resumable() {
    let ws = Workspace::new();
    ws.seed("old", "2024-03-15T08:00:00Z").await;
    let api = Arc::new(FakeMailbox::with_messages(10).fail_batches_from(2));

    let report = fetcher(&ws, api, 3, DEFAULT_DAILY_LIMIT)
        .fetch_incremental()
        .await
        .unwrap();

    assert!(!report.success());
    assert_eq!(report.status, SyncStatus::Failed { resumable: true });
    assert_eq!(report.succeeded, 6);
    assert!(report.error.as_deref().unwrap().contains("Scripted batch failure"));

    let checkpoint = ws.checkpoints.load().await.unwrap().unwrap();
    assert_eq!(checkpoint.last_processed_id.as_deref(), Some("m005"));
    assert_eq!(checkpoint.total_processed, 6);
    assert!(checkpoint.is_resumable());

    // Same watermark day, same query: the next run picks up after m005
    let api = Arc::new(FakeMailbox::with_messages(10));
    let report = fetcher(&ws, api.clone(), 3, DEFAULT_DAILY_LIMIT)
        .fetch_incremental()
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(report.skipped, 6);
    assert_eq!(report.succeeded, 4);
    assert_eq!(api.requested_ids(), vec!["m006", "m007", "m008", "m009"]);

    let checkpoint = ws.checkpoints.load().await.unwrap().unwrap();
    assert_eq!(checkpoint.status, SyncStatus::Completed);
    assert_eq!(checkpoint.total_processed, 10);
}

#[tokio::test]
async fn test_resumes_from_checkpoint_position() {
    let ws = Workspace::new();
    ws.seed("old", "2024-03-15T08:00:00Z").await;

    let mut checkpoint = Checkpoint::new(query_fingerprint("after:2024/03/15"));
    checkpoint.advance("m003", None, 4);
    checkpoint.mark_failed(true);
    ws.checkpoints.save(&checkpoint).await.unwrap();

    let api = Arc::new(FakeMailbox::with_messages(6));
    let report = fetcher(&ws, api.clone(), 100, DEFAULT_DAILY_LIMIT)
        .fetch_incremental()
        .await
        .unwrap();

    assert_eq!(report.skipped, 4);
    assert_eq!(api.requested_ids(), vec!["m004", "m005"]);
    assert_eq!(
        ws.checkpoints.load().await.unwrap().unwrap().total_processed,
        6
    );
}

#[tokio::test]
async fn test_checkpoint_for_other_query_is_ignored() {
    let ws = Workspace::new();
    ws.seed("old", "2024-03-15T08:00:00Z").await;

    let mut checkpoint = Checkpoint::new(query_fingerprint("after:2024/01/01"));
    checkpoint.advance("m003", None, 4);
    ws.checkpoints.save(&checkpoint).await.unwrap();

    let api = Arc::new(FakeMailbox::with_messages(6));
    let report = fetcher(&ws, api.clone(), 100, DEFAULT_DAILY_LIMIT)
        .fetch_incremental()
        .await
        .unwrap();

    assert_eq!(report.skipped, 0);
    assert_eq!(api.requested_ids().len(), 6);
}

#[tokio::test]
async fn test_retry_exhaustion_before_progress_is_not_resumable() {
    let ws = Workspace::new();
    ws.seed("old", "2024-03-15T08:00:00Z").await;
    let mut api = FakeMailbox::with_messages(3);
    for _ in 0..3 {
        api = api.queue_batch_failure(GmailError::TooManyRequests { retry_after: None });
    }
    let api = Arc::new(api);

    let report = fetcher(&ws, api.clone(), 100, DEFAULT_DAILY_LIMIT)
        .fetch_incremental()
        .await
        .unwrap();

    assert!(!report.success());
    assert_eq!(report.status, SyncStatus::Failed { resumable: false });
    assert_eq!(report.found, 3);
    assert_eq!(report.succeeded, 0);
    assert_eq!(api.batch_calls(), 3);

    let checkpoint = ws.checkpoints.load().await.unwrap().unwrap();
    assert!(!checkpoint.is_resumable());
}

#[tokio::test]
async fn test_quota_exhaustion_stops_between_chunks() {
    let ws = Workspace::new();
    ws.seed("old", "2024-03-15T08:00:00Z").await;
    let api = Arc::new(FakeMailbox::with_messages(6));

    // One list page (5) plus one chunk of three gets (15)
    let report = fetcher(&ws, api.clone(), 3, 20)
        .fetch_incremental()
        .await
        .unwrap();

    assert_eq!(report.status, SyncStatus::Failed { resumable: true });
    assert_eq!(report.succeeded, 3);
    assert_eq!(api.batch_calls(), 1);
    assert!(report.error.as_deref().unwrap().contains("quota"));
}

#[tokio::test]
async fn test_fetch_query_without_watermark() {
    let ws = Workspace::new();
    let api = Arc::new(FakeMailbox::with_messages(2));
    let fetcher = fetcher(&ws, api.clone(), 100, DEFAULT_DAILY_LIMIT);

    let report = fetcher.fetch_query("in:inbox").await.unwrap();

    assert_eq!(api.queries.lock().unwrap()[0], "in:inbox");
    assert_eq!(report.succeeded, 2);

    // One list page plus two gets at five units each
    let status = fetcher.quota_status().await;
    assert_eq!(status.daily_used, 15);
}

#[tokio::test]
async fn test_interrupted_newest_first_sync_resumes_with_its_watermark() {
    let ws = Workspace::new();
    ws.seed("old", "2024-03-15T08:00:00Z").await;

    // m000 (newest, 2024-03-20) is saved before the second batch fails
    let failing = Arc::new(FakeMailbox::newest_first_days(5).fail_batches_from(1));
    let first = fetcher(&ws, failing.clone(), 1, DEFAULT_DAILY_LIMIT)
        .fetch_incremental()
        .await
        .unwrap();
    assert_eq!(failing.queries.lock().unwrap()[0], "after:2024/03/15");
    assert_eq!(first.status, SyncStatus::Failed { resumable: true });
    assert_eq!(first.succeeded, 1);

    let checkpoint = ws.checkpoints.load().await.unwrap().unwrap();
    assert_eq!(checkpoint.watermark.as_deref(), Some("2024/03/15"));

    // The store now holds a 2024-03-20 message, but the resume keeps the old bound
    let api = Arc::new(FakeMailbox::newest_first_days(5));
    let second = fetcher(&ws, api.clone(), 1, DEFAULT_DAILY_LIMIT)
        .fetch_incremental()
        .await
        .unwrap();

    assert_eq!(api.queries.lock().unwrap()[0], "after:2024/03/15");
    assert!(second.success());
    assert_eq!(second.skipped, 1);
    assert_eq!(second.succeeded, 4);
    assert_eq!(api.requested_ids(), vec!["m001", "m002", "m003", "m004"]);
    for id in api.ids() {
        assert!(ws.saved_file(&id).exists(), "{} not saved", id);
    }

    let checkpoint = ws.checkpoints.load().await.unwrap().unwrap();
    assert_eq!(checkpoint.status, SyncStatus::Completed);
    assert_eq!(checkpoint.total_processed, 5);

    // Once complete, the next run moves on to the newest stored day
    let api = Arc::new(FakeMailbox::newest_first_days(5));
    let third = fetcher(&ws, api.clone(), 1, DEFAULT_DAILY_LIMIT)
        .fetch_incremental()
        .await
        .unwrap();
    assert_eq!(api.queries.lock().unwrap()[0], "after:2024/03/20");
    assert!(third.success());
    assert!(api.requested_ids().is_empty());
}

#[tokio::test]
async fn test_failed_items_are_retried_on_resume() {
    let ws = Workspace::new();
    ws.seed("old", "2024-03-15T08:00:00Z").await;

    let failing = Arc::new(
        FakeMailbox::with_messages(6)
            .missing(&["m001"])
            .fail_batches_from(1),
    );
    let first = fetcher(&ws, failing, 3, DEFAULT_DAILY_LIMIT)
        .fetch_incremental()
        .await
        .unwrap();

    assert_eq!(first.status, SyncStatus::Failed { resumable: true });
    assert_eq!(first.succeeded, 2);
    assert_eq!(first.failed, 1);

    let checkpoint = ws.checkpoints.load().await.unwrap().unwrap();
    assert_eq!(checkpoint.last_processed_id.as_deref(), Some("m002"));
    assert_eq!(checkpoint.total_processed, 2);
    assert_eq!(checkpoint.failed_ids, vec!["m001".to_string()]);

    let api = Arc::new(FakeMailbox::with_messages(6));
    let second = fetcher(&ws, api.clone(), 3, DEFAULT_DAILY_LIMIT)
        .fetch_incremental()
        .await
        .unwrap();

    assert!(second.success());
    assert_eq!(second.skipped, 2);
    assert_eq!(second.succeeded, 4);
    assert_eq!(api.requested_ids(), vec!["m001", "m003", "m004", "m005"]);
    assert!(ws.saved_file("m001").exists());

    let checkpoint = ws.checkpoints.load().await.unwrap().unwrap();
    assert_eq!(checkpoint.status, SyncStatus::Completed);
    assert_eq!(checkpoint.total_processed, 6);
    assert_eq!(checkpoint.last_processed_id.as_deref(), Some("m005"));
    assert!(checkpoint.failed_ids.is_empty());
}
