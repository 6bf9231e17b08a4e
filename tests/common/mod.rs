//! Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use gmail_backup::batch::BatchClient;
use gmail_backup::checkpoint::CheckpointStore;
use gmail_backup::circuit_breaker::CircuitBreaker;
use gmail_backup::client::GmailApi;
use gmail_backup::config::CircuitBreakerConfig;
use gmail_backup::error::{GmailError, Result};
use gmail_backup::fetcher::FetchOptions;
use gmail_backup::models::{MessageListPage, SubRequest, SubResponse};
use gmail_backup::output::OutputFormat;
use gmail_backup::quota::{QuotaTracker, SharedQuotaTracker};
use gmail_backup::rate_limiter::{RateLimiter, RetryPolicy};
use gmail_backup::store::{IndexEntry, JsonIndexStore, MessageStore};
use mockall::mock;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// Mock implementation of GmailApi for testing
mock! {
    pub GmailApi {}

    #[async_trait]
    impl GmailApi for GmailApi {
        async fn list_messages_page(
            &self,
            query: &str,
            page_size: u32,
            page_token: Option<String>,
        ) -> Result<MessageListPage>;
        async fn execute_batch(&self, requests: Vec<SubRequest>) -> Result<Vec<SubResponse>>;
    }
}

/// `2024-03-15T10:30:00Z` in milliseconds
pub const MARCH_15_2024_MS: i64 = 1_710_498_600_000;

/// RFC 2822 text the fake mailbox serves for `id`
pub fn raw_message_text(id: &str) -> String {
    format!("Message-ID: <{}@example.com>\r\nSubject: Message {}\r\n\r\nBody of {}", id, id, id)
}

/// Gmail `messages.get` body for `id`
pub fn message_body(id: &str, internal_date_ms: i64) -> String {
    json!({
        "id": id,
        "threadId": format!("thread_{}", id),
        "labelIds": ["INBOX"],
        "snippet": format!("Body of {}", id),
        "internalDate": internal_date_ms.to_string(),
        "sizeEstimate": 512,
        "raw": URL_SAFE_NO_PAD.encode(raw_message_text(id)),
    })
    .to_string()
}

/// Id a sub-request targets
pub fn request_id(request: &SubRequest) -> String {
    request
        .path
        .trim_start_matches("/gmail/v1/users/me/messages/")
        .split(['?', '/'])
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Scripted mailbox implementing the network seam.
///
/// Messages are listed in id order; an `after:YYYY/MM/DD` term drops those
/// received before that day (UTC). Ids in `missing` answer 404.
/// Queued errors are returned by the next batch calls, one each; once
/// `fail_batches_from` batch calls have been served every later one fails.
pub struct FakeMailbox {
    messages: Vec<(String, i64)>,
    pub missing: HashSet<String>,
    queued_failures: Mutex<VecDeque<GmailError>>,
    fail_batches_from: Option<usize>,
    pub batch_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub queries: Mutex<Vec<String>>,
    pub requested_ids: Mutex<Vec<String>>,
    batch_delay: Option<Duration>,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl FakeMailbox {
    /// `count` messages `m000..`, one minute apart starting at 2024-03-15 10:30 UTC
    pub fn with_messages(count: usize) -> Self {
        Self::with_dated(
            (0..count)
                .map(|i| (format!("m{:03}", i), MARCH_15_2024_MS + i as i64 * 60_000))
                .collect(),
        )
    }

    /// `count` messages listed newest first, one day apart; the oldest is
    /// received the day after 2024-03-15
    pub fn newest_first_days(count: usize) -> Self {
        Self::with_dated(
            (0..count)
                .map(|i| {
                    let days_after = (count - i) as i64;
                    (format!("m{:03}", i), MARCH_15_2024_MS + days_after * 86_400_000)
                })
                .collect(),
        )
    }

    fn with_dated(messages: Vec<(String, i64)>) -> Self {
        Self {
            messages,
            missing: HashSet::new(),
            queued_failures: Mutex::new(VecDeque::new()),
            fail_batches_from: None,
            batch_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
            requested_ids: Mutex::new(Vec::new()),
            batch_delay: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn missing(mut self, ids: &[&str]) -> Self {
        self.missing.extend(ids.iter().map(|id| id.to_string()));
        self
    }

    pub fn queue_batch_failure(self, error: GmailError) -> Self {
        self.queued_failures.lock().unwrap().push_back(error);
        self
    }

    /// Every batch call after the first `served` succeeds fails with a 400
    pub fn fail_batches_from(mut self, served: usize) -> Self {
        self.fail_batches_from = Some(served);
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = Some(delay);
        self
    }

    pub fn ids(&self) -> Vec<String> {
        self.messages.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn requested_ids(&self) -> Vec<String> {
        self.requested_ids.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GmailApi for FakeMailbox {
    async fn list_messages_page(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<String>,
    ) -> Result<MessageListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.to_string());

        let matching: Vec<&String> = self
            .messages
            .iter()
            .filter(|(_, date)| after_bound(query).map_or(true, |bound| *date >= bound))
            .map(|(id, _)| id)
            .collect();

        let start: usize = page_token.as_deref().unwrap_or("0").parse().unwrap_or(0);
        let end = (start + page_size as usize).min(matching.len());
        Ok(MessageListPage {
            ids: matching[start.min(end)..end].iter().map(|id| id.to_string()).collect(),
            next_page_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn execute_batch(&self, requests: Vec<SubRequest>) -> Result<Vec<SubResponse>> {
        let served = self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.batch_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = self.queued_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if matches!(self.fail_batches_from, Some(limit) if served >= limit) {
            return Err(GmailError::BadRequest("Scripted batch failure".to_string()));
        }

        let mut responses = Vec::with_capacity(requests.len());
        for request in &requests {
            let id = request_id(request);
            self.requested_ids.lock().unwrap().push(id.clone());

            let response = if self.missing.contains(&id) {
                SubResponse {
                    status: 404,
                    body: r#"{"error": {"code": 404, "message": "Requested entity was not found."}}"#
                        .to_string(),
                }
            } else if request.method == "GET" {
                match self.messages.iter().find(|(known, _)| *known == id) {
                    Some((_, date)) => SubResponse::ok(message_body(&id, *date)),
                    None => SubResponse {
                        status: 404,
                        body: r#"{"error": {"code": 404, "message": "Not Found"}}"#.to_string(),
                    },
                }
            } else {
                SubResponse {
                    status: 204,
                    body: String::new(),
                }
            };
            responses.push(response);
        }
        Ok(responses)
    }
}

/// Midnight UTC, in milliseconds, of the day an `after:` term names
fn after_bound(query: &str) -> Option<i64> {
    let day = query
        .split_whitespace()
        .find_map(|term| term.strip_prefix("after:"))?;
    let date = NaiveDate::parse_from_str(day, "%Y/%m/%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
}

/// Retry policy with millisecond delays so failing tests stay fast
pub fn fast_retry_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        jitter: false,
    }
}

/// Batch client with a generous rate and a breaker that never trips in tests
pub fn test_batch_client(api: Arc<dyn GmailApi>, batch_size: usize) -> BatchClient {
    BatchClient::new(
        api,
        RateLimiter::new(1000.0),
        CircuitBreaker::new(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 100,
            reset_timeout_secs: 60,
            success_threshold: 1,
        }),
        fast_retry_policy(2),
    )
    .with_batch_size(batch_size)
}

/// Temporary backup directory with an index store, checkpoint file and output dir
pub struct Workspace {
    pub dir: tempfile::TempDir,
    pub store: Arc<JsonIndexStore>,
    pub checkpoints: CheckpointStore,
    pub output_dir: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonIndexStore::new(dir.path().join("state").join("index.jsonl")));
        let checkpoints = CheckpointStore::new(dir.path().join("state").join("checkpoint.json"));
        let output_dir = dir.path().join("backup");
        Self {
            dir,
            store,
            checkpoints,
            output_dir,
        }
    }

    /// Record a previously saved message so the store has a watermark
    pub async fn seed(&self, id: &str, received_at: &str) {
        let received_at: DateTime<Utc> = received_at.parse().unwrap();
        self.store
            .record(&[IndexEntry {
                id: id.to_string(),
                thread_id: None,
                received_at: Some(received_at),
                path: self.output_dir.join(format!("{}.eml", id)),
                saved_at: Utc::now(),
            }])
            .await
            .unwrap();
    }

    pub fn options(&self) -> FetchOptions {
        FetchOptions {
            max_results: 500,
            output_dir: self.output_dir.clone(),
            format: OutputFormat::Eml,
            extra_query: None,
        }
    }

    pub fn saved_file(&self, id: &str) -> PathBuf {
        self.output_dir.join(format!("{}.eml", id))
    }
}

pub fn quota(limit: u64) -> SharedQuotaTracker {
    SharedQuotaTracker::new(QuotaTracker::new(limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_body_round_trips_raw() {
        let body: serde_json::Value = serde_json::from_str(&message_body("m1", 0)).unwrap();
        let raw = URL_SAFE_NO_PAD.decode(body["raw"].as_str().unwrap()).unwrap();
        assert_eq!(String::from_utf8(raw).unwrap(), raw_message_text("m1"));
    }

    #[test]
    fn test_after_bound() {
        assert_eq!(after_bound("after:2024/03/15 label:work"), Some(1_710_460_800_000));
        assert_eq!(after_bound("in:inbox"), None);
    }

    #[test]
    fn test_request_id() {
        let request = SubRequest::new("POST", "/gmail/v1/users/me/messages/abc/trash");
        assert_eq!(request_id(&request), "abc");
    }
}
