//! Batched access to the Gmail API
//!
//! [`BatchClient`] turns many single-message requests into multipart round
//! trips of at most [`MAX_BATCH_SIZE`] sub-requests. Every round trip is gated
//! by the shared [`RateLimiter`] (with retry) and then the
//! [`CircuitBreaker`]; only the round trip itself can fail the call.
//! Per-message failures are recorded in a [`BatchResult`] and never raised.

use async_stream::stream;
use futures::{Stream, StreamExt};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::client::GmailApi;
use crate::config::{MAX_BATCH_SIZE, MAX_LIST_PAGE_SIZE};
use crate::error::{GmailError, Result};
use crate::models::{BatchAction, BatchResult, GmailMessage, MessageFormat, SubRequest, SubResponse};
use crate::quota::QuotaTracker;
use crate::rate_limiter::{RateLimiter, RetryPolicy};

/// Progress callback invoked as `(completed, total)`
pub type ProgressFn<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

pub struct BatchClient {
    api: Arc<dyn GmailApi>,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
    retry_policy: RetryPolicy,
    costs: QuotaTracker,
    batch_size: usize,
}

impl BatchClient {
    pub fn new(
        api: Arc<dyn GmailApi>,
        rate_limiter: RateLimiter,
        circuit_breaker: CircuitBreaker,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            api,
            rate_limiter,
            circuit_breaker,
            retry_policy,
            costs: QuotaTracker::default(),
            batch_size: MAX_BATCH_SIZE,
        }
    }

    /// Use smaller round trips; values above the Gmail cap are clamped
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// One gated round trip: rate limiter (with retry) around circuit breaker around the API
    async fn round_trip(&self, operation: &str, requests: Vec<SubRequest>) -> Result<Vec<SubResponse>> {
        let quota_cost = self.costs.cost_of(operation, requests.len() as u64) as u32;
        let api = &self.api;
        let breaker = &self.circuit_breaker;

        self.rate_limiter
            .execute_with_retry(operation, quota_cost, &self.retry_policy, || {
                let requests = requests.clone();
                async move { breaker.call(|| api.execute_batch(requests)).await }
            })
            .await
    }

    /// Fetch messages in input order, skipping ids that failed
    pub async fn batch_get_messages(
        &self,
        ids: &[String],
        format: MessageFormat,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Vec<GmailMessage>> {
        let (messages, result) = self.batch_get_messages_detailed(ids, format, progress).await?;
        if result.failed > 0 {
            warn!(
                "{} of {} messages could not be fetched",
                result.failed,
                ids.len()
            );
        }
        Ok(messages)
    }

    /// Like [`batch_get_messages`](Self::batch_get_messages), also returning per-item outcomes.
    ///
    /// Repeated ids are fetched once.
    pub async fn batch_get_messages_detailed(
        &self,
        ids: &[String],
        format: MessageFormat,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<(Vec<GmailMessage>, BatchResult)> {
        let mut messages = Vec::with_capacity(ids.len());
        let mut result = BatchResult::default();
        if ids.is_empty() {
            return Ok((messages, result));
        }

        let mut seen = HashSet::with_capacity(ids.len());
        let unique: Vec<&String> = ids.iter().filter(|id| seen.insert(id.as_str())).collect();
        if unique.len() < ids.len() {
            debug!("Ignoring {} repeated ids", ids.len() - unique.len());
        }

        let total = unique.len();
        let mut completed = 0usize;

        for chunk in unique.chunks(self.batch_size) {
            let requests = chunk
                .iter()
                .map(|id| SubRequest::get_message(id, format))
                .collect();

            // Already in request order: the multipart parser places parts by Content-ID
            let mut responses = self.round_trip("get_message", requests).await?.into_iter();

            for id in chunk {
                let outcome = match responses.next() {
                    Some(response) => decode_message(id, response),
                    None => Err("No response for this item in the batch".to_string()),
                };
                match outcome {
                    Ok(message) => {
                        result.record_success();
                        messages.push(message);
                    }
                    Err(error) => {
                        warn!("Failed to fetch message {}: {}", id, error);
                        result.record_failure(id, error);
                    }
                }
                completed += 1;
                if let Some(progress) = progress {
                    progress(completed, total);
                }
            }
            debug!("Fetched batch of {} ({}/{})", chunk.len(), completed, total);
        }

        Ok((messages, result))
    }

    /// Apply `action` to every id
    pub async fn batch_modify(&self, ids: &[String], action: &BatchAction) -> Result<BatchResult> {
        let mut result = BatchResult::default();
        if ids.is_empty() {
            return Ok(result);
        }

        let operation = action.operation_name();
        for chunk in ids.chunks(self.batch_size) {
            let requests = chunk.iter().map(|id| action.sub_request(id)).collect();
            let responses = self.round_trip(operation, requests).await?;

            for (id, response) in chunk.iter().zip(responses) {
                if response.is_success() {
                    result.record_success();
                } else {
                    let error = response.into_error();
                    warn!("{} failed for message {}: {}", operation, id, error);
                    result.record_failure(id, error);
                }
            }
        }

        info!(
            "{}: {} succeeded, {} failed",
            operation, result.successful, result.failed
        );
        Ok(result)
    }

    /// Permanently delete messages
    pub async fn batch_delete_messages(&self, ids: &[String]) -> Result<BatchResult> {
        self.batch_modify(ids, &BatchAction::Delete).await
    }

    pub async fn batch_trash_messages(&self, ids: &[String]) -> Result<BatchResult> {
        self.batch_modify(ids, &BatchAction::Trash).await
    }

    pub async fn batch_modify_labels(
        &self,
        ids: &[String],
        add: &[String],
        remove: &[String],
    ) -> Result<BatchResult> {
        let action = BatchAction::ModifyLabels {
            add: add.to_vec(),
            remove: remove.to_vec(),
        };
        self.batch_modify(ids, &action).await
    }

    pub async fn mark_read(&self, ids: &[String]) -> Result<BatchResult> {
        self.batch_modify(ids, &BatchAction::mark_read()).await
    }

    pub async fn mark_unread(&self, ids: &[String]) -> Result<BatchResult> {
        self.batch_modify(ids, &BatchAction::mark_unread()).await
    }

    /// Remove from the inbox
    pub async fn archive(&self, ids: &[String]) -> Result<BatchResult> {
        self.batch_modify(ids, &BatchAction::archive()).await
    }

    /// Pages of ids from `messages.list`, ending when exhausted or `max` ids were yielded
    pub fn message_id_pages<'a>(
        &'a self,
        query: &'a str,
        max: usize,
    ) -> Pin<Box<dyn Stream<Item = Result<Vec<String>>> + Send + 'a>> {
        Box::pin(stream! {
            let mut yielded = 0usize;
            let mut page_token: Option<String> = None;
            let cost = self.costs.cost_of("list_messages", 1) as u32;

            while yielded < max {
                let page_size = (max - yielded).min(MAX_LIST_PAGE_SIZE as usize) as u32;
                let api = &self.api;
                let breaker = &self.circuit_breaker;
                let token = page_token.take();

                let page = self
                    .rate_limiter
                    .execute_with_retry("list_messages", cost, &self.retry_policy, || {
                        let token = token.clone();
                        async move {
                            breaker
                                .call(|| api.list_messages_page(query, page_size, token))
                                .await
                        }
                    })
                    .await;

                let page = match page {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };

                debug!("Listed page of {} ids", page.ids.len());
                let ids: Vec<String> = page.ids.into_iter().take(max - yielded).collect();
                yielded += ids.len();
                let exhausted = ids.is_empty();
                yield Ok(ids);

                match page.next_page_token {
                    Some(token) if !exhausted => page_token = Some(token),
                    _ => break,
                }
            }
        })
    }

    /// Collect [`message_id_pages`](Self::message_id_pages) into one list
    pub async fn list_message_ids(&self, query: &str, max: usize) -> Result<Vec<String>> {
        let mut pages = self.message_id_pages(query, max);
        let mut ids = Vec::new();
        while let Some(page) = pages.next().await {
            ids.extend(page?);
        }

        info!("Found {} messages for query '{}'", ids.len(), query);
        Ok(ids)
    }
}

fn decode_message(id: &str, response: SubResponse) -> std::result::Result<GmailMessage, String> {
    if !response.is_success() {
        return Err(response.into_error().to_string());
    }
    match serde_json::from_str::<GmailMessage>(&response.body) {
        Ok(message) if message.id == id => Ok(message),
        Ok(message) => Err(
            GmailError::InvalidMessageFormat(format!(
                "Expected message {}, response carried {}",
                id, message.id
            ))
            .to_string(),
        ),
        Err(e) => Err(GmailError::InvalidMessageFormat(e.to_string()).to_string()),
    }
}
