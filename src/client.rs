//! Network seam for the Gmail API
//!
//! [`GmailApi`] is the only place requests leave the process. Everything
//! above it (batching, retry, circuit breaking, checkpointing) is written
//! against the trait so it can be exercised with mocks.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, trace};

use crate::auth::{GmailAuthenticator, GmailHub, GMAIL_SCOPE};
use crate::error::{parse_retry_after, GmailError, Result};
use crate::models::{MessageListPage, SubRequest, SubResponse};
use crate::multipart;

/// Timeout applied to one batch round trip
const BATCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Raw Gmail API operations
#[async_trait]
pub trait GmailApi: Send + Sync {
    /// One page of `users.messages.list`
    async fn list_messages_page(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<String>,
    ) -> Result<MessageListPage>;

    /// Send up to 100 sub-requests in one multipart round trip.
    ///
    /// Returns one response per request, in request order. Per-item
    /// failures come back as non-2xx [`SubResponse`]s; only a failure of the
    /// round trip itself is an `Err`.
    async fn execute_batch(&self, requests: Vec<SubRequest>) -> Result<Vec<SubResponse>>;
}

/// [`GmailApi`] backed by the `google-gmail1` hub and the batch endpoint
pub struct ProductionGmailClient {
    hub: GmailHub,
    auth: GmailAuthenticator,
    http: reqwest::Client,
    batch_url: String,
}

impl ProductionGmailClient {
    /// # Arguments
    /// * `hub` - Gmail API hub used for listing
    /// * `auth` - Authenticator the hub was built with, used for batch bearer tokens
    /// * `batch_url` - Batch endpoint, normally `https://www.googleapis.com/batch/gmail/v1`
    pub fn new(hub: GmailHub, auth: GmailAuthenticator, batch_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(BATCH_TIMEOUT)
            .build()
            .map_err(|e| GmailError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            hub,
            auth,
            http,
            batch_url: batch_url.into(),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let token = self
            .auth
            .token(&[GMAIL_SCOPE])
            .await
            .map_err(|e| GmailError::AuthError(format!("Failed to obtain token: {}", e)))?;

        token
            .token()
            .map(str::to_string)
            .ok_or_else(|| GmailError::AuthError("Token response carried no access token".to_string()))
    }
}

#[async_trait]
impl GmailApi for ProductionGmailClient {
    async fn list_messages_page(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<String>,
    ) -> Result<MessageListPage> {
        let mut call = self
            .hub
            .users()
            .messages_list("me")
            .q(query)
            .max_results(page_size);

        if let Some(token) = page_token.as_deref() {
            call = call.page_token(token);
        }

        let (_, response) = call.add_scope(GMAIL_SCOPE).doit().await?;

        let ids: Vec<String> = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|message| message.id)
            .collect();

        debug!("Listed {} message ids for query '{}'", ids.len(), query);
        Ok(MessageListPage {
            ids,
            next_page_token: response.next_page_token,
        })
    }

    async fn execute_batch(&self, requests: Vec<SubRequest>) -> Result<Vec<SubResponse>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let token = self.access_token().await?;
        execute_batch_request(&self.http, &self.batch_url, &token, &requests).await
    }
}

/// POST one multipart batch and decode the parts
pub(crate) async fn execute_batch_request(
    http: &reqwest::Client,
    batch_url: &str,
    token: &str,
    requests: &[SubRequest],
) -> Result<Vec<SubResponse>> {
    let boundary = multipart::new_boundary();
    let body = multipart::encode_batch(requests, &boundary);
    trace!("Sending batch of {} sub-requests", requests.len());

    let response = http
        .post(batch_url)
        .bearer_auth(token)
        .header(reqwest::header::CONTENT_TYPE, multipart::content_type(&boundary))
        .body(body)
        .send()
        .await?;

    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_retry_after);
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let text = response.text().await?;

    if !status.is_success() {
        let message = SubResponse {
            status: status.as_u16(),
            body: text,
        }
        .error_message();
        return Err(GmailError::from_status(status.as_u16(), message, retry_after));
    }

    multipart::parse_batch_response(&text, &content_type, requests.len())
}
