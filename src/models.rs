use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{GmailError, Result};

/// Gmail message resource as returned by `users.messages.get`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Milliseconds since the epoch, as a decimal string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_estimate: Option<u64>,
    /// base64url RFC 2822 message, present with `format=raw`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<MessagePayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub headers: Vec<MessageHeader>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

impl GmailMessage {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload.as_ref()?.headers.iter().find_map(|h| {
            if h.name.eq_ignore_ascii_case(name) {
                Some(h.value.as_str())
            } else {
                None
            }
        })
    }

    pub fn subject(&self) -> Option<&str> {
        self.header("Subject")
    }

    /// `internalDate` as a UTC timestamp
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        let millis = self.internal_date.as_deref()?.parse::<i64>().ok()?;
        DateTime::from_timestamp_millis(millis)
    }

    /// Decoded RFC 2822 bytes of a `format=raw` message
    pub fn decoded_raw(&self) -> Result<Vec<u8>> {
        let raw = self.raw.as_deref().ok_or_else(|| {
            GmailError::InvalidMessageFormat(format!("Message {} has no raw content", self.id))
        })?;
        URL_SAFE_NO_PAD
            .decode(raw.trim_end_matches('='))
            .map_err(|e| {
                GmailError::InvalidMessageFormat(format!(
                    "Message {} has invalid base64url content: {}",
                    self.id, e
                ))
            })
    }
}

/// Message format to request from the Gmail API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Only id and labels
    Minimal,
    /// Headers without body
    Metadata,
    /// Parsed payload
    Full,
    /// Entire RFC 2822 message, base64url encoded
    #[default]
    Raw,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Minimal => "minimal",
            MessageFormat::Metadata => "metadata",
            MessageFormat::Full => "full",
            MessageFormat::Raw => "raw",
        }
    }
}

impl fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageFormat {
    type Err = GmailError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(MessageFormat::Minimal),
            "metadata" => Ok(MessageFormat::Metadata),
            "full" => Ok(MessageFormat::Full),
            "raw" => Ok(MessageFormat::Raw),
            other => Err(GmailError::ConfigError(format!(
                "Unknown message format '{}'",
                other
            ))),
        }
    }
}

/// Modification applied uniformly to every id of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchAction {
    /// Permanent deletion
    Delete,
    Trash,
    ModifyLabels {
        add: Vec<String>,
        remove: Vec<String>,
    },
}

impl BatchAction {
    pub fn mark_read() -> Self {
        BatchAction::ModifyLabels {
            add: Vec::new(),
            remove: vec!["UNREAD".to_string()],
        }
    }

    pub fn mark_unread() -> Self {
        BatchAction::ModifyLabels {
            add: vec!["UNREAD".to_string()],
            remove: Vec::new(),
        }
    }

    pub fn archive() -> Self {
        BatchAction::ModifyLabels {
            add: Vec::new(),
            remove: vec!["INBOX".to_string()],
        }
    }

    /// Quota table key for one item of this action
    pub fn operation_name(&self) -> &'static str {
        match self {
            BatchAction::Delete => "delete_message",
            BatchAction::Trash => "trash_message",
            BatchAction::ModifyLabels { .. } => "modify_message",
        }
    }

    pub(crate) fn sub_request(&self, id: &str) -> SubRequest {
        let base = format!("/gmail/v1/users/me/messages/{}", id);
        match self {
            BatchAction::Delete => SubRequest::new("DELETE", base),
            BatchAction::Trash => SubRequest::new("POST", format!("{}/trash", base)),
            BatchAction::ModifyLabels { add, remove } => {
                SubRequest::new("POST", format!("{}/modify", base)).with_body(serde_json::json!({
                    "addLabelIds": add,
                    "removeLabelIds": remove,
                }))
            }
        }
    }
}

/// One sub-request of a multipart batch
#[derive(Debug, Clone, PartialEq)]
pub struct SubRequest {
    pub method: String,
    /// Path and query relative to the API root, e.g. `/gmail/v1/users/me/messages/abc?format=raw`
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl SubRequest {
    pub fn new(method: &str, path: impl Into<String>) -> Self {
        Self {
            method: method.to_string(),
            path: path.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn get_message(id: &str, format: MessageFormat) -> Self {
        Self::new(
            "GET",
            format!("/gmail/v1/users/me/messages/{}?format={}", id, format.as_str()),
        )
    }
}

/// Outcome of one sub-request, in the same position as its request
#[derive(Debug, Clone, PartialEq)]
pub struct SubResponse {
    pub status: u16,
    pub body: String,
}

impl SubResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Error message from a Gmail JSON error body, or the raw text
    pub fn error_message(&self) -> String {
        serde_json::from_str::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| self.body.trim().to_string())
    }

    pub fn into_error(self) -> GmailError {
        let message = self.error_message();
        GmailError::from_status(self.status, message, None)
    }
}

/// One page of `users.messages.list`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageListPage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Per-item failure inside a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItemError {
    pub id: String,
    pub error: String,
}

/// Aggregate outcome of one batch operation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResult {
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<BatchItemError>,
}

impl BatchResult {
    pub fn record_success(&mut self) {
        self.successful += 1;
    }

    pub fn record_failure(&mut self, id: &str, error: impl fmt::Display) {
        self.failed += 1;
        self.errors.push(BatchItemError {
            id: id.to_string(),
            error: error.to_string(),
        });
    }

    pub fn merge(&mut self, other: BatchResult) {
        self.successful += other.successful;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }

    pub fn total(&self) -> usize {
        self.successful + self.failed
    }
}
