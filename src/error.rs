use thiserror::Error;

/// Type alias for Result with GmailError
pub type Result<T> = std::result::Result<T, GmailError>;

/// Error types for the Gmail backup system
#[derive(Error, Debug)]
pub enum GmailError {
    /// Gmail API returned an error that fits no other category
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// Credential invalid, expired, or not yet obtained
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Server answered 429; `retry_after` is set only when the response carried a header
    #[error(
        "Too many requests{}",
        .retry_after.map(|secs| format!(", retry after {} seconds", secs)).unwrap_or_default()
    )]
    TooManyRequests { retry_after: Option<u64> },

    /// Retries were exhausted for a retryable failure
    #[error("Rate limit exceeded after {attempts} attempts: {last_error}")]
    RateLimitExceeded {
        attempts: u32,
        #[source]
        last_error: Box<GmailError>,
    },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Invalid message format or parsing error
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// User-supplied input rejected before any I/O
    #[error("Validation failed ({check}): {message}")]
    ValidationError { check: String, message: String },

    /// A subprocess exceeded its time budget and was killed
    #[error("Subprocess '{program}' timed out after {timeout_secs} seconds")]
    SubprocessTimeout { program: String, timeout_secs: u64 },

    /// No local watermark exists, so an incremental sync cannot be bounded
    #[error("No sync baseline found: the local store has no messages. Run a full fetch first")]
    NoSyncBaseline,

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Checkpoint or local store errors
    #[error("State error: {0}")]
    StateError(String),

    /// Daily quota would be exceeded
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Circuit breaker is open (rejecting requests)
    #[error("Circuit breaker open: {message}. Will retry after {retry_after_secs} seconds")]
    CircuitBreakerOpen {
        message: String,
        retry_after_secs: u64,
    },

    /// Generic catch-all error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl GmailError {
    /// Build a validation error naming the check that failed
    pub fn validation(check: &str, message: impl Into<String>) -> Self {
        GmailError::ValidationError {
            check: check.to_string(),
            message: message.into(),
        }
    }

    /// Whether the retry loop should absorb this error and try again.
    ///
    /// 429, 500, 502, 503, 504, transport failures, and 403 responses whose
    /// text names a quota or rate limit are retryable. Everything else
    /// propagates immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            GmailError::TooManyRequests { .. } | GmailError::NetworkError(_) => true,
            GmailError::ServerError { status, .. } => {
                matches!(status, 500 | 502 | 503 | 504)
            }
            GmailError::Forbidden(message) => is_quota_message(message),
            _ => false,
        }
    }

    /// Check if the error is transient (retryable or a fail-fast rejection worth retrying later)
    pub fn is_transient(&self) -> bool {
        self.is_retryable() || matches!(self, GmailError::CircuitBreakerOpen { .. })
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Explicit "retry after N seconds" hint carried by the error, if any
    pub fn retry_after_hint(&self) -> Option<u64> {
        match self {
            GmailError::TooManyRequests { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Map an HTTP status and response text to an error
    pub fn from_status(status: u16, message: String, retry_after: Option<u64>) -> Self {
        match status {
            429 => GmailError::TooManyRequests { retry_after },
            404 => GmailError::MessageNotFound(message),
            400 => GmailError::BadRequest(message),
            401 => GmailError::AuthError(message),
            403 => GmailError::Forbidden(message),
            500..=599 => GmailError::ServerError { status, message },
            _ => GmailError::ApiError(format!("HTTP {}: {}", status, message)),
        }
    }
}

fn is_quota_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["quota", "rate limit", "ratelimit", "usagelimits", "user-rate"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Parse a Retry-After header value
///
/// The value can be specified in two formats:
/// 1. Delay-seconds: An integer indicating seconds to wait (e.g., "120")
/// 2. HTTP-date: An HTTP date format (e.g., "Wed, 21 Oct 2015 07:28:00 GMT")
///
/// Returns `None` if the value is invalid or names a date in the past.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    let http_date = httpdate::parse_http_date(value).ok()?;
    http_date
        .duration_since(std::time::SystemTime::now())
        .ok()
        .map(|duration| duration.as_secs())
}

fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> Option<u64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(parse_retry_after)
}

impl From<google_gmail1::Error> for GmailError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                if status_code == 429 {
                    return GmailError::TooManyRequests {
                        retry_after: parse_retry_after_header(response),
                    };
                }
                GmailError::from_status(status_code, message, None)
            }
            // The hub surfaces JSON error bodies here, which is where quota 403s land
            google_gmail1::Error::BadRequest(ref err) => {
                let text = err.to_string();
                let code = err
                    .get("error")
                    .and_then(|e| e.get("code"))
                    .and_then(|c| c.as_u64())
                    .unwrap_or(400) as u16;
                GmailError::from_status(code, text, None)
            }
            google_gmail1::Error::HttpError(ref err) => {
                GmailError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => GmailError::NetworkError(err.to_string()),
            google_gmail1::Error::MissingToken(err) => {
                GmailError::AuthError(format!("Missing token: {}", err))
            }
            _ => GmailError::ApiError(error.to_string()),
        }
    }
}

impl From<reqwest::Error> for GmailError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => GmailError::from_status(status.as_u16(), error.to_string(), None),
            None => GmailError::NetworkError(error.to_string()),
        }
    }
}
