//! Writing fetched messages to disk

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::trace;

use crate::error::{GmailError, Result};
use crate::models::{GmailMessage, MessageFormat};

/// On-disk representation of a saved message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// RFC 2822 `.eml` file decoded from the raw message
    #[default]
    Eml,
    /// The API resource as pretty JSON
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Eml => "eml",
            OutputFormat::Json => "json",
        }
    }

    /// Format to request from the API to produce this output
    pub fn message_format(&self) -> MessageFormat {
        match self {
            OutputFormat::Eml => MessageFormat::Raw,
            OutputFormat::Json => MessageFormat::Full,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = GmailError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "eml" => Ok(OutputFormat::Eml),
            "json" => Ok(OutputFormat::Json),
            other => Err(GmailError::ConfigError(format!(
                "Unknown output format '{}', expected 'eml' or 'json'",
                other
            ))),
        }
    }
}

/// Output collaborator the fetchers hand each message to
#[async_trait]
pub trait OutputWriter: Send + Sync {
    /// Write bytes already produced by [`render`]
    async fn write_rendered(
        &self,
        message: &GmailMessage,
        bytes: &[u8],
        destination: &Path,
        format: OutputFormat,
    ) -> Result<PathBuf>;

    async fn save(
        &self,
        message: &GmailMessage,
        destination: &Path,
        format: OutputFormat,
    ) -> Result<PathBuf> {
        let bytes = render(message, format)?;
        self.write_rendered(message, &bytes, destination, format)
            .await
    }
}

/// Serialize a message into the bytes written for `format`.
///
/// CPU-bound; the async fetcher runs this on its worker pool.
pub fn render(message: &GmailMessage, format: OutputFormat) -> Result<Vec<u8>> {
    match format {
        OutputFormat::Eml => message.decoded_raw(),
        OutputFormat::Json => Ok(serde_json::to_vec_pretty(message)?),
    }
}

/// File name for a message; ids are hex so they are safe as-is
pub fn file_name(message: &GmailMessage, format: OutputFormat) -> String {
    let id: String = message
        .id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    format!("{}.{}", id, format.extension())
}

/// Writes one file per message under the destination directory
#[derive(Debug, Clone, Default)]
pub struct FileOutputWriter;

impl FileOutputWriter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OutputWriter for FileOutputWriter {
    async fn write_rendered(
        &self,
        message: &GmailMessage,
        bytes: &[u8],
        destination: &Path,
        format: OutputFormat,
    ) -> Result<PathBuf> {
        if message.id.is_empty() {
            return Err(GmailError::InvalidMessageFormat(
                "Message has no id".to_string(),
            ));
        }
        tokio::fs::create_dir_all(destination).await?;
        let path = destination.join(file_name(message, format));
        tokio::fs::write(&path, bytes).await?;
        trace!("Saved message {} to {:?}", message.id, path);
        Ok(path)
    }
}
