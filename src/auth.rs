//! OAuth2 credentials for the Gmail API
//!
//! The rest of the crate only sees [`CredentialProvider`]: authenticate once,
//! then hand out an authenticated [`GmailApi`] service. Two providers exist,
//! one reading the installed-app `credentials.json`, one reading the client
//! id and secret from the environment. Both persist refreshed tokens to disk.

use async_trait::async_trait;
use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use yup_oauth2::ApplicationSecret;

use crate::client::{GmailApi, ProductionGmailClient};
use crate::error::{GmailError, Result};

/// Full mailbox scope; permanent deletion is not available with narrower scopes
pub const GMAIL_SCOPE: &str = "https://mail.google.com/";

type HttpsConnector =
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;

/// Type alias for Gmail Hub to simplify type signatures
pub type GmailHub = Gmail<HttpsConnector>;

/// Authenticator shared by the hub and the batch client
pub type GmailAuthenticator = yup_oauth2::authenticator::Authenticator<HttpsConnector>;

/// Source of an authenticated Gmail service
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Obtain (or refresh) a token. Returns false when no usable credential exists.
    async fn authenticate(&self) -> bool;

    /// The authenticated service, or `None` until [`authenticate`](Self::authenticate) succeeded
    fn service(&self) -> Option<Arc<dyn GmailApi>>;
}

/// Provider backed by an installed-app `credentials.json`
pub struct FileCredentialProvider {
    credentials_path: PathBuf,
    token_cache_path: PathBuf,
    batch_url: String,
    service: OnceCell<Arc<dyn GmailApi>>,
}

impl FileCredentialProvider {
    pub fn new(
        credentials_path: impl Into<PathBuf>,
        token_cache_path: impl Into<PathBuf>,
        batch_url: impl Into<String>,
    ) -> Self {
        Self {
            credentials_path: credentials_path.into(),
            token_cache_path: token_cache_path.into(),
            batch_url: batch_url.into(),
            service: OnceCell::new(),
        }
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn authenticate(&self) -> bool {
        if self.service.get().is_some() {
            return true;
        }

        let secret = match yup_oauth2::read_application_secret(&self.credentials_path).await {
            Ok(secret) => secret,
            Err(e) => {
                warn!(
                    "Failed to read credentials from {:?}: {}",
                    self.credentials_path, e
                );
                return false;
            }
        };

        match build_client(secret, &self.token_cache_path, &self.batch_url).await {
            Ok(client) => {
                let _ = self.service.set(Arc::new(client));
                true
            }
            Err(e) => {
                warn!("Authentication failed: {}", e);
                false
            }
        }
    }

    fn service(&self) -> Option<Arc<dyn GmailApi>> {
        self.service.get().cloned()
    }
}

/// Provider reading `GMAIL_CLIENT_ID` / `GMAIL_CLIENT_SECRET` from the environment
pub struct EnvCredentialProvider {
    token_cache_path: PathBuf,
    batch_url: String,
    service: OnceCell<Arc<dyn GmailApi>>,
}

impl EnvCredentialProvider {
    pub fn new(token_cache_path: impl Into<PathBuf>, batch_url: impl Into<String>) -> Self {
        Self {
            token_cache_path: token_cache_path.into(),
            batch_url: batch_url.into(),
            service: OnceCell::new(),
        }
    }

    /// Whether the required variables are present
    pub fn is_configured() -> bool {
        env::var("GMAIL_CLIENT_ID").is_ok() && env::var("GMAIL_CLIENT_SECRET").is_ok()
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn authenticate(&self) -> bool {
        if self.service.get().is_some() {
            return true;
        }

        let secret = match load_credentials_from_env() {
            Ok(secret) => secret,
            Err(e) => {
                warn!("{}", e);
                return false;
            }
        };

        match build_client(secret, &self.token_cache_path, &self.batch_url).await {
            Ok(client) => {
                let _ = self.service.set(Arc::new(client));
                true
            }
            Err(e) => {
                warn!("Authentication failed: {}", e);
                false
            }
        }
    }

    fn service(&self) -> Option<Arc<dyn GmailApi>> {
        self.service.get().cloned()
    }
}

/// Build an authenticated client from an application secret.
///
/// Runs the installed flow (HTTP redirect, opens a browser) when no cached
/// token exists, then persists tokens to `token_cache_path` with owner-only
/// permissions.
pub async fn build_client(
    secret: ApplicationSecret,
    token_cache_path: &Path,
    batch_url: &str,
) -> Result<ProductionGmailClient> {
    if let Some(parent) = token_cache_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
        secret,
        yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .persist_tokens_to_disk(token_cache_path)
    .build()
    .await
    .map_err(|e| GmailError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    // Fetch once up front so the cached token carries the right scope
    auth.token(&[GMAIL_SCOPE])
        .await
        .map_err(|e| GmailError::AuthError(format!("Failed to obtain token: {}", e)))?;

    if token_cache_path.exists() {
        secure_token_file(token_cache_path).await?;
    }

    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| GmailError::AuthError(format!("Failed to load TLS roots: {}", e)))?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    let hub = Gmail::new(client, auth.clone());
    info!("Authenticated with Gmail API");
    ProductionGmailClient::new(hub, auth, batch_url)
}

/// Credential structure matching Google's OAuth2 credentials JSON format
#[derive(Debug, Serialize, Deserialize)]
pub struct Credentials {
    pub installed: InstalledApp,
}

/// Installed application credentials (desktop/CLI app)
#[derive(Debug, Serialize, Deserialize)]
pub struct InstalledApp {
    pub client_id: String,
    pub project_id: String,
    pub auth_uri: String,
    pub token_uri: String,
    pub client_secret: String,
    pub redirect_uris: Vec<String>,
}

/// Load OAuth2 credentials from a JSON file
pub async fn load_credentials(path: &Path) -> Result<Credentials> {
    let content = tokio::fs::read_to_string(path).await?;
    let creds = serde_json::from_str(&content)?;
    Ok(creds)
}

/// Load OAuth2 credentials from environment variables
///
/// # Environment Variables
/// - `GMAIL_CLIENT_ID`: OAuth2 client ID
/// - `GMAIL_CLIENT_SECRET`: OAuth2 client secret
/// - `GMAIL_REDIRECT_URI`: Redirect URI (optional, defaults to http://localhost:8080)
pub fn load_credentials_from_env() -> Result<ApplicationSecret> {
    let client_id = env::var("GMAIL_CLIENT_ID")
        .map_err(|_| GmailError::ConfigError("GMAIL_CLIENT_ID not set".to_string()))?;
    let client_secret = env::var("GMAIL_CLIENT_SECRET")
        .map_err(|_| GmailError::ConfigError("GMAIL_CLIENT_SECRET not set".to_string()))?;
    let redirect_uri =
        env::var("GMAIL_REDIRECT_URI").unwrap_or_else(|_| "http://localhost:8080".to_string());

    Ok(ApplicationSecret {
        client_id,
        client_secret,
        auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
        token_uri: "https://oauth2.googleapis.com/token".to_string(),
        redirect_uris: vec![redirect_uri],
        ..Default::default()
    })
}

/// Restrict the token cache to the owner (0600)
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

/// Windows relies on the profile directory ACLs
#[cfg(windows)]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}
