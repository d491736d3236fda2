//! OIDC discovery (`.well-known/openid-configuration`).

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Path appended to the issuer URL.
pub const WELL_KNOWN_PATH: &str = "/.well-known/openid-configuration";

/// The parts of the discovery document this crate uses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OidcConfiguration {
    /// Issuer identifier; must equal the configured issuer
    pub issuer: String,
    /// JWK set location
    pub jwks_uri: String,
    /// Token endpoint (client credentials, token exchange)
    #[serde(default)]
    pub token_endpoint: Option<String>,
    /// UserInfo endpoint
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
}

impl OidcConfiguration {
    /// Token endpoint or a discovery error naming the issuer.
    pub fn require_token_endpoint(&self) -> Result<&str> {
        self.token_endpoint.as_deref().ok_or_else(|| {
            Error::DiscoveryFailed(format!("issuer {} has no token_endpoint", self.issuer))
        })
    }

    /// UserInfo endpoint or a discovery error naming the issuer.
    pub fn require_userinfo_endpoint(&self) -> Result<&str> {
        self.userinfo_endpoint.as_deref().ok_or_else(|| {
            Error::DiscoveryFailed(format!("issuer {} has no userinfo_endpoint", self.issuer))
        })
    }
}

/// Build the outbound HTTP client shared by the OIDC components.
///
/// `https_only` is relaxed when `allow_insecure_http` is set so local IdPs and
/// test stubs work.
pub fn http_client(allow_insecure_http: bool, timeout: Duration) -> Result<Client> {
    Client::builder()
        .https_only(!allow_insecure_http)
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))
}

/// Fetch and decode `{issuer}/.well-known/openid-configuration`.
pub async fn discover(http: &Client, issuer: &str) -> Result<OidcConfiguration> {
    let url = format!("{}{WELL_KNOWN_PATH}", issuer.trim_end_matches('/'));
    debug!(issuer = %issuer, url = %url, "Fetching OIDC discovery document");

    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::DiscoveryFailed(format!("GET {url}: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::DiscoveryFailed(format!(
            "GET {url} returned {status}: {body}"
        )));
    }

    let config: OidcConfiguration = response
        .json()
        .await
        .map_err(|e| Error::DiscoveryFailed(format!("invalid discovery document at {url}: {e}")))?;

    if config.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
        return Err(Error::DiscoveryFailed(format!(
            "discovery issuer mismatch: expected {issuer}, got {}",
            config.issuer
        )));
    }
    Ok(config)
}

/// [`discover`] with exponential backoff, for startup.
pub async fn discover_with_retry(
    http: &Client,
    issuer: &str,
    max_attempts: usize,
) -> Result<OidcConfiguration> {
    (|| async { discover(http, issuer).await })
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(200))
                .with_max_delay(Duration::from_secs(5))
                .with_max_times(max_attempts.saturating_sub(1)),
        )
        .notify(|err: &Error, delay: Duration| {
            warn!(issuer = %issuer, error = %err, retry_in = ?delay, "OIDC discovery failed, retrying");
        })
        .await
}
