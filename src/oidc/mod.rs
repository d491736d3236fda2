//! OIDC plumbing: discovery, JWKS cache, UserInfo cache and the token client.
//!
//! [`OidcProviders`] is built once at startup: every configured issuer is
//! discovered, its JWKS loaded and its UserInfo endpoint registered. Any
//! failure here is fatal.

pub mod discovery;
pub mod jwks;
pub mod token_client;
pub mod userinfo;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use discovery::{OidcConfiguration, discover, discover_with_retry, http_client};
pub use jwks::JwksCache;
pub use token_client::{ClientAuth, DpopKey, TokenClient, TokenExchangeRequest, TokenResponse};
pub use userinfo::{UserInfo, UserInfoCache, UserInfoCredential};

use crate::Result;

/// Discovery attempts per issuer at startup.
const DISCOVERY_ATTEMPTS: usize = 3;

/// Discovered issuers and their shared caches.
pub struct OidcProviders {
    http: Client,
    configs: HashMap<String, OidcConfiguration>,
    primary: Option<String>,
    jwks: Arc<JwksCache>,
    userinfo: Arc<UserInfoCache>,
}

impl OidcProviders {
    /// Discover `issuers` and load their key sets.
    pub async fn discover(http: Client, issuers: &[String], userinfo_ttl: Duration) -> Result<Self> {
        let mut configs = Vec::with_capacity(issuers.len());
        for issuer in issuers {
            configs.push(discover_with_retry(&http, issuer, DISCOVERY_ATTEMPTS).await?);
        }
        Self::from_configurations(http, configs, userinfo_ttl).await
    }

    /// Register already-discovered configurations.
    pub async fn from_configurations(
        http: Client,
        configs: Vec<OidcConfiguration>,
        userinfo_ttl: Duration,
    ) -> Result<Self> {
        let jwks = Arc::new(JwksCache::new(http.clone()));
        let userinfo = Arc::new(UserInfoCache::new(http.clone(), userinfo_ttl));
        let primary = configs.first().map(|c| c.issuer.clone());
        let mut by_issuer = HashMap::with_capacity(configs.len());
        for config in configs {
            jwks.register(&config.jwks_uri).await?;
            if let Some(endpoint) = &config.userinfo_endpoint {
                userinfo.register_issuer(&config.issuer, endpoint);
            }
            info!(issuer = %config.issuer, jwks_uri = %config.jwks_uri, "OIDC issuer registered");
            by_issuer.insert(config.issuer.clone(), config);
        }
        Ok(Self {
            http,
            configs: by_issuer,
            primary,
            jwks,
            userinfo,
        })
    }

    /// Configuration for `issuer`.
    #[must_use]
    pub fn get(&self, issuer: &str) -> Option<&OidcConfiguration> {
        self.configs.get(issuer)
    }

    /// First configured issuer, used for server-to-IdP calls.
    #[must_use]
    pub fn primary(&self) -> Option<&OidcConfiguration> {
        self.primary.as_deref().and_then(|iss| self.configs.get(iss))
    }

    /// `issuer → jwks_uri`, the allow-list for token verification.
    #[must_use]
    pub fn jwks_uris(&self) -> HashMap<String, String> {
        self.configs
            .iter()
            .map(|(iss, c)| (iss.clone(), c.jwks_uri.clone()))
            .collect()
    }

    /// Shared HTTP client.
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Shared JWKS cache.
    #[must_use]
    pub fn jwks(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    /// Shared UserInfo cache.
    #[must_use]
    pub fn userinfo(&self) -> &Arc<UserInfoCache> {
        &self.userinfo
    }

    /// Start the periodic JWKS refresh.
    pub fn spawn_jwks_refresher(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        self.jwks.spawn_refresher(interval, cancel)
    }

    /// Start the periodic eviction of expired UserInfo entries.
    pub fn spawn_userinfo_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        self.userinfo.spawn_sweeper(interval, cancel)
    }
}
