//! JWKS cache with a background refresher.
//!
//! # Behaviour
//!
//! | Situation | Result |
//! |-----------|--------|
//! | first load of a URI fails | [`Error::DiscoveryFailed`]; the issuer is unusable |
//! | later refresh fails | warning logged, last-good set kept |
//! | token `kid` not in the cached set | one immediate refresh, then `TokenParse` |
//!
//! Reads never block on the refresher: entries are swapped whole.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use reqwest::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

struct CachedJwks {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
}

/// JWK sets keyed by `jwks_uri`.
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    http: Client,
}

impl JwksCache {
    /// Empty cache using `http` for fetches.
    #[must_use]
    pub fn new(http: Client) -> Self {
        Self {
            inner: DashMap::new(),
            http,
        }
    }

    /// Load `jwks_uri` for the first time. Failure here is fatal for the issuer.
    pub async fn register(&self, jwks_uri: &str) -> Result<()> {
        let keys = self.fetch(jwks_uri).await?;
        info!(jwks_uri = %jwks_uri, keys = keys.keys.len(), "JWKS loaded");
        self.store(jwks_uri, keys);
        Ok(())
    }

    /// Registered URIs.
    #[must_use]
    pub fn uris(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    /// Cached set for `jwks_uri`.
    #[must_use]
    pub fn get(&self, jwks_uri: &str) -> Option<Arc<JwkSet>> {
        self.inner.get(jwks_uri).map(|e| Arc::clone(&e.keys))
    }

    /// Age of the cached set.
    #[must_use]
    pub fn age(&self, jwks_uri: &str) -> Option<Duration> {
        self.inner.get(jwks_uri).map(|e| e.fetched_at.elapsed())
    }

    /// Refetch `jwks_uri`; on failure keep the last-good set and return the error.
    pub async fn refresh(&self, jwks_uri: &str) -> Result<()> {
        match self.fetch(jwks_uri).await {
            Ok(keys) => {
                debug!(jwks_uri = %jwks_uri, keys = keys.keys.len(), "JWKS refreshed");
                self.store(jwks_uri, keys);
                Ok(())
            }
            Err(e) => {
                warn!(jwks_uri = %jwks_uri, error = %e, "JWKS refresh failed, keeping last-good set");
                Err(e)
            }
        }
    }

    /// Decoding key for `kid` (or the only key when the token names none).
    ///
    /// An unknown `kid` triggers one refresh before failing.
    pub async fn decoding_key(&self, jwks_uri: &str, kid: Option<&str>) -> Result<DecodingKey> {
        let set = self.get(jwks_uri).ok_or_else(|| {
            Error::DiscoveryFailed(format!("no JWKS registered for {jwks_uri}"))
        })?;
        if let Some(jwk) = select_key(&set, kid) {
            return decoding_key(jwk);
        }

        debug!(kid = ?kid, "Key not found in cached JWKS, refreshing");
        // A failed refresh leaves the old set; the lookup below reports the kid.
        let _ = self.refresh(jwks_uri).await;
        let set = self.get(jwks_uri).unwrap_or(set);
        let jwk = select_key(&set, kid).ok_or_else(|| {
            Error::TokenParse(format!("unknown signing key id {}", kid.unwrap_or("<none>")))
        })?;
        decoding_key(jwk)
    }

    /// Refresh every registered URI on `interval` until `cancel` fires.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; registration already loaded.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("JWKS refresher stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        for uri in cache.uris() {
                            let _ = cache.refresh(&uri).await;
                        }
                    }
                }
            }
        })
    }

    async fn fetch(&self, jwks_uri: &str) -> Result<JwkSet> {
        let response = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| Error::DiscoveryFailed(format!("GET {jwks_uri}: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::DiscoveryFailed(format!(
                "GET {jwks_uri} returned {status}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::DiscoveryFailed(format!("invalid JWKS at {jwks_uri}: {e}")))
    }

    fn store(&self, jwks_uri: &str, keys: JwkSet) {
        self.inner.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys: Arc::new(keys),
                fetched_at: Instant::now(),
            },
        );
    }
}

fn select_key<'a>(set: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => set.find(kid),
        None if set.keys.len() == 1 => set.keys.first(),
        None => None,
    }
}

/// Convert an asymmetric JWK into a decoding key; symmetric keys are refused.
pub fn decoding_key(jwk: &Jwk) -> Result<DecodingKey> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(_)
        | AlgorithmParameters::EllipticCurve(_)
        | AlgorithmParameters::OctetKeyPair(_) => DecodingKey::from_jwk(jwk)
            .map_err(|e| Error::TokenParse(format!("unusable JWK: {e}"))),
        AlgorithmParameters::OctetKey(_) => {
            Err(Error::TokenParse("symmetric JWK not accepted".to_string()))
        }
    }
}
