//! UserInfo cache keyed by (issuer, subject).
//!
//! A miss obtains a [`UserInfoCredential`] and fetches `userinfo_endpoint`
//! with it. Concurrent misses on the same key wait for a single credential
//! lookup and a single upstream call. Upstream failures are returned as-is;
//! an expired entry is never served in their place.
//!
//! Entries that are never read again are removed by [`UserInfoCache::evict_expired`],
//! which [`UserInfoCache::spawn_sweeper`] runs periodically.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use reqwest::Client;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::token_client::DpopKey;
use crate::{Error, Result};

/// Shortest sweep period; `tokio::time::interval` rejects zero.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// UserInfo document and the bytes it was parsed from.
#[derive(Debug, Clone)]
pub struct UserInfo {
    /// Parsed claims
    pub claims: serde_json::Value,
    /// Raw response body
    pub raw: Arc<[u8]>,
}

/// Token presented to the UserInfo endpoint.
#[derive(Debug, Clone)]
pub struct UserInfoCredential {
    /// Access token
    pub access_token: String,
    /// Key the token is bound to; adds a `DPoP` proof and the `DPoP` scheme
    pub dpop: Option<Arc<DpopKey>>,
}

impl UserInfoCredential {
    /// Plain bearer token.
    #[must_use]
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            dpop: None,
        }
    }

    /// Token bound to `key`.
    #[must_use]
    pub fn dpop(access_token: impl Into<String>, key: Arc<DpopKey>) -> Self {
        Self {
            access_token: access_token.into(),
            dpop: Some(key),
        }
    }
}

struct Entry {
    info: UserInfo,
    stored_at: Instant,
}

/// TTL-bounded UserInfo cache with single-flight population.
pub struct UserInfoCache {
    http: Client,
    ttl: Duration,
    endpoints: DashMap<String, String>,
    entries: DashMap<String, Entry>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

/// Cache key: base64url(issuer) followed by base64url(subject).
#[must_use]
pub fn cache_key(issuer: &str, subject: &str) -> String {
    format!(
        "{}{}",
        URL_SAFE_NO_PAD.encode(issuer),
        URL_SAFE_NO_PAD.encode(subject)
    )
}

impl UserInfoCache {
    /// Empty cache.
    #[must_use]
    pub fn new(http: Client, ttl: Duration) -> Self {
        Self {
            http,
            ttl,
            endpoints: DashMap::new(),
            entries: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    /// Record the UserInfo endpoint for `issuer`.
    pub fn register_issuer(&self, issuer: &str, userinfo_endpoint: &str) {
        self.endpoints
            .insert(issuer.to_string(), userinfo_endpoint.to_string());
    }

    /// Fresh cached entry, if any.
    #[must_use]
    pub fn get_from_cache(&self, issuer: &str, subject: &str) -> Option<UserInfo> {
        let key = cache_key(issuer, subject);
        let entry = self.entries.get(&key)?;
        if entry.stored_at.elapsed() < self.ttl {
            return Some(entry.info.clone());
        }
        drop(entry);
        self.entries.remove(&key);
        None
    }

    /// Cached entry or a single-flight fetch with `access_token` as a bearer token.
    pub async fn get(&self, issuer: &str, subject: &str, access_token: &str) -> Result<UserInfo> {
        self.get_with(issuer, subject, || async {
            Ok(UserInfoCredential::bearer(access_token))
        })
        .await
    }

    /// Cached entry or a single-flight fetch.
    ///
    /// `credential` runs only on a miss, inside the single-flight section, so
    /// concurrent misses share one credential lookup as well as one fetch.
    pub async fn get_with<F, Fut>(&self, issuer: &str, subject: &str, credential: F) -> Result<UserInfo>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UserInfoCredential>>,
    {
        if let Some(hit) = self.get_from_cache(issuer, subject) {
            return Ok(hit);
        }

        let key = cache_key(issuer, subject);
        let lock = Arc::clone(self.inflight.entry(key.clone()).or_default().value());
        let result = {
            let _guard = lock.lock().await;
            // Another caller may have filled the entry while we waited.
            match self.get_from_cache(issuer, subject) {
                Some(hit) => Ok(hit),
                None => self.populate(&key, issuer, credential).await,
            }
        };
        drop(lock);
        self.inflight.remove_if(&key, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn populate<F, Fut>(&self, key: &str, issuer: &str, credential: F) -> Result<UserInfo>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UserInfoCredential>>,
    {
        let credential = credential().await?;
        let info = self.fetch(issuer, &credential).await?;
        self.entries.insert(
            key.to_string(),
            Entry {
                info: info.clone(),
                stored_at: Instant::now(),
            },
        );
        Ok(info)
    }

    /// Remove expired entries and idle single-flight locks; returns the
    /// number of entries removed.
    pub fn evict_expired(&self) -> usize {
        let mut evicted = 0;
        self.entries.retain(|_, entry| {
            let fresh = entry.stored_at.elapsed() < self.ttl;
            if !fresh {
                evicted += 1;
            }
            fresh
        });
        self.inflight.retain(|_, lock| Arc::strong_count(lock) > 1);
        evicted
    }

    /// Run [`Self::evict_expired`] every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_SWEEP_INTERVAL));
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("UserInfo sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let evicted = cache.evict_expired();
                        if evicted > 0 {
                            debug!(evicted, remaining = cache.len(), "Evicted expired userinfo entries");
                        }
                    }
                }
            }
        })
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of cached entries, stale ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn fetch(&self, issuer: &str, credential: &UserInfoCredential) -> Result<UserInfo> {
        let endpoint = self
            .endpoints
            .get(issuer)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::UserInfoFailed(format!("no userinfo endpoint for {issuer}")))?;
        debug!(issuer = %issuer, endpoint = %endpoint, "Fetching userinfo");

        let token = credential.access_token.as_str();
        let request = match &credential.dpop {
            Some(key) => self
                .http
                .get(&endpoint)
                .header(reqwest::header::AUTHORIZATION, format!("DPoP {token}"))
                .header("DPoP", key.proof("GET", &endpoint, Some(token), None)?),
            None => self.http.get(&endpoint).bearer_auth(token),
        };
        let response = request
            .send()
            .await
            .map_err(|e| Error::UserInfoFailed(format!("GET {endpoint}: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UserInfoFailed(format!(
                "GET {endpoint} returned {status}: {body}"
            )));
        }
        let raw = response
            .bytes()
            .await
            .map_err(|e| Error::UserInfoFailed(format!("reading userinfo body: {e}")))?;
        let claims = serde_json::from_slice(&raw)
            .map_err(|e| Error::UserInfoFailed(format!("invalid userinfo document: {e}")))?;
        Ok(UserInfo {
            claims,
            raw: Arc::from(raw.as_ref()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_separates_issuer_and_subject() {
        // GIVEN: two pairs whose plain concatenation would collide
        let a = cache_key("https://idp/a", "bc");
        let b = cache_key("https://idp/ab", "c");

        // THEN: the encoded keys differ
        assert_ne!(a, b);
        assert!(a.starts_with(&URL_SAFE_NO_PAD.encode("https://idp/a")));
    }

    #[tokio::test]
    async fn expired_entries_are_not_served() {
        // GIVEN: a cache with a zero TTL holding one entry
        let cache = UserInfoCache::new(Client::new(), Duration::ZERO);
        cache.entries.insert(
            cache_key("iss", "sub"),
            Entry {
                info: UserInfo {
                    claims: serde_json::json!({"sub": "sub"}),
                    raw: Arc::from(&b"{}"[..]),
                },
                stored_at: Instant::now(),
            },
        );

        // THEN: lookups miss and the entry is evicted
        assert!(cache.get_from_cache("iss", "sub").is_none());
        assert!(cache.is_empty());
    }

    fn entry(stored_at: Instant) -> Entry {
        Entry {
            info: UserInfo {
                claims: serde_json::json!({"sub": "sub"}),
                raw: Arc::from(&b"{}"[..]),
            },
            stored_at,
        }
    }

    #[test]
    fn evict_expired_drops_unread_entries_only() {
        // GIVEN: one entry past its TTL that nobody reads again, one fresh
        let cache = UserInfoCache::new(Client::new(), Duration::from_secs(60));
        let old = Instant::now()
            .checked_sub(Duration::from_secs(120))
            .unwrap();
        cache.entries.insert(cache_key("iss", "gone"), entry(old));
        cache.entries.insert(cache_key("iss", "kept"), entry(Instant::now()));
        cache.inflight.insert(cache_key("iss", "idle"), Arc::default());

        // WHEN: swept
        let evicted = cache.evict_expired();

        // THEN: only the stale entry and the idle lock are gone
        assert_eq!(evicted, 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_from_cache("iss", "kept").is_some());
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn sweeper_evicts_until_cancelled() {
        // GIVEN: a short TTL and a running sweeper
        let cache = Arc::new(UserInfoCache::new(Client::new(), Duration::from_millis(20)));
        cache.entries.insert(cache_key("iss", "sub"), entry(Instant::now()));
        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_millis(10), cancel.clone());

        // WHEN: the entry expires without ever being read
        tokio::time::sleep(Duration::from_millis(150)).await;

        // THEN: the sweeper removed it
        assert!(cache.is_empty());

        // AND: cancellation stops the task
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn credential_failure_is_returned_and_releases_the_lock() {
        let cache = UserInfoCache::new(Client::new(), Duration::from_secs(60));
        cache.register_issuer("iss", "http://127.0.0.1:9/userinfo");

        let err = cache
            .get_with("iss", "sub", || async {
                Err(Error::UserInfoFailed("exchange refused".to_string()))
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("exchange refused"), "{err}");
        assert!(cache.is_empty());
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn miss_without_endpoint_fails() {
        let cache = UserInfoCache::new(Client::new(), Duration::from_secs(60));
        let err = cache.get("iss", "sub", "token").await.unwrap_err();
        assert!(matches!(err, Error::UserInfoFailed(_)));
    }
}
