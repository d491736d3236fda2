//! Caller authentication: token verification, DPoP binding and UserInfo
//! enrichment.
//!
//! # DPoP target URIs
//!
//! The proof's `htu` must equal `<origin><path>` (or `<origin><path>?<query>`)
//! for one of the request's acceptable origins:
//!
//! 1. `Grpcgateway-Origin`, `Grpcgateway-Referer`, then `Origin`, reduced to
//!    `scheme://host[:port]`
//! 2. otherwise `server.public_hostname`
//! 3. otherwise the `Host` header (`:443` → `https://host`, `:80` →
//!    `http://host`, anything else under both schemes)
//!
//! Without any of these the bare path is accepted. The Rewrap RPC is also
//! reachable through the `/kas/v2/rewrap` gateway route, so both are accepted
//! there.

use std::sync::Arc;

use axum::http::{HeaderMap, Method, header::HOST};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::dpop::{DpopError, DpopValidator, ProofTarget, ValidatedProof};
use super::routes::RouteSet;
use super::token::{AccessToken, TokenVerifier, parse_authorization};
use crate::config::{AuthConfig, ServerConfig};
use crate::oidc::{
    ClientAuth, DpopKey, OidcProviders, TokenClient, TokenExchangeRequest, UserInfo, UserInfoCache, UserInfoCredential,
};
use crate::{Error, Result};

/// Header naming the DPoP proof.
pub const DPOP_HEADER: &str = "dpop";

const ORIGIN_HEADERS: &[&str] = &["grpcgateway-origin", "grpcgateway-referer", "origin"];

const REWRAP_RPC: &str = "/kas.AccessService/Rewrap";
const REWRAP_ROUTE: &str = "/kas/v2/rewrap";

/// The parts of a request authentication looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestParts<'a> {
    /// HTTP method
    pub method: &'a Method,
    /// URL path
    pub path: &'a str,
    /// URL query without `?`
    pub query: Option<&'a str>,
    /// Request headers
    pub headers: &'a HeaderMap,
}

/// Identity established for one request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Verified access token
    pub token: AccessToken,
    /// Bound DPoP key, when a proof was validated
    pub dpop: Option<ValidatedProof>,
    /// UserInfo claims, when enrichment is on
    pub userinfo: Option<UserInfo>,
}

impl AuthContext {
    /// UserInfo claims, if fetched.
    #[must_use]
    pub fn userinfo_claims(&self) -> Option<&Value> {
        self.userinfo.as_ref().map(|u| &u.claims)
    }
}

/// Exchanges the caller's token for one the platform may use against
/// UserInfo, then caches the result.
///
/// With a DPoP key on the exchange client, the exchange request carries a
/// proof and a DPoP-bound result is presented to UserInfo with a fresh proof
/// from the same key.
pub struct UserInfoEnricher {
    cache: Arc<UserInfoCache>,
    exchange: TokenClient,
    audience: String,
}

impl UserInfoEnricher {
    /// Enricher exchanging tokens as `exchange`'s client for `audience`.
    #[must_use]
    pub fn new(cache: Arc<UserInfoCache>, exchange: TokenClient, audience: impl Into<String>) -> Self {
        Self {
            cache,
            exchange,
            audience: audience.into(),
        }
    }

    /// UserInfo for the caller; cached per (issuer, subject).
    ///
    /// The exchange runs only on a cache miss, inside the cache's
    /// single-flight section.
    pub async fn fetch(&self, token: &AccessToken) -> Result<UserInfo> {
        let (Some(issuer), Some(subject)) = (token.issuer(), token.subject()) else {
            return Err(Error::UserInfoFailed("token lacks iss or sub".to_string()));
        };
        self.cache
            .get_with(issuer, subject, || self.exchange_for_userinfo(token))
            .await
            .map_err(|e| match e {
                Error::UserInfoFailed(_) => e,
                other => Error::UserInfoFailed(other.to_string()),
            })
    }

    async fn exchange_for_userinfo(&self, token: &AccessToken) -> Result<UserInfoCredential> {
        let exchanged = self
            .exchange
            .exchange(&TokenExchangeRequest {
                subject_token: token.raw().to_string(),
                audience: vec![self.audience.clone()],
                ..TokenExchangeRequest::default()
            })
            .await
            .map_err(|e| Error::UserInfoFailed(e.to_string()))?;
        let bound = exchanged
            .token_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("dpop"));
        Ok(match self.exchange.dpop_key() {
            Some(key) if bound => UserInfoCredential::dpop(exchanged.access_token, Arc::clone(key)),
            _ => UserInfoCredential::bearer(exchanged.access_token),
        })
    }
}

/// Authenticates requests against the configured issuers.
pub struct Authenticator {
    verifier: TokenVerifier,
    dpop: DpopValidator,
    enforce_dpop: bool,
    enricher: Option<UserInfoEnricher>,
    public_routes: RouteSet,
    ipc_routes: RouteSet,
    public_hostname: Option<String>,
}

impl Authenticator {
    /// Build from configuration and discovered providers.
    pub fn new(auth: &AuthConfig, server: &ServerConfig, providers: &OidcProviders) -> Result<Self> {
        let verifier = TokenVerifier::new(
            providers.jwks_uris(),
            Arc::clone(providers.jwks()),
            auth.audience.clone(),
            auth.token_skew,
        );
        let enricher = if auth.enrich_userinfo {
            let primary = providers
                .primary()
                .ok_or_else(|| Error::Config("no issuer available for UserInfo".to_string()))?;
            let client_id = auth
                .platform_client_id
                .clone()
                .ok_or_else(|| Error::Config("auth.platform_client_id is required".to_string()))?;
            let client_auth = auth
                .platform_client_secret
                .clone()
                .map_or(ClientAuth::None, ClientAuth::Secret);
            let exchange = TokenClient::new(
                providers.http().clone(),
                primary.require_token_endpoint()?,
                client_id.clone(),
                client_auth,
            )
            .with_dpop(DpopKey::generate()?);
            Some(UserInfoEnricher::new(Arc::clone(providers.userinfo()), exchange, client_id))
        } else {
            None
        };
        Ok(Self {
            verifier,
            dpop: DpopValidator::new(auth.dpop_skew),
            enforce_dpop: auth.enforce_dpop,
            enricher,
            public_routes: RouteSet::public(&auth.public_routes)?,
            ipc_routes: RouteSet::ipc_reauth(&auth.ipc_reauth_routes)?,
            public_hostname: server.public_hostname.clone(),
        })
    }

    /// Assemble from parts (tests, embedding).
    #[must_use]
    pub fn from_parts(
        verifier: TokenVerifier,
        dpop: DpopValidator,
        enforce_dpop: bool,
        public_routes: RouteSet,
    ) -> Self {
        Self {
            verifier,
            dpop,
            enforce_dpop,
            enricher: None,
            public_routes,
            ipc_routes: RouteSet::default(),
            public_hostname: None,
        }
    }

    /// Enable UserInfo enrichment.
    #[must_use]
    pub fn with_enricher(mut self, enricher: UserInfoEnricher) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Canonical server identity for `htu` when no origin header is sent.
    #[must_use]
    pub fn with_public_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.public_hostname = Some(hostname.into());
        self
    }

    /// Whether `path` bypasses authentication.
    #[must_use]
    pub fn is_public(&self, path: &str) -> bool {
        self.public_routes.matches(path)
    }

    /// Authenticate one request.
    pub async fn authenticate(&self, request: &RequestParts<'_>) -> Result<AuthContext> {
        let raw = parse_authorization(request.headers)?;
        let token = self.verifier.verify(&raw).await?;

        let dpop = if token.has_confirmation() || self.enforce_dpop {
            let proofs = dpop_proofs(request.headers)?;
            let target = self.proof_target(request);
            let proof = self.dpop.validate(token.cnf_jkt(), token.raw(), &proofs, &target)?;
            debug!(thumbprint = %proof.thumbprint, "DPoP proof bound");
            Some(proof)
        } else {
            None
        };

        let userinfo = match &self.enricher {
            Some(enricher) => Some(enricher.fetch(&token).await.inspect_err(|e| {
                warn!(sub = ?token.subject(), error = %e, "UserInfo enrichment failed");
            })?),
            None => None,
        };

        Ok(AuthContext {
            token,
            dpop,
            userinfo,
        })
    }

    /// Re-verify an in-process call on a re-auth route.
    ///
    /// Returns `None` for other routes. DPoP is not checked: in-process calls
    /// carry no proof.
    pub async fn ipc_reauth(&self, path: &str, headers: &HeaderMap) -> Result<Option<AccessToken>> {
        if !self.ipc_routes.matches(path) {
            return Ok(None);
        }
        let raw = parse_authorization(headers)?;
        self.verifier.verify(&raw).await.map(Some)
    }

    /// Acceptable methods and URIs for the request's proof.
    #[must_use]
    pub fn proof_target(&self, request: &RequestParts<'_>) -> ProofTarget {
        let origins = request_origins(request.headers, self.public_hostname.as_deref());
        let mut paths = vec![request.path];
        if request.path == REWRAP_RPC {
            paths.push(REWRAP_ROUTE);
        }
        let mut uris = Vec::new();
        let bases: Vec<&str> = if origins.is_empty() {
            vec![""]
        } else {
            origins.iter().map(String::as_str).collect()
        };
        for base in bases {
            for path in &paths {
                uris.push(format!("{base}{path}"));
                if let Some(query) = request.query.filter(|q| !q.is_empty()) {
                    uris.push(format!("{base}{path}?{query}"));
                }
            }
        }
        ProofTarget {
            methods: vec![request.method.as_str().to_string()],
            uris,
        }
    }
}

fn dpop_proofs(headers: &HeaderMap) -> Result<Vec<String>> {
    headers
        .get_all(DPOP_HEADER)
        .iter()
        .map(|v| {
            v.to_str()
                .map(str::to_string)
                .map_err(|_| Error::DPoP(DpopError::Malformed("non-ASCII DPoP header".to_string())))
        })
        .collect()
}

/// `scheme://host[:port]` of a URL, default ports dropped.
fn origin_of(value: &str) -> Option<String> {
    let url = Url::parse(value.trim()).ok()?;
    let origin = url.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

/// Acceptable origins for the request, most specific first.
pub fn request_origins(headers: &HeaderMap, public_hostname: Option<&str>) -> Vec<String> {
    for name in ORIGIN_HEADERS {
        if let Some(origin) = headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .and_then(origin_of)
        {
            return vec![origin];
        }
    }
    if let Some(origin) = public_hostname.and_then(origin_of) {
        return vec![origin];
    }
    let Some(host) = headers.get(HOST).and_then(|v| v.to_str().ok()) else {
        return Vec::new();
    };
    if let Some(h) = host.strip_suffix(":443") {
        vec![format!("https://{h}")]
    } else if let Some(h) = host.strip_suffix(":80") {
        vec![format!("http://{h}")]
    } else {
        vec![format!("https://{host}"), format!("http://{host}")]
    }
}
