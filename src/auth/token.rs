//! Access-token parsing and verification.
//!
//! # Verification flow
//!
//! 1. Parse the `Authorization` header (`Bearer` or `DPoP`, case-insensitive).
//! 2. Read `iss` without verification and require it in the allow-list.
//! 3. Fetch the issuer's signing key from the JWKS cache by `kid`.
//! 4. Verify signature, `exp`/`nbf` with the configured skew, and the
//!    required claims (`iss`, `sub`, `aud`, `exp`, `iat`).
//! 5. Require the configured audience in `aud`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, header::AUTHORIZATION};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use serde_json::{Map, Value};

use crate::oidc::jwks::JwksCache;
use crate::{Error, Result};

/// Scheme the token was presented with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    /// `Authorization: Bearer`
    Bearer,
    /// `Authorization: DPoP`
    DPoP,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer => f.write_str("Bearer"),
            Self::DPoP => f.write_str("DPoP"),
        }
    }
}

/// Token text and scheme from the `Authorization` header.
#[derive(Clone, PartialEq, Eq)]
pub struct RawToken {
    /// Compact JWT
    pub raw: String,
    /// Presentation scheme
    pub token_type: TokenType,
}

impl fmt::Debug for RawToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawToken")
            .field("token_type", &self.token_type)
            .field("len", &self.raw.len())
            .finish()
    }
}

/// Extract the token from exactly one `Authorization` header.
pub fn parse_authorization(headers: &HeaderMap) -> Result<RawToken> {
    let mut values = headers.get_all(AUTHORIZATION).iter();
    let Some(value) = values.next() else {
        return Err(Error::TokenParse("missing authorization header".to_string()));
    };
    if values.next().is_some() {
        return Err(Error::TokenParse("more than one authorization header".to_string()));
    }
    let value = value
        .to_str()
        .map_err(|_| Error::TokenParse("authorization header is not ASCII".to_string()))?;
    let (scheme, token) = value
        .split_once(' ')
        .ok_or_else(|| Error::TokenParse("not of type bearer or dpop".to_string()))?;
    let token_type = if scheme.eq_ignore_ascii_case("bearer") {
        TokenType::Bearer
    } else if scheme.eq_ignore_ascii_case("dpop") {
        TokenType::DPoP
    } else {
        return Err(Error::TokenParse("not of type bearer or dpop".to_string()));
    };
    let token = token.trim();
    if token.is_empty() {
        return Err(Error::TokenParse("empty token".to_string()));
    }
    Ok(RawToken {
        raw: token.to_string(),
        token_type,
    })
}

/// A parsed JWT access token; immutable once built.
#[derive(Clone)]
pub struct AccessToken {
    raw: String,
    token_type: TokenType,
    claims: Map<String, Value>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("iss", &self.issuer())
            .field("sub", &self.subject())
            .field("token_type", &self.token_type)
            .finish_non_exhaustive()
    }
}

impl AccessToken {
    /// Decode the payload without checking the signature.
    ///
    /// Only for tokens verified elsewhere (entity chains) or for routing
    /// before verification.
    pub fn parse_unverified(raw: &str) -> Result<Self> {
        let mut parts = raw.split('.');
        let (Some(_), Some(payload), Some(_), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::TokenParse("token is not a compact JWS".to_string()));
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| Error::TokenParse(format!("token payload encoding: {e}")))?;
        let claims: Map<String, Value> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::TokenParse(format!("token payload: {e}")))?;
        Ok(Self {
            raw: raw.to_string(),
            token_type: TokenType::Bearer,
            claims,
        })
    }

    /// Token built from a claim set (tests and offline checks).
    #[must_use]
    pub fn from_claims(claims: Map<String, Value>) -> Self {
        Self {
            raw: String::new(),
            token_type: TokenType::Bearer,
            claims,
        }
    }

    /// Compact JWT as presented.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Presentation scheme.
    #[must_use]
    pub fn token_type(&self) -> TokenType {
        self.token_type
    }

    /// All claims.
    #[must_use]
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    /// Top-level claim.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    /// String-valued top-level claim.
    #[must_use]
    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }

    /// `iss`
    #[must_use]
    pub fn issuer(&self) -> Option<&str> {
        self.claim_str("iss")
    }

    /// `sub`
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.claim_str("sub")
    }

    /// `aud` as a list; a single string becomes one entry.
    #[must_use]
    pub fn audience(&self) -> Vec<&str> {
        match self.claims.get("aud") {
            Some(Value::String(s)) => vec![s.as_str()],
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// `azp`, falling back to `client_id` and `cid`.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        ["azp", "client_id", "cid"]
            .iter()
            .find_map(|c| self.claim_str(c))
    }

    /// `cnf` claim present at all.
    #[must_use]
    pub fn has_confirmation(&self) -> bool {
        self.claims.contains_key("cnf")
    }

    /// `cnf.jkt` when present and a string.
    #[must_use]
    pub fn cnf_jkt(&self) -> Option<&str> {
        self.claims
            .get("cnf")
            .and_then(|c| c.get("jkt"))
            .and_then(Value::as_str)
    }
}

/// Verifies tokens from a fixed set of issuers.
pub struct TokenVerifier {
    issuers: HashMap<String, String>,
    jwks: Arc<JwksCache>,
    audience: String,
    skew: Duration,
}

impl TokenVerifier {
    /// `issuers` maps each accepted `iss` to its `jwks_uri`.
    #[must_use]
    pub fn new(
        issuers: HashMap<String, String>,
        jwks: Arc<JwksCache>,
        audience: impl Into<String>,
        skew: Duration,
    ) -> Self {
        Self {
            issuers,
            jwks,
            audience: audience.into(),
            skew,
        }
    }

    /// Accepted issuers.
    pub fn issuers(&self) -> impl Iterator<Item = &str> {
        self.issuers.keys().map(String::as_str)
    }

    /// Verify `token` and return its claims.
    pub async fn verify(&self, token: &RawToken) -> Result<AccessToken> {
        let header = jsonwebtoken::decode_header(&token.raw)
            .map_err(|e| Error::TokenParse(format!("invalid token header: {e}")))?;
        let unverified = AccessToken::parse_unverified(&token.raw)?;
        let iss = unverified
            .issuer()
            .ok_or_else(|| Error::TokenClaim("\"iss\" claim missing".to_string()))?;
        let jwks_uri = self
            .issuers
            .get(iss)
            .ok_or_else(|| Error::TokenClaim(format!("\"iss\" not satisfied: {iss} is not accepted")))?;

        let alg = token_algorithm(header.alg)?;
        let key = self.jwks.decoding_key(jwks_uri, header.kid.as_deref()).await?;

        let mut validation = Validation::new(alg);
        validation.leeway = self.skew.as_secs();
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "iss", "sub", "aud"]);
        validation.set_issuer(&[iss]);

        let data = jsonwebtoken::decode::<Map<String, Value>>(&token.raw, &key, &validation)
            .map_err(claim_error)?;
        let verified = AccessToken {
            raw: token.raw.clone(),
            token_type: token.token_type,
            claims: data.claims,
        };

        if !verified.audience().iter().any(|a| *a == self.audience) {
            return Err(Error::TokenClaim(format!(
                "\"aud\" not satisfied: {} not in audience",
                self.audience
            )));
        }
        let iat = verified
            .claim("iat")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::TokenClaim("\"iat\" claim missing".to_string()))?;
        let skew = i64::try_from(self.skew.as_secs()).unwrap_or(i64::MAX);
        if iat > chrono::Utc::now().timestamp().saturating_add(skew) {
            return Err(Error::TokenClaim("\"iat\" not satisfied: issued in the future".to_string()));
        }
        Ok(verified)
    }
}

fn token_algorithm(alg: Algorithm) -> Result<Algorithm> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512
        | Algorithm::ES256
        | Algorithm::ES384
        | Algorithm::EdDSA => Ok(alg),
        other => Err(Error::TokenParse(format!("token algorithm {other:?} not accepted"))),
    }
}

fn claim_error(e: jsonwebtoken::errors::Error) -> Error {
    match e.kind() {
        ErrorKind::ExpiredSignature => Error::TokenClaim("\"exp\" not satisfied: token expired".to_string()),
        ErrorKind::ImmatureSignature => Error::TokenClaim("\"nbf\" not satisfied".to_string()),
        ErrorKind::InvalidIssuer => Error::TokenClaim("\"iss\" not satisfied".to_string()),
        ErrorKind::MissingRequiredClaim(c) => Error::TokenClaim(format!("\"{c}\" claim missing")),
        _ => Error::TokenParse(format!("token verification failed: {e}")),
    }
}
