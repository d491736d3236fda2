//! Token endpoint client: client credentials and RFC 8693 token exchange.
//!
//! Requests are `application/x-www-form-urlencoded`. When a [`DpopKey`] is
//! configured every request carries a `DPoP` proof; a `400` answered with a
//! `DPoP-Nonce` header is retried once with that nonce in the proof.

use std::fmt;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::dpop::{DPOP_TYP, access_token_hash, jwk_thumbprint};
use crate::config::REDACTED;
use crate::{Error, Result};

/// `grant_type` for client credentials.
pub const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";
/// `grant_type` for token exchange.
pub const GRANT_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
/// `client_assertion_type` for signed JWT client authentication.
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
/// Token type of an OAuth access token.
pub const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";
/// Response header carrying a server-issued DPoP nonce.
pub const DPOP_NONCE_HEADER: &str = "DPoP-Nonce";

/// EC P-256 key used to sign DPoP proofs.
pub struct DpopKey {
    encoding: EncodingKey,
    jwk: serde_json::Value,
    thumbprint: String,
}

impl fmt::Debug for DpopKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DpopKey")
            .field("thumbprint", &self.thumbprint)
            .finish_non_exhaustive()
    }
}

impl DpopKey {
    /// Fresh ephemeral key.
    pub fn generate() -> Result<Self> {
        let pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Internal(format!("DPoP key generation failed: {e}")))?;
        Self::from_key_pair(&pair)
    }

    /// Key from a PKCS#8 PEM holding an EC P-256 private key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let pair = rcgen::KeyPair::from_pem(pem)
            .map_err(|e| Error::Config(format!("invalid DPoP key: {e}")))?;
        Self::from_key_pair(&pair)
    }

    fn from_key_pair(pair: &rcgen::KeyPair) -> Result<Self> {
        let raw = pair.public_key_raw();
        // Uncompressed SEC1 point: 0x04 || x || y
        if raw.len() != 65 || raw[0] != 0x04 {
            return Err(Error::Config("DPoP key must be EC P-256".to_string()));
        }
        let jwk = serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": URL_SAFE_NO_PAD.encode(&raw[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&raw[33..65]),
        });
        let thumbprint = jwk_thumbprint(&jwk).map_err(|e| Error::Internal(e.to_string()))?;
        let encoding = EncodingKey::from_ec_pem(pair.serialize_pem().as_bytes())
            .map_err(|e| Error::Internal(format!("DPoP key encoding failed: {e}")))?;
        Ok(Self {
            encoding,
            jwk,
            thumbprint,
        })
    }

    /// Public JWK.
    #[must_use]
    pub fn public_jwk(&self) -> &serde_json::Value {
        &self.jwk
    }

    /// RFC 7638 thumbprint; the value a bound token carries in `cnf.jkt`.
    #[must_use]
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Signed proof for `htm`/`htu`, optionally bound to `access_token` and a nonce.
    pub fn proof(
        &self,
        htm: &str,
        htu: &str,
        access_token: Option<&str>,
        nonce: Option<&str>,
    ) -> Result<String> {
        let mut header = Header::new(Algorithm::ES256);
        header.typ = Some(DPOP_TYP.to_string());
        let jwk: Jwk = serde_json::from_value(self.jwk.clone())?;
        header.jwk = Some(jwk);

        let mut claims = serde_json::json!({
            "jti": uuid::Uuid::new_v4().to_string(),
            "htm": htm,
            "htu": htu,
            "iat": chrono::Utc::now().timestamp(),
        });
        if let Some(token) = access_token {
            claims["ath"] = access_token_hash(token).into();
        }
        if let Some(nonce) = nonce {
            claims["nonce"] = nonce.into();
        }
        jsonwebtoken::encode(&header, &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("signing DPoP proof failed: {e}")))
    }
}

/// How the client authenticates at the token endpoint.
#[derive(Clone, Default)]
pub enum ClientAuth {
    /// Public client: `client_id` only
    #[default]
    None,
    /// HTTP Basic with the client secret
    Secret(String),
    /// Pre-signed JWT sent as `client_assertion`
    Assertion(String),
}

impl fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Secret(_) => write!(f, "Secret({REDACTED})"),
            Self::Assertion(_) => write!(f, "Assertion({REDACTED})"),
        }
    }
}

/// Token endpoint response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Issued token
    pub access_token: String,
    /// `Bearer` or `DPoP`
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Token type URI (token exchange only)
    #[serde(default)]
    pub issued_token_type: Option<String>,
    /// Granted scope
    #[serde(default)]
    pub scope: Option<String>,
}

/// RFC 8693 exchange parameters.
#[derive(Debug, Clone, Default)]
pub struct TokenExchangeRequest {
    /// Token being exchanged
    pub subject_token: String,
    /// Its type URI; defaults to [`ACCESS_TOKEN_TYPE`]
    pub subject_token_type: Option<String>,
    /// Acting party token
    pub actor_token: Option<String>,
    /// Actor token type URI
    pub actor_token_type: Option<String>,
    /// Target audiences, each sent as its own `audience` field
    pub audience: Vec<String>,
    /// Requested scopes
    pub scope: Vec<String>,
}

/// Token endpoint client bound to one client identity.
#[derive(Debug)]
pub struct TokenClient {
    http: Client,
    token_endpoint: String,
    client_id: String,
    auth: ClientAuth,
    dpop: Option<Arc<DpopKey>>,
}

impl TokenClient {
    /// Client for `token_endpoint` as `client_id`.
    #[must_use]
    pub fn new(http: Client, token_endpoint: impl Into<String>, client_id: impl Into<String>, auth: ClientAuth) -> Self {
        Self {
            http,
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            auth,
            dpop: None,
        }
    }

    /// Sign every request with `key`.
    #[must_use]
    pub fn with_dpop(mut self, key: impl Into<Arc<DpopKey>>) -> Self {
        self.dpop = Some(key.into());
        self
    }

    /// DPoP key in use; issued DPoP tokens are bound to it.
    #[must_use]
    pub fn dpop_key(&self) -> Option<&Arc<DpopKey>> {
        self.dpop.as_ref()
    }

    /// Client-credentials grant.
    pub async fn client_credentials(&self, scope: &[String]) -> Result<TokenResponse> {
        let mut params = vec![("grant_type", GRANT_CLIENT_CREDENTIALS.to_string())];
        if !scope.is_empty() {
            params.push(("scope", scope.join(" ")));
        }
        self.post_form(params).await
    }

    /// Token exchange grant.
    pub async fn exchange(&self, request: &TokenExchangeRequest) -> Result<TokenResponse> {
        let mut params = vec![
            ("grant_type", GRANT_TOKEN_EXCHANGE.to_string()),
            ("subject_token", request.subject_token.clone()),
            (
                "subject_token_type",
                request
                    .subject_token_type
                    .clone()
                    .unwrap_or_else(|| ACCESS_TOKEN_TYPE.to_string()),
            ),
        ];
        if let Some(actor) = &request.actor_token {
            params.push(("actor_token", actor.clone()));
            params.push((
                "actor_token_type",
                request
                    .actor_token_type
                    .clone()
                    .unwrap_or_else(|| ACCESS_TOKEN_TYPE.to_string()),
            ));
        }
        for audience in &request.audience {
            params.push(("audience", audience.clone()));
        }
        if !request.scope.is_empty() {
            params.push(("scope", request.scope.join(" ")));
        }
        self.post_form(params).await
    }

    async fn post_form(&self, mut params: Vec<(&'static str, String)>) -> Result<TokenResponse> {
        params.push(("client_id", self.client_id.clone()));
        if let ClientAuth::Assertion(assertion) = &self.auth {
            params.push(("client_assertion", assertion.clone()));
            params.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()));
        }

        let mut nonce: Option<String> = None;
        loop {
            let mut request = self.http.post(&self.token_endpoint).form(&params);
            if let ClientAuth::Secret(secret) = &self.auth {
                request = request.basic_auth(&self.client_id, Some(secret));
            }
            if let Some(key) = &self.dpop {
                request = request.header(
                    "DPoP",
                    key.proof("POST", &self.token_endpoint, None, nonce.as_deref())?,
                );
            }

            let response = request.send().await.map_err(|e| {
                Error::TokenExchangeFailed(format!("POST {}: {e}", self.token_endpoint))
            })?;
            let status = response.status();

            if status == StatusCode::BAD_REQUEST && self.dpop.is_some() && nonce.is_none() {
                if let Some(server_nonce) = response
                    .headers()
                    .get(DPOP_NONCE_HEADER)
                    .and_then(|v| v.to_str().ok())
                {
                    debug!(endpoint = %self.token_endpoint, "Token endpoint requested a DPoP nonce, retrying");
                    nonce = Some(server_nonce.to_string());
                    continue;
                }
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                warn!(endpoint = %self.token_endpoint, status = %status, "Token request rejected");
                return Err(Error::TokenExchangeFailed(format!(
                    "token endpoint returned {status}: {body}"
                )));
            }

            return response.json().await.map_err(|e| {
                Error::TokenExchangeFailed(format!("invalid token response: {e}"))
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_thumbprint_matches_jwk() {
        // GIVEN: an ephemeral key
        let key = DpopKey::generate().unwrap();

        // THEN: its thumbprint is the RFC 7638 hash of its public JWK
        assert_eq!(key.thumbprint(), jwk_thumbprint(key.public_jwk()).unwrap());
        assert!(key.public_jwk().get("d").is_none());
    }

    #[test]
    fn proof_carries_nonce_and_ath() {
        // GIVEN: a key
        let key = DpopKey::generate().unwrap();

        // WHEN: a proof is built with a token and a nonce
        let proof = key
            .proof("POST", "https://idp/token", Some("tok"), Some("n-1"))
            .unwrap();

        // THEN: the payload carries the bindings
        let payload = proof.split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
        assert_eq!(claims["htm"], "POST");
        assert_eq!(claims["htu"], "https://idp/token");
        assert_eq!(claims["nonce"], "n-1");
        assert_eq!(claims["ath"], access_token_hash("tok"));
    }

    #[test]
    fn client_auth_debug_is_redacted() {
        let rendered = format!("{:?}", ClientAuth::Secret("s3cr3t".into()));
        assert!(!rendered.contains("s3cr3t"));
        assert!(rendered.contains(REDACTED));
    }
}
