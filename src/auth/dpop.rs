//! DPoP proof validation.
//!
//! # Checks, in order
//!
//! | Step | Failure |
//! |------|---------|
//! | exactly one `DPoP` header | [`DpopError::MissingProof`], [`DpopError::MultipleProofs`] |
//! | token carries `cnf.jkt` | [`DpopError::MissingConfirmation`] |
//! | `typ == dpop+jwt` | [`DpopError::WrongType`] |
//! | asymmetric, whitelisted `alg` | [`DpopError::DisallowedAlgorithm`] |
//! | embedded JWK is public | [`DpopError::PrivateKey`] |
//! | JWK thumbprint equals `cnf.jkt` | [`DpopError::ThumbprintMismatch`] |
//! | signature verifies with the JWK | [`DpopError::InvalidSignature`] |
//! | `iat` within the skew window | [`DpopError::Expired`], [`DpopError::IssuedInFuture`] |
//! | `htm`, `htu`, `ath` bind the request | [`DpopError::HtmMismatch`], [`DpopError::HtuMismatch`], [`DpopError::AthMismatch`] |

use std::collections::BTreeMap;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{Algorithm, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Required JWS `typ`.
pub const DPOP_TYP: &str = "dpop+jwt";

/// DPoP validation failures; each maps to unauthenticated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DpopError {
    /// No `DPoP` header although one is required
    #[error("DPoP proof missing")]
    MissingProof,
    /// More than one `DPoP` header
    #[error("got {0} DPoP headers, expected 1")]
    MultipleProofs(usize),
    /// Access token lacks `cnf.jkt`
    #[error("missing cnf.jkt claim in access token")]
    MissingConfirmation,
    /// Proof is not a compact JWS with a JSON header
    #[error("invalid DPoP JWT: {0}")]
    Malformed(String),
    /// `typ` header is wrong
    #[error("invalid typ on DPoP JWT: {0}")]
    WrongType(String),
    /// Symmetric, `none`, or unknown `alg`
    #[error("algorithm not allowed for DPoP: {0}")]
    DisallowedAlgorithm(String),
    /// Header has no usable `jwk`
    #[error("JWK missing or invalid in DPoP JWT: {0}")]
    InvalidKey(String),
    /// Embedded JWK carries private material
    #[error("cannot use a private key for DPoP")]
    PrivateKey,
    /// JWK thumbprint differs from `cnf.jkt`
    #[error("DPoP key thumbprint does not match cnf.jkt")]
    ThumbprintMismatch,
    /// Signature did not verify
    #[error("failed to verify signature on DPoP JWT: {0}")]
    InvalidSignature(String),
    /// A required claim is absent
    #[error("missing {0} claim in DPoP JWT")]
    MissingClaim(&'static str),
    /// `iat` older than the skew window
    #[error("DPoP JWT has expired (iat too old)")]
    Expired,
    /// `iat` newer than the skew window
    #[error("\"iat\" not satisfied: DPoP JWT issued in the future")]
    IssuedInFuture,
    /// `htm` differs from the request method
    #[error("incorrect htm claim in DPoP JWT")]
    HtmMismatch,
    /// `htu` differs from every acceptable request URI
    #[error("incorrect htu claim in DPoP JWT")]
    HtuMismatch,
    /// `ath` differs from the access-token hash
    #[error("incorrect ath claim in DPoP JWT")]
    AthMismatch,
}

/// What the proof must bind to.
#[derive(Debug, Clone, Default)]
pub struct ProofTarget {
    /// Acceptable `htm` values
    pub methods: Vec<String>,
    /// Acceptable `htu` values
    pub uris: Vec<String>,
}

impl ProofTarget {
    /// Single method and URI.
    #[must_use]
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            methods: vec![method.into()],
            uris: vec![uri.into()],
        }
    }
}

/// A proof that passed every check.
#[derive(Debug, Clone)]
pub struct ValidatedProof {
    /// Embedded public key as sent
    pub jwk_json: serde_json::Value,
    /// RFC 7638 thumbprint of `jwk`
    pub thumbprint: String,
}

#[derive(Debug, Deserialize)]
struct ProofClaims {
    #[serde(default)]
    htm: Option<String>,
    #[serde(default)]
    htu: Option<String>,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    ath: Option<String>,
}

/// Stateless validator; one instance per authenticator.
#[derive(Debug, Clone)]
pub struct DpopValidator {
    skew: Duration,
}

impl DpopValidator {
    /// Validator accepting `iat` within `skew` of now.
    #[must_use]
    pub fn new(skew: Duration) -> Self {
        Self { skew }
    }

    /// Validate `proofs` (the `DPoP` header values) for a token.
    pub fn validate(
        &self,
        cnf_jkt: Option<&str>,
        raw_access_token: &str,
        proofs: &[String],
        target: &ProofTarget,
    ) -> Result<ValidatedProof, DpopError> {
        let proof = match proofs {
            [] => return Err(DpopError::MissingProof),
            [one] => one.as_str(),
            many => return Err(DpopError::MultipleProofs(many.len())),
        };
        let jkt = cnf_jkt.ok_or(DpopError::MissingConfirmation)?;

        let header = decode_header(proof)?;
        let typ = header.get("typ").and_then(|v| v.as_str()).unwrap_or_default();
        if typ != DPOP_TYP {
            return Err(DpopError::WrongType(typ.to_string()));
        }
        let alg = proof_algorithm(header.get("alg").and_then(|v| v.as_str()).unwrap_or("none"))?;

        let jwk_json = header
            .get("jwk")
            .filter(|v| v.is_object())
            .cloned()
            .ok_or_else(|| DpopError::InvalidKey("no jwk header".to_string()))?;
        if is_private_jwk(&jwk_json) {
            return Err(DpopError::PrivateKey);
        }
        let thumbprint = jwk_thumbprint(&jwk_json)?;
        if !ct_eq(&thumbprint, jkt) {
            return Err(DpopError::ThumbprintMismatch);
        }

        let claims = match alg {
            ProofAlgorithm::Jws(alg) => verify_jws(proof, &jwk_json, alg)?,
            ProofAlgorithm::Es512 => verify_es512(proof, &jwk_json)?,
        };

        let iat = claims.iat.ok_or(DpopError::MissingClaim("iat"))?;
        let skew = i64::try_from(self.skew.as_secs()).unwrap_or(i64::MAX);
        let now = chrono::Utc::now().timestamp();
        if iat.saturating_add(skew) < now {
            return Err(DpopError::Expired);
        }
        if iat > now.saturating_add(skew) {
            return Err(DpopError::IssuedInFuture);
        }

        let htm = claims.htm.ok_or(DpopError::MissingClaim("htm"))?;
        if !target.methods.iter().any(|m| *m == htm) {
            return Err(DpopError::HtmMismatch);
        }
        let htu = claims.htu.ok_or(DpopError::MissingClaim("htu"))?;
        if !target.uris.iter().any(|u| *u == htu) {
            return Err(DpopError::HtuMismatch);
        }
        let ath = claims.ath.ok_or(DpopError::MissingClaim("ath"))?;
        if !ct_eq(&ath, &access_token_hash(raw_access_token)) {
            return Err(DpopError::AthMismatch);
        }

        Ok(ValidatedProof {
            jwk_json,
            thumbprint,
        })
    }
}

/// `BASE64URL(SHA-256(token))` without padding.
#[must_use]
pub fn access_token_hash(raw_access_token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(raw_access_token.as_bytes()))
}

/// RFC 7638 SHA-256 thumbprint of a public JWK.
pub fn jwk_thumbprint(jwk: &serde_json::Value) -> Result<String, DpopError> {
    let member = |name: &'static str| {
        jwk.get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| DpopError::InvalidKey(format!("JWK member {name} missing")))
    };
    let kty = member("kty")?;
    let required: &[&'static str] = match kty {
        "EC" => &["crv", "kty", "x", "y"],
        "RSA" => &["e", "kty", "n"],
        "OKP" => &["crv", "kty", "x"],
        other => return Err(DpopError::InvalidKey(format!("unsupported kty {other}"))),
    };
    let mut canonical = BTreeMap::new();
    for name in required {
        canonical.insert(*name, member(name)?);
    }
    let json = serde_json::to_string(&canonical)
        .map_err(|e| DpopError::InvalidKey(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(json.as_bytes())))
}

fn decode_header(proof: &str) -> Result<serde_json::Value, DpopError> {
    let mut parts = proof.split('.');
    let (Some(head), Some(_), Some(_), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(DpopError::Malformed("expected three dot-separated parts".to_string()));
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(head)
        .map_err(|e| DpopError::Malformed(format!("header encoding: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| DpopError::Malformed(format!("header json: {e}")))
}

/// Whitelisted proof algorithm and the library that verifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProofAlgorithm {
    Jws(Algorithm),
    /// P-521, which jsonwebtoken cannot verify
    Es512,
}

fn proof_algorithm(alg: &str) -> Result<ProofAlgorithm, DpopError> {
    let alg = match alg {
        "RS256" => Algorithm::RS256,
        "RS384" => Algorithm::RS384,
        "RS512" => Algorithm::RS512,
        "PS256" => Algorithm::PS256,
        "PS384" => Algorithm::PS384,
        "PS512" => Algorithm::PS512,
        "ES256" => Algorithm::ES256,
        "ES384" => Algorithm::ES384,
        "ES512" => return Ok(ProofAlgorithm::Es512),
        other => return Err(DpopError::DisallowedAlgorithm(other.to_string())),
    };
    Ok(ProofAlgorithm::Jws(alg))
}

fn verify_jws(proof: &str, jwk_json: &serde_json::Value, alg: Algorithm) -> Result<ProofClaims, DpopError> {
    let jwk: Jwk =
        serde_json::from_value(jwk_json.clone()).map_err(|e| DpopError::InvalidKey(e.to_string()))?;
    let key = crate::oidc::jwks::decoding_key(&jwk).map_err(|e| DpopError::InvalidKey(e.to_string()))?;
    let mut validation = Validation::new(alg);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    jsonwebtoken::decode::<ProofClaims>(proof, &key, &validation)
        .map(|data| data.claims)
        .map_err(|e| DpopError::InvalidSignature(e.to_string()))
}

fn verify_es512(proof: &str, jwk_json: &serde_json::Value) -> Result<ProofClaims, DpopError> {
    let map = jwk_json
        .as_object()
        .cloned()
        .ok_or_else(|| DpopError::InvalidKey("jwk is not an object".to_string()))?;
    let jwk = josekit::jwk::Jwk::from_map(map).map_err(|e| DpopError::InvalidKey(e.to_string()))?;
    let verifier = josekit::jws::ES512
        .verifier_from_jwk(&jwk)
        .map_err(|e| DpopError::InvalidKey(e.to_string()))?;
    let (payload, _) = josekit::jws::deserialize_compact(proof, &verifier)
        .map_err(|e| DpopError::InvalidSignature(e.to_string()))?;
    serde_json::from_slice(&payload).map_err(|e| DpopError::Malformed(format!("claims json: {e}")))
}

fn is_private_jwk(jwk: &serde_json::Value) -> bool {
    ["d", "p", "q", "dp", "dq", "qi", "k"]
        .iter()
        .any(|m| jwk.get(m).is_some())
}

fn ct_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}
