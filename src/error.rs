//! Error types for the access pipeline

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

use crate::auth::dpop::DpopError;

/// Result type alias for the access pipeline
pub type Result<T> = std::result::Result<T, Error>;

/// Access pipeline errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or malformed `Authorization` header / token
    #[error("token parse error: {0}")]
    TokenParse(String),

    /// Token verified structurally but a claim check failed (iss, aud, exp, ...)
    #[error("token claim error: {0}")]
    TokenClaim(String),

    /// DPoP proof failed to bind
    #[error("dpop validation failed: {0}")]
    DPoP(#[from] DpopError),

    /// OIDC discovery or JWKS fetch failed
    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    /// UserInfo fetch failed
    #[error("userinfo request failed: {0}")]
    UserInfoFailed(String),

    /// Token endpoint request failed
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// A per-RPC resolver returned an error
    #[error("resolver failed for {rpc}: {reason}")]
    ResolverFailed {
        /// Full RPC path
        rpc: String,
        /// Resolver error text
        reason: String,
    },

    /// The authorizer denied the request
    #[error("permission denied: {0}")]
    AuthorizerDenied(String),

    /// The authorizer could not evaluate the request
    #[error("authorizer error: {0}")]
    AuthorizerInternal(String),

    /// Entity lookup found nothing and inference is off
    #[error("resource not found: {0}")]
    ErsNotFound(String),

    /// Entity backend failure
    #[error("entity resolution backend failed: {0}")]
    ErsBackendFailed(String),

    /// Invalid caller input
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Request was cancelled
    #[error("request cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wire status returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    /// Caller could not be authenticated
    Unauthenticated,
    /// Caller is authenticated but not allowed
    PermissionDenied,
    /// Entity or resource not found
    NotFound,
    /// Malformed request
    InvalidArgument,
    /// Request cancelled
    Canceled,
    /// Anything else
    Internal,
}

impl Code {
    /// HTTP status used by the JSON gateway surface.
    #[must_use]
    pub fn http_status(self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidArgument => StatusCode::BAD_REQUEST,
            // 499 Client Closed Request
            Self::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT),
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// gRPC-style code name carried in error bodies.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::InvalidArgument => "invalid_argument",
            Self::Canceled => "canceled",
            Self::Internal => "internal",
        }
    }

    /// Minimal externally visible message for this code.
    #[must_use]
    pub fn public_message(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission denied",
            Self::NotFound => "not found",
            Self::InvalidArgument => "invalid request",
            Self::Canceled => "canceled",
            Self::Internal => "internal error",
        }
    }
}

impl Error {
    /// Map this error onto the wire status.
    ///
    /// Resolver failures map to permission denied here; the interceptor may
    /// override that with `internal` when configured to.
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            Self::TokenParse(_)
            | Self::TokenClaim(_)
            | Self::DPoP(_)
            | Self::UserInfoFailed(_)
            | Self::TokenExchangeFailed(_) => Code::Unauthenticated,
            Self::AuthorizerDenied(_) | Self::ResolverFailed { .. } => Code::PermissionDenied,
            Self::ErsNotFound(_) => Code::NotFound,
            Self::InvalidRequest(_) => Code::InvalidArgument,
            Self::Cancelled => Code::Canceled,
            _ => Code::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_and_dpop_errors_are_unauthenticated() {
        assert_eq!(Error::TokenParse("x".into()).code(), Code::Unauthenticated);
        assert_eq!(Error::TokenClaim("exp".into()).code(), Code::Unauthenticated);
        assert_eq!(
            Error::DPoP(DpopError::HtuMismatch).code(),
            Code::Unauthenticated
        );
    }

    #[test]
    fn denial_and_resolver_errors_are_permission_denied() {
        assert_eq!(
            Error::AuthorizerDenied("no".into()).code(),
            Code::PermissionDenied
        );
        let err = Error::ResolverFailed {
            rpc: "/a.B/C".into(),
            reason: "boom".into(),
        };
        assert_eq!(err.code(), Code::PermissionDenied);
    }

    #[test]
    fn ers_errors_map_to_not_found_and_internal() {
        assert_eq!(Error::ErsNotFound("alice".into()).code(), Code::NotFound);
        assert_eq!(Error::ErsBackendFailed("down".into()).code(), Code::Internal);
    }

    #[test]
    fn codes_map_to_http_statuses() {
        assert_eq!(Code::Unauthenticated.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Code::PermissionDenied.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(Code::NotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(Code::Canceled.http_status().as_u16(), 499);
    }
}
