//! Audit events for authentication and authorization outcomes.
//!
//! Every event is emitted via `tracing::info!` as one JSON blob in the
//! `audit` field.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `authn.failed` | Token, DPoP or UserInfo checks rejected the caller |
//! | `authz.allowed` | The authorizer allowed the RPC |
//! | `authz.denied` | The authorizer denied the RPC |
//! | `authz.resolver_failed` | The RPC's resolver failed; the request is refused |

use serde::Serialize;

/// Structured audit record.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type (`"authz.denied"`, ...)
    pub event: &'static str,
    /// RPC path or HTTP route
    pub rpc: String,
    /// Token `sub`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Token `azp` / client id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    /// `v1` or `v2`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<&'static str>,
    /// Canonical dimensions (v2)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dims: Option<String>,
    /// Subject that matched a policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_policy: Option<String>,
    /// Operator-facing reason; never returned to callers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str, rpc: &str) -> Self {
        Self {
            event,
            rpc: rpc.to_string(),
            subject: None,
            azp: None,
            mode: None,
            dims: None,
            matched_policy: None,
            reason: None,
        }
    }

    /// `authn.failed`
    #[must_use]
    pub fn authn_failed(rpc: &str, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new("authn.failed", rpc)
        }
    }

    /// `authz.allowed`
    #[must_use]
    pub fn allowed(rpc: &str, mode: &'static str, matched_policy: Option<String>) -> Self {
        Self {
            mode: Some(mode),
            matched_policy,
            ..Self::new("authz.allowed", rpc)
        }
    }

    /// `authz.denied`
    #[must_use]
    pub fn denied(rpc: &str, mode: &'static str, reason: impl Into<String>) -> Self {
        Self {
            mode: Some(mode),
            reason: Some(reason.into()),
            ..Self::new("authz.denied", rpc)
        }
    }

    /// `authz.resolver_failed`
    #[must_use]
    pub fn resolver_failed(rpc: &str, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new("authz.resolver_failed", rpc)
        }
    }

    /// Attach the caller identity.
    #[must_use]
    pub fn with_identity(mut self, subject: Option<&str>, azp: Option<&str>) -> Self {
        self.subject = subject.map(str::to_string);
        self.azp = azp.map(str::to_string);
        self
    }

    /// Attach the canonical dimensions.
    #[must_use]
    pub fn with_dims(mut self, dims: impl Into<String>) -> Self {
        self.dims = Some(dims.into());
        self
    }
}

/// Emit `event` through `tracing`.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "access audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
