//! Authorization: decide whether an authenticated caller may invoke an RPC.
//!
//! Two request shapes are supported:
//!
//! | Mode | Enforced tuple | Scope column |
//! |------|----------------|--------------|
//! | `v1` | subject, resource path, action | action (`read`, `write`, ...) |
//! | `v2` | subject, RPC path, dimensions | `dimensionMatch` expression |
//!
//! Engines are created by name from [`AuthorizerRegistry`]; the only builtin
//! engine is `casbin`.

pub mod action;
pub mod casbin;
pub mod policy;
pub mod resolver;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

pub use action::{http_action, rpc_action};
pub use casbin::CasbinAuthorizer;
pub use resolver::{
    Resolver, ResolverContext, ResolverRegistry, ResolverRequest, ResolverResource,
    ScopedResolverRegistry, ServiceDescriptor,
};

use crate::auth::roles::RoleProvider;
use crate::auth::token::AccessToken;
use crate::config::AuthzConfig;
use crate::{Error, Result};

/// Authorization model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthzMode {
    /// Path + action
    V1,
    /// RPC + dimensions
    V2,
}

impl AuthzMode {
    /// Parse a configured version; empty means `v1`.
    pub fn parse(version: &str) -> Result<Self> {
        match version {
            "" | "v1" => Ok(Self::V1),
            "v2" => Ok(Self::V2),
            other => Err(Error::Config(format!("unsupported authz.version '{other}'"))),
        }
    }

    /// `"v1"` or `"v2"`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }
}

impl fmt::Display for AuthzMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything an authorizer may look at.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationRequest<'a> {
    /// Verified token, if any
    pub token: Option<&'a AccessToken>,
    /// UserInfo claims, if fetched
    pub userinfo: Option<&'a Value>,
    /// Full RPC path or HTTP route
    pub rpc: &'a str,
    /// Derived action (v1)
    pub action: &'a str,
    /// Resolved dimensions (v2)
    pub resource_context: Option<&'a ResolverContext>,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDecision {
    /// Whether the call may proceed
    pub allowed: bool,
    /// Operator-facing reason
    pub reason: String,
    /// Mode that decided
    pub mode: AuthzMode,
    /// Subject whose policy allowed the call
    pub matched_policy: Option<String>,
}

/// An authorization engine.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Decide `request`. An `Err` is an evaluation failure, not a denial.
    async fn authorize(&self, request: &AuthorizationRequest<'_>) -> Result<AuthorizationDecision>;

    /// Model version this engine enforces.
    fn version(&self) -> AuthzMode;

    /// Whether resolved dimensions influence decisions.
    fn supports_resource_authorization(&self) -> bool {
        self.version() == AuthzMode::V2
    }
}

/// Inputs handed to an authorizer factory.
#[derive(Clone)]
pub struct AuthorizerSettings {
    /// Authorization section of the configuration
    pub authz: AuthzConfig,
    /// Role source
    pub roles: Arc<dyn RoleProvider>,
    /// Claim holding the caller's user name
    pub username_claim: Option<String>,
}

type Factory =
    Box<dyn Fn(AuthorizerSettings) -> BoxFuture<'static, Result<Arc<dyn Authorizer>>> + Send + Sync>;

/// Named authorizer factories.
pub struct AuthorizerRegistry {
    factories: HashMap<String, Factory>,
}

impl Default for AuthorizerRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(casbin::ENGINE_NAME, |settings| {
            Box::pin(async move {
                let authorizer = CasbinAuthorizer::new(&settings).await?;
                Ok(Arc::new(authorizer) as Arc<dyn Authorizer>)
            })
        });
        registry
    }
}

impl AuthorizerRegistry {
    /// Registry holding the builtin engines.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an engine.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(AuthorizerSettings) -> BoxFuture<'static, Result<Arc<dyn Authorizer>>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Build the engine named in `settings.authz.engine`.
    pub async fn build(&self, settings: &AuthorizerSettings) -> Result<Arc<dyn Authorizer>> {
        let name = match settings.authz.engine.as_str() {
            "" => casbin::ENGINE_NAME,
            other => other,
        };
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown authorization engine '{name}'")))?;
        let authorizer = factory(settings.clone()).await?;
        tracing::info!(engine = %name, mode = %authorizer.version(), "Authorizer ready");
        Ok(authorizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::roles::ClaimsRoleProvider;

    fn settings(engine: &str, version: &str) -> AuthorizerSettings {
        AuthorizerSettings {
            authz: AuthzConfig {
                engine: engine.to_string(),
                version: version.to_string(),
                ..AuthzConfig::default()
            },
            roles: Arc::new(ClaimsRoleProvider::new("realm_access.roles")),
            username_claim: None,
        }
    }

    #[test]
    fn mode_parses_versions() {
        assert_eq!(AuthzMode::parse("").unwrap(), AuthzMode::V1);
        assert_eq!(AuthzMode::parse("v2").unwrap(), AuthzMode::V2);
        assert!(AuthzMode::parse("v9").is_err());
    }

    #[tokio::test]
    async fn registry_builds_casbin_by_default() {
        let registry = AuthorizerRegistry::new();
        let authz = registry.build(&settings("", "v2")).await.unwrap();
        assert_eq!(authz.version(), AuthzMode::V2);
        assert!(authz.supports_resource_authorization());
    }

    #[tokio::test]
    async fn registry_rejects_unknown_engine() {
        let registry = AuthorizerRegistry::new();
        assert!(matches!(
            registry.build(&settings("opa", "v1")).await,
            Err(Error::Config(_))
        ));
    }
}
