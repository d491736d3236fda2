//! Role providers: map an authenticated caller to role names.
//!
//! The default provider, `claims`, walks one or more dotted selectors
//! (`realm_access.roles`) through the token claims and collects string leaves.
//! Providers are created by name from [`RoleProviderRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::auth::token::AccessToken;
use crate::config::RoleProviderConfig;
use crate::{Error, Result};

/// Caller-derived roles for authorization.
#[async_trait]
pub trait RoleProvider: Send + Sync {
    /// Roles for the caller. A missing claim yields an empty list.
    async fn roles(&self, token: &AccessToken, userinfo: Option<&Value>) -> Result<Vec<String>>;
}

/// Collect string leaves at `selector` (dot-separated) within `root`.
///
/// A string leaf yields one entry, an array yields its string elements, and
/// anything else yields nothing.
#[must_use]
pub fn lookup_claim<'a>(root: &'a Value, selector: &str) -> Vec<&'a str> {
    let mut current = root;
    for part in selector.split('.').filter(|p| !p.is_empty()) {
        match current.get(part) {
            Some(next) => current = next,
            None => return Vec::new(),
        }
    }
    match current {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Reads roles from the token's groups claims, then from UserInfo.
#[derive(Debug, Clone)]
pub struct ClaimsRoleProvider {
    groups_claims: Vec<String>,
}

impl ClaimsRoleProvider {
    /// Provider reading a single `groups_claim`.
    #[must_use]
    pub fn new(groups_claim: impl Into<String>) -> Self {
        Self {
            groups_claims: vec![groups_claim.into()],
        }
    }

    /// Provider merging roles found under each of `groups_claims`, in order.
    #[must_use]
    pub fn with_claims<I, S>(groups_claims: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups_claims: groups_claims.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl RoleProvider for ClaimsRoleProvider {
    async fn roles(&self, token: &AccessToken, userinfo: Option<&Value>) -> Result<Vec<String>> {
        let claims = Value::Object(token.claims().clone());
        let sources = std::iter::once(&claims).chain(userinfo);
        let mut roles: Vec<String> = Vec::new();
        for source in sources {
            for selector in &self.groups_claims {
                for role in lookup_claim(source, selector) {
                    if !roles.iter().any(|r| r == role) {
                        roles.push(role.to_string());
                    }
                }
            }
        }
        Ok(roles)
    }
}

/// Fixed role list, ignoring the token.
#[derive(Debug, Clone, Default)]
pub struct StaticRoleProvider {
    roles: Vec<String>,
}

impl StaticRoleProvider {
    /// Provider always answering `roles`.
    #[must_use]
    pub fn new(roles: Vec<String>) -> Self {
        Self { roles }
    }
}

#[async_trait]
impl RoleProvider for StaticRoleProvider {
    async fn roles(&self, _token: &AccessToken, _userinfo: Option<&Value>) -> Result<Vec<String>> {
        Ok(self.roles.clone())
    }
}

/// Inputs handed to a provider factory.
#[derive(Debug, Clone)]
pub struct RoleProviderContext<'a> {
    /// Configured groups claims
    pub groups_claim: &'a [String],
    /// Provider-specific settings
    pub config: &'a Map<String, Value>,
}

type Factory = fn(&RoleProviderContext<'_>) -> Result<Arc<dyn RoleProvider>>;

/// Named role provider factories.
pub struct RoleProviderRegistry {
    factories: HashMap<String, Factory>,
}

impl Default for RoleProviderRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("claims", |ctx| {
            let claims = match ctx.config.get("groups_claim") {
                None => ctx.groups_claim.to_vec(),
                Some(Value::String(one)) => vec![one.clone()],
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| Error::Config("groups_claim entries must be strings".to_string()))
                    })
                    .collect::<Result<_>>()?,
                Some(_) => return Err(Error::Config("groups_claim must be a string or a list".to_string())),
            };
            Ok(Arc::new(ClaimsRoleProvider::with_claims(claims)))
        });
        registry.register("static", |ctx| {
            let roles = match ctx.config.get("roles") {
                None => Vec::new(),
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| Error::Config("static role provider roles must be strings".to_string()))
                    })
                    .collect::<Result<_>>()?,
                Some(_) => return Err(Error::Config("static role provider needs a roles list".to_string())),
            };
            Ok(Arc::new(StaticRoleProvider::new(roles)))
        });
        registry
    }
}

impl RoleProviderRegistry {
    /// Registry holding the builtin `claims` provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a provider factory.
    pub fn register(&mut self, name: &str, factory: Factory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Build the provider selected by `config`.
    pub fn build(&self, config: &RoleProviderConfig, groups_claim: &[String]) -> Result<Arc<dyn RoleProvider>> {
        let name = if config.name.is_empty() { "claims" } else { config.name.as_str() };
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown role provider '{name}'")))?;
        factory(&RoleProviderContext {
            groups_claim,
            config: &config.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token(claims: Value) -> AccessToken {
        match claims {
            Value::Object(map) => AccessToken::from_claims(map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn lookup_descends_nested_maps() {
        let root = json!({"realm_access": {"roles": ["a", 1, "b"]}, "group": "solo"});
        assert_eq!(lookup_claim(&root, "realm_access.roles"), vec!["a", "b"]);
        assert_eq!(lookup_claim(&root, "group"), vec!["solo"]);
        assert!(lookup_claim(&root, "realm_access").is_empty());
        assert!(lookup_claim(&root, "missing.path").is_empty());
    }

    #[tokio::test]
    async fn claims_provider_merges_userinfo_roles() {
        // GIVEN: roles in both the token and UserInfo
        let provider = ClaimsRoleProvider::new("realm_access.roles");
        let tok = token(json!({"realm_access": {"roles": ["opentdf-standard"]}}));
        let info = json!({"realm_access": {"roles": ["opentdf-standard", "auditor"]}});

        // WHEN: roles are requested
        let roles = provider.roles(&tok, Some(&info)).await.unwrap();

        // THEN: token roles come first, duplicates are dropped
        assert_eq!(roles, vec!["opentdf-standard", "auditor"]);
    }

    fn claims(selectors: &[&str]) -> Vec<String> {
        selectors.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn roles_from_every_groups_claim_are_merged() {
        // GIVEN: two configured claims, one nested and one flat
        let provider = ClaimsRoleProvider::with_claims(["realm_access.roles", "groups"]);
        let tok = token(json!({
            "realm_access": {"roles": ["opentdf-standard"]},
            "groups": ["hr-admin", "opentdf-standard"],
        }));
        let info = json!({"groups": "auditor"});

        // WHEN: roles are requested
        let roles = provider.roles(&tok, Some(&info)).await.unwrap();

        // THEN: each claim contributes, in order, without duplicates
        assert_eq!(roles, vec!["opentdf-standard", "hr-admin", "auditor"]);
    }

    #[tokio::test]
    async fn registry_uses_configured_claim_list() {
        let registry = RoleProviderRegistry::new();
        let provider = registry
            .build(&RoleProviderConfig::default(), &claims(&["realm_access.roles", "groups"]))
            .unwrap();
        let tok = token(json!({"realm_access": {"roles": ["a"]}, "groups": ["b"]}));
        assert_eq!(provider.roles(&tok, None).await.unwrap(), vec!["a", "b"]);

        let mut config = RoleProviderConfig::default();
        config.config.insert("groups_claim".into(), json!(["groups"]));
        let provider = registry.build(&config, &claims(&["realm_access.roles"])).unwrap();
        assert_eq!(provider.roles(&tok, None).await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn missing_claim_is_not_an_error() {
        let provider = ClaimsRoleProvider::new("groups");
        let roles = provider.roles(&token(json!({"sub": "x"})), None).await.unwrap();
        assert!(roles.is_empty());
    }

    #[tokio::test]
    async fn registry_builds_by_name() {
        let registry = RoleProviderRegistry::new();
        let mut config = RoleProviderConfig::default();
        config.config.insert("groups_claim".into(), json!("groups"));
        let provider = registry.build(&config, &claims(&["realm_access.roles"])).unwrap();
        let roles = provider.roles(&token(json!({"groups": "g1"})), None).await.unwrap();
        assert_eq!(roles, vec!["g1"]);

        config.name = "ldap".into();
        assert!(registry.build(&config, &claims(&["x"])).is_err());
    }

    #[tokio::test]
    async fn static_provider_ignores_token() {
        let registry = RoleProviderRegistry::new();
        let mut config = RoleProviderConfig {
            name: "static".into(),
            ..RoleProviderConfig::default()
        };
        config.config.insert("roles".into(), json!(["admin"]));
        let provider = registry.build(&config, &claims(&["groups"])).unwrap();
        let roles = provider.roles(&token(json!({"groups": ["other"]})), None).await.unwrap();
        assert_eq!(roles, vec!["admin"]);

        config.config.insert("roles".into(), json!("admin"));
        assert!(registry.build(&config, &claims(&["groups"])).is_err());
    }
}
