//! Configuration management

use std::{collections::HashMap, env, fmt, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ers::{keycloak::KeycloakConfig, ldap::LdapConfig, sql::SqlConfig};
use crate::{Error, Result};

/// Placeholder rendered instead of secret values.
pub const REDACTED: &str = "[REDACTED]";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Authorization configuration
    pub authz: AuthzConfig,
    /// Entity resolution configuration
    pub ers: ErsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Canonical `scheme://host[:port]` of this server, used for DPoP `htu`
    /// when the request carries no origin header
    pub public_hostname: Option<String>,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Largest request body buffered for resolvers; larger bodies fail resolution
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            public_hostname: None,
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Authentication configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable authentication
    pub enabled: bool,
    /// Accepted token issuers. A token is accepted only if `iss` equals one of these.
    pub issuers: Vec<String>,
    /// Required audience
    pub audience: String,
    /// Require DPoP-bound tokens
    pub enforce_dpop: bool,
    /// Maximum age of a DPoP proof's `iat`
    #[serde(with = "humantime_serde")]
    pub dpop_skew: Duration,
    /// Clock skew tolerance for access token `exp`/`nbf`/`iat`
    #[serde(with = "humantime_serde")]
    pub token_skew: Duration,
    /// JWKS refresh interval
    #[serde(with = "humantime_serde")]
    pub cache_refresh: Duration,
    /// Public client id advertised to SDKs
    pub public_client_id: Option<String>,
    /// Extra public routes (exact or glob)
    pub public_routes: Vec<String>,
    /// Routes that re-verify in-process calls
    pub ipc_reauth_routes: Vec<String>,
    /// Dotted claim paths holding the caller's groups; a single string is
    /// accepted, and roles found under every path are merged
    #[serde(deserialize_with = "one_or_many::deserialize")]
    pub groups_claim: Vec<String>,
    /// Claim holding the caller's user name (optional)
    pub username_claim: Option<String>,
    /// Fetch UserInfo for each authenticated caller
    pub enrich_userinfo: bool,
    /// How long fetched UserInfo stays cached
    #[serde(with = "humantime_serde")]
    pub userinfo_ttl: Duration,
    /// Platform client used for token exchange
    pub platform_client_id: Option<String>,
    /// Platform client secret (supports `${VAR}`)
    pub platform_client_secret: Option<String>,
    /// Permit `http://` issuers (local development and tests)
    pub allow_insecure_http: bool,
    /// Role provider selection
    pub role_provider: RoleProviderConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            issuers: Vec::new(),
            audience: String::new(),
            enforce_dpop: false,
            dpop_skew: Duration::from_secs(3600),
            token_skew: Duration::from_secs(60),
            cache_refresh: Duration::from_secs(15 * 60),
            public_client_id: None,
            public_routes: Vec::new(),
            ipc_reauth_routes: Vec::new(),
            groups_claim: vec!["realm_access.roles".to_string()],
            username_claim: None,
            enrich_userinfo: false,
            userinfo_ttl: Duration::from_secs(5 * 60),
            platform_client_id: None,
            platform_client_secret: None,
            allow_insecure_http: false,
            role_provider: RoleProviderConfig::default(),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("enabled", &self.enabled)
            .field("issuers", &self.issuers)
            .field("audience", &self.audience)
            .field("enforce_dpop", &self.enforce_dpop)
            .field("dpop_skew", &self.dpop_skew)
            .field("token_skew", &self.token_skew)
            .field("cache_refresh", &self.cache_refresh)
            .field("public_routes", &self.public_routes)
            .field("groups_claim", &self.groups_claim)
            .field("username_claim", &self.username_claim)
            .field("enrich_userinfo", &self.enrich_userinfo)
            .field("platform_client_id", &self.platform_client_id)
            .field(
                "platform_client_secret",
                &self.platform_client_secret.as_ref().map(|_| REDACTED),
            )
            .finish_non_exhaustive()
    }
}

/// Named role provider with free-form settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleProviderConfig {
    /// Registered provider name
    pub name: String,
    /// Provider-specific settings
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl Default for RoleProviderConfig {
    fn default() -> Self {
        Self {
            name: "claims".to_string(),
            config: serde_json::Map::new(),
        }
    }
}

/// Wire status used when a resolver fails
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolverErrorCode {
    /// Treat resolver failure as a denial
    #[default]
    PermissionDenied,
    /// Surface resolver failure as an internal error
    Internal,
}

/// Authorization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthzConfig {
    /// Registered authorizer engine
    pub engine: String,
    /// Authorization model version (`v1` or `v2`)
    pub version: String,
    /// Casbin model text replacing the builtin model for `version`
    pub model: Option<String>,
    /// Policy CSV replacing the builtin policy
    pub csv: Option<String>,
    /// Policy lines appended to the active policy
    pub extension: Option<String>,
    /// Role to group mapping (`admin: opentdf-admin`)
    pub role_map: HashMap<String, String>,
    /// Status used when a resolver fails
    pub resolver_error_code: ResolverErrorCode,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            engine: "casbin".to_string(),
            version: "v1".to_string(),
            model: None,
            csv: None,
            extension: None,
            role_map: HashMap::new(),
            resolver_error_code: ResolverErrorCode::default(),
        }
    }
}

/// Entity resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ErsConfig {
    /// Active backend (`ldap`, `sql`, `keycloak`)
    pub backend: Option<String>,
    /// Directory backend settings
    pub ldap: LdapConfig,
    /// Relational backend settings
    pub sql: SqlConfig,
    /// IdP backend settings
    pub keycloak: KeycloakConfig,
}

/// Per-entity-type opt-in for inferring identities that were not found
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct InferIdConfig {
    /// Which entity types may be inferred
    pub from: InferFrom,
}

/// Entity types eligible for inference
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct InferFrom {
    /// Infer client ids
    #[serde(alias = "clientId")]
    pub clientid: bool,
    /// Infer email addresses
    pub email: bool,
    /// Infer user names
    pub username: bool,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("TDF_ACCESS_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.auth.enabled && self.auth.issuers.is_empty() {
            return Err(Error::Config(
                "auth.issuers must name at least one issuer".to_string(),
            ));
        }
        match self.authz.version.as_str() {
            "" | "v1" | "v2" => {}
            other => {
                return Err(Error::Config(format!(
                    "unsupported authz.version '{other}'"
                )));
            }
        }
        if self.auth.enrich_userinfo && self.auth.platform_client_id.is_none() {
            return Err(Error::Config(
                "auth.enrich_userinfo requires auth.platform_client_id".to_string(),
            ));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                dirs::home_dir().map_or_else(
                    || path_str.clone(),
                    |home| path_str.replacen('~', &home.display().to_string(), 1),
                )
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in secret-bearing fields
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        let expand = |value: &mut Option<String>| {
            if let Some(v) = value.as_mut() {
                *v = expand_string(&re, v);
            }
        };

        expand(&mut self.auth.platform_client_secret);
        expand(&mut self.ers.sql.dsn);
        expand(&mut self.ers.sql.password);
        expand(&mut self.ers.ldap.bind_password);
        expand(&mut self.ers.keycloak.client_secret);
        Ok(())
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// A string or a list of strings, read as a list
pub mod one_or_many {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    /// Deserialize `"a"` as `["a"]` and `["a", "b"]` as-is
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(one) => vec![one],
            OneOrMany::Many(many) => many,
        })
    }
}

/// Human-readable duration serde (`"30s"`, `"15m"`, `"1h"`, `"250ms"`)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() > 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize a human-readable duration string
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse `"250ms"`, `"30s"`, `"5m"`, `"1h"`, or bare seconds.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let auth = AuthConfig::default();
        assert_eq!(auth.dpop_skew, Duration::from_secs(3600));
        assert_eq!(auth.token_skew, Duration::from_secs(60));
        assert_eq!(auth.cache_refresh, Duration::from_secs(900));
        assert_eq!(auth.groups_claim, vec!["realm_access.roles"]);
        assert_eq!(AuthzConfig::default().version, "v1");
    }

    #[test]
    fn humantime_parse_handles_units() {
        assert_eq!(humantime_serde::parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(humantime_serde::parse("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(humantime_serde::parse("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(humantime_serde::parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(humantime_serde::parse("7").unwrap(), Duration::from_secs(7));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn load_reads_yaml_file() {
        // GIVEN: a config file with nested sections
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
auth:
  issuers: ["https://idp.example.com/realms/tdf"]
  audience: "http://localhost:8080"
  dpop_skew: "30m"
authz:
  version: "v2"
  extension: "p, role:auditor, /policy.*/Get*, *, allow"
ers:
  backend: "sql"
  sql:
    driver: "sqlite"
    dsn: "sqlite::memory:"
"#
        )
        .unwrap();

        // WHEN: loaded
        let config = Config::load(Some(file.path())).unwrap();

        // THEN: values are applied on top of defaults
        assert_eq!(config.auth.issuers.len(), 1);
        assert_eq!(config.auth.dpop_skew, Duration::from_secs(1800));
        assert_eq!(config.auth.token_skew, Duration::from_secs(60));
        assert_eq!(config.authz.version, "v2");
        assert_eq!(config.ers.backend.as_deref(), Some("sql"));
    }

    #[test]
    fn groups_claim_accepts_string_or_list() {
        let mut single = tempfile::NamedTempFile::new().unwrap();
        writeln!(single, "auth:\n  groups_claim: \"groups\"").unwrap();
        let mut list = tempfile::NamedTempFile::new().unwrap();
        writeln!(list, "auth:\n  groups_claim: [\"realm_access.roles\", \"groups\"]").unwrap();

        let single = Config::load(Some(single.path())).unwrap();
        let list = Config::load(Some(list.path())).unwrap();

        assert_eq!(single.auth.groups_claim, vec!["groups"]);
        assert_eq!(list.auth.groups_claim, vec!["realm_access.roles", "groups"]);
    }

    #[test]
    fn load_rejects_missing_file() {
        let result = Config::load(Some(Path::new("/nonexistent/tdf-access.yaml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_unknown_authz_version() {
        let mut config = Config::default();
        config.auth.issuers = vec!["https://idp".to_string()];
        config.authz.version = "v3".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_issuer_when_enabled() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_redacts_platform_secret() {
        let auth = AuthConfig {
            platform_client_secret: Some("s3cret".to_string()),
            ..AuthConfig::default()
        };
        let rendered = format!("{auth:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains(REDACTED));
    }

    #[test]
    fn expand_string_uses_default_when_unset() {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        let out = expand_string(&re, "${TDF_ACCESS_SURELY_UNSET_VAR:-fallback}");
        assert_eq!(out, "fallback");
    }
}
