//! Keycloak entity resolution through the admin REST API.
//!
//! The resolver authenticates as `client_id` with the client-credentials
//! grant and caches the admin token until 30 seconds before it expires.
//!
//! | Entity | Lookup |
//! |--------|--------|
//! | client id | `GET clients?clientId=` |
//! | user name | `GET users?username=&exact=true`, exactly one match |
//! | email | `GET users?email=&exact=true`, else a single group named by the address, expanded to its members |
//!
//! Token chains need both `azp` and `preferred_username`. A
//! `service-account-<client>` user name that matches exactly one client
//! becomes a client-id subject.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{
    Category, Entity, EntityChain, EntityId, EntityRepresentation, EntityResolver, Record, RecordSource,
    TokenInput, resolve_with,
};
use crate::auth::token::AccessToken;
use crate::config::{InferIdConfig, REDACTED};
use crate::oidc::{ClientAuth, TokenClient};
use crate::{Error, Result};

/// User-name prefix Keycloak gives service-account users.
pub const SERVICE_ACCOUNT_PREFIX: &str = "service-account-";

/// Refresh the admin token this long before it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// HTTP connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept per host
    pub max_idle_connections_count: usize,
    /// Idle connection lifetime in seconds
    pub max_connection_idle_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_connections_count: 100,
            max_connection_idle_seconds: 90,
        }
    }
}

/// IdP backend settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeycloakConfig {
    /// Server root URL
    pub url: String,
    /// Realm holding the users
    pub realm: String,
    /// Admin API client
    #[serde(alias = "clientid")]
    pub client_id: String,
    /// Admin API client secret
    #[serde(alias = "clientsecret")]
    pub client_secret: Option<String>,
    /// Serve under `/auth` (Keycloak before 17)
    #[serde(alias = "legacykeycloak")]
    pub legacy_keycloak: bool,
    /// Include subgroup members when expanding a group
    #[serde(alias = "subgroups")]
    pub sub_groups: bool,
    /// Inference flags
    pub inferid: InferIdConfig,
    /// TCP connect timeout
    pub connect_timeout_seconds: u64,
    /// Connection pool
    pub pool: PoolConfig,
}

impl Default for KeycloakConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            realm: "opentdf".to_string(),
            client_id: String::new(),
            client_secret: None,
            legacy_keycloak: false,
            sub_groups: false,
            inferid: InferIdConfig::default(),
            connect_timeout_seconds: 10,
            pool: PoolConfig::default(),
        }
    }
}

impl fmt::Debug for KeycloakConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeycloakConfig")
            .field("url", &self.url)
            .field("realm", &self.realm)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| REDACTED))
            .field("legacy_keycloak", &self.legacy_keycloak)
            .field("sub_groups", &self.sub_groups)
            .field("inferid", &self.inferid)
            .finish_non_exhaustive()
    }
}

impl KeycloakConfig {
    fn base(&self) -> String {
        let root = self.url.trim_end_matches('/');
        if self.legacy_keycloak {
            format!("{root}/auth")
        } else {
            root.to_string()
        }
    }

    /// Admin API root for the realm.
    #[must_use]
    pub fn admin_url(&self) -> String {
        format!("{}/admin/realms/{}", self.base(), self.realm)
    }

    /// Token endpoint of the realm.
    #[must_use]
    pub fn token_endpoint(&self) -> String {
        format!("{}/realms/{}/protocol/openid-connect/token", self.base(), self.realm)
    }

    /// HTTP client honouring the pool and timeout settings.
    pub fn http_client(&self) -> Result<Client> {
        Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_seconds))
            .pool_max_idle_per_host(self.pool.max_idle_connections_count)
            .pool_idle_timeout(Duration::from_secs(self.pool.max_connection_idle_seconds))
            .build()
            .map_err(|e| Error::Config(format!("building Keycloak HTTP client: {e}")))
    }
}

struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

/// Keycloak entity resolver.
pub struct KeycloakResolver {
    config: KeycloakConfig,
    http: Client,
    tokens: TokenClient,
    admin_token: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for KeycloakResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeycloakResolver").field("config", &self.config).finish_non_exhaustive()
    }
}

impl KeycloakResolver {
    /// Resolver calling Keycloak through `http`.
    pub fn new(config: KeycloakConfig, http: Client) -> Result<Self> {
        if config.url.is_empty() || config.client_id.is_empty() {
            return Err(Error::Config("ers.keycloak needs url and client_id".to_string()));
        }
        let auth = config
            .client_secret
            .clone()
            .map_or(ClientAuth::None, ClientAuth::Secret);
        let tokens = TokenClient::new(http.clone(), config.token_endpoint(), config.client_id.clone(), auth);
        debug!(config = ?config, "Keycloak entity resolution configuration");
        Ok(Self {
            config,
            http,
            tokens,
            admin_token: Mutex::new(None),
        })
    }

    /// Admin token, refreshed when close to expiry.
    async fn admin_token(&self) -> Result<String> {
        let mut cached = self.admin_token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(token.access_token.clone());
        }
        let response = self.tokens.client_credentials(&[]).await.map_err(|e| {
            error!(error = %e, "Keycloak admin login failed");
            Error::ErsBackendFailed(format!("keycloak login: {e}"))
        })?;
        let lifetime = Duration::from_secs(response.expires_in.unwrap_or(60));
        let refresh_at = Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN);
        debug!(expires_in = lifetime.as_secs(), "Refreshed Keycloak admin token");
        let token = response.access_token;
        *cached = Some(CachedToken {
            access_token: token.clone(),
            refresh_at,
        });
        Ok(token)
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let token = self.admin_token().await?;
        let url = format!("{}/{path}", self.config.admin_url());
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::ErsBackendFailed(format!("GET {path}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            error!(path = %path, status = %status, "Keycloak admin API error");
            return Err(Error::ErsBackendFailed(format!("GET {path} returned {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| Error::ErsBackendFailed(format!("GET {path}: invalid JSON: {e}")))
    }

    async fn list(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<Value>> {
        match self.get(path, query).await? {
            Value::Array(items) => Ok(items),
            _ => Err(Error::ErsBackendFailed(format!("GET {path}: expected an array"))),
        }
    }

    async fn clients(&self, client_id: &str) -> Result<Vec<Value>> {
        self.list("clients", &[("clientId", client_id)]).await
    }

    async fn users(&self, field: &str, value: &str) -> Result<Vec<Value>> {
        self.list("users", &[(field, value), ("exact", "true")]).await
    }

    /// Members of group `id`, and of its subgroups when enabled.
    async fn expand_group(&self, id: &str) -> Result<Vec<Value>> {
        info!(group_id = %id, "Expanding group");
        let mut pending = vec![id.to_string()];
        let mut members = Vec::new();
        while let Some(group_id) = pending.pop() {
            members.extend(self.list(&format!("groups/{group_id}/members"), &[]).await?);
            if self.config.sub_groups {
                let group = self.get(&format!("groups/{group_id}"), &[]).await?;
                pending.extend(
                    group["subGroups"]
                        .as_array()
                        .into_iter()
                        .flatten()
                        .filter_map(|g| g["id"].as_str().map(str::to_string)),
                );
            }
        }
        Ok(members)
    }

    /// Client id owning `username` when it is a service account.
    async fn service_account_client(&self, username: &str) -> Result<Option<String>> {
        let Some(expected) = username.strip_prefix(SERVICE_ACCOUNT_PREFIX) else {
            return Ok(None);
        };
        let clients = self.clients(expected).await?;
        match clients.as_slice() {
            [client] => Ok(client["clientId"].as_str().map(str::to_string)),
            [] => {
                debug!(client_id = %expected, "No client found, not a service account");
                Ok(None)
            }
            _ => {
                error!(client_id = %expected, "More than one client found");
                Ok(None)
            }
        }
    }

    async fn entities_from_token(&self, jwt: &str) -> Result<Vec<Entity>> {
        let token = AccessToken::parse_unverified(jwt)?;
        let azp = token
            .claim_str("azp")
            .ok_or_else(|| Error::TokenClaim("azp claim missing".to_string()))?;
        let username = token
            .claim_str("preferred_username")
            .ok_or_else(|| Error::TokenClaim("preferred_username claim missing".to_string()))?;

        let mut entities = vec![
            Entity::new(EntityId::ClientId(azp.to_string()), Category::Environment)
                .with_ephemeral_id(format!("jwtentity-0-clientid-{azp}")),
        ];
        let subject = match self.service_account_client(username).await? {
            Some(client) => Entity::new(EntityId::ClientId(client.clone()), Category::Subject)
                .with_ephemeral_id(format!("jwtentity-1-clientid-{client}")),
            None => Entity::new(EntityId::UserName(username.to_string()), Category::Subject)
                .with_ephemeral_id(format!("jwtentity-1-username-{username}")),
        };
        entities.push(subject);
        Ok(entities)
    }
}

fn into_records(values: Vec<Value>) -> Vec<Record> {
    values
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl RecordSource for KeycloakResolver {
    async fn lookup(&self, entity: &Entity) -> Result<Vec<Record>> {
        debug!(kind = entity.id.kind(), "Keycloak lookup");
        match &entity.id {
            EntityId::ClientId(id) => Ok(into_records(self.clients(id).await?)),
            EntityId::UserName(name) => {
                let users = self.users("username", name).await?;
                Ok(if users.len() == 1 { into_records(users) } else { Vec::new() })
            }
            EntityId::EmailAddress(email) => {
                let users = self.users("email", email).await?;
                if users.len() == 1 {
                    return Ok(into_records(users));
                }
                let groups = self.list("groups", &[("search", email.as_str())]).await?;
                match groups.as_slice() {
                    [group] => {
                        let id = group["id"]
                            .as_str()
                            .ok_or_else(|| Error::ErsBackendFailed("group without id".to_string()))?;
                        info!(email = %email, "Group found for entity");
                        Ok(into_records(self.expand_group(id).await?))
                    }
                    _ => Ok(Vec::new()),
                }
            }
        }
    }
}

#[async_trait]
impl EntityResolver for KeycloakResolver {
    fn name(&self) -> &'static str {
        "keycloak"
    }

    async fn resolve_entities(&self, entities: &[Entity]) -> Result<Vec<EntityRepresentation>> {
        resolve_with(self, self.config.inferid.from, entities).await
    }

    async fn create_entity_chains_from_tokens(&self, tokens: &[TokenInput]) -> Result<Vec<EntityChain>> {
        let mut chains = Vec::with_capacity(tokens.len());
        for token in tokens {
            chains.push(EntityChain {
                ephemeral_id: token.ephemeral_id.clone(),
                entities: self.entities_from_token(&token.jwt).await?,
            });
        }
        Ok(chains)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_follow_legacy_flag() {
        let mut config = KeycloakConfig {
            url: "http://kc:8080/".into(),
            realm: "tdf".into(),
            ..KeycloakConfig::default()
        };
        assert_eq!(config.admin_url(), "http://kc:8080/admin/realms/tdf");
        config.legacy_keycloak = true;
        assert_eq!(
            config.token_endpoint(),
            "http://kc:8080/auth/realms/tdf/protocol/openid-connect/token"
        );
    }

    #[test]
    fn accepts_flat_option_names() {
        let config: KeycloakConfig = serde_json::from_value(serde_json::json!({
            "url": "http://kc",
            "clientid": "tdf-entity-resolution",
            "clientsecret": "s3cret",
            "legacykeycloak": true,
            "inferid": {"from": {"clientid": true}}
        }))
        .unwrap();
        assert_eq!(config.client_id, "tdf-entity-resolution");
        assert!(config.legacy_keycloak);
        assert!(config.inferid.from.clientid);
        assert!(!format!("{config:?}").contains("s3cret"));
    }

    #[test]
    fn requires_url_and_client() {
        assert!(KeycloakResolver::new(KeycloakConfig::default(), Client::new()).is_err());
    }
}
