//! Entity resolution: turn identifiers and tokens into entity records.
//!
//! # Contract shared by every backend
//!
//! - `resolve_entities` returns one [`EntityRepresentation`] per input, in
//!   order. Its `original_id` is the caller's `ephemeral_id`, or
//!   `entity-<index>` when that is empty.
//! - A lookup that finds nothing either infers a record from the entity
//!   itself (per-type opt-in, [`InferFrom`]) or fails with
//!   [`Error::ErsNotFound`].
//! - `create_entity_chains_from_tokens` decodes each JWT without verifying
//!   it and extracts `azp` (client, environment), `preferred_username` and
//!   `email` (subject).
//!
//! # Backends
//!
//! | Name | Store |
//! |------|-------|
//! | `ldap` | Directory via a [`ldap::DirectoryConnector`] |
//! | `sql` | PostgreSQL, MySQL or SQLite via `sqlx` |
//! | `keycloak` | Keycloak admin API |

pub mod keycloak;
pub mod ldap;
pub mod sql;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::auth::token::AccessToken;
use crate::config::{ErsConfig, InferFrom};
use crate::{Error, Result};

/// Prefix of synthesized original ids.
pub const ENTITY_ID_PREFIX: &str = "entity-";

/// A free-form record describing an entity.
pub type Record = Map<String, Value>;

/// Role of an entity in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Category {
    /// Not stated
    #[default]
    #[serde(rename = "CATEGORY_UNSPECIFIED")]
    Unspecified,
    /// The acting party
    #[serde(rename = "CATEGORY_SUBJECT")]
    Subject,
    /// The environment the request runs in (the client application)
    #[serde(rename = "CATEGORY_ENVIRONMENT")]
    Environment,
}

/// Identifier carried by an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityId {
    /// OAuth client id
    ClientId(String),
    /// User name
    UserName(String),
    /// Email address
    EmailAddress(String),
}

impl EntityId {
    /// Identifier value.
    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::ClientId(v) | Self::UserName(v) | Self::EmailAddress(v) => v,
        }
    }

    /// Short kind name (`clientid`, `username`, `email`).
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientId(_) => "clientid",
            Self::UserName(_) => "username",
            Self::EmailAddress(_) => "email",
        }
    }
}

/// An entity to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Request-scoped identifier
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ephemeral_id: String,
    /// Identifier
    #[serde(flatten)]
    pub id: EntityId,
    /// Role in the request
    #[serde(default)]
    pub category: Category,
}

impl Entity {
    /// Entity without an ephemeral id.
    #[must_use]
    pub fn new(id: EntityId, category: Category) -> Self {
        Self {
            ephemeral_id: String::new(),
            id,
            category,
        }
    }

    /// Set the ephemeral id.
    #[must_use]
    pub fn with_ephemeral_id(mut self, id: impl Into<String>) -> Self {
        self.ephemeral_id = id.into();
        self
    }

    /// Record describing the entity itself, used for inference.
    pub fn to_record(&self) -> Result<Record> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(Error::Internal("entity did not serialize to an object".to_string())),
        }
    }
}

/// Entities derived from one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChain {
    /// The token's ephemeral id
    pub ephemeral_id: String,
    /// Entities in extraction order
    pub entities: Vec<Entity>,
}

/// Resolved records for one input entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRepresentation {
    /// Caller's ephemeral id or `entity-<index>`
    pub original_id: String,
    /// Backend records
    pub additional_props: Vec<Record>,
}

/// A token submitted for chain creation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInput {
    /// Caller-chosen id echoed on the chain
    #[serde(default)]
    pub ephemeral_id: String,
    /// Compact JWT
    pub jwt: String,
}

impl fmt::Debug for TokenInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenInput")
            .field("ephemeral_id", &self.ephemeral_id)
            .finish_non_exhaustive()
    }
}

/// An entity resolution backend.
#[async_trait]
pub trait EntityResolver: Send + Sync {
    /// Backend name.
    fn name(&self) -> &'static str;

    /// Resolve each entity; output order and length match the input.
    async fn resolve_entities(&self, entities: &[Entity]) -> Result<Vec<EntityRepresentation>>;

    /// Build one chain per token.
    async fn create_entity_chains_from_tokens(&self, tokens: &[TokenInput]) -> Result<Vec<EntityChain>> {
        chains_from_tokens(tokens)
    }
}

/// Per-entity record lookup used by [`resolve_with`].
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Records matching `entity`; empty when nothing matched.
    async fn lookup(&self, entity: &Entity) -> Result<Vec<Record>>;
}

/// Original id for the entity at `index`.
#[must_use]
pub fn original_id(entity: &Entity, index: usize) -> String {
    if entity.ephemeral_id.is_empty() {
        format!("{ENTITY_ID_PREFIX}{index}")
    } else {
        entity.ephemeral_id.clone()
    }
}

/// Whether `entity` may be inferred when not found.
#[must_use]
pub fn should_infer(entity: &Entity, infer: InferFrom) -> bool {
    match entity.id {
        EntityId::ClientId(_) => infer.clientid,
        EntityId::EmailAddress(_) => infer.email,
        EntityId::UserName(_) => infer.username,
    }
}

/// Resolve `entities` one by one against `source`, applying inference.
pub async fn resolve_with(
    source: &dyn RecordSource,
    infer: InferFrom,
    entities: &[Entity],
) -> Result<Vec<EntityRepresentation>> {
    let mut out = Vec::with_capacity(entities.len());
    for (index, entity) in entities.iter().enumerate() {
        debug!(kind = entity.id.kind(), ephemeral_id = %entity.ephemeral_id, "Resolving entity");
        let mut records = source.lookup(entity).await?;
        if records.is_empty() {
            if !should_infer(entity, infer) {
                warn!(kind = entity.id.kind(), "Entity not found");
                return Err(Error::ErsNotFound(format!(
                    "{} {}",
                    entity.id.kind(),
                    entity.id.value()
                )));
            }
            records.push(entity.to_record()?);
        }
        out.push(EntityRepresentation {
            original_id: original_id(entity, index),
            additional_props: records,
        });
    }
    Ok(out)
}

/// Entities carried in a token's well-known claims.
pub fn entities_from_token(jwt: &str) -> Result<Vec<Entity>> {
    let token = AccessToken::parse_unverified(jwt)?;
    let mut entities = Vec::new();
    let claims: [(&str, Category, fn(String) -> EntityId); 3] = [
        ("azp", Category::Environment, EntityId::ClientId),
        ("preferred_username", Category::Subject, EntityId::UserName),
        ("email", Category::Subject, EntityId::EmailAddress),
    ];
    for (claim, category, make) in claims {
        if let Some(value) = token.claim_str(claim).filter(|v| !v.is_empty()) {
            let id = make(value.to_string());
            let ephemeral = format!("jwtentity-{}-{}-{}", entities.len(), id.kind(), value);
            entities.push(Entity::new(id, category).with_ephemeral_id(ephemeral));
        }
    }
    Ok(entities)
}

/// One chain per token using [`entities_from_token`].
pub fn chains_from_tokens(tokens: &[TokenInput]) -> Result<Vec<EntityChain>> {
    tokens
        .iter()
        .map(|t| {
            Ok(EntityChain {
                ephemeral_id: t.ephemeral_id.clone(),
                entities: entities_from_token(&t.jwt)?,
            })
        })
        .collect()
}

type Factory =
    Box<dyn Fn(ErsConfig, Client) -> BoxFuture<'static, Result<Arc<dyn EntityResolver>>> + Send + Sync>;

/// Named backend factories.
pub struct EntityResolverRegistry {
    factories: HashMap<String, Factory>,
}

impl Default for EntityResolverRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("sql", |config, _http| {
            Box::pin(async move {
                let resolver = sql::SqlResolver::connect(config.sql).await?;
                Ok(Arc::new(resolver) as Arc<dyn EntityResolver>)
            })
        });
        registry.register("keycloak", |config, _http| {
            Box::pin(async move {
                let http = config.keycloak.http_client()?;
                let resolver = keycloak::KeycloakResolver::new(config.keycloak, http)?;
                Ok(Arc::new(resolver) as Arc<dyn EntityResolver>)
            })
        });
        registry.register_ldap(Arc::new(ldap::Ldap3Connector));
        registry
    }
}

impl EntityResolverRegistry {
    /// Registry with the `sql`, `keycloak` and `ldap` backends.
    ///
    /// `ldap` dials through [`ldap::Ldap3Connector`]; swap the connector with
    /// [`EntityResolverRegistry::register_ldap`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a backend factory.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(ErsConfig, Client) -> BoxFuture<'static, Result<Arc<dyn EntityResolver>>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Register `ldap` backed by `connector`.
    pub fn register_ldap(&mut self, connector: Arc<dyn ldap::DirectoryConnector>) {
        self.register("ldap", move |config, _http| {
            let connector = Arc::clone(&connector);
            Box::pin(async move {
                let resolver = ldap::LdapResolver::new(config.ldap, connector)?;
                Ok(Arc::new(resolver) as Arc<dyn EntityResolver>)
            })
        });
    }

    /// Build the backend named in `config.backend`.
    pub async fn build(&self, config: &ErsConfig, http: Client) -> Result<Arc<dyn EntityResolver>> {
        let name = config
            .backend
            .as_deref()
            .ok_or_else(|| Error::Config("ers.backend is not set".to_string()))?;
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown entity resolution backend '{name}'")))?;
        let resolver = factory(config.clone(), http).await?;
        tracing::info!(backend = %name, "Entity resolution backend ready");
        Ok(resolver)
    }
}
