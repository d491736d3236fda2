//! Directory entity resolution.
//!
//! The wire protocol sits behind [`DirectoryConnector`] /
//! [`DirectorySession`]; this module owns everything above it:
//!
//! - server failover: servers are tried in order, the first one that
//!   connects (and binds, when `bind_dn` is set) serves the request
//! - filter templating: `{username}`, `{email}` and `{client_id}` are
//!   replaced with the RFC 4515-escaped identifier
//! - entry mapping: the entry becomes a record with `dn` plus its
//!   attributes, mapped names renamed to canonical fields; single values
//!   become strings, multiple values arrays
//! - optional group expansion through `group_search_base` / `group_filter`
//!
//! [`Ldap3Connector`] speaks LDAPv3 through the `ldap3` crate and is what the
//! `ldap` backend uses unless another connector is registered.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Entity, EntityId, EntityRepresentation, EntityResolver, Record, RecordSource, resolve_with};
use crate::config::{InferIdConfig, REDACTED, humantime_serde};
use crate::{Error, Result};

/// Directory attribute names for each canonical field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AttributeMapping {
    /// User name attribute
    pub username: String,
    /// Email attribute
    pub email: String,
    /// Display name attribute
    pub display_name: String,
    /// Group membership attribute
    pub groups: String,
    /// Client id attribute
    pub client_id: String,
    /// Extra attributes requested unchanged
    pub additional: Vec<String>,
}

impl Default for AttributeMapping {
    fn default() -> Self {
        Self {
            username: "uid".to_string(),
            email: "mail".to_string(),
            display_name: "displayName".to_string(),
            groups: "memberOf".to_string(),
            client_id: "cn".to_string(),
            additional: Vec::new(),
        }
    }
}

impl AttributeMapping {
    fn canonical(&self, attribute: &str) -> Option<&'static str> {
        [
            (self.username.as_str(), "username"),
            (self.email.as_str(), "email"),
            (self.display_name.as_str(), "display_name"),
            (self.client_id.as_str(), "client_id"),
            (self.groups.as_str(), "groups"),
        ]
        .into_iter()
        .find(|(source, _)| source.eq_ignore_ascii_case(attribute))
        .map(|(_, canonical)| canonical)
    }

    fn requested(&self, include_groups: bool) -> Vec<String> {
        let mut attributes = vec![
            self.username.clone(),
            self.email.clone(),
            self.display_name.clone(),
            self.client_id.clone(),
        ];
        if include_groups && !self.groups.is_empty() {
            attributes.push(self.groups.clone());
        }
        attributes.extend(self.additional.iter().cloned());
        attributes
    }
}

/// Directory backend settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LdapConfig {
    /// Server host names, tried in order
    pub servers: Vec<String>,
    /// Port; 636 with TLS, otherwise 389 when 0
    pub port: u16,
    /// Connect with LDAPS
    pub use_tls: bool,
    /// Skip certificate verification
    pub insecure_tls: bool,
    /// Upgrade a plain connection with STARTTLS
    pub start_tls: bool,
    /// Service account DN; anonymous when unset
    pub bind_dn: Option<String>,
    /// Service account password
    pub bind_password: Option<String>,
    /// Search base
    pub base_dn: String,
    /// Filter for user names
    pub user_filter: String,
    /// Filter for email addresses
    pub email_filter: String,
    /// Filter for client ids
    pub client_id_filter: String,
    /// Base for group searches; expansion is off when empty
    pub group_search_base: Option<String>,
    /// Group filter; `{dn}` is the member's DN
    pub group_filter: String,
    /// Attribute renames
    pub attribute_mapping: AttributeMapping,
    /// Connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Search timeout
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Request and expand group membership
    pub include_groups: bool,
    /// Inference flags
    pub inferid: InferIdConfig,
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            port: 0,
            use_tls: true,
            insecure_tls: false,
            start_tls: false,
            bind_dn: None,
            bind_password: None,
            base_dn: String::new(),
            user_filter: "(uid={username})".to_string(),
            email_filter: "(mail={email})".to_string(),
            client_id_filter: "(cn={client_id})".to_string(),
            group_search_base: None,
            group_filter: "(member={dn})".to_string(),
            attribute_mapping: AttributeMapping::default(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            include_groups: true,
            inferid: InferIdConfig::default(),
        }
    }
}

impl fmt::Debug for LdapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdapConfig")
            .field("servers", &self.servers)
            .field("port", &self.effective_port())
            .field("use_tls", &self.use_tls)
            .field("insecure_tls", &self.insecure_tls)
            .field("start_tls", &self.start_tls)
            .field("bind_dn", &self.bind_dn)
            .field("bind_password", &self.bind_password.as_ref().map(|_| REDACTED))
            .field("base_dn", &self.base_dn)
            .field("user_filter", &self.user_filter)
            .field("email_filter", &self.email_filter)
            .field("client_id_filter", &self.client_id_filter)
            .field("group_search_base", &self.group_search_base)
            .field("include_groups", &self.include_groups)
            .field("inferid", &self.inferid)
            .finish_non_exhaustive()
    }
}

impl LdapConfig {
    /// Configured port or the TLS-dependent default.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        match (self.port, self.use_tls) {
            (0, true) => 636,
            (0, false) => 389,
            (port, _) => port,
        }
    }

    fn transport(&self) -> Transport {
        if self.use_tls {
            Transport::Ldaps
        } else if self.start_tls {
            Transport::StartTls
        } else {
            Transport::Plain
        }
    }
}

/// How a connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// TLS from the first byte
    Ldaps,
    /// Plain connection upgraded with STARTTLS
    StartTls,
    /// No TLS
    Plain,
}

/// One server to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    /// Host name
    pub host: String,
    /// Port
    pub port: u16,
    /// Transport security
    pub transport: Transport,
    /// Skip certificate verification
    pub insecure_tls: bool,
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Subtree search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Search base
    pub base_dn: String,
    /// RFC 4515 filter
    pub filter: String,
    /// Attributes to return
    pub attributes: Vec<String>,
}

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Distinguished name
    pub dn: String,
    /// Attribute values
    pub attributes: Vec<(String, Vec<String>)>,
}

impl DirectoryEntry {
    /// Entry with no attributes.
    #[must_use]
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    /// Append an attribute.
    #[must_use]
    pub fn with(mut self, name: &str, values: &[&str]) -> Self {
        self.attributes
            .push((name.to_string(), values.iter().map(|v| (*v).to_string()).collect()));
        self
    }

    /// Values of `name`, matched case-insensitively.
    #[must_use]
    pub fn values(&self, name: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map_or(&[][..], |(_, v)| v.as_slice())
    }
}

/// Opens sessions to a directory server.
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    /// Dial `server`.
    async fn connect(&self, server: &ServerAddress) -> Result<Box<dyn DirectorySession>>;
}

/// An open directory connection.
#[async_trait]
pub trait DirectorySession: Send {
    /// Simple bind.
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()>;

    /// Subtree search.
    async fn search(&mut self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>>;
}

/// Connector over TCP using `ldap3`; LDAPS, STARTTLS and plain transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ldap3Connector;

impl Ldap3Connector {
    fn url(server: &ServerAddress) -> String {
        let scheme = match server.transport {
            Transport::Ldaps => "ldaps",
            Transport::StartTls | Transport::Plain => "ldap",
        };
        format!("{scheme}://{}:{}", server.host, server.port)
    }
}

#[async_trait]
impl DirectoryConnector for Ldap3Connector {
    async fn connect(&self, server: &ServerAddress) -> Result<Box<dyn DirectorySession>> {
        let url = Self::url(server);
        let settings = LdapConnSettings::new()
            .set_starttls(server.transport == Transport::StartTls)
            .set_no_tls_verify(server.insecure_tls);
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|e| Error::ErsBackendFailed(format!("{server}: {e}")))?;
        let address = server.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(address = %address, error = %e, "LDAP connection closed with error");
            }
        });
        Ok(Box::new(Ldap3Session { ldap }))
    }
}

struct Ldap3Session {
    ldap: Ldap,
}

#[async_trait]
impl DirectorySession for Ldap3Session {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        self.ldap
            .simple_bind(dn, password)
            .await
            .and_then(ldap3::LdapResult::success)
            .map(|_| ())
            .map_err(|e| Error::ErsBackendFailed(format!("bind failed: {e}")))
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>> {
        let (entries, _) = self
            .ldap
            .search(&request.base_dn, Scope::Subtree, &request.filter, request.attributes.clone())
            .await
            .and_then(ldap3::SearchResult::success)
            .map_err(|e| Error::ErsBackendFailed(e.to_string()))?;
        Ok(entries
            .into_iter()
            .map(|raw| {
                let entry = SearchEntry::construct(raw);
                let mut attributes: Vec<(String, Vec<String>)> = entry.attrs.into_iter().collect();
                attributes.sort_by(|a, b| a.0.cmp(&b.0));
                DirectoryEntry {
                    dn: entry.dn,
                    attributes,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod memory;

/// Escape a value for use inside a filter (RFC 4515).
#[must_use]
pub fn escape_filter(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\5c"),
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\0' => out.push_str("\\00"),
            other => out.push(other),
        }
    }
    out
}

/// Record for `entry` with canonical attribute names.
#[must_use]
pub fn entry_to_record(entry: &DirectoryEntry, mapping: &AttributeMapping) -> Record {
    let mut record = Record::new();
    record.insert("dn".to_string(), Value::String(entry.dn.clone()));
    for (name, values) in &entry.attributes {
        let field = mapping
            .canonical(name)
            .map_or_else(|| name.clone(), str::to_string);
        match values.as_slice() {
            [] => {}
            [single] => {
                record.insert(field, Value::String(single.clone()));
            }
            many => {
                record.insert(
                    field,
                    Value::Array(many.iter().cloned().map(Value::String).collect()),
                );
            }
        }
    }
    record
}

/// Directory entity resolver.
pub struct LdapResolver {
    config: LdapConfig,
    connector: Arc<dyn DirectoryConnector>,
}

impl fmt::Debug for LdapResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdapResolver").field("config", &self.config).finish_non_exhaustive()
    }
}

impl LdapResolver {
    /// Resolver dialing through `connector`.
    pub fn new(config: LdapConfig, connector: Arc<dyn DirectoryConnector>) -> Result<Self> {
        if config.servers.is_empty() {
            return Err(Error::Config("ers.ldap.servers must not be empty".to_string()));
        }
        if config.base_dn.is_empty() {
            return Err(Error::Config("ers.ldap.base_dn must be set".to_string()));
        }
        debug!(config = ?config, "LDAP entity resolution configuration");
        Ok(Self { config, connector })
    }

    /// Connect to the first reachable server, binding when configured.
    async fn open(&self) -> Result<Box<dyn DirectorySession>> {
        let mut last_error = None;
        for host in &self.config.servers {
            let address = ServerAddress {
                host: host.clone(),
                port: self.config.effective_port(),
                transport: self.config.transport(),
                insecure_tls: self.config.insecure_tls,
            };
            debug!(address = %address, "Attempting LDAP connection");
            let connected = tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&address))
                .await
                .unwrap_or_else(|_| Err(Error::ErsBackendFailed("connect timed out".to_string())));
            let mut session = match connected {
                Ok(session) => session,
                Err(e) => {
                    warn!(address = %address, error = %e, "Failed to connect to LDAP server");
                    last_error = Some(e);
                    continue;
                }
            };
            if let Some(dn) = &self.config.bind_dn {
                let password = self.config.bind_password.as_deref().unwrap_or_default();
                if let Err(e) = session.bind(dn, password).await {
                    warn!(address = %address, bind_dn = %dn, error = %e, "LDAP bind failed");
                    last_error = Some(e);
                    continue;
                }
            }
            debug!(address = %address, "Connected to LDAP server");
            return Ok(session);
        }
        Err(Error::ErsBackendFailed(format!(
            "failed to connect to any LDAP server: {}",
            last_error.map_or_else(|| "no servers".to_string(), |e| e.to_string())
        )))
    }

    fn filter_for(&self, id: &EntityId) -> String {
        let (template, placeholder) = match id {
            EntityId::UserName(_) => (&self.config.user_filter, "{username}"),
            EntityId::EmailAddress(_) => (&self.config.email_filter, "{email}"),
            EntityId::ClientId(_) => (&self.config.client_id_filter, "{client_id}"),
        };
        template.replace(placeholder, &escape_filter(id.value()))
    }
}

/// One request's view of the directory over a single session.
struct DirectoryLookup<'a> {
    resolver: &'a LdapResolver,
    session: Mutex<Box<dyn DirectorySession>>,
}

impl DirectoryLookup<'_> {
    async fn search(&self, base_dn: &str, filter: String, attributes: Vec<String>) -> Result<Vec<DirectoryEntry>> {
        let request = SearchRequest {
            base_dn: base_dn.to_string(),
            filter,
            attributes,
        };
        debug!(base_dn = %request.base_dn, filter = %request.filter, "Performing LDAP search");
        let mut session = self.session.lock().await;
        let entries = tokio::time::timeout(self.resolver.config.read_timeout, session.search(&request))
            .await
            .map_err(|_| Error::ErsBackendFailed("LDAP search timed out".to_string()))??;
        debug!(entries_found = entries.len(), "LDAP search completed");
        Ok(entries)
    }

    async fn expand_groups(&self, entry: &DirectoryEntry, record: &mut Record) -> Result<()> {
        let config = &self.resolver.config;
        let Some(base) = config.group_search_base.as_deref().filter(|b| !b.is_empty()) else {
            return Ok(());
        };
        if record.contains_key("groups") {
            return Ok(());
        }
        let filter = config.group_filter.replace("{dn}", &escape_filter(&entry.dn));
        let groups: Vec<Value> = self
            .search(base, filter, vec!["cn".to_string()])
            .await?
            .into_iter()
            .map(|g| {
                let name = g.values("cn").first().cloned().unwrap_or(g.dn);
                Value::String(name)
            })
            .collect();
        if !groups.is_empty() {
            record.insert("groups".to_string(), Value::Array(groups));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordSource for DirectoryLookup<'_> {
    async fn lookup(&self, entity: &Entity) -> Result<Vec<Record>> {
        let config = &self.resolver.config;
        let attributes = config.attribute_mapping.requested(config.include_groups);
        let entries = self
            .search(&config.base_dn, self.resolver.filter_for(&entity.id), attributes)
            .await
            .map_err(|e| Error::ErsBackendFailed(format!("LDAP search failed: {e}")))?;
        let mut records = Vec::with_capacity(entries.len());
        for entry in &entries {
            let mut record = entry_to_record(entry, &config.attribute_mapping);
            if config.include_groups {
                self.expand_groups(entry, &mut record).await?;
            }
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl EntityResolver for LdapResolver {
    fn name(&self) -> &'static str {
        "ldap"
    }

    async fn resolve_entities(&self, entities: &[Entity]) -> Result<Vec<EntityRepresentation>> {
        let lookup = DirectoryLookup {
            resolver: self,
            session: Mutex::new(self.open().await?),
        };
        resolve_with(&lookup, self.config.inferid.from, entities).await
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryDirectory;
    use super::*;
    use crate::config::{ErsConfig, InferFrom};
    use crate::ers::{Category, EntityResolverRegistry};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn directory() -> InMemoryDirectory {
        let dir = InMemoryDirectory::new();
        dir.add_credentials("cn=ers,dc=example,dc=org", "secret");
        dir.add_entry(
            DirectoryEntry::new("uid=alice,ou=people,dc=example,dc=org")
                .with("uid", &["alice"])
                .with("mail", &["alice@example.org"])
                .with("displayName", &["Alice"])
                .with("memberOf", &["cn=admins,ou=groups,dc=example,dc=org", "cn=staff,ou=groups,dc=example,dc=org"]),
        );
        dir.add_entry(
            DirectoryEntry::new("uid=bob,ou=people,dc=example,dc=org")
                .with("uid", &["bob"])
                .with("mail", &["bob@example.org"]),
        );
        dir.add_entry(
            DirectoryEntry::new("cn=readers,ou=groups,dc=example,dc=org")
                .with("cn", &["readers"])
                .with("member", &["uid=bob,ou=people,dc=example,dc=org"]),
        );
        dir
    }

    fn config() -> LdapConfig {
        LdapConfig {
            servers: vec!["ldap1".into(), "ldap2".into()],
            bind_dn: Some("cn=ers,dc=example,dc=org".into()),
            bind_password: Some("secret".into()),
            base_dn: "ou=people,dc=example,dc=org".into(),
            ..LdapConfig::default()
        }
    }

    #[test]
    fn escape_filter_covers_special_characters() {
        assert_eq!(escape_filter("a*b(c)d\\e\0"), "a\\2ab\\28c\\29d\\5ce\\00");
        assert_eq!(escape_filter("plain"), "plain");
    }

    #[test]
    fn default_port_follows_tls() {
        assert_eq!(LdapConfig::default().effective_port(), 636);
        let plain = LdapConfig {
            use_tls: false,
            ..LdapConfig::default()
        };
        assert_eq!(plain.effective_port(), 389);
    }

    #[test]
    fn entry_maps_attributes_to_canonical_names() {
        let entry = DirectoryEntry::new("uid=x,dc=o")
            .with("uid", &["x"])
            .with("memberOf", &["g1", "g2"])
            .with("title", &["eng"]);
        let record = entry_to_record(&entry, &AttributeMapping::default());
        assert_eq!(
            Value::Object(record),
            json!({"dn": "uid=x,dc=o", "username": "x", "groups": ["g1", "g2"], "title": "eng"})
        );
    }

    #[tokio::test]
    async fn resolves_by_username_with_failover() {
        // GIVEN: the first server is down
        let dir = directory();
        dir.set_offline("ldap1");
        let resolver = LdapResolver::new(config(), Arc::new(dir)).unwrap();

        // WHEN: resolving a user
        let reps = resolver
            .resolve_entities(&[Entity::new(EntityId::UserName("alice".into()), Category::Subject)])
            .await
            .unwrap();

        // THEN: the second server answered with the mapped record
        let record = &reps[0].additional_props[0];
        assert_eq!(reps[0].original_id, "entity-0");
        assert_eq!(record["username"], "alice");
        assert_eq!(record["display_name"], "Alice");
        assert_eq!(record["groups"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn injection_attempt_finds_nothing() {
        let resolver = LdapResolver::new(config(), Arc::new(directory())).unwrap();
        let err = resolver
            .resolve_entities(&[Entity::new(EntityId::UserName("*".into()), Category::Subject)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ErsNotFound(_)));
    }

    #[tokio::test]
    async fn bad_bind_fails_every_server() {
        let cfg = LdapConfig {
            bind_password: Some("wrong".into()),
            ..config()
        };
        let resolver = LdapResolver::new(cfg, Arc::new(directory())).unwrap();
        let err = resolver
            .resolve_entities(&[Entity::new(EntityId::UserName("alice".into()), Category::Subject)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ErsBackendFailed(_)));
    }

    #[tokio::test]
    async fn group_search_expands_membership() {
        let cfg = LdapConfig {
            group_search_base: Some("ou=groups,dc=example,dc=org".into()),
            ..config()
        };
        let resolver = LdapResolver::new(cfg, Arc::new(directory())).unwrap();
        let reps = resolver
            .resolve_entities(&[Entity::new(EntityId::EmailAddress("bob@example.org".into()), Category::Subject)])
            .await
            .unwrap();
        assert_eq!(reps[0].additional_props[0]["groups"], json!(["readers"]));
    }

    #[tokio::test]
    async fn unknown_client_is_inferred_when_enabled() {
        let cfg = LdapConfig {
            inferid: InferIdConfig {
                from: InferFrom {
                    clientid: true,
                    ..InferFrom::default()
                },
            },
            ..config()
        };
        let resolver = LdapResolver::new(cfg, Arc::new(directory())).unwrap();
        let reps = resolver
            .resolve_entities(&[Entity::new(EntityId::ClientId("svc".into()), Category::Environment).with_ephemeral_id("c1")])
            .await
            .unwrap();
        assert_eq!(reps[0].original_id, "c1");
        assert_eq!(reps[0].additional_props[0]["clientId"], "svc");
    }

    #[tokio::test]
    async fn registered_connector_replaces_the_default() {
        // GIVEN: the in-memory directory registered as the ldap backend
        let mut registry = EntityResolverRegistry::new();
        registry.register_ldap(Arc::new(directory()));
        let ers = ErsConfig {
            backend: Some("ldap".into()),
            ldap: config(),
            ..ErsConfig::default()
        };

        // WHEN: built and queried by email
        let resolver = registry.build(&ers, reqwest::Client::new()).await.unwrap();
        let reps = resolver
            .resolve_entities(&[Entity::new(EntityId::EmailAddress("alice@example.org".into()), Category::Subject)])
            .await
            .unwrap();

        // THEN: the entry comes back under canonical names
        assert_eq!(resolver.name(), "ldap");
        assert_eq!(reps[0].additional_props[0]["username"], "alice");
        assert_eq!(reps[0].additional_props[0]["email"], "alice@example.org");
    }

    #[test]
    fn ldap3_url_follows_transport() {
        let mut address = ServerAddress {
            host: "ldap.example.org".into(),
            port: 636,
            transport: Transport::Ldaps,
            insecure_tls: false,
        };
        assert_eq!(Ldap3Connector::url(&address), "ldaps://ldap.example.org:636");
        address.transport = Transport::StartTls;
        address.port = 389;
        assert_eq!(Ldap3Connector::url(&address), "ldap://ldap.example.org:389");
    }

    #[test]
    fn debug_redacts_bind_password() {
        let rendered = format!("{:?}", config());
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains(REDACTED));
    }
}
