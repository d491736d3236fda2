//! Relational entity resolution over `sqlx`'s `Any` driver.
//!
//! Each entity type has one parameterized query taking the identifier as
//! its only bind argument. Rows become records; columns named in
//! [`ColumnMapping`] are renamed to their canonical field.
//!
//! The connection string is either `dsn` (used verbatim) or assembled from
//! `host`/`port`/`database`/`username`/`password` for the configured
//! `driver`. When both `dsn` and `driver` are present they must agree.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row};
use tracing::{debug, error, info};
use url::Url;

use super::{Entity, EntityId, EntityRepresentation, EntityResolver, Record, RecordSource, resolve_with};
use crate::config::{InferIdConfig, REDACTED, humantime_serde};
use crate::{Error, Result};

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    /// PostgreSQL
    Postgres,
    /// MySQL / MariaDB
    MySql,
    /// SQLite
    Sqlite,
}

impl Driver {
    /// Parse a configured driver name.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pgx" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            other => Err(Error::Config(format!("unsupported SQL driver '{other}'"))),
        }
    }

    /// Detect the driver from a DSN's scheme.
    #[must_use]
    pub fn from_dsn(dsn: &str) -> Option<Self> {
        let scheme = dsn.split_once(':')?.0;
        match scheme {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mysql" | "mariadb" => Some(Self::MySql),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }

    fn scheme(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::MySql => 3306,
            Self::Sqlite => 0,
        }
    }
}

/// Query per entity type. Each takes one bind parameter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueryMapping {
    /// Lookup by user name
    pub username_query: Option<String>,
    /// Lookup by email address
    pub email_query: Option<String>,
    /// Lookup by client id
    pub client_id_query: Option<String>,
    /// Group membership by user name (folded into the record as `groups`)
    pub groups_query: Option<String>,
    /// Extra attributes by user name (merged into the record)
    pub attributes_query: Option<String>,
}

/// Source column for each canonical field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ColumnMapping {
    /// Column holding the user name
    pub username: String,
    /// Column holding the email address
    pub email: String,
    /// Column holding the display name
    pub display_name: String,
    /// Column holding the client id
    pub client_id: String,
    /// Column holding group names
    pub groups: String,
    /// Extra columns copied through unchanged
    pub additional: Vec<String>,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            username: "username".to_string(),
            email: "email".to_string(),
            display_name: "display_name".to_string(),
            client_id: "client_id".to_string(),
            groups: "groups".to_string(),
            additional: Vec::new(),
        }
    }
}

impl ColumnMapping {
    /// Canonical field name for a source column, if mapped.
    fn canonical(&self, column: &str) -> Option<&'static str> {
        [
            (self.username.as_str(), "username"),
            (self.email.as_str(), "email"),
            (self.display_name.as_str(), "display_name"),
            (self.client_id.as_str(), "client_id"),
            (self.groups.as_str(), "groups"),
        ]
        .into_iter()
        .find(|(source, _)| source.eq_ignore_ascii_case(column))
        .map(|(_, canonical)| canonical)
    }
}

/// Relational backend settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    /// `postgres`, `mysql` or `sqlite`
    pub driver: Option<String>,
    /// Full connection string; overrides the individual fields
    pub dsn: Option<String>,
    /// Database host
    pub host: String,
    /// Database port (driver default when 0)
    pub port: u16,
    /// Database name, or file path for SQLite
    pub database: String,
    /// Login user
    pub username: Option<String>,
    /// Login password
    pub password: Option<String>,
    /// PostgreSQL `sslmode`
    pub ssl_mode: String,
    /// Pool size
    pub max_open_conns: u32,
    /// Connections kept warm in the pool
    pub max_idle_conns: u32,
    /// Recycle connections after this long
    #[serde(with = "humantime_serde")]
    pub conn_max_lifetime: Duration,
    /// Connect / acquire timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-query timeout
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
    /// Queries per entity type
    pub query_mapping: QueryMapping,
    /// Column renames
    pub column_mapping: ColumnMapping,
    /// Inference flags
    pub inferid: InferIdConfig,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            driver: None,
            dsn: None,
            host: "localhost".to_string(),
            port: 0,
            database: String::new(),
            username: None,
            password: None,
            ssl_mode: "prefer".to_string(),
            max_open_conns: 25,
            max_idle_conns: 5,
            conn_max_lifetime: Duration::from_secs(30 * 60),
            connect_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(30),
            query_mapping: QueryMapping::default(),
            column_mapping: ColumnMapping::default(),
            inferid: InferIdConfig::default(),
        }
    }
}

impl fmt::Debug for SqlConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlConfig")
            .field("driver", &self.driver)
            .field("dsn", &self.dsn.as_ref().map(|_| REDACTED))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .field("ssl_mode", &self.ssl_mode)
            .field("max_open_conns", &self.max_open_conns)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("conn_max_lifetime", &self.conn_max_lifetime)
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout", &self.query_timeout)
            .field("query_mapping", &self.query_mapping)
            .field("column_mapping", &self.column_mapping)
            .field("inferid", &self.inferid)
            .finish()
    }
}

impl SqlConfig {
    /// Resolve the driver from `driver` or the DSN scheme.
    pub fn resolved_driver(&self) -> Result<Driver> {
        let from_dsn = self.dsn.as_deref().and_then(Driver::from_dsn);
        match (self.driver.as_deref().filter(|d| !d.is_empty()), from_dsn) {
            (Some(name), Some(detected)) => {
                let configured = Driver::parse(name)?;
                if configured == detected {
                    Ok(configured)
                } else {
                    Err(Error::Config(format!(
                        "ers.sql.driver '{name}' does not match the dsn scheme"
                    )))
                }
            }
            (Some(name), None) => Driver::parse(name),
            (None, Some(detected)) => Ok(detected),
            (None, None) => Err(Error::Config(
                "ers.sql needs a driver or a dsn with a recognised scheme".to_string(),
            )),
        }
    }

    /// Connection URL for `sqlx`.
    pub fn connection_url(&self) -> Result<String> {
        let driver = self.resolved_driver()?;
        if let Some(dsn) = self.dsn.as_deref().filter(|d| !d.is_empty()) {
            if Driver::from_dsn(dsn).is_some() {
                return Ok(dsn.to_string());
            }
            if driver == Driver::Sqlite {
                return Ok(format!("sqlite:{dsn}"));
            }
            return Err(Error::Config(
                "ers.sql.dsn must be a URL (postgres://, mysql://, sqlite:)".to_string(),
            ));
        }
        build_dsn(driver, self)
    }
}

/// Assemble a connection URL from the individual fields.
pub fn build_dsn(driver: Driver, config: &SqlConfig) -> Result<String> {
    if driver == Driver::Sqlite {
        if config.database.is_empty() || config.database == ":memory:" {
            return Ok("sqlite::memory:".to_string());
        }
        return Ok(format!("sqlite://{}?mode=ro", config.database));
    }
    let port = if config.port == 0 {
        driver.default_port()
    } else {
        config.port
    };
    let mut url = Url::parse(&format!("{}://{}:{port}", driver.scheme(), config.host))
        .map_err(|e| Error::Config(format!("ers.sql host: {e}")))?;
    url.set_path(&config.database);
    if let Some(user) = &config.username {
        url.set_username(user)
            .map_err(|()| Error::Config("ers.sql.username cannot be set".to_string()))?;
    }
    if let Some(password) = &config.password {
        url.set_password(Some(password))
            .map_err(|()| Error::Config("ers.sql.password cannot be set".to_string()))?;
    }
    if driver == Driver::Postgres && !config.ssl_mode.is_empty() {
        url.query_pairs_mut().append_pair("sslmode", &config.ssl_mode);
    }
    Ok(url.into())
}

/// Relational entity resolver.
pub struct SqlResolver {
    pool: AnyPool,
    config: SqlConfig,
}

impl fmt::Debug for SqlResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlResolver").field("config", &self.config).finish_non_exhaustive()
    }
}

impl SqlResolver {
    /// Open the pool and check connectivity.
    pub async fn connect(config: SqlConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let url = config.connection_url()?;
        let driver = config.resolved_driver()?;
        debug!(config = ?config, "SQL entity resolution configuration");

        // Every connection to an in-memory SQLite database is a new database.
        let (max, min) = if url.starts_with("sqlite::memory:") {
            (1, 0)
        } else {
            (config.max_open_conns.max(1), config.max_idle_conns.min(config.max_open_conns))
        };
        let pool = AnyPoolOptions::new()
            .max_connections(max)
            .min_connections(min)
            .max_lifetime(config.conn_max_lifetime)
            .acquire_timeout(config.connect_timeout)
            .connect(&url)
            .await
            .map_err(|e| {
                error!(driver = ?driver, error = %e, "Failed to open SQL connection");
                Error::ErsBackendFailed(format!("SQL connection failed: {e}"))
            })?;

        info!(driver = ?driver, "SQL entity resolution connected");
        Ok(Self { pool, config })
    }

    /// Resolver over an existing pool.
    #[must_use]
    pub fn with_pool(pool: AnyPool, config: SqlConfig) -> Self {
        Self { pool, config }
    }

    fn query_for(&self, id: &EntityId) -> Result<&str> {
        let mapping = &self.config.query_mapping;
        let (query, kind) = match id {
            EntityId::UserName(_) => (&mapping.username_query, "username"),
            EntityId::EmailAddress(_) => (&mapping.email_query, "email"),
            EntityId::ClientId(_) => (&mapping.client_id_query, "client id"),
        };
        query
            .as_deref()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| Error::ErsBackendFailed(format!("{kind} query not configured")))
    }

    /// Run `query` with one bind argument.
    pub async fn execute(&self, query: &str, param: &str) -> Result<Vec<Record>> {
        let fetch = sqlx::query(query).bind(param.to_string()).fetch_all(&self.pool);
        let rows = tokio::time::timeout(self.config.query_timeout, fetch)
            .await
            .map_err(|_| Error::ErsBackendFailed("SQL query timed out".to_string()))?
            .map_err(|e| Error::ErsBackendFailed(format!("SQL query failed: {e}")))?;
        Ok(rows.iter().map(|row| self.row_to_record(row)).collect())
    }

    fn row_to_record(&self, row: &AnyRow) -> Record {
        let mut record = Record::new();
        for (index, column) in row.columns().iter().enumerate() {
            let name = column.name();
            let key = self
                .config
                .column_mapping
                .canonical(name)
                .map_or_else(|| name.to_string(), str::to_string);
            record.insert(key, column_value(row, index));
        }
        record
    }

    async fn enrich(&self, record: &mut Record, username: &str) -> Result<()> {
        let mapping = &self.config.query_mapping;
        if let Some(query) = mapping.groups_query.as_deref().filter(|q| !q.trim().is_empty()) {
            let groups: Vec<Value> = self
                .execute(query, username)
                .await?
                .into_iter()
                .filter_map(|row| row.into_iter().next().map(|(_, v)| v))
                .collect();
            record.insert("groups".to_string(), Value::Array(groups));
        }
        if let Some(query) = mapping.attributes_query.as_deref().filter(|q| !q.trim().is_empty()) {
            for row in self.execute(query, username).await? {
                for (k, v) in row {
                    record.entry(k).or_insert(v);
                }
            }
        }
        Ok(())
    }
}

/// Decode one column into JSON, trying text, integer, float, bool, bytes.
fn column_value(row: &AnyRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(Value::Null, Value::String);
    }
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(index) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(index) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<bool>, _>(index) {
        return Value::Bool(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return Value::String(String::from_utf8_lossy(&v).into_owned());
    }
    Value::Null
}

#[async_trait]
impl RecordSource for SqlResolver {
    async fn lookup(&self, entity: &Entity) -> Result<Vec<Record>> {
        let query = self.query_for(&entity.id)?;
        let mut records = self.execute(query, entity.id.value()).await.map_err(|e| {
            error!(kind = entity.id.kind(), error = %e, "SQL lookup failed");
            e
        })?;
        for record in &mut records {
            let username = record
                .get("username")
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(username) = username {
                self.enrich(record, &username).await?;
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl EntityResolver for SqlResolver {
    fn name(&self) -> &'static str {
        "sql"
    }

    async fn resolve_entities(&self, entities: &[Entity]) -> Result<Vec<EntityRepresentation>> {
        resolve_with(self, self.config.inferid.from, entities).await
    }
}
