//! Entity resolution tests: SQL over SQLite, the default directory backend
//! and the ERS HTTP routes.

use std::time::Duration;

use axum::{
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use tower::ServiceExt;

use tdf_access_core::config::{Config, ErsConfig, InferFrom, InferIdConfig};
use tdf_access_core::error::Code;
use tdf_access_core::ers::ldap::LdapConfig;
use tdf_access_core::ers::sql::{ColumnMapping, QueryMapping, SqlConfig, SqlResolver};
use tdf_access_core::ers::{Category, Entity, EntityId, EntityResolver, EntityResolverRegistry};
use tdf_access_core::server::AccessServer;

const SCHEMA: &[&str] = &[
    "CREATE TABLE users (login TEXT NOT NULL, mail TEXT, display_name TEXT, level INTEGER)",
    "CREATE TABLE user_groups (login TEXT NOT NULL, group_name TEXT NOT NULL)",
    "CREATE TABLE clients (client_id TEXT NOT NULL, owner TEXT)",
    "INSERT INTO users VALUES ('alice', 'alice@example.org', 'Alice', 3)",
    "INSERT INTO users VALUES ('bob', 'bob@example.org', NULL, 1)",
    "INSERT INTO user_groups VALUES ('alice', 'staff')",
    "INSERT INTO user_groups VALUES ('alice', 'admins')",
    "INSERT INTO clients VALUES ('tdf-sdk', 'platform')",
];

async fn seed(url: &str) -> AnyPool {
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .connect(url)
        .await
        .unwrap();
    for statement in SCHEMA {
        sqlx::query(statement).execute(&pool).await.unwrap();
    }
    pool
}

fn sql_config(dsn: &str) -> SqlConfig {
    SqlConfig {
        dsn: Some(dsn.to_string()),
        query_mapping: QueryMapping {
            username_query: Some("SELECT login, mail, display_name, level FROM users WHERE login = ?".into()),
            email_query: Some("SELECT login, mail, display_name FROM users WHERE mail = ?".into()),
            client_id_query: Some("SELECT client_id, owner FROM clients WHERE client_id = ?".into()),
            groups_query: Some("SELECT group_name FROM user_groups WHERE login = ? ORDER BY group_name".into()),
            attributes_query: None,
        },
        column_mapping: ColumnMapping {
            username: "login".into(),
            email: "mail".into(),
            ..ColumnMapping::default()
        },
        query_timeout: Duration::from_secs(5),
        ..SqlConfig::default()
    }
}

async fn memory_resolver(infer: InferFrom) -> SqlResolver {
    let pool = seed("sqlite::memory:").await;
    let mut config = sql_config("sqlite::memory:");
    config.inferid = InferIdConfig { from: infer };
    SqlResolver::with_pool(pool, config)
}

fn user(name: &str) -> Entity {
    Entity::new(EntityId::UserName(name.to_string()), Category::Subject)
}

#[tokio::test]
async fn test_sql_user_record_uses_canonical_columns() {
    // GIVEN: users keyed by a `login` column
    let resolver = memory_resolver(InferFrom::default()).await;

    // WHEN: alice is resolved
    let reps = resolver
        .resolve_entities(&[user("alice").with_ephemeral_id("e-alice")])
        .await
        .unwrap();

    // THEN: columns are renamed and groups folded in
    assert_eq!(reps.len(), 1);
    assert_eq!(reps[0].original_id, "e-alice");
    assert_eq!(
        Value::Object(reps[0].additional_props[0].clone()),
        json!({
            "username": "alice",
            "email": "alice@example.org",
            "display_name": "Alice",
            "level": 3,
            "groups": ["admins", "staff"],
        })
    );
}

#[tokio::test]
async fn test_sql_null_columns_become_null() {
    let resolver = memory_resolver(InferFrom::default()).await;
    let reps = resolver
        .resolve_entities(&[Entity::new(
            EntityId::EmailAddress("bob@example.org".into()),
            Category::Subject,
        )])
        .await
        .unwrap();
    let record = &reps[0].additional_props[0];
    assert_eq!(record["username"], "bob");
    assert_eq!(record["display_name"], Value::Null);
    assert_eq!(record["groups"], json!([]));
}

#[tokio::test]
async fn test_sql_preserves_identity_and_order() {
    // GIVEN: mixed entities, some without an ephemeral id, one only inferable
    let resolver = memory_resolver(InferFrom {
        email: true,
        ..InferFrom::default()
    })
    .await;
    let entities = vec![
        user("bob"),
        Entity::new(EntityId::ClientId("tdf-sdk".into()), Category::Environment).with_ephemeral_id("client"),
        Entity::new(EntityId::EmailAddress("nobody@example.org".into()), Category::Subject),
        user("alice").with_ephemeral_id("e-4"),
    ];

    // WHEN: resolved together
    let reps = resolver.resolve_entities(&entities).await.unwrap();

    // THEN: one representation per input, ids preserved or synthesized
    let ids: Vec<&str> = reps.iter().map(|r| r.original_id.as_str()).collect();
    assert_eq!(ids, vec!["entity-0", "client", "entity-2", "e-4"]);
    assert_eq!(reps[1].additional_props[0]["owner"], "platform");
    assert_eq!(reps[2].additional_props[0]["emailAddress"], "nobody@example.org");
}

#[tokio::test]
async fn test_sql_unknown_user_is_not_found_without_inference() {
    let resolver = memory_resolver(InferFrom::default()).await;
    let err = resolver.resolve_entities(&[user("mallory")]).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_sql_unconfigured_query_is_a_backend_failure() {
    let pool = seed("sqlite::memory:").await;
    let mut config = sql_config("sqlite::memory:");
    config.query_mapping.client_id_query = None;
    let resolver = SqlResolver::with_pool(pool, config);

    let err = resolver
        .resolve_entities(&[Entity::new(EntityId::ClientId("tdf-sdk".into()), Category::Environment)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
}

#[tokio::test]
async fn test_ldap_backend_is_registered_by_default() {
    // GIVEN: an ldap backend pointing at a port nothing listens on
    let config = ErsConfig {
        backend: Some("ldap".into()),
        ldap: LdapConfig {
            servers: vec!["127.0.0.1".into()],
            port: 1,
            use_tls: false,
            base_dn: "ou=people,dc=example,dc=org".into(),
            connect_timeout: Duration::from_secs(2),
            ..LdapConfig::default()
        },
        ..ErsConfig::default()
    };

    // WHEN: built from configuration alone
    let resolver = EntityResolverRegistry::new()
        .build(&config, reqwest::Client::new())
        .await
        .unwrap();
    assert_eq!(resolver.name(), "ldap");

    // THEN: queries reach the network and fail as a backend error
    let err = resolver
        .resolve_entities(&[Entity::new(EntityId::UserName("alice".into()), Category::Subject)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert!(err.to_string().contains("LDAP server"), "{err}");
}

#[tokio::test]
async fn test_ldap_backend_without_servers_is_a_config_error() {
    let config = ErsConfig {
        backend: Some("ldap".into()),
        ..ErsConfig::default()
    };
    let err = EntityResolverRegistry::new()
        .build(&config, reqwest::Client::new())
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("ers.ldap.servers"), "{err}");
}

#[tokio::test]
async fn test_unknown_backend_is_a_config_error() {
    let config = ErsConfig {
        backend: Some("directory".into()),
        ..ErsConfig::default()
    };
    let err = EntityResolverRegistry::new()
        .build(&config, reqwest::Client::new())
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("directory"), "{err}");
}

fn unsigned_jwt(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    format!("{header}.{payload}.c2ln")
}

async fn post(server: &AccessServer, path: &str, body: Value) -> (StatusCode, Value) {
    let response = server
        .router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_ers_routes_over_sqlite_file() {
    // GIVEN: a seeded SQLite file served read-only by the sql backend
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.db");
    let seeded = seed(&format!("sqlite://{}?mode=rwc", path.display())).await;
    seeded.close().await;

    let mut config = Config::default();
    config.auth.enabled = false;
    config.ers.backend = Some("sql".into());
    config.ers.sql = sql_config(&format!("sqlite://{}?mode=ro", path.display()));
    let server = AccessServer::new(config).await.unwrap();

    // WHEN: entities are resolved over HTTP
    let (status, body) = post(
        &server,
        "/entityresolution.EntityResolutionService/ResolveEntities",
        json!({"entities": [
            {"ephemeralId": "e1", "userName": "alice", "category": "CATEGORY_SUBJECT"},
            {"emailAddress": "bob@example.org"}
        ]}),
    )
    .await;

    // THEN: one representation per entity, in order
    assert_eq!(status, StatusCode::OK);
    let reps = body["entityRepresentations"].as_array().unwrap();
    assert_eq!(reps.len(), 2);
    assert_eq!(reps[0]["originalId"], "e1");
    assert_eq!(reps[0]["additionalProps"][0]["username"], "alice");
    assert_eq!(reps[1]["originalId"], "entity-1");

    // AND: an unknown user maps to not_found
    let (status, body) = post(
        &server,
        "/entityresolution.EntityResolutionService/ResolveEntities",
        json!({"entities": [{"userName": "mallory"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    // AND: entity chains come from token claims
    let jwt = unsigned_jwt(&json!({
        "azp": "tdf-sdk",
        "preferred_username": "alice",
        "email": "alice@example.org",
    }));
    let (status, body) = post(
        &server,
        "/entityresolution.EntityResolutionService/CreateEntityChainsFromTokens",
        json!({"tokens": [{"ephemeralId": "tok1", "jwt": jwt}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let chain = &body["entityChains"][0];
    assert_eq!(chain["ephemeralId"], "tok1");
    assert_eq!(
        chain["entities"],
        json!([
            {"ephemeralId": "jwtentity-0-clientid-tdf-sdk", "clientId": "tdf-sdk", "category": "CATEGORY_ENVIRONMENT"},
            {"ephemeralId": "jwtentity-1-username-alice", "userName": "alice", "category": "CATEGORY_SUBJECT"},
            {"ephemeralId": "jwtentity-2-email-alice@example.org", "emailAddress": "alice@example.org", "category": "CATEGORY_SUBJECT"},
        ])
    );
}
