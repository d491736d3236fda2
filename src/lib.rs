//! TDF Access Core
//!
//! Authentication, authorization, entity resolution and key-access
//! reasoning for a TDF data-protection platform.
//!
//! # Features
//!
//! - **Authentication**: Bearer and DPoP-bound access tokens from one or more
//!   OIDC issuers, with JWKS caching and UserInfo enrichment
//! - **Authorization**: role-based (`v1`) and dimension-aware (`v2`) policy
//!   evaluation behind one [`authz::Authorizer`] trait
//! - **Resolvers**: per-RPC extraction of authorization dimensions from the
//!   request body
//! - **Entity Resolution**: directory, relational and Keycloak backends that
//!   turn identifiers and tokens into entity records
//! - **Reasoner**: attribute values to key-access-server split plans
//!
//! The request pipeline is an `axum` middleware:
//! [`auth::access_middleware`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod auth;
pub mod authz;
pub mod cli;
pub mod config;
pub mod error;
pub mod ers;
pub mod oidc;
pub mod reasoner;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` wins over `level`. `format` of `"json"` selects JSON lines.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("installing tracing subscriber: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("installing tracing subscriber: {e}")))?,
    }

    Ok(())
}
