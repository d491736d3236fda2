//! Access server: the interceptor in front of a small set of handlers.
//!
//! | Route | Handler |
//! |-------|---------|
//! | `GET /healthz` | liveness (public) |
//! | `GET /.well-known/opentdf-configuration` | issuer and public client id (public) |
//! | `POST /entityresolution.EntityResolutionService/ResolveEntities` | ERS |
//! | `POST /entityresolution.EntityResolutionService/CreateEntityChainsFromTokens` | ERS |
//! | anything else | echoes the caller's identity, bound DPoP key and resolved dimensions |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{OriginalUri, State},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::auth::{AuthContext, Authenticator, Interceptor, RoleProviderRegistry, access_middleware};
use crate::auth::interceptor::error_response;
use crate::authz::{AuthorizerRegistry, AuthorizerSettings, ResolverContext, ResolverRegistry};
use crate::config::Config;
use crate::ers::{Entity, EntityResolver, EntityResolverRegistry, TokenInput};
use crate::oidc::{OidcProviders, http_client};
use crate::{Error, Result};

/// ERS RPC prefix.
pub const ERS_SERVICE: &str = "/entityresolution.EntityResolutionService";

/// Shared handler state
pub struct AppState {
    /// Entity resolution backend, when configured
    pub ers: Option<Arc<dyn EntityResolver>>,
    /// First configured issuer
    pub issuer: Option<String>,
    /// Public client id advertised to SDKs
    pub public_client_id: Option<String>,
}

/// Access server
pub struct AccessServer {
    config: Config,
    interceptor: Arc<Interceptor>,
    state: Arc<AppState>,
    providers: Option<Arc<OidcProviders>>,
    resolvers: Arc<ResolverRegistry>,
}

impl AccessServer {
    /// Build the whole pipeline from configuration.
    ///
    /// Issuer discovery and the first JWKS load happen here; failure is fatal.
    pub async fn new(config: Config) -> Result<Self> {
        let http = http_client(config.auth.allow_insecure_http, config.server.request_timeout)?;

        let providers = if config.auth.enabled {
            let providers =
                OidcProviders::discover(http.clone(), &config.auth.issuers, config.auth.userinfo_ttl).await?;
            Some(Arc::new(providers))
        } else {
            warn!("AUTHENTICATION disabled - every request passes unauthenticated");
            None
        };

        let authenticator = providers
            .as_deref()
            .map(|p| Authenticator::new(&config.auth, &config.server, p).map(Arc::new))
            .transpose()?;

        let roles = RoleProviderRegistry::new().build(&config.auth.role_provider, &config.auth.groups_claim)?;
        let authorizer = AuthorizerRegistry::new().build(&AuthorizerSettings {
            authz: config.authz.clone(),
            roles,
            username_claim: config.auth.username_claim.clone(),
        })
        .await?;

        let resolvers = Arc::new(ResolverRegistry::new());
        let interceptor = Arc::new(
            Interceptor::new(authenticator, authorizer, Arc::clone(&resolvers))
                .with_resolver_error_code(config.authz.resolver_error_code)
                .with_body_limit(config.server.max_body_bytes),
        );

        let ers = match config.ers.backend {
            Some(_) => Some(EntityResolverRegistry::new().build(&config.ers, http).await?),
            None => None,
        };

        let state = Arc::new(AppState {
            ers,
            issuer: config.auth.issuers.first().cloned(),
            public_client_id: config.auth.public_client_id.clone(),
        });

        Ok(Self {
            config,
            interceptor,
            state,
            providers,
            resolvers,
        })
    }

    /// Server over an already-built interceptor and the registry it consults.
    #[must_use]
    pub fn from_parts(
        config: Config,
        interceptor: Arc<Interceptor>,
        resolvers: Arc<ResolverRegistry>,
        state: AppState,
    ) -> Self {
        Self {
            config,
            interceptor,
            state: Arc::new(state),
            providers: None,
            resolvers,
        }
    }

    /// Registry services use to claim their resolvers.
    #[must_use]
    pub fn resolvers(&self) -> &Arc<ResolverRegistry> {
        &self.resolvers
    }

    /// Router with the access middleware installed.
    pub fn router(&self) -> Router {
        create_router(
            Arc::clone(&self.state),
            Arc::clone(&self.interceptor),
            self.config.server.request_timeout,
        )
    }

    /// Serve until Ctrl+C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let shutdown = CancellationToken::new();
        let mut background = Vec::new();
        if let Some(providers) = &self.providers {
            background.push(providers.spawn_jwks_refresher(self.config.auth.cache_refresh, shutdown.child_token()));
            background.push(providers.spawn_userinfo_sweeper(self.config.auth.userinfo_ttl, shutdown.child_token()));
        }

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!(
            version = env!("CARGO_PKG_VERSION"),
            host = %self.config.server.host,
            port = self.config.server.port,
            authz = %self.config.authz.version,
            issuers = self.config.auth.issuers.len(),
            ers = self.config.ers.backend.as_deref().unwrap_or("none"),
            "TDF access server listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        shutdown.cancel();
        for handle in background {
            let _ = handle.await;
        }
        info!("Server shutdown complete");
        Ok(())
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>, interceptor: Arc<Interceptor>, timeout: std::time::Duration) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/.well-known/opentdf-configuration", get(well_known_handler))
        .route(&format!("{ERS_SERVICE}/ResolveEntities"), post(resolve_entities_handler))
        .route(
            &format!("{ERS_SERVICE}/CreateEntityChainsFromTokens"),
            post(create_chains_handler),
        )
        .fallback(echo_handler)
        .layer(middleware::from_fn_with_state(interceptor, access_middleware))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn well_known_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "idp": {
            "issuer": state.issuer,
            "public_client_id": state.public_client_id,
        }
    }))
}

#[derive(Debug, Deserialize)]
struct ResolveEntitiesBody {
    #[serde(default)]
    entities: Vec<Entity>,
}

#[derive(Debug, Deserialize)]
struct CreateChainsBody {
    #[serde(default)]
    tokens: Vec<TokenInput>,
}

fn ers_backend(state: &AppState) -> std::result::Result<&Arc<dyn EntityResolver>, Response> {
    state.ers.as_ref().ok_or_else(|| {
        warn!("Entity resolution requested but no backend is configured");
        error_response(crate::error::Code::NotFound)
    })
}

async fn resolve_entities_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResolveEntitiesBody>,
) -> Response {
    let ers = match ers_backend(&state) {
        Ok(ers) => ers,
        Err(response) => return response,
    };
    match ers.resolve_entities(&body.entities).await {
        Ok(representations) => Json(json!({ "entityRepresentations": representations })).into_response(),
        Err(e) => {
            warn!(backend = ers.name(), error = %e, "Entity resolution failed");
            error_response(e.code())
        }
    }
}

async fn create_chains_handler(State(state): State<Arc<AppState>>, Json(body): Json<CreateChainsBody>) -> Response {
    let ers = match ers_backend(&state) {
        Ok(ers) => ers,
        Err(response) => return response,
    };
    match ers.create_entity_chains_from_tokens(&body.tokens).await {
        Ok(chains) => Json(json!({ "entityChains": chains })).into_response(),
        Err(e) => {
            warn!(backend = ers.name(), error = %e, "Entity chain creation failed");
            error_response(e.code())
        }
    }
}

async fn echo_handler(
    OriginalUri(uri): OriginalUri,
    auth: Option<Extension<AuthContext>>,
    resources: Option<Extension<ResolverContext>>,
) -> impl IntoResponse {
    let subject = auth.as_ref().and_then(|Extension(a)| a.token.subject().map(str::to_string));
    let dpop_jwk = auth
        .as_ref()
        .and_then(|Extension(a)| a.dpop.as_ref().map(|p| p.jwk_json.clone()));
    let dims = resources.map(|Extension(r)| r.dimensions());
    let value: Value = json!({
        "rpc": uri.path(),
        "subject": subject,
        "dpop_jwk": dpop_jwk,
        "dims": dims,
    });
    Json(value)
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
        () = shutdown.cancelled() => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
