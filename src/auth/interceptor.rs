//! Per-request access pipeline as an `axum` middleware.
//!
//! Order of stages:
//!
//! 1. Public routes pass straight through; no token is parsed.
//! 2. [`Authenticator::authenticate`]: token, DPoP, UserInfo.
//! 3. The RPC's resolver (if registered) turns the request body into
//!    dimensions.
//! 4. The authorizer decides.
//!
//! On success the handler sees [`AuthContext`] and, when a resolver ran,
//! [`ResolverContext`] in the request extensions. Failures return a JSON
//! body with a minimal message; the full reason is only logged.

use std::sync::Arc;

use axum::{
    Json,
    body::{Body, to_bytes},
    extract::State,
    http::{Request, StatusCode, header::WWW_AUTHENTICATE, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use super::authenticator::{AuthContext, Authenticator, RequestParts};
use crate::audit::{self, AuditEvent};
use crate::authz::action::{http_action, is_rpc_path, rpc_action};
use crate::authz::{AuthorizationRequest, Authorizer, ResolverContext, ResolverRegistry, ResolverRequest};
use crate::config::{ResolverErrorCode, ServerConfig};
use crate::error::Code;

/// Shared pipeline state.
pub struct Interceptor {
    authenticator: Option<Arc<Authenticator>>,
    authorizer: Arc<dyn Authorizer>,
    resolvers: Arc<ResolverRegistry>,
    resolver_error_code: ResolverErrorCode,
    body_limit: usize,
}

impl Interceptor {
    /// Pipeline with authentication; `None` disables authentication.
    #[must_use]
    pub fn new(
        authenticator: Option<Arc<Authenticator>>,
        authorizer: Arc<dyn Authorizer>,
        resolvers: Arc<ResolverRegistry>,
    ) -> Self {
        Self {
            authenticator,
            authorizer,
            resolvers,
            resolver_error_code: ResolverErrorCode::default(),
            body_limit: ServerConfig::default().max_body_bytes,
        }
    }

    /// Status used when a resolver fails.
    #[must_use]
    pub fn with_resolver_error_code(mut self, code: ResolverErrorCode) -> Self {
        self.resolver_error_code = code;
        self
    }

    /// Largest body buffered for resolvers.
    #[must_use]
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }
}

/// Access middleware; install with `middleware::from_fn_with_state`.
pub async fn access_middleware(
    State(interceptor): State<Arc<Interceptor>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(authenticator) = interceptor.authenticator.as_ref() else {
        return next.run(request).await;
    };

    if authenticator.is_public(&path) {
        debug!(path = %path, "Public route, skipping authentication");
        return next.run(request).await;
    }

    // Body is not `Sync`; only the head is borrowed across awaits.
    let (parts, body) = request.into_parts();
    let auth = {
        let request_parts = RequestParts {
            method: &parts.method,
            path: &path,
            query: parts.uri.query(),
            headers: &parts.headers,
        };
        match authenticator.authenticate(&request_parts).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(rpc = %path, error = %e, "Authentication failed");
                audit::emit(&AuditEvent::authn_failed(&path, e.to_string()));
                return error_response(e.code());
            }
        }
    };
    let subject = auth.token.subject().map(str::to_string);
    let azp = auth.token.client_id().map(str::to_string);

    let (request, resource_context) = match run_resolver(&interceptor, &path, parts, body).await {
        Ok(pair) => pair,
        Err(reason) => {
            warn!(rpc = %path, error = %reason, "Resolver failed");
            audit::emit(
                &AuditEvent::resolver_failed(&path, reason)
                    .with_identity(subject.as_deref(), azp.as_deref()),
            );
            return error_response(match interceptor.resolver_error_code {
                ResolverErrorCode::PermissionDenied => Code::PermissionDenied,
                ResolverErrorCode::Internal => Code::Internal,
            });
        }
    };

    let action = if is_rpc_path(&path) {
        rpc_action(&path)
    } else {
        http_action(request.method())
    };

    let decision = interceptor
        .authorizer
        .authorize(&AuthorizationRequest {
            token: Some(&auth.token),
            userinfo: auth.userinfo_claims(),
            rpc: &path,
            action,
            resource_context: resource_context.as_ref(),
        })
        .await;

    let mode = interceptor.authorizer.version().as_str();
    let dims = || {
        resource_context
            .as_ref()
            .map_or_else(|| "*".to_string(), ResolverContext::dimensions)
    };
    match decision {
        Ok(d) if d.allowed => {
            debug!(rpc = %path, matched_policy = ?d.matched_policy, "Access granted");
            audit::emit(
                &AuditEvent::allowed(&path, mode, d.matched_policy)
                    .with_identity(subject.as_deref(), azp.as_deref())
                    .with_dims(dims()),
            );
        }
        Ok(d) => {
            audit::emit(
                &AuditEvent::denied(&path, mode, d.reason)
                    .with_identity(subject.as_deref(), azp.as_deref())
                    .with_dims(dims()),
            );
            return error_response(Code::PermissionDenied);
        }
        Err(e) => {
            error!(rpc = %path, error = %e, "Authorizer failed");
            audit::emit(
                &AuditEvent::denied(&path, mode, e.to_string())
                    .with_identity(subject.as_deref(), azp.as_deref()),
            );
            return error_response(e.code());
        }
    }

    let mut request = request;
    if let Some(ctx) = resource_context {
        request.extensions_mut().insert(ctx);
    }
    request.extensions_mut().insert::<AuthContext>(auth);
    next.run(request).await
}

/// Run the resolver registered for `path`, buffering the body for it.
async fn run_resolver(
    interceptor: &Interceptor,
    path: &str,
    parts: Parts,
    body: Body,
) -> Result<(Request<Body>, Option<ResolverContext>), String> {
    if interceptor.resolvers.get(path).is_none() {
        return Ok((Request::from_parts(parts, body), None));
    }
    let bytes = to_bytes(body, interceptor.body_limit)
        .await
        .map_err(|e| format!("reading request body: {e}"))?;
    let body_json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).map_err(|e| format!("decoding request body: {e}"))?
    };
    let resolver_request = ResolverRequest {
        rpc: path.to_string(),
        body: body_json,
        headers: parts.headers.clone(),
    };
    let context = interceptor
        .resolvers
        .run(&resolver_request)
        .await
        .map_err(|e| e.to_string())?;
    Ok((Request::from_parts(parts, Body::from(bytes)), context))
}

/// JSON error body for `code`, with `WWW-Authenticate` on 401.
pub fn error_response(code: Code) -> Response {
    let status = code.http_status();
    let body = Json(json!({
        "code": code.as_str(),
        "message": code.public_message(),
    }));
    if status == StatusCode::UNAUTHORIZED {
        (status, [(WWW_AUTHENTICATE, "Bearer, DPoP")], body).into_response()
    } else {
        (status, body).into_response()
    }
}
