//! Casbin authorizer for the v1 and v2 models.
//!
//! # Subjects
//!
//! Each role from the role provider becomes `role:<role>`; the configured
//! user-name claim is added bare. A caller with neither is `role:unknown`.
//! Subjects are enforced in order and the first allowed one is reported as
//! the matched policy.
//!
//! # Model and policy
//!
//! The model is [`MODEL_V1`] or [`MODEL_V2`] unless `authz.model` supplies
//! one. The policy is the configured CSV (or the builtin policy for the
//! mode), then one `g, <group>, role:<role>` line per role-map entry, then
//! the configured extension lines. Both are loaded into an in-memory
//! enforcer with `dimensionMatch` registered.

use std::sync::Arc;

use async_trait::async_trait;
use casbin::function_map::OperatorFunction;
use casbin::{CoreApi, DefaultModel, Enforcer, MemoryAdapter, MgmtApi};
use rhai::Dynamic;
use tracing::{debug, error, warn};

use super::policy::{Policy, ROLE_PREFIX, dimension_match};
use super::{
    AuthorizationDecision, AuthorizationRequest, Authorizer, AuthorizerSettings, AuthzMode,
    ResolverContext,
};
use crate::auth::roles::{RoleProvider, lookup_claim};
use crate::{Error, Result};

/// Registry name of this engine.
pub const ENGINE_NAME: &str = "casbin";

/// Subject used when no role or user name was found.
pub const UNKNOWN_SUBJECT: &str = "role:unknown";

/// Builtin v1 model: subject, resource path, action.
pub const MODEL_V1: &str = "\
[request_definition]
r = sub, res, act

[policy_definition]
p = sub, res, act, eft

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow)) && !some(where (p.eft == deny))

[matchers]
m = g(r.sub, p.sub) && globMatch(r.res, p.res) && globMatch(r.act, p.act)
";

/// Builtin v2 model: subject, RPC path, dimensions.
pub const MODEL_V2: &str = "\
[request_definition]
r = sub, rpc, dims

[policy_definition]
p = sub, rpc, dims, eft

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow)) && !some(where (p.eft == deny))

[matchers]
m = g(r.sub, p.sub) && globMatch(r.rpc, p.rpc) && dimensionMatch(r.dims, p.dims)
";

/// Builtin v1 policy (resource path, action).
pub const DEFAULT_POLICY_V1: &str = "\
p, role:admin, *, *, allow
p, role:standard, policy.*, read, allow
p, role:standard, kas.AccessService/Rewrap, *, allow
p, role:standard, authorization.AuthorizationService/GetDecisions*, read, allow
p, role:standard, authorization.v2.AuthorizationService/GetDecision*, read, allow
p, role:standard, /attributes*, read, allow
p, role:standard, /namespaces*, read, allow
p, role:standard, /kas/v2/rewrap, write, allow
p, role:unknown, kas.AccessService/Rewrap, *, allow
p, role:unknown, /kas/v2/rewrap, *, allow
";

/// Builtin v2 policy (RPC, dimensions).
pub const DEFAULT_POLICY_V2: &str = "\
p, role:admin, *, *, allow
p, role:standard, /policy.*/Get*, *, allow
p, role:standard, /policy.*/List*, *, allow
p, role:standard, /kas.AccessService/Rewrap, *, allow
p, role:standard, /authorization.*/GetDecision*, *, allow
p, role:standard, /authorization.*/GetEntitlements*, *, allow
p, role:unknown, /kas.AccessService/Rewrap, *, allow
";

/// Role map used when none is configured.
pub const DEFAULT_ROLE_MAP: &[(&str, &str)] = &[("admin", "opentdf-admin"), ("standard", "opentdf-standard")];

/// Casbin-backed evaluator for both models.
pub struct CasbinAuthorizer {
    mode: AuthzMode,
    enforcer: Enforcer,
    roles: Arc<dyn RoleProvider>,
    username_claim: Option<String>,
}

impl CasbinAuthorizer {
    /// Build the enforcer for `settings`.
    ///
    /// A model that does not parse, or cannot evaluate a request of the
    /// mode's shape, is a configuration error.
    pub async fn new(settings: &AuthorizerSettings) -> Result<Self> {
        let mode = AuthzMode::parse(&settings.authz.version)?;
        let policy = Policy::parse(&policy_text(mode, settings), true)?;
        let model = match settings.authz.model.as_deref() {
            Some(text) if !text.trim().is_empty() => text,
            _ => match mode {
                AuthzMode::V1 => MODEL_V1,
                AuthzMode::V2 => MODEL_V2,
            },
        };
        let enforcer = build_enforcer(model, &policy).await?;
        debug!(
            mode = %mode,
            rules = policy.rules().len(),
            groupings = policy.groupings().len(),
            custom_model = settings.authz.model.is_some(),
            "Authorization policy loaded"
        );
        Ok(Self {
            mode,
            enforcer,
            roles: Arc::clone(&settings.roles),
            username_claim: settings.username_claim.clone(),
        })
    }

    /// Subjects for the caller, in evaluation order.
    pub async fn subjects(&self, request: &AuthorizationRequest<'_>) -> Result<Vec<String>> {
        let mut subjects = Vec::new();
        let Some(token) = request.token else {
            subjects.push(UNKNOWN_SUBJECT.to_string());
            return Ok(subjects);
        };
        let roles = self
            .roles
            .roles(token, request.userinfo)
            .await
            .map_err(|e| Error::AuthorizerInternal(format!("role lookup failed: {e}")))?;
        subjects.extend(roles.into_iter().map(|r| format!("{ROLE_PREFIX}{r}")));
        if let Some(claim) = &self.username_claim {
            let claims = serde_json::Value::Object(token.claims().clone());
            if let Some(name) = lookup_claim(&claims, claim).into_iter().next() {
                subjects.push(name.to_string());
            }
        }
        if subjects.is_empty() {
            subjects.push(UNKNOWN_SUBJECT.to_string());
        }
        Ok(subjects)
    }

    /// Evaluate explicit subjects; the first allowed subject wins.
    ///
    /// Subjects whose evaluation fails are skipped. When every subject
    /// fails the result is `AuthorizerInternal`.
    pub fn decide(
        &self,
        subjects: &[String],
        rpc: &str,
        action: &str,
        context: Option<&ResolverContext>,
    ) -> Result<AuthorizationDecision> {
        let (object, scope) = match self.mode {
            AuthzMode::V1 => (v1_resource(rpc), action.to_string()),
            AuthzMode::V2 => (
                rpc,
                context.map_or_else(|| "*".to_string(), ResolverContext::dimensions),
            ),
        };

        let mut last_error = None;
        let mut evaluated = false;
        for subject in subjects {
            match self.enforcer.enforce((subject.as_str(), object, scope.as_str())) {
                Ok(true) => return Ok(self.allowed(subject, object, &scope)),
                Ok(false) => evaluated = true,
                Err(e) => {
                    error!(subject = %subject, rpc = %rpc, error = %e, "Policy evaluation failed");
                    last_error = Some(e);
                }
            }
        }
        if let (false, Some(e)) = (evaluated, last_error) {
            return Err(Error::AuthorizerInternal(format!("policy evaluation failed: {e}")));
        }
        Ok(self.denied(object, &scope))
    }

    fn allowed(&self, subject: &str, object: &str, scope: &str) -> AuthorizationDecision {
        let reason = match self.mode {
            AuthzMode::V1 => format!("v1: {subject} may {scope} {object}"),
            AuthzMode::V2 => format!("v2: {subject} on {object} with dims={scope}"),
        };
        AuthorizationDecision {
            allowed: true,
            reason,
            mode: self.mode,
            matched_policy: Some(subject.to_string()),
        }
    }

    fn denied(&self, object: &str, scope: &str) -> AuthorizationDecision {
        let reason = match self.mode {
            AuthzMode::V1 => format!("v1: denied {scope} {object}"),
            AuthzMode::V2 => format!("v2: denied {object} with dims={scope}"),
        };
        AuthorizationDecision {
            allowed: false,
            reason,
            mode: self.mode,
            matched_policy: None,
        }
    }
}

#[async_trait]
impl Authorizer for CasbinAuthorizer {
    async fn authorize(&self, request: &AuthorizationRequest<'_>) -> Result<AuthorizationDecision> {
        let subjects = self.subjects(request).await?;
        let decision = self.decide(&subjects, request.rpc, request.action, request.resource_context)?;
        if !decision.allowed {
            warn!(
                rpc = %request.rpc,
                subjects = ?subjects,
                reason = %decision.reason,
                "Authorization denied"
            );
        }
        Ok(decision)
    }

    fn version(&self) -> AuthzMode {
        self.mode
    }
}

async fn build_enforcer(model_text: &str, policy: &Policy) -> Result<Enforcer> {
    let invalid = |e: casbin::Error| Error::Config(format!("invalid authorization model: {e}"));

    let model = DefaultModel::from_str(model_text).await.map_err(invalid)?;
    let mut enforcer = Enforcer::new(model, MemoryAdapter::default())
        .await
        .map_err(invalid)?;
    enforcer.add_function("dimensionMatch", OperatorFunction::Arg2(dimension_match_fn));

    let rejected = |e: casbin::Error| Error::Config(format!("policy rejected by model: {e}"));
    for row in policy.policy_rows() {
        enforcer.add_policy(row).await.map_err(rejected)?;
    }
    for row in policy.grouping_rows() {
        enforcer.add_grouping_policy(row).await.map_err(rejected)?;
    }
    enforcer.build_role_links().map_err(rejected)?;

    // Every builtin request is three strings; a model expecting another shape
    // fails here rather than on the first call.
    enforcer
        .enforce((UNKNOWN_SUBJECT, "/", "*"))
        .map_err(invalid)?;
    Ok(enforcer)
}

fn dimension_match_fn(request: Dynamic, policy: Dynamic) -> Dynamic {
    match (request.into_immutable_string(), policy.into_immutable_string()) {
        (Ok(request), Ok(policy)) => Dynamic::from(dimension_match(request.as_str(), policy.as_str())),
        _ => Dynamic::from(false),
    }
}

/// v1 resource: RPC paths lose their leading `/`, HTTP routes keep it.
fn v1_resource(rpc: &str) -> &str {
    if rpc.contains('.') {
        rpc.strip_prefix('/').unwrap_or(rpc)
    } else {
        rpc
    }
}

fn policy_text(mode: AuthzMode, settings: &AuthorizerSettings) -> String {
    let mut text = match (&settings.authz.csv, mode) {
        (Some(csv), _) if !csv.trim().is_empty() => csv.clone(),
        (_, AuthzMode::V1) => DEFAULT_POLICY_V1.to_string(),
        (_, AuthzMode::V2) => DEFAULT_POLICY_V2.to_string(),
    };
    if !text.ends_with('\n') {
        text.push('\n');
    }
    let mut entries: Vec<(&str, &str)> = if settings.authz.role_map.is_empty() {
        DEFAULT_ROLE_MAP.to_vec()
    } else {
        settings
            .authz
            .role_map
            .iter()
            .map(|(role, group)| (role.as_str(), group.as_str()))
            .collect()
    };
    entries.sort_unstable();
    for (role, group) in entries {
        text.push_str(&format!("g, {group}, {ROLE_PREFIX}{role}\n"));
    }
    if let Some(extension) = &settings.authz.extension {
        text.push_str(extension);
        text.push('\n');
    }
    text
}
