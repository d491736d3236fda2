//! Per-RPC authorization resolvers.
//!
//! A resolver turns a decoded request into the resource dimensions the v2
//! model authorizes against. Services register through a
//! [`ScopedResolverRegistry`] created from their [`ServiceDescriptor`], which
//! refuses methods the service does not declare.
//!
//! Registration happens during startup under the write lock; lookups on the
//! request path only take the read lock.

use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::policy::serialize_dimensions;
use crate::{Error, Result};

/// One resource entry: dimension name → value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverResource(BTreeMap<String, String>);

impl ResolverResource {
    /// Set `key` to `value`, replacing any earlier value.
    pub fn add_dimension(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Underlying map.
    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl Deref for ResolverResource {
    type Target = BTreeMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ResolverResource {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Resolved dimensions of one request. Several resources describe compound
/// operations such as moving a value between namespaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverContext {
    /// Resource entries in resolver order
    pub resources: Vec<ResolverResource>,
}

impl ResolverContext {
    /// Empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an empty resource and return it.
    pub fn new_resource(&mut self) -> &mut ResolverResource {
        self.resources.push(ResolverResource::default());
        let last = self.resources.len() - 1;
        &mut self.resources[last]
    }

    /// Canonical dimension string (`*` when empty).
    #[must_use]
    pub fn dimensions(&self) -> String {
        serialize_dimensions(self.resources.iter().map(ResolverResource::as_map))
    }
}

/// What a resolver sees of a request.
#[derive(Debug, Clone, Default)]
pub struct ResolverRequest {
    /// Full RPC path, e.g. `/policy.attributes.AttributesService/UpdateAttribute`
    pub rpc: String,
    /// Decoded request message
    pub body: serde_json::Value,
    /// Request headers
    pub headers: HeaderMap,
}

/// Extracts dimensions from a request. An error denies the request.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve the request's resource context.
    async fn resolve(&self, request: &ResolverRequest) -> Result<ResolverContext>;
}

#[async_trait]
impl<F> Resolver for F
where
    F: Fn(&ResolverRequest) -> Result<ResolverContext> + Send + Sync,
{
    async fn resolve(&self, request: &ResolverRequest) -> Result<ResolverContext> {
        self(request)
    }
}

/// A service name and the methods it declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    name: String,
    methods: Vec<String>,
}

impl ServiceDescriptor {
    /// Descriptor for `name` (e.g. `policy.attributes.AttributesService`).
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }

    /// Fully-qualified service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared method names.
    #[must_use]
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// `/{service}/{method}`.
    #[must_use]
    pub fn full_method(&self, method: &str) -> String {
        format!("/{}/{method}", self.name)
    }
}

/// Process-wide map of full RPC path → resolver.
#[derive(Default)]
pub struct ResolverRegistry {
    inner: RwLock<HashMap<String, Arc<dyn Resolver>>>,
}

impl ResolverRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `resolver` for the full RPC path `method`, replacing any
    /// earlier one.
    pub fn register(&self, method: impl Into<String>, resolver: Arc<dyn Resolver>) {
        let method = method.into();
        if self.inner.write().insert(method.clone(), resolver).is_some() {
            warn!(method = %method, "Replacing existing authorization resolver");
        } else {
            debug!(method = %method, "Registered authorization resolver");
        }
    }

    /// Resolver for `method`.
    #[must_use]
    pub fn get(&self, method: &str) -> Option<Arc<dyn Resolver>> {
        self.inner.read().get(method).cloned()
    }

    /// Number of registered resolvers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Registered paths, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.inner.read().keys().cloned().collect();
        methods.sort();
        methods
    }

    /// View that only accepts methods declared by `service`.
    #[must_use]
    pub fn scoped(self: &Arc<Self>, service: ServiceDescriptor) -> ScopedResolverRegistry {
        ScopedResolverRegistry {
            registry: Arc::clone(self),
            service,
        }
    }

    /// Run the resolver for `request.rpc`, if any.
    ///
    /// Resolver errors come back as [`Error::ResolverFailed`].
    pub async fn run(&self, request: &ResolverRequest) -> Result<Option<ResolverContext>> {
        let Some(resolver) = self.get(&request.rpc) else {
            return Ok(None);
        };
        resolver
            .resolve(request)
            .await
            .map(Some)
            .map_err(|e| Error::ResolverFailed {
                rpc: request.rpc.clone(),
                reason: e.to_string(),
            })
    }
}

/// Registration view bound to one service.
pub struct ScopedResolverRegistry {
    registry: Arc<ResolverRegistry>,
    service: ServiceDescriptor,
}

impl ScopedResolverRegistry {
    /// Service this view registers for.
    #[must_use]
    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    /// Register `resolver` for `method` (short name) of this service.
    pub fn register<R>(&self, method: &str, resolver: R) -> Result<()>
    where
        R: Resolver + 'static,
    {
        if !self.service.methods.iter().any(|m| m == method) {
            return Err(Error::Config(format!(
                "method \"{method}\" not found in service \"{}\"",
                self.service.name
            )));
        }
        self.registry
            .register(self.service.full_method(method), Arc::new(resolver));
        Ok(())
    }

    /// [`Self::register`] that panics on an undeclared method; for static wiring.
    pub fn must_register<R>(&self, method: &str, resolver: R)
    where
        R: Resolver + 'static,
    {
        if let Err(e) = self.register(method, resolver) {
            panic!("{e}");
        }
    }

    /// Register several resolvers; stops at the first undeclared method.
    pub fn register_all<I>(&self, resolvers: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Arc<dyn Resolver>)>,
    {
        for (method, resolver) in resolvers {
            if !self.service.methods.contains(&method) {
                return Err(Error::Config(format!(
                    "method \"{method}\" not found in service \"{}\"",
                    self.service.name
                )));
            }
            self.registry
                .register(self.service.full_method(&method), resolver);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attributes_service() -> ServiceDescriptor {
        ServiceDescriptor::new(
            "policy.attributes.AttributesService",
            ["GetAttribute", "UpdateAttribute"],
        )
    }

    fn namespace_resolver(req: &ResolverRequest) -> Result<ResolverContext> {
        let mut ctx = ResolverContext::new();
        let ns = req.body["namespace"].as_str().unwrap_or_default();
        ctx.new_resource().add_dimension("namespace", ns);
        Ok(ctx)
    }

    #[test]
    fn scoped_view_rejects_foreign_methods() {
        // GIVEN: a scoped view for the attributes service
        let registry = Arc::new(ResolverRegistry::new());
        let scoped = registry.scoped(attributes_service());

        // WHEN: registering a declared and an undeclared method
        scoped.register("UpdateAttribute", namespace_resolver).unwrap();
        let err = scoped
            .register("NonExistentMethod", namespace_resolver)
            .unwrap_err();

        // THEN: only the declared one lands, under its full path
        assert!(err.to_string().contains(
            "method \"NonExistentMethod\" not found in service \"policy.attributes.AttributesService\""
        ));
        assert_eq!(
            registry.methods(),
            vec!["/policy.attributes.AttributesService/UpdateAttribute".to_string()]
        );
    }

    #[test]
    fn services_cannot_claim_each_others_methods() {
        let registry = Arc::new(ResolverRegistry::new());
        let attrs = registry.scoped(attributes_service());
        let ns = registry.scoped(ServiceDescriptor::new(
            "policy.namespaces.NamespaceService",
            ["GetNamespace"],
        ));
        assert!(attrs.register("GetNamespace", namespace_resolver).is_err());
        assert!(ns.register("GetAttribute", namespace_resolver).is_err());
        assert!(ns.register("GetNamespace", namespace_resolver).is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    #[should_panic(expected = "not found in service")]
    fn must_register_panics_on_undeclared_method() {
        let registry = Arc::new(ResolverRegistry::new());
        registry
            .scoped(attributes_service())
            .must_register("Nope", namespace_resolver);
    }

    #[test]
    fn resources_are_independent_and_dimensions_overwrite() {
        let mut ctx = ResolverContext::new();
        ctx.new_resource()
            .add_dimension("namespace", "original")
            .add_dimension("namespace", "updated");
        ctx.new_resource().add_dimension("namespace", "ns-destination");

        assert_eq!(ctx.resources.len(), 2);
        assert_eq!(ctx.resources[0]["namespace"], "updated");
        assert_eq!(ctx.resources[1]["namespace"], "ns-destination");
        // Later resources win when merged.
        assert_eq!(ctx.dimensions(), "namespace=ns-destination");
        assert_eq!(ResolverContext::new().dimensions(), "*");
    }

    #[tokio::test]
    async fn run_wraps_resolver_errors() {
        // GIVEN: a resolver that always fails
        let registry = Arc::new(ResolverRegistry::new());
        registry.scoped(attributes_service()).must_register(
            "GetAttribute",
            |_: &ResolverRequest| -> Result<ResolverContext> {
                Err(Error::Internal("store unavailable".into()))
            },
        );
        let request = ResolverRequest {
            rpc: "/policy.attributes.AttributesService/GetAttribute".into(),
            ..ResolverRequest::default()
        };

        // WHEN: run
        let err = registry.run(&request).await.unwrap_err();

        // THEN: the failure names the RPC
        assert!(matches!(err, Error::ResolverFailed { ref rpc, .. } if rpc == &request.rpc));

        // AND: RPCs without a resolver resolve to nothing
        let other = ResolverRequest {
            rpc: "/x.Y/Z".into(),
            ..ResolverRequest::default()
        };
        assert!(registry.run(&other).await.unwrap().is_none());
    }

    #[test]
    fn concurrent_lookups_see_registrations() {
        let registry = Arc::new(ResolverRegistry::new());
        registry
            .scoped(attributes_service())
            .must_register("GetAttribute", namespace_resolver);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&registry);
                std::thread::spawn(move || {
                    r.get("/policy.attributes.AttributesService/GetAttribute")
                        .is_some()
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
