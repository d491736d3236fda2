//! Route sets: public routes that bypass authentication and in-process
//! routes that are re-verified.
//!
//! Entries are exact paths or globs. `*` matches within one path segment and
//! `**` spans segments.

use glob::{MatchOptions, Pattern};

use crate::{Error, Result};

/// Routes that never require a token.
pub const BUILTIN_PUBLIC_ROUTES: &[&str] = &[
    "/grpc.health.v1.Health/Check",
    "/wellknownconfiguration.WellKnownService/GetWellKnownConfiguration",
    "/kas.AccessService/PublicKey",
    "/kas.AccessService/LegacyPublicKey",
    "/.well-known/opentdf-configuration",
    "/kas/kas_public_key",
    "/kas/v2/kas_public_key",
    "/healthz",
];

/// Routes re-verified when called in-process, unless configured otherwise.
pub const DEFAULT_IPC_REAUTH_ROUTES: &[&str] = &["/kas.AccessService/Rewrap", "/kas/v2/rewrap"];

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiled set of exact and glob routes.
#[derive(Debug, Clone, Default)]
pub struct RouteSet {
    exact: Vec<String>,
    globs: Vec<Pattern>,
}

impl RouteSet {
    /// Compile `routes`; an invalid glob is a configuration error.
    pub fn new<I, S>(routes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for route in routes {
            let route = route.as_ref();
            if route.contains(['*', '?', '[']) {
                let pattern = Pattern::new(route)
                    .map_err(|e| Error::Config(format!("invalid route pattern '{route}': {e}")))?;
                set.globs.push(pattern);
            } else {
                set.exact.push(route.to_string());
            }
        }
        Ok(set)
    }

    /// Builtin public routes plus `extra`.
    pub fn public(extra: &[String]) -> Result<Self> {
        Self::new(
            BUILTIN_PUBLIC_ROUTES
                .iter()
                .copied()
                .chain(extra.iter().map(String::as_str)),
        )
    }

    /// Configured IPC re-auth routes, or the defaults when none are set.
    pub fn ipc_reauth(configured: &[String]) -> Result<Self> {
        if configured.is_empty() {
            Self::new(DEFAULT_IPC_REAUTH_ROUTES)
        } else {
            Self::new(configured)
        }
    }

    /// Whether `path` is in the set.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.exact.iter().any(|r| r == path)
            || self.globs.iter().any(|p| p.matches_with(path, MATCH))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len() + self.globs.len()
    }

    /// No entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_public_routes_match_exactly() {
        let set = RouteSet::public(&[]).unwrap();
        assert!(set.matches("/healthz"));
        assert!(set.matches("/kas/v2/kas_public_key"));
        assert!(!set.matches("/healthz/deep"));
        assert!(!set.matches("/kas.AccessService/Rewrap"));
    }

    #[test]
    fn single_star_stays_within_a_segment() {
        let set = RouteSet::new(["/public/*"]).unwrap();
        assert!(set.matches("/public/a"));
        assert!(!set.matches("/public/a/b"));
    }

    #[test]
    fn double_star_spans_segments() {
        let set = RouteSet::new(["/docs/**"]).unwrap();
        assert!(set.matches("/docs/a"));
        assert!(set.matches("/docs/a/b/c"));
        assert!(!set.matches("/doc/a"));
    }

    #[test]
    fn ipc_defaults_apply_when_unset() {
        let set = RouteSet::ipc_reauth(&[]).unwrap();
        assert!(set.matches("/kas.AccessService/Rewrap"));
        let custom = RouteSet::ipc_reauth(&["/x.Y/Z".to_string()]).unwrap();
        assert!(!custom.matches("/kas.AccessService/Rewrap"));
        assert_eq!(custom.len(), 1);
    }

    #[test]
    fn invalid_glob_is_config_error() {
        assert!(matches!(RouteSet::new(["/a/[b"]), Err(Error::Config(_))));
    }
}
