//! Action derivation for the v1 model.

use axum::http::Method;

/// Read access.
pub const ACTION_READ: &str = "read";
/// Create or modify.
pub const ACTION_WRITE: &str = "write";
/// Removal or deactivation.
pub const ACTION_DELETE: &str = "delete";
/// `Unsafe*` RPCs and unusual HTTP methods.
pub const ACTION_UNSAFE: &str = "unsafe";
/// Anything not classified.
pub const ACTION_OTHER: &str = "other";

/// Action implied by the verb prefix of an RPC's method name.
///
/// Only the segment after the last `/` is inspected, so both
/// `/policy.attributes.AttributesService/GetAttribute` and `GetAttribute`
/// yield `read`.
#[must_use]
pub fn rpc_action(rpc: &str) -> &'static str {
    const VERBS: &[(&str, &str)] = &[
        ("Get", ACTION_READ),
        ("List", ACTION_READ),
        ("Create", ACTION_WRITE),
        ("Update", ACTION_WRITE),
        ("Assign", ACTION_WRITE),
        ("Delete", ACTION_DELETE),
        ("Remove", ACTION_DELETE),
        ("Deactivate", ACTION_DELETE),
        ("Unsafe", ACTION_UNSAFE),
    ];
    let method = rpc.rsplit('/').next().unwrap_or(rpc);
    VERBS
        .iter()
        .find(|(prefix, _)| method.starts_with(prefix))
        .map_or(ACTION_OTHER, |&(_, action)| action)
}

/// Action implied by an HTTP method.
#[must_use]
pub fn http_action(method: &Method) -> &'static str {
    match *method {
        Method::GET => ACTION_READ,
        Method::POST | Method::PUT | Method::PATCH => ACTION_WRITE,
        Method::DELETE => ACTION_DELETE,
        _ => ACTION_UNSAFE,
    }
}

/// Whether `path` names an RPC (`/pkg.Service/Method`) rather than a gateway route.
#[must_use]
pub fn is_rpc_path(path: &str) -> bool {
    path.trim_start_matches('/')
        .split_once('/')
        .is_some_and(|(service, method)| service.contains('.') && !method.is_empty() && !method.contains('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_verbs_map_to_actions() {
        let cases = [
            ("/policy.attributes.AttributesService/GetAttribute", "read"),
            ("/policy.attributes.AttributesService/ListAttributes", "read"),
            ("/policy.attributes.AttributesService/CreateAttribute", "write"),
            ("/policy.attributes.AttributesService/UpdateAttribute", "write"),
            ("/policy.subjectmapping.SubjectMappingService/AssignKeyAccessServer", "write"),
            ("/policy.attributes.AttributesService/DeleteAttribute", "delete"),
            ("/policy.attributes.AttributesService/RemoveKeyAccessServer", "delete"),
            ("/policy.attributes.AttributesService/DeactivateAttribute", "delete"),
            ("/policy.unsafe.UnsafeService/UnsafeDeleteAttribute", "unsafe"),
            ("/kas.AccessService/Rewrap", "other"),
        ];
        for (rpc, action) in cases {
            assert_eq!(rpc_action(rpc), action, "{rpc}");
        }
    }

    #[test]
    fn http_methods_map_to_actions() {
        assert_eq!(http_action(&Method::GET), "read");
        assert_eq!(http_action(&Method::PATCH), "write");
        assert_eq!(http_action(&Method::DELETE), "delete");
        assert_eq!(http_action(&Method::OPTIONS), "unsafe");
    }

    #[test]
    fn rpc_paths_are_distinguished_from_routes() {
        assert!(is_rpc_path("/kas.AccessService/Rewrap"));
        assert!(!is_rpc_path("/kas/v2/rewrap"));
        assert!(!is_rpc_path("/healthz"));
    }
}
