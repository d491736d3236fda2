//! Policy lines, the `dimensionMatch` function and dimension serialization.
//!
//! Policy text is CSV, one rule per line:
//!
//! ```text
//! p, role:hr-admin, /policy.attributes.AttributesService/*, namespace=hr&attribute=*, allow
//! g, opentdf-admin, role:admin
//! ```
//!
//! `p` lines are `subject, object, scope, effect` where `scope` is an action
//! (v1) or a dimension expression (v2). `g` lines grant `role` to `member`.
//! Lines are validated here and then handed to the casbin enforcer.

use std::collections::{BTreeMap, HashMap};

use glob::Pattern;

use crate::{Error, Result};

/// Subject prefix used for roles.
pub const ROLE_PREFIX: &str = "role:";

/// Rule effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Grant
    Allow,
    /// Veto; wins over any allow
    Deny,
}

impl Effect {
    /// Value of the `eft` column.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// One `p` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    /// Role or user name
    pub subject: String,
    /// Resource / RPC glob
    pub object: String,
    /// Action glob (v1) or dimension expression (v2)
    pub scope: String,
    /// Effect
    pub effect: Effect,
}

/// One `g` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingRule {
    /// Group, role or user name receiving `role`
    pub member: String,
    /// Granted role
    pub role: String,
}

/// Validated policy lines.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    rules: Vec<PolicyRule>,
    groupings: Vec<GroupingRule>,
}

impl Policy {
    /// Parse policy CSV.
    ///
    /// With `require_role_prefix`, every `g` role must carry the `role:`
    /// prefix. `p` subjects may be roles or plain user names. Objects and
    /// scopes must be valid glob patterns.
    pub fn parse(csv: &str, require_role_prefix: bool) -> Result<Self> {
        let mut policy = Self::default();
        for (lineno, raw) in csv.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let bad = |msg: &str| {
                Error::Config(format!("policy line {}: {msg}: '{line}'", lineno + 1))
            };
            match fields.first().copied() {
                Some("p") => {
                    let [_, subject, object, scope, effect] = fields.as_slice() else {
                        return Err(bad("expected 'p, subject, object, scope, effect'"));
                    };
                    let effect = match *effect {
                        "allow" => Effect::Allow,
                        "deny" => Effect::Deny,
                        _ => return Err(bad("effect must be allow or deny")),
                    };
                    if subject.is_empty() || object.is_empty() || scope.is_empty() {
                        return Err(bad("empty field"));
                    }
                    if Pattern::new(object).is_err() || Pattern::new(scope).is_err() {
                        return Err(bad("invalid wildcard pattern"));
                    }
                    policy.rules.push(PolicyRule {
                        subject: (*subject).to_string(),
                        object: (*object).to_string(),
                        scope: (*scope).to_string(),
                        effect,
                    });
                }
                Some("g") => {
                    let [_, member, role] = fields.as_slice() else {
                        return Err(bad("expected 'g, member, role'"));
                    };
                    if member.is_empty() || role.is_empty() {
                        return Err(bad("empty field"));
                    }
                    if require_role_prefix && !role.starts_with(ROLE_PREFIX) {
                        return Err(bad("role must start with 'role:'"));
                    }
                    policy.groupings.push(GroupingRule {
                        member: (*member).to_string(),
                        role: (*role).to_string(),
                    });
                }
                _ => return Err(bad("line must start with 'p' or 'g'")),
            }
        }
        Ok(policy)
    }

    /// Rules in declaration order.
    #[must_use]
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Grouping lines in declaration order.
    #[must_use]
    pub fn groupings(&self) -> &[GroupingRule] {
        &self.groupings
    }

    /// `p` rows for the enforcer: subject, object, scope, effect.
    #[must_use]
    pub fn policy_rows(&self) -> Vec<Vec<String>> {
        self.rules
            .iter()
            .map(|r| {
                vec![
                    r.subject.clone(),
                    r.object.clone(),
                    r.scope.clone(),
                    r.effect.as_str().to_string(),
                ]
            })
            .collect()
    }

    /// `g` rows for the enforcer.
    ///
    /// Role subjects are `role:<group>`, so a bare group member is also
    /// granted its roles under the prefixed name.
    #[must_use]
    pub fn grouping_rows(&self) -> Vec<Vec<String>> {
        let mut rows = Vec::with_capacity(self.groupings.len() * 2);
        for g in &self.groupings {
            rows.push(vec![g.member.clone(), g.role.clone()]);
            if !g.member.starts_with(ROLE_PREFIX) {
                rows.push(vec![format!("{ROLE_PREFIX}{}", g.member), g.role.clone()]);
            }
        }
        rows
    }
}

/// Canonical form of resolved dimensions.
///
/// No resources → `"*"`. Otherwise every resource entry is merged (later
/// entries win on key collisions), keys are sorted and rendered as
/// `k1=v1&k2=v2`.
#[must_use]
pub fn serialize_dimensions<'a, I>(resources: I) -> String
where
    I: IntoIterator<Item = &'a BTreeMap<String, String>>,
{
    let mut merged: BTreeMap<&str, &str> = BTreeMap::new();
    for resource in resources {
        for (k, v) in resource {
            merged.insert(k, v);
        }
    }
    if merged.is_empty() {
        return "*".to_string();
    }
    merged
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Whether request dimensions satisfy a policy dimension expression.
///
/// Policy `*` matches anything; an empty policy matches only an empty
/// request; otherwise each `key=value` pair must be present in the request,
/// with `*` as a per-value wildcard. Extra request dimensions are ignored and
/// a malformed policy pair never matches.
#[must_use]
pub fn dimension_match(request_dims: &str, policy_dims: &str) -> bool {
    if policy_dims == "*" {
        return true;
    }
    let request = parse_dimensions(request_dims);
    if policy_dims.is_empty() {
        return request.is_empty();
    }
    for pair in policy_dims.split('&').map(str::trim) {
        if pair.is_empty() {
            continue;
        }
        let Some((key, want)) = pair.split_once('=') else {
            return false;
        };
        match request.get(key) {
            Some(got) if want == "*" || want == *got => {}
            _ => return false,
        }
    }
    true
}

fn parse_dimensions(dims: &str) -> HashMap<&str, &str> {
    if dims == "*" || dims.is_empty() {
        return HashMap::new();
    }
    dims.split('&').filter_map(|pair| pair.split_once('=')).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn serialize_empty_context_is_wildcard() {
        let none: Vec<BTreeMap<String, String>> = vec![];
        assert_eq!(serialize_dimensions(&none), "*");
        assert_eq!(serialize_dimensions(&vec![BTreeMap::new()]), "*");
    }

    #[test]
    fn serialize_is_independent_of_partitioning() {
        // GIVEN: the same dimensions split differently across resources
        let a = vec![res(&[("namespace", "hr"), ("attribute", "classification")])];
        let b = vec![res(&[("attribute", "classification")]), res(&[("namespace", "hr")])];

        // THEN: canonical forms are equal and keys are sorted
        assert_eq!(serialize_dimensions(&a), serialize_dimensions(&b));
        assert_eq!(serialize_dimensions(&a), "attribute=classification&namespace=hr");
    }

    #[test]
    fn dimension_match_rules() {
        assert!(dimension_match("namespace=hr", "*"));
        assert!(dimension_match("*", "*"));
        assert!(dimension_match("*", ""));
        assert!(!dimension_match("namespace=hr", ""));
        assert!(dimension_match(
            "attribute=classification&namespace=hr",
            "namespace=hr&attribute=*"
        ));
        assert!(dimension_match("attribute=x&namespace=hr", "namespace=hr"));
        assert!(!dimension_match("namespace=finance", "namespace=hr"));
        assert!(!dimension_match("attribute=x", "namespace=*"));
        assert!(!dimension_match("namespace=hr", "namespace"));
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert!(Policy::parse("role:admin, new.service.DoSomething, *", false).is_err());
        assert!(Policy::parse("p, role:admin, new.service.DoSomething, *", false).is_err());
        assert!(Policy::parse("p, role:admin, x, read, maybe", false).is_err());
        assert!(Policy::parse("g, opentdf-admin, admin", true).is_err());
        assert!(Policy::parse("g, opentdf-admin, role:admin", true).is_ok());
        assert!(Policy::parse("p, casbin-user, new.service.*, read, allow", true).is_ok());
    }

    #[test]
    fn bare_group_members_are_mirrored_under_role_prefix() {
        let policy = Policy::parse(
            "g, opentdf-admin, role:admin\ng, role:admin, role:auditor",
            true,
        )
        .unwrap();
        assert_eq!(
            policy.grouping_rows(),
            vec![
                vec!["opentdf-admin".to_string(), "role:admin".to_string()],
                vec!["role:opentdf-admin".to_string(), "role:admin".to_string()],
                vec!["role:admin".to_string(), "role:auditor".to_string()],
            ]
        );
    }

    #[test]
    fn policy_rows_carry_the_effect_column() {
        let policy = Policy::parse("p, role:a, kas.*, *, deny", true).unwrap();
        assert_eq!(
            policy.policy_rows(),
            vec![vec![
                "role:a".to_string(),
                "kas.*".to_string(),
                "*".to_string(),
                "deny".to_string()
            ]]
        );
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert!(Policy::parse("p, role:a, /policy.[unclosed, *, allow", true).is_err());
    }
}
