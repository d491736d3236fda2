//! Attribute reasoner: maps a data policy to the KASes that must take part in a rewrap.
//!
//! # Steps
//!
//! 1. [`Granter::construct_attribute_boolean`] buckets the policy's values by
//!    definition, keeping first-seen order.
//! 2. [`Granter::insert_keys`] replaces each value with its granted KASes
//!    (`DEFAULT` when none are named).
//! 3. [`BooleanKeyExpression::reduce`] yields the canonical conjunction of
//!    sorted KAS disjunctions, e.g. `(GBR⋁US)&(HCS_US)&(SI_US)`.
//! 4. [`Granter::plan`] turns that into key-split steps.
//!
//! Hierarchy selection happens before the reasoner runs: callers pass only
//! the highest present value of a hierarchy (see [`select_hierarchy`]).

pub mod definition;
pub mod expr;
pub mod fqn;

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

pub use definition::{
    AttributeDefinition, AttributeRule, DefinitionSpec, GrantService, GrantTable, KeyAccessGrant,
};
pub use expr::{
    AttributeBooleanExpression, AttributeClause, BooleanKeyExpression, KasTerm, KeyClause,
    Operator, DEFAULT_KAS,
};
pub use fqn::{AttributeNameFqn, AttributeValueFqn};

use crate::{Error, Result};

/// One KAS and the split it wraps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySplitStep {
    /// KAS URI
    pub kas: String,
    /// Split identifier; empty when the key is not split
    pub split_id: String,
}

/// Reasoner over one data policy.
pub struct Granter<'a, G: GrantService + ?Sized> {
    grants: &'a G,
    tags: Vec<AttributeValueFqn>,
}

impl<'a, G: GrantService + ?Sized> Granter<'a, G> {
    /// Reason over `tags` using `grants`.
    pub fn new(grants: &'a G, tags: Vec<AttributeValueFqn>) -> Self {
        Self { grants, tags }
    }

    /// Bucket the policy by definition. Values with no known grant are skipped.
    #[must_use]
    pub fn construct_attribute_boolean(&self) -> AttributeBooleanExpression {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut must: Vec<AttributeClause> = Vec::new();
        for tag in &self.tags {
            let prefix = tag.prefix().key().to_string();
            if let Some(&i) = index.get(&prefix) {
                must[i].values.push(tag.clone());
            } else if let Some(grant) = self.grants.by_attribute(tag) {
                index.insert(prefix, must.len());
                must.push(AttributeClause {
                    definition: grant.definition.clone(),
                    values: vec![tag.clone()],
                });
            }
        }
        AttributeBooleanExpression { must }
    }

    /// Replace each value with its KASes.
    pub fn insert_keys(&self, e: &AttributeBooleanExpression) -> Result<BooleanKeyExpression> {
        let mut values = Vec::with_capacity(e.must.len());
        for clause in &e.must {
            let mut terms = Vec::with_capacity(clause.values.len());
            for term in &clause.values {
                let grant = self.grants.by_attribute(term).ok_or_else(|| {
                    Error::InvalidRequest(format!("no definition or grant found for [{term}]"))
                })?;
                if grant.kases.is_empty() {
                    terms.push(KasTerm::Default);
                } else {
                    terms.extend(grant.kases.iter().cloned().map(KasTerm::Uri));
                }
            }
            if clause.definition.rule() == AttributeRule::Unspecified {
                debug!(definition = %clause.definition.fqn(), "unspecified attribute rule, treating as allOf");
            }
            values.push(KeyClause {
                operator: Operator::from(clause.definition.rule()),
                values: terms,
            });
        }
        Ok(BooleanKeyExpression { values })
    }

    /// Canonical reduced key expression for this policy.
    pub fn reduced(&self) -> Result<BooleanKeyExpression> {
        let attrs = self.construct_attribute_boolean();
        Ok(self.insert_keys(&attrs)?.reduce())
    }

    /// Key-split plan.
    ///
    /// An empty reduced expression splits across `default_kas` (error if none
    /// configured). Otherwise each disjunction gets its own split id when
    /// there is more than one.
    pub fn plan(
        &self,
        default_kas: &[String],
        mut gen_split_id: impl FnMut() -> String,
    ) -> Result<Vec<KeySplitStep>> {
        let reduced = self.reduced()?;
        debug!(expression = %reduced, "reduced key expression");

        if reduced.is_empty() {
            return match default_kas {
                [] => Err(Error::InvalidRequest(
                    "no default KAS specified; required for grantless plans".to_string(),
                )),
                [only] => Ok(vec![KeySplitStep {
                    kas: only.clone(),
                    split_id: String::new(),
                }]),
                many => Ok(many
                    .iter()
                    .map(|kas| KeySplitStep {
                        kas: kas.clone(),
                        split_id: gen_split_id(),
                    })
                    .collect()),
            };
        }

        let split = reduced.values.len() > 1;
        let mut steps = Vec::with_capacity(reduced.len());
        for clause in &reduced.values {
            let split_id = if split { gen_split_id() } else { String::new() };
            for term in &clause.values {
                if let Some(uri) = term.uri() {
                    steps.push(KeySplitStep {
                        kas: uri.to_string(),
                        split_id: split_id.clone(),
                    });
                }
            }
        }
        Ok(steps)
    }
}

/// Narrow every hierarchy definition in `policy` to its highest present value.
///
/// Values of other rules, and values without a known definition, pass through
/// in order.
#[must_use]
pub fn select_hierarchy(table: &GrantTable, policy: &[AttributeValueFqn]) -> Vec<AttributeValueFqn> {
    let mut chosen: HashMap<String, String> = HashMap::new();
    for tag in policy {
        let Some(def) = table.definition_of(tag) else {
            continue;
        };
        if def.rule() != AttributeRule::Hierarchy {
            continue;
        }
        let prefix = def.fqn().key().to_string();
        if chosen.contains_key(&prefix) {
            continue;
        }
        let present: Vec<&str> = policy
            .iter()
            .filter(|t| t.prefix().key() == prefix)
            .map(AttributeValueFqn::value)
            .collect();
        if let Some(best) = def.highest_of(&present) {
            chosen.insert(prefix, best.to_lowercase());
        }
    }

    let mut emitted: Vec<String> = Vec::new();
    policy
        .iter()
        .filter(|tag| match chosen.get(tag.prefix().key()) {
            Some(best) => {
                let keep = tag.value().to_lowercase() == *best && !emitted.contains(best);
                if keep {
                    emitted.push(best.clone());
                }
                keep
            }
            None => true,
        })
        .cloned()
        .collect()
}

/// File form accepted by the `reason` command.
#[derive(Debug, Clone, Deserialize)]
pub struct ReasonerInput {
    /// Attribute definitions with grants
    pub definitions: Vec<DefinitionSpec>,
    /// Data policy as value FQNs
    pub policy: Vec<String>,
    /// KASes used when the policy names none
    #[serde(default)]
    pub default_kas: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTH: &str = "https://virtru.com";

    fn table() -> GrantTable {
        let mut t = GrantTable::new();
        t.add_definition(
            AttributeDefinition::new(
                AUTH,
                "Classification",
                AttributeRule::Hierarchy,
                vec!["TopSecret".into(), "Secret".into(), "Open".into()],
            )
            .unwrap(),
            &[],
            &HashMap::new(),
        );
        let mut rel = HashMap::new();
        rel.insert("GBR".to_string(), vec!["GBR".to_string()]);
        rel.insert("USA".to_string(), vec!["US".to_string()]);
        t.add_definition(
            AttributeDefinition::new(
                AUTH,
                "Releasable To",
                AttributeRule::AnyOf,
                vec!["GBR".into(), "USA".into()],
            )
            .unwrap(),
            &[],
            &rel,
        );
        t
    }

    fn tag(name: &str, value: &str) -> AttributeValueFqn {
        AttributeNameFqn::from_parts(AUTH, name).unwrap().select(value)
    }

    #[test]
    fn construct_buckets_by_definition_in_first_seen_order() {
        // GIVEN: interleaved values from two definitions
        let t = table();
        let g = Granter::new(
            &t,
            vec![
                tag("Releasable To", "GBR"),
                tag("Classification", "Secret"),
                tag("Releasable To", "USA"),
            ],
        );

        // WHEN: the attribute expression is built
        let e = g.construct_attribute_boolean();

        // THEN: two clauses, releasability first, with both values
        assert_eq!(e.must.len(), 2);
        assert_eq!(e.must[0].values.len(), 2);
        assert_eq!(
            e.to_string(),
            "https://virtru.com/attr/Releasable%20To/value/{GBR,USA}&https://virtru.com/attr/Classification/value/Secret"
        );
    }

    #[test]
    fn empty_policy_renders_empty_set() {
        let t = table();
        let g = Granter::new(&t, vec![]);
        assert_eq!(g.construct_attribute_boolean().to_string(), "∅");
    }

    #[test]
    fn insert_keys_uses_default_sentinel() {
        let t = table();
        let g = Granter::new(&t, vec![tag("Classification", "Secret")]);
        let e = g.insert_keys(&g.construct_attribute_boolean()).unwrap();
        assert_eq!(e.to_string(), "[DEFAULT]");
    }

    #[test]
    fn insert_keys_rejects_unknown_value() {
        let t = table();
        let g = Granter::new(&t, vec![]);
        let def = t.definition_of(&tag("Releasable To", "GBR")).unwrap().clone();
        let e = AttributeBooleanExpression {
            must: vec![AttributeClause {
                definition: def,
                values: vec![tag("Releasable To", "FRA")],
            }],
        };
        let err = g.insert_keys(&e).unwrap_err();
        assert!(err.to_string().contains("no definition or grant found"));
    }

    #[test]
    fn plan_uses_default_kas_for_grantless_policy() {
        let t = table();
        let g = Granter::new(&t, vec![tag("Classification", "Secret")]);
        let steps = g.plan(&["https://kas.local/".to_string()], || "x".to_string()).unwrap();
        assert_eq!(
            steps,
            vec![KeySplitStep {
                kas: "https://kas.local/".into(),
                split_id: String::new()
            }]
        );
        assert!(g.plan(&[], || "x".to_string()).is_err());
    }

    #[test]
    fn plan_assigns_one_split_per_disjunction() {
        // GIVEN: an anyOf clause reduced to one disjunction
        let t = table();
        let g = Granter::new(&t, vec![tag("Releasable To", "GBR"), tag("Releasable To", "USA")]);

        // WHEN: planned
        let steps = g.plan(&[], || "split".to_string()).unwrap();

        // THEN: both KASes share the unsplit key
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.split_id.is_empty()));
    }

    #[test]
    fn select_hierarchy_keeps_highest_value_only() {
        let t = table();
        let policy = vec![
            tag("Classification", "Open"),
            tag("Releasable To", "GBR"),
            tag("Classification", "TopSecret"),
        ];
        let selected = select_hierarchy(&t, &policy);
        let rendered: Vec<String> = selected.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "https://virtru.com/attr/Releasable%20To/value/GBR".to_string(),
                "https://virtru.com/attr/Classification/value/TopSecret".to_string(),
            ]
        );
    }
}
