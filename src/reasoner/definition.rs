//! Attribute definitions and the grant table that maps values to KASes.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use super::fqn::{AttributeNameFqn, AttributeValueFqn};
use crate::{Error, Result};

/// Combination rule of an attribute definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeRule {
    /// Any one of the present values suffices
    AnyOf,
    /// Every present value is required
    AllOf,
    /// Ordered values; the caller selects the highest present one
    Hierarchy,
    /// Rule not set
    Unspecified,
}

impl AttributeRule {
    /// Accepts `ANY_OF`, `anyOf`, `any_of` and the
    /// `ATTRIBUTE_RULE_TYPE_ENUM_` prefixed forms.
    pub fn parse(raw: &str) -> Result<Self> {
        let upper = raw.trim().to_ascii_uppercase().replace('_', "");
        let upper = upper.trim_start_matches("ATTRIBUTERULETYPEENUM");
        match upper {
            "ANYOF" => Ok(Self::AnyOf),
            "ALLOF" => Ok(Self::AllOf),
            "HIERARCHY" => Ok(Self::Hierarchy),
            "" | "UNSPECIFIED" => Ok(Self::Unspecified),
            _ => Err(Error::InvalidRequest(format!("unknown attribute rule '{raw}'"))),
        }
    }
}

/// Immutable attribute definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDefinition {
    fqn: AttributeNameFqn,
    rule: AttributeRule,
    order: Vec<String>,
}

impl AttributeDefinition {
    /// Build a definition; `order` lists values from highest to lowest rank.
    pub fn new(authority: &str, name: &str, rule: AttributeRule, order: Vec<String>) -> Result<Self> {
        Ok(Self {
            fqn: AttributeNameFqn::from_parts(authority, name)?,
            rule,
            order,
        })
    }

    /// Definition FQN (the clause prefix).
    #[must_use]
    pub fn fqn(&self) -> &AttributeNameFqn {
        &self.fqn
    }

    /// Combination rule.
    #[must_use]
    pub fn rule(&self) -> AttributeRule {
        self.rule
    }

    /// Declared values, highest rank first.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Whether `value` is declared (case-insensitive).
    #[must_use]
    pub fn contains(&self, value: &str) -> bool {
        self.order.iter().any(|v| v.eq_ignore_ascii_case(value))
    }

    /// Highest-ranked entry of `present` according to `order`.
    #[must_use]
    pub fn highest_of<'a>(&self, present: &[&'a str]) -> Option<&'a str> {
        self.order.iter().find_map(|declared| {
            present
                .iter()
                .find(|p| p.eq_ignore_ascii_case(declared))
                .copied()
        })
    }
}

/// KASes that must participate for one attribute value.
#[derive(Debug, Clone)]
pub struct KeyAccessGrant {
    /// Owning definition
    pub definition: Arc<AttributeDefinition>,
    /// KAS URIs; empty means the default KAS
    pub kases: Vec<String>,
}

/// Lookup of grants by attribute value.
pub trait GrantService: Send + Sync {
    /// Grant for `value`, or `None` when neither a definition nor a grant is known.
    fn by_attribute(&self, value: &AttributeValueFqn) -> Option<&KeyAccessGrant>;
}

/// In-memory grant table keyed by lowercased value FQN.
#[derive(Debug, Default, Clone)]
pub struct GrantTable {
    grants: HashMap<String, KeyAccessGrant>,
}

impl GrantTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every declared value of `definition`.
    ///
    /// A value's own KAS list wins; values without one inherit
    /// `definition_kases`.
    pub fn add_definition(
        &mut self,
        definition: AttributeDefinition,
        definition_kases: &[String],
        value_kases: &HashMap<String, Vec<String>>,
    ) {
        let definition = Arc::new(definition);
        for value in definition.order() {
            let fqn = definition.fqn().select(value);
            let kases = value_kases
                .get(value)
                .filter(|k| !k.is_empty())
                .cloned()
                .unwrap_or_else(|| definition_kases.to_vec());
            self.grants.insert(
                fqn.key().to_string(),
                KeyAccessGrant {
                    definition: Arc::clone(&definition),
                    kases,
                },
            );
        }
    }

    /// Definition owning `value`, if known.
    #[must_use]
    pub fn definition_of(&self, value: &AttributeValueFqn) -> Option<&Arc<AttributeDefinition>> {
        self.grants.get(value.key()).map(|g| &g.definition)
    }

    /// Build from deserialized definition specs.
    pub fn from_specs(specs: Vec<DefinitionSpec>) -> Result<Self> {
        let mut table = Self::new();
        for spec in specs {
            let (definition, definition_kases, value_kases) = spec.into_parts()?;
            table.add_definition(definition, &definition_kases, &value_kases);
        }
        Ok(table)
    }
}

impl GrantService for GrantTable {
    fn by_attribute(&self, value: &AttributeValueFqn) -> Option<&KeyAccessGrant> {
        self.grants.get(value.key())
    }
}

/// Wire form of a definition, validated into [`AttributeDefinition`].
#[derive(Debug, Clone, Deserialize)]
pub struct DefinitionSpec {
    /// Either a full definition FQN ...
    #[serde(default)]
    pub fqn: Option<String>,
    /// ... or an authority plus name
    #[serde(default)]
    pub authority: Option<String>,
    /// Definition name
    #[serde(default)]
    pub name: Option<String>,
    /// Rule text (`ANY_OF`, `allOf`, `hierarchy`, ...)
    #[serde(default)]
    pub rule: String,
    /// Values, highest rank first
    #[serde(default)]
    pub values: Vec<ValueSpec>,
    /// Definition-level KAS grants
    #[serde(default)]
    pub kas: Vec<String>,
}

/// Wire form of a value with optional KAS grants.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ValueSpec {
    /// Bare value
    Plain(String),
    /// Value with grants
    Granted {
        /// Value name
        value: String,
        /// KAS URIs
        #[serde(default)]
        kas: Vec<String>,
    },
}

type SpecParts = (AttributeDefinition, Vec<String>, HashMap<String, Vec<String>>);

impl DefinitionSpec {
    fn into_parts(self) -> Result<SpecParts> {
        let fqn = match (self.fqn, self.authority, self.name) {
            (Some(fqn), _, _) => AttributeNameFqn::parse(&fqn)?,
            (None, Some(authority), Some(name)) => AttributeNameFqn::from_parts(&authority, &name)?,
            _ => {
                return Err(Error::InvalidRequest(
                    "definition needs either fqn or authority and name".to_string(),
                ));
            }
        };
        let rule = AttributeRule::parse(&self.rule)?;
        let mut order = Vec::with_capacity(self.values.len());
        let mut value_kases = HashMap::new();
        for v in self.values {
            match v {
                ValueSpec::Plain(value) => order.push(value),
                ValueSpec::Granted { value, kas } => {
                    value_kases.insert(value.clone(), kas);
                    order.push(value);
                }
            }
        }
        let definition = AttributeDefinition::new(fqn.authority(), fqn.name(), rule, order)?;
        Ok((definition, self.kas, value_kases))
    }
}
