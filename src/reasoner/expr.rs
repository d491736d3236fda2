//! Attribute and key boolean expressions.

use std::fmt;
use std::sync::Arc;

use super::definition::{AttributeDefinition, AttributeRule};
use super::fqn::AttributeValueFqn;

/// Sentinel rendered for values whose grant names no KAS.
pub const DEFAULT_KAS: &str = "DEFAULT";

/// One definition and the policy values observed for it.
#[derive(Debug, Clone)]
pub struct AttributeClause {
    /// Owning definition
    pub definition: Arc<AttributeDefinition>,
    /// Values in insertion order
    pub values: Vec<AttributeValueFqn>,
}

/// Conjunction of per-definition clauses.
#[derive(Debug, Clone, Default)]
pub struct AttributeBooleanExpression {
    /// Clauses in first-seen order
    pub must: Vec<AttributeClause>,
}

impl fmt::Display for AttributeBooleanExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.must.is_empty() {
            return f.write_str("∅");
        }
        for (i, clause) in self.must.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            match clause.values.as_slice() {
                [] => write!(f, "{}", clause.definition.fqn())?,
                [only] => write!(f, "{only}")?,
                many => {
                    write!(f, "{}/value/{{", clause.definition.fqn())?;
                    for (j, v) in many.iter().enumerate() {
                        if j > 0 {
                            f.write_str(",")?;
                        }
                        f.write_str(v.value())?;
                    }
                    f.write_str("}")?;
                }
            }
        }
        Ok(())
    }
}

/// Operator joining the KASes of a clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Disjunction
    AnyOf,
    /// Conjunction
    AllOf,
}

impl From<AttributeRule> for Operator {
    fn from(rule: AttributeRule) -> Self {
        match rule {
            // The caller has already narrowed a hierarchy to one value.
            AttributeRule::AnyOf | AttributeRule::Hierarchy => Self::AnyOf,
            AttributeRule::AllOf | AttributeRule::Unspecified => Self::AllOf,
        }
    }
}

/// A KAS reference or the default sentinel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KasTerm {
    /// No KAS named; use the default
    Default,
    /// KAS URI
    Uri(String),
}

impl KasTerm {
    /// URI, or `None` for the sentinel.
    #[must_use]
    pub fn uri(&self) -> Option<&str> {
        match self {
            Self::Default => None,
            Self::Uri(u) => Some(u),
        }
    }
}

impl fmt::Display for KasTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str(DEFAULT_KAS),
            Self::Uri(u) => f.write_str(u),
        }
    }
}

/// KASes of one clause joined by an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyClause {
    /// Join operator
    pub operator: Operator,
    /// KAS terms
    pub values: Vec<KasTerm>,
}

impl fmt::Display for KeyClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.values.as_slice() {
            [KasTerm::Default] => write!(f, "[{DEFAULT_KAS}]"),
            [only] => write!(f, "({only})"),
            many => {
                let op = match self.operator {
                    Operator::AnyOf => "⋁",
                    Operator::AllOf => "⋀",
                };
                f.write_str("(")?;
                for (i, v) in many.iter().enumerate() {
                    if i > 0 {
                        f.write_str(op)?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Conjunction of key clauses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BooleanKeyExpression {
    /// Clauses
    pub values: Vec<KeyClause>,
}

impl BooleanKeyExpression {
    /// Total number of KAS terms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.iter().map(|c| c.values.len()).sum()
    }

    /// True when no clause is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Canonical conjunction of sorted, deduplicated disjunctions.
    ///
    /// `DEFAULT` terms are dropped, empty disjunctions skipped, and a
    /// disjunction equal to one already present is not added again.
    #[must_use]
    pub fn reduce(&self) -> Self {
        let mut conjunction: Vec<Vec<KasTerm>> = Vec::new();
        let mut push = |terms: Vec<KasTerm>| {
            if !terms.is_empty() && !conjunction.contains(&terms) {
                conjunction.push(terms);
            }
        };
        for clause in &self.values {
            match clause.operator {
                Operator::AnyOf => push(sorted_no_dupes(&clause.values)),
                Operator::AllOf => {
                    for term in &clause.values {
                        if matches!(term, KasTerm::Uri(_)) {
                            push(vec![term.clone()]);
                        }
                    }
                }
            }
        }
        Self {
            values: conjunction
                .into_iter()
                .map(|values| KeyClause {
                    operator: Operator::AnyOf,
                    values,
                })
                .collect(),
        }
    }
}

impl fmt::Display for BooleanKeyExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, clause) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{clause}")?;
        }
        Ok(())
    }
}

fn sorted_no_dupes(terms: &[KasTerm]) -> Vec<KasTerm> {
    let mut out: Vec<KasTerm> = terms
        .iter()
        .filter(|t| matches!(t, KasTerm::Uri(u) if !u.is_empty()))
        .cloned()
        .collect();
    out.sort();
    out.dedup();
    out
}
