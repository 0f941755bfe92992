//! Label selection as network policies use it: a policy's `podSelector`
//! picks the pods it protects, and peer clauses select source and
//! destination pods (and namespaces) by the same mechanism.
//!
//! The wire shape follows `metav1.LabelSelector`. The legacy policy schema
//! embeds [`Selector`] directly; the current schema converts through
//! [`Selector::try_from`], where an unknown operator is a policy-data
//! error surfaced to the caller.

use anyhow::{bail, Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// An object's label map, as it appears on pod and namespace metadata.
pub type Map = BTreeMap<String, String>;

/// A label predicate. Both halves must hold; the empty selector selects
/// everything in scope (an empty `podSelector` targets the whole
/// namespace).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(skip_serializing_if = "Option::is_none")]
    match_labels: Option<Map>,
    #[serde(skip_serializing_if = "Option::is_none")]
    match_expressions: Option<Vec<Expression>>,
}

/// One `matchExpressions` requirement.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    key: String,
    operator: Operator,
    #[serde(skip_serializing_if = "Option::is_none")]
    values: Option<BTreeSet<String>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

// === impl Selector ===

impl Selector {
    /// A selector requiring every given label, the way most policies
    /// select their target pods.
    pub fn from_labels<K: ToString, V: ToString>(
        labels: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            match_labels: Some(
                labels
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            match_expressions: None,
        }
    }

    /// Evaluates the selector against an object's label map. Metadata
    /// carries labels optionally; absence behaves as an empty map.
    pub fn matches(&self, labels: Option<&Map>) -> bool {
        if let Some(required) = &self.match_labels {
            for (key, value) in required {
                if labels.and_then(|l| l.get(key)) != Some(value) {
                    return false;
                }
            }
        }
        self.match_expressions
            .iter()
            .flatten()
            .all(|expr| expr.holds(labels))
    }
}

impl TryFrom<&LabelSelector> for Selector {
    type Error = Error;

    fn try_from(selector: &LabelSelector) -> Result<Self> {
        let match_expressions = selector
            .match_expressions
            .as_ref()
            .map(|requirements| {
                requirements
                    .iter()
                    .map(|req| {
                        Ok(Expression {
                            key: req.key.clone(),
                            operator: req.operator.parse()?,
                            values: req
                                .values
                                .as_ref()
                                .map(|values| values.iter().cloned().collect()),
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;

        Ok(Self {
            match_labels: selector.match_labels.clone(),
            match_expressions,
        })
    }
}

// === impl Expression ===

impl Expression {
    fn holds(&self, labels: Option<&Map>) -> bool {
        let value = labels.and_then(|l| l.get(&self.key));
        match (self.operator, self.values.as_ref()) {
            (Operator::In, Some(values)) => value.is_some_and(|v| values.contains(v)),
            (Operator::NotIn, Some(values)) => !value.is_some_and(|v| values.contains(v)),
            (Operator::Exists, None) => value.is_some(),
            (Operator::DoesNotExist, None) => value.is_none(),
            (operator, values) => {
                tracing::warn!(?operator, key = %self.key, ?values, "malformed selector requirement");
                false
            }
        }
    }
}

// === impl Operator ===

impl std::str::FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "In" => Ok(Self::In),
            "NotIn" => Ok(Self::NotIn),
            "Exists" => Ok(Self::Exists),
            "DoesNotExist" => Ok(Self::DoesNotExist),
            other => bail!("unknown label selector operator: {other}"),
        }
    }
}
