// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Placement constraints and host attributes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Attribute that pins a task to one specific host.
pub const MACHINE_ID_ATTRIBUTE: &str = "machine_id";

/// Constraint operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    /// Attribute value must equal (or, for list values, contain) the constraint value.
    #[default]
    Equals,
}

/// A predicate on one host attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    /// Attribute name.
    pub attribute: String,
    /// Expected value.
    pub value: String,
    /// Comparison operator.
    #[serde(default)]
    pub operator: Operator,
}

impl Constraint {
    /// Build an equality constraint.
    pub fn equals(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
            operator: Operator::Equals,
        }
    }
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ATTR:'{}' EQUALS '{}'", self.attribute, self.value)
    }
}

/// An ordered list of constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Constraints(Vec<Constraint>);

impl Constraints {
    /// Build from a list.
    pub fn new(constraints: Vec<Constraint>) -> Self {
        Self(constraints)
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over constraints.
    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.0.iter()
    }

    /// Constraint on `attribute`, if any.
    pub fn get(&self, attribute: &str) -> Option<&Constraint> {
        self.0.iter().find(|c| c.attribute == attribute)
    }

    /// Merge with the constraints inherited from a parent role. A child
    /// constraint replaces the parent's constraint on the same attribute.
    pub fn merge_parent(&self, parent: &Constraints) -> Constraints {
        let mut merged = parent.0.clone();
        for constraint in &self.0 {
            match merged
                .iter_mut()
                .find(|p| p.attribute == constraint.attribute)
            {
                Some(existing) => *existing = constraint.clone(),
                None => merged.push(constraint.clone()),
            }
        }
        Constraints(merged)
    }
}

impl std::fmt::Display for Constraints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", parts.join("; "))
    }
}

/// Text attributes advertised by a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    /// Build from name/value pairs.
    pub fn new<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Value of an attribute.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Whether every constraint is satisfied. A comma-separated attribute
    /// value satisfies an equality constraint on any of its members.
    pub fn satisfy(&self, constraints: &Constraints) -> bool {
        if constraints.is_empty() {
            return true;
        }
        if self.0.is_empty() {
            debug!("no attributes but non-empty constraints, defaulting to false");
            return false;
        }

        constraints.iter().all(|constraint| match constraint.operator {
            Operator::Equals => match self.get(&constraint.attribute) {
                Some(value) => {
                    value == constraint.value
                        || (value.contains(',')
                            && value.split(',').any(|v| v.trim() == constraint.value))
                }
                None => {
                    warn!(
                        constraint = %constraint.attribute,
                        "constraint not satisfiable (cannot get attribute)"
                    );
                    false
                }
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> Attributes {
        Attributes::new([("machine_id", "flp001"), ("role", "flp,epn")])
    }

    #[test]
    fn test_empty_constraints_always_satisfied() {
        assert!(Attributes::default().satisfy(&Constraints::default()));
    }

    #[test]
    fn test_equality_and_list_membership() {
        let a = attrs();
        assert!(a.satisfy(&Constraints::new(vec![Constraint::equals(
            "machine_id",
            "flp001"
        )])));
        assert!(a.satisfy(&Constraints::new(vec![Constraint::equals("role", "epn")])));
        assert!(!a.satisfy(&Constraints::new(vec![Constraint::equals("role", "qc")])));
    }

    #[test]
    fn test_missing_attribute_fails() {
        let a = attrs();
        assert!(!a.satisfy(&Constraints::new(vec![Constraint::equals("rack", "7")])));
        assert!(!Attributes::default().satisfy(&Constraints::new(vec![Constraint::equals(
            "rack", "7"
        )])));
    }

    #[test]
    fn test_merge_parent_overrides_same_attribute() {
        let parent = Constraints::new(vec![
            Constraint::equals("rack", "1"),
            Constraint::equals("zone", "a"),
        ]);
        let child = Constraints::new(vec![
            Constraint::equals("rack", "2"),
            Constraint::equals("gpu", "yes"),
        ]);

        let merged = child.merge_parent(&parent);
        assert_eq!(merged.get("rack").unwrap().value, "2");
        assert_eq!(merged.get("zone").unwrap().value, "a");
        assert_eq!(merged.get("gpu").unwrap().value, "yes");
        assert_eq!(merged.iter().count(), 3);
    }
}
