//! Declarative relationship rules between resources.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::entity::{Entity, EntityKind};
use crate::selector::Selector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelatableType {
    Resource,
    Deployment,
    Environment,
}

/// How a `from` property is compared with a `to` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyComparator {
    /// Deep equality; numbers compare by value.
    Equals,
    /// `from` starts with `to`.
    StartsWith,
    /// `from` ends with `to`.
    EndsWith,
    /// `from` contains `to`.
    Contains,
    /// `to` is a regular expression that must match `from`.
    Regex,
    /// `from` is an element of the `to` array (or numerically equal to it).
    In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMatcher {
    pub from_property: Vec<String>,
    pub to_property: Vec<String>,
    #[serde(default = "default_comparator")]
    pub operator: PropertyComparator,
}

fn default_comparator() -> PropertyComparator {
    PropertyComparator::Equals
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRule {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    /// Name variables use to follow this edge, e.g. `vpc`.
    pub reference: String,
    #[serde(default)]
    pub description: Option<String>,
    pub from_type: RelatableType,
    pub to_type: RelatableType,
    #[serde(default)]
    pub from_selector: Option<Selector>,
    #[serde(default)]
    pub to_selector: Option<Selector>,
    #[serde(default)]
    pub matchers: Vec<PropertyMatcher>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Entity for RelationshipRule {
    const KIND: EntityKind = EntityKind::RelationshipRule;
    fn id(&self) -> String {
        self.id.clone()
    }
}
