//! JSON-tree selectors.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{SelectorError, Subject};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchOperator {
    Equals,
    NotEquals,
    StartsWith,
    EndsWith,
    Contains,
    Regex,
    /// Field is present; `value` is ignored.
    Exists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateOperator {
    Before,
    After,
    BeforeOrOn,
    AfterOrOn,
}

/// Wire form of a JSON-tree selector.
///
/// ```json
/// {"type": "and", "conditions": [
///   {"type": "kind", "operator": "equals", "value": "kubernetes-cluster"},
///   {"type": "metadata", "key": "env", "operator": "starts-with", "value": "prod"}
/// ]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JsonSelector {
    /// Empty `and` admits everything.
    And { conditions: Vec<JsonSelector> },
    /// Empty `or` admits nothing.
    Or { conditions: Vec<JsonSelector> },
    Not { condition: Box<JsonSelector> },
    Metadata {
        key: String,
        operator: MatchOperator,
        #[serde(default)]
        value: String,
    },
    Name {
        operator: MatchOperator,
        #[serde(default)]
        value: String,
    },
    Kind {
        operator: MatchOperator,
        #[serde(default)]
        value: String,
    },
    Id {
        operator: MatchOperator,
        #[serde(default)]
        value: String,
    },
    Identifier {
        operator: MatchOperator,
        #[serde(default)]
        value: String,
    },
    Version {
        operator: MatchOperator,
        #[serde(default)]
        value: String,
    },
    CreatedAt {
        operator: DateOperator,
        value: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Field {
    Metadata(String),
    Name,
    Kind,
    Id,
    Identifier,
    Version,
}

impl Field {
    fn read<'a>(&self, subject: &Subject<'a>) -> Option<&'a str> {
        match self {
            Field::Metadata(key) => subject.metadata()?.get(key).map(String::as_str),
            Field::Name => Some(subject.name()),
            Field::Kind => subject.kind(),
            Field::Id => Some(subject.id()),
            Field::Identifier => subject.identifier(),
            Field::Version => subject.version(),
        }
    }
}

#[derive(Debug, Clone)]
enum StringTest {
    Equals(String),
    NotEquals(String),
    StartsWith(String),
    EndsWith(String),
    Contains(String),
    Regex(Regex),
    Exists,
}

impl StringTest {
    fn compile(operator: MatchOperator, value: &str) -> Result<Self, SelectorError> {
        let value = value.to_string();
        Ok(match operator {
            MatchOperator::Equals => Self::Equals(value),
            MatchOperator::NotEquals => Self::NotEquals(value),
            MatchOperator::StartsWith => Self::StartsWith(value),
            MatchOperator::EndsWith => Self::EndsWith(value),
            MatchOperator::Contains => Self::Contains(value),
            MatchOperator::Regex => Self::Regex(
                Regex::new(&value)
                    .map_err(|e| SelectorError::Compile(format!("invalid regex {value:?}: {e}")))?,
            ),
            MatchOperator::Exists => Self::Exists,
        })
    }

    fn test(&self, actual: &str) -> bool {
        match self {
            Self::Equals(v) => actual == v,
            Self::NotEquals(v) => actual != v,
            Self::StartsWith(v) => actual.starts_with(v.as_str()),
            Self::EndsWith(v) => actual.ends_with(v.as_str()),
            Self::Contains(v) => actual.contains(v.as_str()),
            Self::Regex(re) => re.is_match(actual),
            Self::Exists => true,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Field(Field, StringTest),
    CreatedAt(DateOperator, DateTime<Utc>),
}

impl Node {
    fn matches(&self, subject: &Subject<'_>) -> bool {
        match self {
            Node::And(children) => children.iter().all(|c| c.matches(subject)),
            Node::Or(children) => children.iter().any(|c| c.matches(subject)),
            Node::Not(child) => !child.matches(subject),
            // A missing field never matches, not even `not-equals`.
            Node::Field(field, test) => field.read(subject).map_or(false, |v| test.test(v)),
            Node::CreatedAt(op, at) => subject.created_at().map_or(false, |created| match op {
                DateOperator::Before => created < *at,
                DateOperator::After => created > *at,
                DateOperator::BeforeOrOn => created <= *at,
                DateOperator::AfterOrOn => created >= *at,
            }),
        }
    }
}

/// A JSON-tree selector with its regular expressions precompiled.
#[derive(Debug, Clone)]
pub struct CompiledJsonSelector {
    root: Node,
}

impl CompiledJsonSelector {
    pub fn compile(selector: &JsonSelector) -> Result<Self, SelectorError> {
        Ok(Self {
            root: compile_node(selector)?,
        })
    }

    pub fn matches(&self, subject: Subject<'_>) -> bool {
        self.root.matches(&subject)
    }
}

fn compile_node(selector: &JsonSelector) -> Result<Node, SelectorError> {
    match selector {
        JsonSelector::And { conditions } => Ok(Node::And(
            conditions.iter().map(compile_node).collect::<Result<_, _>>()?,
        )),
        JsonSelector::Or { conditions } => Ok(Node::Or(
            conditions.iter().map(compile_node).collect::<Result<_, _>>()?,
        )),
        JsonSelector::Not { condition } => Ok(Node::Not(Box::new(compile_node(condition)?))),
        JsonSelector::Metadata {
            key,
            operator,
            value,
        } => {
            if key.is_empty() {
                return Err(SelectorError::Compile(
                    "metadata condition requires a key".to_string(),
                ));
            }
            leaf(Field::Metadata(key.clone()), *operator, value)
        }
        JsonSelector::Name { operator, value } => leaf(Field::Name, *operator, value),
        JsonSelector::Kind { operator, value } => leaf(Field::Kind, *operator, value),
        JsonSelector::Id { operator, value } => leaf(Field::Id, *operator, value),
        JsonSelector::Identifier { operator, value } => leaf(Field::Identifier, *operator, value),
        JsonSelector::Version { operator, value } => leaf(Field::Version, *operator, value),
        JsonSelector::CreatedAt { operator, value } => Ok(Node::CreatedAt(*operator, *value)),
    }
}

fn leaf(field: Field, operator: MatchOperator, value: &str) -> Result<Node, SelectorError> {
    Ok(Node::Field(field, StringTest::compile(operator, value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Environment, Resource};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn resource(kind: &str, env: &str) -> Resource {
        let mut metadata = BTreeMap::new();
        metadata.insert("env".to_string(), env.to_string());
        Resource {
            id: format!("{kind}-{env}"),
            workspace_id: "ws".into(),
            name: format!("{kind}-{env}"),
            kind: kind.into(),
            identifier: String::new(),
            version: String::new(),
            metadata,
            config: serde_json::Value::Null,
            created_at: "2024-06-01T00:00:00Z".parse().unwrap(),
        }
    }

    fn compile(value: serde_json::Value) -> CompiledJsonSelector {
        let tree: JsonSelector = serde_json::from_value(value).unwrap();
        CompiledJsonSelector::compile(&tree).unwrap()
    }

    #[test]
    fn and_or_not() {
        let sel = compile(json!({
            "type": "and",
            "conditions": [
                {"type": "kind", "operator": "equals", "value": "kubernetes-cluster"},
                {"type": "not", "condition":
                    {"type": "metadata", "key": "env", "operator": "starts-with", "value": "dev"}}
            ]
        }));
        assert!(sel.matches(Subject::Resource(&resource("kubernetes-cluster", "prod"))));
        assert!(!sel.matches(Subject::Resource(&resource("kubernetes-cluster", "dev-1"))));
        assert!(!sel.matches(Subject::Resource(&resource("vpc", "prod"))));
    }

    #[test]
    fn empty_composites() {
        let r = resource("vpc", "prod");
        assert!(compile(json!({"type": "and", "conditions": []})).matches(Subject::Resource(&r)));
        assert!(!compile(json!({"type": "or", "conditions": []})).matches(Subject::Resource(&r)));
    }

    #[test]
    fn missing_field_never_matches() {
        let env = Environment {
            id: "e1".into(),
            system_id: "s1".into(),
            name: "prod".into(),
            description: None,
            resource_selector: None,
        };
        let sel = compile(json!({"type": "kind", "operator": "not-equals", "value": "vpc"}));
        assert!(!sel.matches(Subject::Environment(&env)));
        let sel = compile(json!({"type": "metadata", "key": "team", "operator": "exists"}));
        assert!(!sel.matches(Subject::Resource(&resource("vpc", "prod"))));
    }

    #[test]
    fn regex_and_dates() {
        let r = resource("vpc", "prod-eu");
        let sel = compile(json!({"type": "metadata", "key": "env", "operator": "regex", "value": "^prod-(eu|us)$"}));
        assert!(sel.matches(Subject::Resource(&r)));
        let sel = compile(json!({"type": "created-at", "operator": "before-or-on", "value": "2024-06-01T00:00:00Z"}));
        assert!(sel.matches(Subject::Resource(&r)));
        let sel = compile(json!({"type": "created-at", "operator": "before", "value": "2024-06-01T00:00:00Z"}));
        assert!(!sel.matches(Subject::Resource(&r)));
    }

    #[test]
    fn bad_regex_fails_compile() {
        let tree: JsonSelector =
            serde_json::from_value(json!({"type": "name", "operator": "regex", "value": "(unclosed"}))
                .unwrap();
        assert!(matches!(
            CompiledJsonSelector::compile(&tree),
            Err(SelectorError::Compile(_))
        ));
    }
}
