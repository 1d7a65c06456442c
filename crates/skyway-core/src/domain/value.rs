//! Variable values: literals and relationship references.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A fully resolved variable value.
///
/// Serialized untagged so JSON payloads read naturally:
/// `"us-east-1"`, `3`, `true`, `{"cpu": "500m"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LiteralValue {
    String(String),
    Int(i64),
    Bool(bool),
    Object(BTreeMap<String, LiteralValue>),
}

impl LiteralValue {
    /// Convert a JSON tree into a literal.
    ///
    /// `null` has no literal form and yields `None`; floats become their
    /// decimal string, arrays become objects keyed by index, and `null`
    /// members are dropped from objects.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => Some(match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::String(n.to_string()),
            }),
            serde_json::Value::String(s) => Some(Self::String(s.clone())),
            serde_json::Value::Array(items) => Some(Self::Object(
                items
                    .iter()
                    .enumerate()
                    .filter_map(|(i, v)| Self::from_json(v).map(|lit| (i.to_string(), lit)))
                    .collect(),
            )),
            serde_json::Value::Object(map) => Some(Self::Object(
                map.iter()
                    .filter_map(|(k, v)| Self::from_json(v).map(|lit| (k.clone(), lit)))
                    .collect(),
            )),
        }
    }

    /// Canonical JSON form used for fingerprints and CEL bindings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Object(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<&str> for LiteralValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for LiteralValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for LiteralValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for LiteralValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// A variable value as declared on a deployment or resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// Used verbatim.
    Literal(LiteralValue),
    /// Follow relationship `reference` from the owning resource, then read
    /// `path` on the first related resource.
    Reference { reference: String, path: Vec<String> },
}

impl Value {
    pub fn literal(v: impl Into<LiteralValue>) -> Self {
        Self::Literal(v.into())
    }

    pub fn reference(reference: impl Into<String>, path: &[&str]) -> Self {
        Self::Reference {
            reference: reference.into(),
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Relationship name this value depends on, if any.
    pub fn reference_name(&self) -> Option<&str> {
        match self {
            Self::Reference { reference, .. } => Some(reference),
            Self::Literal(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn literal_untagged_json_shape() {
        let v: LiteralValue = serde_json::from_value(json!({"cpu": "500m", "replicas": 3}))
            .expect("deserialize");
        let mut expected = BTreeMap::new();
        expected.insert("cpu".to_string(), LiteralValue::from("500m"));
        expected.insert("replicas".to_string(), LiteralValue::Int(3));
        assert_eq!(v, LiteralValue::Object(expected));
        assert_eq!(serde_json::to_value(&v).unwrap(), json!({"cpu": "500m", "replicas": 3}));
    }

    #[test]
    fn from_json_handles_non_literal_shapes() {
        assert_eq!(LiteralValue::from_json(&json!(null)), None);
        assert_eq!(
            LiteralValue::from_json(&json!(1.5)),
            Some(LiteralValue::from("1.5"))
        );
        let arr = LiteralValue::from_json(&json!(["a", null, "c"])).expect("array");
        let LiteralValue::Object(map) = arr else {
            panic!("expected object");
        };
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("2"), Some(&LiteralValue::from("c")));
    }

    #[test]
    fn value_tagged_json_shape() {
        let v = Value::reference("vpc", &["metadata", "cidr"]);
        let encoded = serde_json::to_value(&v).unwrap();
        assert_eq!(
            encoded,
            json!({"reference": {"reference": "vpc", "path": ["metadata", "cidr"]}})
        );
        let lit: Value = serde_json::from_value(json!({"literal": 5})).unwrap();
        assert_eq!(lit, Value::literal(5i64));
        assert_eq!(v.reference_name(), Some("vpc"));
    }
}
