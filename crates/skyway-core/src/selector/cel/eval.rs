//! CEL values and the tree-walking interpreter.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use super::super::SelectorError;
use super::parser::{BinaryOp, Expr, Quantifier, UnaryOp};

/// Runtime value of a CEL expression. Map keys are strings.
#[derive(Debug, Clone, PartialEq)]
pub enum CelValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
    List(Vec<CelValue>),
    Map(BTreeMap<String, CelValue>),
    Timestamp(DateTime<Utc>),
}

impl CelValue {
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::UInt(u)
                } else {
                    Self::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            serde_json::Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null_type",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Timestamp(_) => "google.protobuf.Timestamp",
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::UInt(u) => Some(*u as f64),
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Heterogeneous equality: numbers compare by value, other mismatched
    /// types are unequal.
    fn equals(&self, other: &CelValue) -> bool {
        match (self, other) {
            (Self::Int(a), Self::UInt(b)) | (Self::UInt(b), Self::Int(a)) => {
                *a >= 0 && *a as u64 == *b
            }
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).map_or(false, |w| v.equals(w)))
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => self == other,
            },
        }
    }

    fn compare(&self, other: &CelValue) -> Result<Ordering, SelectorError> {
        let ordering = match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::UInt(a), Self::UInt(b)) => Some(a.cmp(b)),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        };
        ordering.ok_or_else(|| {
            eval_err(format!(
                "no ordering between {} and {}",
                self.type_name(),
                other.type_name()
            ))
        })
    }
}

fn eval_err(msg: impl Into<String>) -> SelectorError {
    SelectorError::Eval(msg.into())
}

/// Variable bindings for one evaluation.
#[derive(Debug, Default, Clone)]
pub struct Activation {
    vars: HashMap<String, CelValue>,
}

impl Activation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: impl Into<String>, value: CelValue) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    fn get(&self, name: &str) -> Option<&CelValue> {
        self.vars.get(name)
    }
}

pub(crate) fn evaluate(expr: &Expr, activation: &Activation) -> Result<CelValue, SelectorError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => activation
            .get(name)
            .cloned()
            .ok_or_else(|| eval_err(format!("undeclared reference to '{name}'"))),
        Expr::Member(target, field) => match evaluate(target, activation)? {
            CelValue::Map(mut map) => map
                .remove(field)
                .ok_or_else(|| eval_err(format!("no such key: {field}"))),
            other => Err(eval_err(format!(
                "cannot select field '{field}' on {}",
                other.type_name()
            ))),
        },
        Expr::Index(target, index) => {
            let target = evaluate(target, activation)?;
            let index = evaluate(index, activation)?;
            index_value(target, &index)
        }
        Expr::Has(target, field) => match evaluate(target, activation)? {
            CelValue::Map(map) => Ok(CelValue::Bool(map.contains_key(field))),
            other => Err(eval_err(format!(
                "has() on unsupported type {}",
                other.type_name()
            ))),
        },
        Expr::Matches(target, re) => match evaluate(target, activation)? {
            CelValue::String(s) => Ok(CelValue::Bool(re.is_match(&s))),
            other => Err(eval_err(format!("matches() on {}", other.type_name()))),
        },
        Expr::Call {
            target,
            function,
            args,
        } => {
            let target = target
                .as_ref()
                .map(|t| evaluate(t, activation))
                .transpose()?;
            let args = args
                .iter()
                .map(|a| evaluate(a, activation))
                .collect::<Result<Vec<_>, _>>()?;
            call(function, target, args)
        }
        Expr::Unary(op, operand) => {
            let v = evaluate(operand, activation)?;
            match (op, v) {
                (UnaryOp::Not, CelValue::Bool(b)) => Ok(CelValue::Bool(!b)),
                (UnaryOp::Neg, CelValue::Int(i)) => i
                    .checked_neg()
                    .map(CelValue::Int)
                    .ok_or_else(|| eval_err("integer overflow")),
                (UnaryOp::Neg, CelValue::Double(d)) => Ok(CelValue::Double(-d)),
                (op, v) => Err(eval_err(format!(
                    "no such overload: {op:?} {}",
                    v.type_name()
                ))),
            }
        }
        // Logical operators absorb errors when the other side decides the
        // result: `false && error` is `false`, `true || error` is `true`.
        Expr::And(lhs, rhs) => logical(lhs, rhs, activation, false),
        Expr::Or(lhs, rhs) => logical(lhs, rhs, activation, true),
        Expr::Ternary(cond, then, otherwise) => match evaluate(cond, activation)? {
            CelValue::Bool(true) => evaluate(then, activation),
            CelValue::Bool(false) => evaluate(otherwise, activation),
            other => Err(eval_err(format!(
                "ternary condition must be bool, got {}",
                other.type_name()
            ))),
        },
        Expr::Binary(op, lhs, rhs) => {
            let lhs = evaluate(lhs, activation)?;
            let rhs = evaluate(rhs, activation)?;
            binary(*op, lhs, rhs)
        }
        Expr::List(items) => Ok(CelValue::List(
            items
                .iter()
                .map(|i| evaluate(i, activation))
                .collect::<Result<_, _>>()?,
        )),
        Expr::Map(entries) => {
            let mut map = BTreeMap::new();
            for (k, v) in entries {
                let key = match evaluate(k, activation)? {
                    CelValue::String(s) => s,
                    other => {
                        return Err(eval_err(format!(
                            "unsupported map key type {}",
                            other.type_name()
                        )))
                    }
                };
                map.insert(key, evaluate(v, activation)?);
            }
            Ok(CelValue::Map(map))
        }
        Expr::Quantified {
            quantifier,
            range,
            var,
            predicate,
        } => {
            let items: Vec<CelValue> = match evaluate(range, activation)? {
                CelValue::List(items) => items,
                CelValue::Map(map) => map.into_keys().map(CelValue::String).collect(),
                other => {
                    return Err(eval_err(format!(
                        "cannot iterate over {}",
                        other.type_name()
                    )))
                }
            };
            quantify(*quantifier, items, var, predicate, activation)
        }
    }
}

fn logical(
    lhs: &Expr,
    rhs: &Expr,
    activation: &Activation,
    short_circuit_on: bool,
) -> Result<CelValue, SelectorError> {
    let as_bool = |v: Result<CelValue, SelectorError>| match v {
        Ok(CelValue::Bool(b)) => Ok(b),
        Ok(other) => Err(eval_err(format!(
            "logical operand must be bool, got {}",
            other.type_name()
        ))),
        Err(e) => Err(e),
    };
    let left = as_bool(evaluate(lhs, activation));
    if matches!(left, Ok(b) if b == short_circuit_on) {
        return Ok(CelValue::Bool(short_circuit_on));
    }
    let right = as_bool(evaluate(rhs, activation));
    match (left, right) {
        (_, Ok(b)) if b == short_circuit_on => Ok(CelValue::Bool(short_circuit_on)),
        (Ok(_), Ok(_)) => Ok(CelValue::Bool(!short_circuit_on)),
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
}

fn quantify(
    quantifier: Quantifier,
    items: Vec<CelValue>,
    var: &str,
    predicate: &Expr,
    activation: &Activation,
) -> Result<CelValue, SelectorError> {
    let mut scope = activation.clone();
    let mut matched = 0usize;
    let mut first_error = None;
    for item in items {
        scope.vars.insert(var.to_string(), item);
        match evaluate(predicate, &scope) {
            Ok(CelValue::Bool(true)) => {
                matched += 1;
                if quantifier == Quantifier::Exists {
                    return Ok(CelValue::Bool(true));
                }
            }
            Ok(CelValue::Bool(false)) => {
                if quantifier == Quantifier::All {
                    return Ok(CelValue::Bool(false));
                }
            }
            Ok(other) => {
                return Err(eval_err(format!(
                    "predicate must be bool, got {}",
                    other.type_name()
                )))
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    Ok(CelValue::Bool(match quantifier {
        Quantifier::Exists => false,
        Quantifier::All => true,
        Quantifier::ExistsOne => matched == 1,
    }))
}

fn index_value(target: CelValue, index: &CelValue) -> Result<CelValue, SelectorError> {
    match (target, index) {
        (CelValue::Map(mut map), CelValue::String(key)) => map
            .remove(key)
            .ok_or_else(|| eval_err(format!("no such key: {key}"))),
        (CelValue::List(items), idx) => {
            let i = match idx {
                CelValue::Int(i) => usize::try_from(*i).ok(),
                CelValue::UInt(u) => usize::try_from(*u).ok(),
                other => {
                    return Err(eval_err(format!(
                        "list index must be int, got {}",
                        other.type_name()
                    )))
                }
            };
            let len = items.len();
            i.and_then(|i| items.into_iter().nth(i))
                .ok_or_else(|| eval_err(format!("index out of range: {idx:?} (size {len})")))
        }
        (target, idx) => Err(eval_err(format!(
            "cannot index {} with {}",
            target.type_name(),
            idx.type_name()
        ))),
    }
}

fn binary(op: BinaryOp, lhs: CelValue, rhs: CelValue) -> Result<CelValue, SelectorError> {
    use CelValue::*;
    match op {
        BinaryOp::Eq => Ok(Bool(lhs.equals(&rhs))),
        BinaryOp::Ne => Ok(Bool(!lhs.equals(&rhs))),
        BinaryOp::Lt => Ok(Bool(lhs.compare(&rhs)? == Ordering::Less)),
        BinaryOp::Le => Ok(Bool(lhs.compare(&rhs)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Bool(lhs.compare(&rhs)? == Ordering::Greater)),
        BinaryOp::Ge => Ok(Bool(lhs.compare(&rhs)? != Ordering::Less)),
        BinaryOp::In => match rhs {
            List(items) => Ok(Bool(items.iter().any(|i| i.equals(&lhs)))),
            Map(map) => match lhs {
                String(key) => Ok(Bool(map.contains_key(&key))),
                _ => Ok(Bool(false)),
            },
            other => Err(eval_err(format!("'in' on {}", other.type_name()))),
        },
        BinaryOp::Add => match (lhs, rhs) {
            (Int(a), Int(b)) => a.checked_add(b).map(Int).ok_or_else(overflow),
            (UInt(a), UInt(b)) => a.checked_add(b).map(UInt).ok_or_else(overflow),
            (Double(a), Double(b)) => Ok(Double(a + b)),
            (String(a), String(b)) => Ok(String(a + &b)),
            (List(mut a), List(b)) => {
                a.extend(b);
                Ok(List(a))
            }
            (a, b) => Err(no_overload("+", &a, &b)),
        },
        BinaryOp::Sub => match (lhs, rhs) {
            (Int(a), Int(b)) => a.checked_sub(b).map(Int).ok_or_else(overflow),
            (UInt(a), UInt(b)) => a.checked_sub(b).map(UInt).ok_or_else(overflow),
            (Double(a), Double(b)) => Ok(Double(a - b)),
            (a, b) => Err(no_overload("-", &a, &b)),
        },
        BinaryOp::Mul => match (lhs, rhs) {
            (Int(a), Int(b)) => a.checked_mul(b).map(Int).ok_or_else(overflow),
            (UInt(a), UInt(b)) => a.checked_mul(b).map(UInt).ok_or_else(overflow),
            (Double(a), Double(b)) => Ok(Double(a * b)),
            (a, b) => Err(no_overload("*", &a, &b)),
        },
        BinaryOp::Div => match (lhs, rhs) {
            (Int(_), Int(0)) | (UInt(_), UInt(0)) => Err(eval_err("division by zero")),
            (Int(a), Int(b)) => a.checked_div(b).map(Int).ok_or_else(overflow),
            (UInt(a), UInt(b)) => Ok(UInt(a / b)),
            (Double(a), Double(b)) => Ok(Double(a / b)),
            (a, b) => Err(no_overload("/", &a, &b)),
        },
        BinaryOp::Rem => match (lhs, rhs) {
            (Int(_), Int(0)) | (UInt(_), UInt(0)) => Err(eval_err("modulus by zero")),
            (Int(a), Int(b)) => a.checked_rem(b).map(Int).ok_or_else(overflow),
            (UInt(a), UInt(b)) => Ok(UInt(a % b)),
            (a, b) => Err(no_overload("%", &a, &b)),
        },
    }
}

fn overflow() -> SelectorError {
    eval_err("integer overflow")
}

fn no_overload(op: &str, a: &CelValue, b: &CelValue) -> SelectorError {
    eval_err(format!(
        "no such overload: {} {op} {}",
        a.type_name(),
        b.type_name()
    ))
}

fn call(
    function: &str,
    target: Option<CelValue>,
    args: Vec<CelValue>,
) -> Result<CelValue, SelectorError> {
    use CelValue::*;
    // Receiver-style and global-style calls share one table.
    let mut all = Vec::with_capacity(args.len() + 1);
    all.extend(target);
    all.extend(args);
    match (function, all.as_slice()) {
        ("size", [String(s)]) => Ok(Int(s.chars().count() as i64)),
        ("size", [List(l)]) => Ok(Int(l.len() as i64)),
        ("size", [Map(m)]) => Ok(Int(m.len() as i64)),
        ("startsWith", [String(s), String(p)]) => Ok(Bool(s.starts_with(p.as_str()))),
        ("endsWith", [String(s), String(p)]) => Ok(Bool(s.ends_with(p.as_str()))),
        ("contains", [String(s), String(p)]) => Ok(Bool(s.contains(p.as_str()))),
        ("matches", [String(s), String(p)]) => regex::Regex::new(p)
            .map(|re| Bool(re.is_match(s)))
            .map_err(|e| eval_err(format!("invalid regex {p:?}: {e}"))),
        ("lowerAscii", [String(s)]) => Ok(String(s.to_ascii_lowercase())),
        ("upperAscii", [String(s)]) => Ok(String(s.to_ascii_uppercase())),
        ("trim", [String(s)]) => Ok(String(s.trim().to_string())),
        ("string", [v]) => Ok(String(match v {
            String(s) => s.clone(),
            Int(i) => i.to_string(),
            UInt(u) => u.to_string(),
            Double(d) => d.to_string(),
            Bool(b) => b.to_string(),
            Timestamp(t) => t.to_rfc3339(),
            other => {
                return Err(eval_err(format!(
                    "cannot convert {} to string",
                    other.type_name()
                )))
            }
        })),
        ("int", [v]) => match v {
            Int(i) => Ok(Int(*i)),
            UInt(u) => i64::try_from(*u).map(Int).map_err(|_| overflow()),
            Double(d) if d.is_finite() && d.abs() < 9.2e18 => Ok(Int(d.trunc() as i64)),
            String(s) => s
                .trim()
                .parse::<i64>()
                .map(Int)
                .map_err(|e| eval_err(format!("cannot convert {s:?} to int: {e}"))),
            Timestamp(t) => Ok(Int(t.timestamp())),
            other => Err(eval_err(format!(
                "cannot convert {} to int",
                other.type_name()
            ))),
        },
        ("double", [v]) => match v {
            String(s) => s
                .trim()
                .parse::<f64>()
                .map(Double)
                .map_err(|e| eval_err(format!("cannot convert {s:?} to double: {e}"))),
            other => other.as_f64().map(Double).ok_or_else(|| {
                eval_err(format!("cannot convert {} to double", other.type_name()))
            }),
        },
        ("timestamp", [String(s)]) => DateTime::parse_from_rfc3339(s)
            .map(|t| Timestamp(t.with_timezone(&Utc)))
            .map_err(|e| eval_err(format!("invalid timestamp {s:?}: {e}"))),
        ("timestamp", [Timestamp(t)]) => Ok(Timestamp(*t)),
        (name, values) => Err(eval_err(format!(
            "no such overload: {name}({})",
            values
                .iter()
                .map(CelValue::type_name)
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}
