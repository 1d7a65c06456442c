//! Selector compilation and evaluation.
//!
//! Two dialects are supported:
//! - JSON-tree selectors ([`JsonSelector`]), a recursive `and`/`or`/`not`
//!   tree over field conditions.
//! - CEL expressions, a subset of the Common Expression Language with the
//!   subject bound under its kind name (`resource`, `environment`,
//!   `deployment` or `version`).
//!
//! Both compile into a [`Predicate`]. Compilation never panics: a selector
//! that fails to compile becomes [`Predicate::Invalid`], which admits
//! nothing. [`SelectorCache`] interns compiled predicates so identical
//! selectors share one `Arc<Predicate>`; a predicate lives as long as some
//! owning entity still evaluates it.

pub mod cel;
pub mod json;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::domain::{Deployment, DeploymentVersion, Environment, Resource};

pub use cel::{CelProgram, CelValue};
pub use json::{CompiledJsonSelector, DateOperator, JsonSelector, MatchOperator};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("selector compile error: {0}")]
    Compile(String),

    #[error("selector evaluation error: {0}")]
    Eval(String),
}

/// A selector as it appears on entities and policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    Json(JsonSelector),
    Cel(String),
}

impl Selector {
    pub fn cel(expr: impl Into<String>) -> Self {
        Self::Cel(expr.into())
    }

    /// A selector that admits everything.
    pub fn all() -> Self {
        Self::Cel("true".to_string())
    }

    /// A selector that admits nothing.
    pub fn none() -> Self {
        Self::Cel("false".to_string())
    }
}

/// The entity a predicate is evaluated against.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    Resource(&'a Resource),
    Environment(&'a Environment),
    Deployment(&'a Deployment),
    Version(&'a DeploymentVersion),
}

impl<'a> Subject<'a> {
    /// Variable name the subject is bound to in CEL.
    pub fn binding(&self) -> &'static str {
        match self {
            Self::Resource(_) => "resource",
            Self::Environment(_) => "environment",
            Self::Deployment(_) => "deployment",
            Self::Version(_) => "version",
        }
    }

    pub fn id(&self) -> &'a str {
        match self {
            Self::Resource(r) => &r.id,
            Self::Environment(e) => &e.id,
            Self::Deployment(d) => &d.id,
            Self::Version(v) => &v.id,
        }
    }

    pub fn name(&self) -> &'a str {
        match self {
            Self::Resource(r) => &r.name,
            Self::Environment(e) => &e.name,
            Self::Deployment(d) => &d.name,
            Self::Version(v) => &v.name,
        }
    }

    pub fn kind(&self) -> Option<&'a str> {
        match self {
            Self::Resource(r) => Some(&r.kind),
            _ => None,
        }
    }

    pub fn identifier(&self) -> Option<&'a str> {
        match self {
            Self::Resource(r) => Some(&r.identifier),
            _ => None,
        }
    }

    /// Resource version string, or the tag of a deployment version.
    pub fn version(&self) -> Option<&'a str> {
        match self {
            Self::Resource(r) => Some(&r.version),
            Self::Version(v) => Some(&v.tag),
            _ => None,
        }
    }

    pub fn metadata(&self) -> Option<&'a std::collections::BTreeMap<String, String>> {
        match self {
            Self::Resource(r) => Some(&r.metadata),
            Self::Version(v) => Some(&v.metadata),
            _ => None,
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Resource(r) => Some(r.created_at),
            Self::Version(v) => Some(v.created_at),
            _ => None,
        }
    }

    /// JSON view of the subject used for property paths and CEL bindings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Resource(r) => json!({
                "id": r.id,
                "workspace_id": r.workspace_id,
                "name": r.name,
                "kind": r.kind,
                "identifier": r.identifier,
                "version": r.version,
                "metadata": r.metadata,
                "config": r.config,
                "created_at": r.created_at.to_rfc3339(),
            }),
            Self::Environment(e) => json!({
                "id": e.id,
                "system_id": e.system_id,
                "name": e.name,
                "description": e.description,
            }),
            Self::Deployment(d) => json!({
                "id": d.id,
                "system_id": d.system_id,
                "name": d.name,
                "slug": d.slug,
                "description": d.description,
                "job_agent_id": d.job_agent_id,
            }),
            Self::Version(v) => json!({
                "id": v.id,
                "deployment_id": v.deployment_id,
                "name": v.name,
                "tag": v.tag,
                "status": v.status,
                "metadata": v.metadata,
                "config": v.config,
                "created_at": v.created_at.to_rfc3339(),
            }),
        }
    }

    /// CEL value of the subject; `created_at` is bound as a timestamp.
    pub fn to_cel(&self) -> CelValue {
        let mut value = CelValue::from_json(&self.to_json());
        if let (CelValue::Map(map), Some(ts)) = (&mut value, self.created_at()) {
            map.insert("created_at".to_string(), CelValue::Timestamp(ts));
        }
        value
    }

    /// Look up a property path such as `["metadata", "vpc_id"]`.
    ///
    /// Returns `None` for a missing path or a `null` leaf.
    pub fn property(&self, path: &[String]) -> Option<serde_json::Value> {
        lookup_path(&self.to_json(), path).cloned()
    }
}

/// Walk `path` through nested objects (and arrays, by index). A missing
/// segment or a `null` leaf yields `None`.
pub fn lookup_path<'v>(
    root: &'v serde_json::Value,
    path: &[String],
) -> Option<&'v serde_json::Value> {
    let mut cursor = root;
    for segment in path {
        cursor = match cursor {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if cursor.is_null() {
        None
    } else {
        Some(cursor)
    }
}

/// A compiled selector.
#[derive(Debug)]
pub enum Predicate {
    Const(bool),
    Json(CompiledJsonSelector),
    Cel(CelProgram),
    /// Failed to compile; admits nothing.
    Invalid(String),
}

impl Predicate {
    pub fn compile(selector: &Selector) -> Result<Self, SelectorError> {
        match selector {
            Selector::Json(tree) => Ok(Self::Json(CompiledJsonSelector::compile(tree)?)),
            Selector::Cel(source) => match source.trim() {
                "true" => Ok(Self::Const(true)),
                "false" => Ok(Self::Const(false)),
                _ => Ok(Self::Cel(CelProgram::compile(source)?)),
            },
        }
    }

    pub fn evaluate(&self, subject: Subject<'_>) -> Result<bool, SelectorError> {
        match self {
            Self::Const(b) => Ok(*b),
            Self::Json(tree) => Ok(tree.matches(subject)),
            Self::Cel(program) => program.evaluate_subject(subject),
            Self::Invalid(reason) => Err(SelectorError::Compile(reason.clone())),
        }
    }

    /// Evaluate, treating any error as `false`.
    pub fn test(&self, subject: Subject<'_>) -> bool {
        self.evaluate(subject).unwrap_or(false)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

pub const DEFAULT_SELECTOR_CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct Interned {
    predicates: HashMap<String, Arc<Predicate>>,
    /// owner -> keys it has evaluated
    owners: HashMap<String, HashSet<String>>,
    /// key -> number of owners holding it
    holders: HashMap<String, usize>,
}

impl Interned {
    /// Drop predicates no owner holds.
    fn sweep(&mut self) {
        let holders = &self.holders;
        self.predicates.retain(|key, _| holders.contains_key(key));
    }
}

/// Interning cache of compiled predicates, keyed by the serialized selector.
///
/// Owners are entity handles such as `environment/prod`. Releasing an
/// owner evicts every predicate no other owner holds. Predicates fetched
/// without an owner are dropped whenever the cache reaches capacity.
#[derive(Debug)]
pub struct SelectorCache {
    inner: Mutex<Interned>,
    capacity: usize,
}

impl Default for SelectorCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SELECTOR_CACHE_CAPACITY)
    }
}

fn cache_key(selector: &Selector) -> Result<String, serde_json::Error> {
    serde_json::to_string(selector)
}

impl SelectorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Interned::default()),
            capacity: capacity.max(1),
        }
    }

    /// Compile `selector`, or return the predicate already compiled for an
    /// identical selector.
    pub fn get(&self, selector: &Selector) -> Arc<Predicate> {
        self.intern(selector, None)
    }

    /// [`SelectorCache::get`], recording that `owner` evaluates `selector`.
    pub fn get_for(&self, selector: &Selector, owner: &str) -> Arc<Predicate> {
        self.intern(selector, Some(owner))
    }

    fn intern(&self, selector: &Selector, owner: Option<&str>) -> Arc<Predicate> {
        let key = match cache_key(selector) {
            Ok(key) => key,
            Err(e) => return Arc::new(Predicate::Invalid(e.to_string())),
        };
        let mut inner = self.inner.lock();
        if let Some(owner) = owner {
            let fresh = inner
                .owners
                .entry(owner.to_string())
                .or_default()
                .insert(key.clone());
            if fresh {
                *inner.holders.entry(key.clone()).or_default() += 1;
            }
        }
        if let Some(existing) = inner.predicates.get(&key) {
            return Arc::clone(existing);
        }
        if inner.predicates.len() >= self.capacity {
            inner.sweep();
        }
        let predicate = Arc::new(
            Predicate::compile(selector).unwrap_or_else(|e| Predicate::Invalid(e.to_string())),
        );
        inner.predicates.insert(key, Arc::clone(&predicate));
        predicate
    }

    /// Forget everything `owner` evaluated. Called when the owning entity
    /// is deleted or its selectors may have changed.
    pub fn release(&self, owner: &str) {
        let mut inner = self.inner.lock();
        let Some(keys) = inner.owners.remove(owner) else {
            return;
        };
        for key in keys {
            let orphaned = match inner.holders.get_mut(&key) {
                Some(count) => {
                    *count -= 1;
                    *count == 0
                }
                None => false,
            };
            if orphaned {
                inner.holders.remove(&key);
                inner.predicates.remove(&key);
            }
        }
    }

    pub fn contains(&self, selector: &Selector) -> bool {
        cache_key(selector).map_or(false, |key| self.inner.lock().predicates.contains_key(&key))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().predicates.is_empty()
    }
}

/// Selector evaluation bound to a cache and a diagnostics sink.
///
/// Every failure is recorded and degrades to `false`.
#[derive(Debug, Clone, Copy)]
pub struct Matcher<'a> {
    pub cache: &'a SelectorCache,
    pub diagnostics: &'a Diagnostics,
}

impl<'a> Matcher<'a> {
    pub fn new(cache: &'a SelectorCache, diagnostics: &'a Diagnostics) -> Self {
        Self { cache, diagnostics }
    }

    /// Evaluate an optional selector; `absent` is the answer when there is
    /// no selector at all.
    pub fn admits(
        &self,
        selector: Option<&Selector>,
        subject: Subject<'_>,
        absent: bool,
        owner: &str,
    ) -> bool {
        let Some(selector) = selector else {
            return absent;
        };
        let predicate = self.cache.get_for(selector, owner);
        match predicate.evaluate(subject) {
            Ok(admitted) => admitted,
            Err(SelectorError::Compile(reason)) => {
                self.diagnostics
                    .record(DiagnosticKind::SelectorCompile, owner, reason);
                false
            }
            Err(SelectorError::Eval(reason)) => {
                self.diagnostics.record(
                    DiagnosticKind::SelectorEval,
                    owner,
                    format!("{} {}: {reason}", subject.binding(), subject.id()),
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn resource() -> Resource {
        let mut metadata = BTreeMap::new();
        metadata.insert("env".to_string(), "prod".to_string());
        Resource {
            id: "r1".into(),
            workspace_id: "ws".into(),
            name: "cluster-a".into(),
            kind: "kubernetes-cluster".into(),
            identifier: "k8s/cluster-a".into(),
            version: "v1".into(),
            metadata,
            config: json!({"region": "us-east-1", "nodes": [1, 2]}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn literal_true_and_false_are_constants() {
        assert!(matches!(
            Predicate::compile(&Selector::cel(" true ")).unwrap(),
            Predicate::Const(true)
        ));
        assert!(matches!(
            Predicate::compile(&Selector::none()).unwrap(),
            Predicate::Const(false)
        ));
    }

    #[test]
    fn identical_selectors_share_a_predicate() {
        let cache = SelectorCache::new();
        let a = cache.get(&Selector::cel("resource.kind == 'vpc'"));
        let b = cache.get(&Selector::cel("resource.kind == 'vpc'"));
        let c = cache.get(&Selector::cel("resource.kind == 'db'"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn releasing_the_last_owner_evicts() {
        let cache = SelectorCache::new();
        let vpc = Selector::cel("resource.kind == 'vpc'");
        let db = Selector::cel("resource.kind == 'db'");
        cache.get_for(&vpc, "environment/prod");
        cache.get_for(&vpc, "relationship_rule/r1");
        cache.get_for(&db, "environment/prod");
        assert_eq!(cache.len(), 2);

        cache.release("environment/prod");
        assert!(cache.contains(&vpc));
        assert!(!cache.contains(&db));

        cache.release("relationship_rule/r1");
        assert!(cache.is_empty());
        cache.release("relationship_rule/r1");
    }

    #[test]
    fn capacity_drops_unowned_predicates() {
        let cache = SelectorCache::with_capacity(2);
        let owned = Selector::cel("resource.kind == 'vpc'");
        cache.get_for(&owned, "deployment/api");
        cache.get(&Selector::cel("resource.kind == 'db'"));
        cache.get(&Selector::cel("resource.kind == 'queue'"));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&owned));
        assert!(cache.contains(&Selector::cel("resource.kind == 'queue'")));
    }

    #[test]
    fn invalid_selector_admits_nothing_and_is_recorded() {
        let cache = SelectorCache::new();
        let diags = Diagnostics::new(10);
        let matcher = Matcher::new(&cache, &diags);
        let r = resource();
        let sel = Selector::cel("resource.name ==");
        assert!(!matcher.admits(Some(&sel), Subject::Resource(&r), true, "environment/e1"));
        assert_eq!(diags.len(), 1);
        assert_eq!(diags.snapshot()[0].kind, DiagnosticKind::SelectorCompile);
    }

    #[test]
    fn missing_selector_uses_default() {
        let cache = SelectorCache::new();
        let diags = Diagnostics::new(10);
        let matcher = Matcher::new(&cache, &diags);
        let r = resource();
        assert!(matcher.admits(None, Subject::Resource(&r), true, "d"));
        assert!(!matcher.admits(None, Subject::Resource(&r), false, "e"));
    }

    #[test]
    fn property_paths() {
        let r = resource();
        let s = Subject::Resource(&r);
        assert_eq!(s.property(&["metadata".into(), "env".into()]), Some(json!("prod")));
        assert_eq!(s.property(&["config".into(), "nodes".into(), "1".into()]), Some(json!(2)));
        assert_eq!(s.property(&["config".into(), "missing".into()]), None);
        assert_eq!(s.property(&["id".into()]), Some(json!("r1")));
    }

    #[test]
    fn selector_serde_shape() {
        let sel: Selector = serde_json::from_value(json!({"cel": "resource.kind == 'vpc'"})).unwrap();
        assert_eq!(sel, Selector::cel("resource.kind == 'vpc'"));
        let sel: Selector = serde_json::from_value(json!({
            "json": {"type": "kind", "operator": "equals", "value": "vpc"}
        }))
        .unwrap();
        assert!(matches!(sel, Selector::Json(_)));
    }
}
