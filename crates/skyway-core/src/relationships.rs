//! Resource relationship graph.
//!
//! Edges are derived from [`RelationshipRule`]s: `(from, to, reference)`
//! exists iff `from` passes the rule's from-selector, `to` passes its
//! to-selector, and every property matcher holds. Self-edges are never
//! created. Follows are answered in ascending id order.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use regex::Regex;
use serde_json::Value as Json;

use crate::diagnostics::DiagnosticKind;
use crate::domain::{PropertyComparator, PropertyMatcher, RelatableType, RelationshipRule, Resource};
use crate::selector::{lookup_path, Matcher, Subject};
use crate::store::Store;

#[derive(Debug, Clone, Default)]
pub struct RelationshipGraph {
    /// from -> reference -> to
    forward: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    /// to -> (from, reference)
    reverse: BTreeMap<String, BTreeSet<(String, String)>>,
    patterns: HashMap<String, Option<Regex>>,
}

/// Rules whose endpoints are both resources; others produce no edges.
pub fn is_supported(rule: &RelationshipRule) -> bool {
    rule.from_type == RelatableType::Resource && rule.to_type == RelatableType::Resource
}

impl RelationshipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute every edge.
    pub fn rebuild(&mut self, store: &Store, matcher: Matcher<'_>) {
        self.forward.clear();
        self.reverse.clear();
        let docs: BTreeMap<&str, Json> = store
            .resources()
            .items()
            .map(|r| (r.id.as_str(), Subject::Resource(r).to_json()))
            .collect();
        for rule in store.relationship_rules().items().filter(|r| is_supported(r)) {
            let froms: Vec<&Resource> = store
                .resources()
                .items()
                .filter(|r| Self::admits_from(rule, r, matcher))
                .collect();
            if froms.is_empty() {
                continue;
            }
            let tos: Vec<&Resource> = store
                .resources()
                .items()
                .filter(|r| Self::admits_to(rule, r, matcher))
                .collect();
            for from in &froms {
                for to in &tos {
                    if from.id == to.id {
                        continue;
                    }
                    let (Some(from_doc), Some(to_doc)) =
                        (docs.get(from.id.as_str()), docs.get(to.id.as_str()))
                    else {
                        continue;
                    };
                    if self.properties_match(rule, from_doc, to_doc, matcher) {
                        self.link(&from.id, &rule.reference, &to.id);
                    }
                }
            }
        }
    }

    /// Recompute edges touching `resource_id` in either direction.
    pub fn refresh_resource(&mut self, store: &Store, matcher: Matcher<'_>, resource_id: &str) {
        self.remove_resource(resource_id);
        let Some(resource) = store.resources().get(resource_id) else {
            return;
        };
        let doc = Subject::Resource(resource).to_json();
        for rule in store.relationship_rules().items().filter(|r| is_supported(r)) {
            let as_from = Self::admits_from(rule, resource, matcher);
            let as_to = Self::admits_to(rule, resource, matcher);
            if !as_from && !as_to {
                continue;
            }
            for other in store.resources().items() {
                if other.id == resource.id {
                    continue;
                }
                let other_doc = Subject::Resource(other).to_json();
                if as_from
                    && Self::admits_to(rule, other, matcher)
                    && self.properties_match(rule, &doc, &other_doc, matcher)
                {
                    self.link(&resource.id, &rule.reference, &other.id);
                }
                if as_to
                    && Self::admits_from(rule, other, matcher)
                    && self.properties_match(rule, &other_doc, &doc, matcher)
                {
                    self.link(&other.id, &rule.reference, &resource.id);
                }
            }
        }
    }

    /// Drop every edge touching `resource_id`.
    pub fn remove_resource(&mut self, resource_id: &str) {
        if let Some(outgoing) = self.forward.remove(resource_id) {
            for (reference, tos) in outgoing {
                for to in tos {
                    if let Some(set) = self.reverse.get_mut(&to) {
                        set.remove(&(resource_id.to_string(), reference.clone()));
                        if set.is_empty() {
                            self.reverse.remove(&to);
                        }
                    }
                }
            }
        }
        if let Some(incoming) = self.reverse.remove(resource_id) {
            for (from, reference) in incoming {
                if let Some(refs) = self.forward.get_mut(&from) {
                    if let Some(tos) = refs.get_mut(&reference) {
                        tos.remove(resource_id);
                        if tos.is_empty() {
                            refs.remove(&reference);
                        }
                    }
                    if refs.is_empty() {
                        self.forward.remove(&from);
                    }
                }
            }
        }
    }

    /// Targets of `reference` from `resource_id`, ids ascending.
    pub fn follow(&self, resource_id: &str, reference: &str) -> Vec<String> {
        self.forward
            .get(resource_id)
            .and_then(|refs| refs.get(reference))
            .map(|tos| tos.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Resources that reach `resource_id` through one or more edges.
    pub fn dependents(&self, resource_id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([resource_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for (from, _) in self.reverse.get(&current).into_iter().flatten() {
                if from != resource_id && seen.insert(from.clone()) {
                    queue.push_back(from.clone());
                }
            }
        }
        seen
    }

    /// Direct neighbours in either direction.
    pub fn neighbours(&self, resource_id: &str) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self
            .forward
            .get(resource_id)
            .into_iter()
            .flat_map(|refs| refs.values().flatten().cloned())
            .collect();
        out.extend(
            self.reverse
                .get(resource_id)
                .into_iter()
                .flatten()
                .map(|(from, _)| from.clone()),
        );
        out
    }

    /// Resources whose outgoing edges differ between `self` and `other`.
    pub fn changed_sources(&self, other: &Self) -> BTreeSet<String> {
        self.forward
            .keys()
            .chain(other.forward.keys())
            .filter(|id| self.forward.get(*id) != other.forward.get(*id))
            .cloned()
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.forward
            .values()
            .flat_map(|refs| refs.values())
            .map(BTreeSet::len)
            .sum()
    }

    fn link(&mut self, from: &str, reference: &str, to: &str) {
        self.forward
            .entry(from.to_string())
            .or_default()
            .entry(reference.to_string())
            .or_default()
            .insert(to.to_string());
        self.reverse
            .entry(to.to_string())
            .or_default()
            .insert((from.to_string(), reference.to_string()));
    }

    fn admits_from(rule: &RelationshipRule, resource: &Resource, matcher: Matcher<'_>) -> bool {
        matcher.admits(
            rule.from_selector.as_ref(),
            Subject::Resource(resource),
            true,
            &format!("relationship_rule/{}", rule.id),
        )
    }

    fn admits_to(rule: &RelationshipRule, resource: &Resource, matcher: Matcher<'_>) -> bool {
        matcher.admits(
            rule.to_selector.as_ref(),
            Subject::Resource(resource),
            true,
            &format!("relationship_rule/{}", rule.id),
        )
    }

    fn properties_match(
        &mut self,
        rule: &RelationshipRule,
        from: &Json,
        to: &Json,
        matcher: Matcher<'_>,
    ) -> bool {
        rule.matchers
            .iter()
            .all(|m| self.property_matches(rule, m, from, to, matcher))
    }

    fn property_matches(
        &mut self,
        rule: &RelationshipRule,
        m: &PropertyMatcher,
        from: &Json,
        to: &Json,
        matcher: Matcher<'_>,
    ) -> bool {
        let (Some(a), Some(b)) = (lookup_path(from, &m.from_property), lookup_path(to, &m.to_property))
        else {
            return false;
        };
        match m.operator {
            PropertyComparator::Equals => json_equals(a, b),
            PropertyComparator::StartsWith => text_pair(a, b).map_or(false, |(a, b)| a.starts_with(&b)),
            PropertyComparator::EndsWith => text_pair(a, b).map_or(false, |(a, b)| a.ends_with(&b)),
            PropertyComparator::Contains => text_pair(a, b).map_or(false, |(a, b)| a.contains(&b)),
            PropertyComparator::In => in_list(a, b),
            PropertyComparator::Regex => {
                let (Some(text), Some(pattern)) = (as_text(a), b.as_str()) else {
                    return false;
                };
                let compiled = self
                    .patterns
                    .entry(pattern.to_string())
                    .or_insert_with(|| Regex::new(pattern).ok());
                match compiled {
                    Some(re) => re.is_match(&text),
                    None => {
                        matcher.diagnostics.record(
                            DiagnosticKind::SelectorCompile,
                            &format!("relationship_rule/{}", rule.id),
                            format!("invalid regex {pattern:?}"),
                        );
                        false
                    }
                }
            }
        }
    }
}

/// Deep equality where numbers compare by value.
pub fn json_equals(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Json::Array(x), Json::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| json_equals(x, y))
        }
        (Json::Object(x), Json::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map_or(false, |w| json_equals(v, w)))
        }
        _ => a == b,
    }
}

/// Membership for the `in` comparator. The right side is an array or a
/// comma-separated string; members compare numerically when both sides
/// read as numbers, so metadata `"443"` is in `[80, 443]`.
fn in_list(needle: &Json, haystack: &Json) -> bool {
    match haystack {
        Json::Array(items) => items.iter().any(|item| numeric_equals(needle, item)),
        Json::String(list) => list
            .split(',')
            .any(|part| numeric_equals(needle, &Json::String(part.trim().to_string()))),
        other => numeric_equals(needle, other),
    }
}

fn numeric_equals(a: &Json, b: &Json) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => json_equals(a, b),
    }
}

fn as_number(value: &Json) -> Option<f64> {
    match value {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn as_text(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn text_pair(a: &Json, b: &Json) -> Option<(String, String)> {
    Some((as_text(a)?, as_text(b)?))
}
