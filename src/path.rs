//! Composite key parsing and dotted-path resolution over JSON values.
//!
//! A composite key looks like `namespace:dotted.path`. The namespace picks an
//! entry of the request's root object, the path walks into that entry.
//!
//! ```text
//!   "user:profile.name.first"
//!    ────  ──────────────────
//!     ns    steps: [profile, name, first]
//! ```
//!
//! Reads are tolerant: a missing or non-traversable step yields `None`.
//! Writes create empty objects for missing steps and replace any scalar
//! standing in the way.

use serde_json::{Map, Value};

use crate::error::{ContextError, Result};

/// A parsed `namespace:path` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeKey {
    namespace: String,
    steps: Vec<String>,
}

impl CompositeKey {
    /// Parse a key whose path is a dotted sequence of property names.
    pub fn parse(key: &str) -> Result<Self> {
        let (namespace, path) = split_namespace(key)?;
        let steps: Vec<String> = path.split('.').map(str::to_string).collect();
        if steps.iter().any(|s| s.is_empty()) {
            return Err(ContextError::InvalidKey {
                key: key.to_string(),
                reason: "path contains an empty segment".to_string(),
            });
        }
        Ok(Self {
            namespace: namespace.to_string(),
            steps,
        })
    }

    /// Parse a key whose path is taken verbatim as one property name.
    ///
    /// `"user:a.b"` addresses the property literally named `a.b`.
    pub fn parse_property(key: &str) -> Result<Self> {
        let (namespace, property) = split_namespace(key)?;
        Ok(Self {
            namespace: namespace.to_string(),
            steps: vec![property.to_string()],
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }
}

fn split_namespace(key: &str) -> Result<(&str, &str)> {
    let invalid = |reason: &str| ContextError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let (namespace, path) = key
        .split_once(':')
        .ok_or_else(|| invalid("expected 'namespace:path'"))?;
    if namespace.is_empty() {
        return Err(invalid("namespace is empty"));
    }
    if path.is_empty() {
        return Err(invalid("path is empty"));
    }
    Ok((namespace, path))
}

/// Walk `steps` from `container` and return the leaf, if every step exists.
///
/// Objects are indexed by key, arrays by a numeric step. Anything else in
/// the middle of the walk ends it with `None`.
pub fn resolve_for_read<'a, S: AsRef<str>>(container: &'a Value, steps: &[S]) -> Option<&'a Value> {
    steps.iter().try_fold(container, |current, step| {
        let step = step.as_ref();
        match current {
            Value::Object(map) => map.get(step),
            Value::Array(items) => step.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    })
}

/// Walk `steps` from `container`, creating objects as needed, and assign
/// `value` at the leaf.
///
/// An intermediate that is neither an object nor an array indexed in range
/// is overwritten with an empty object. An empty `steps` slice is a no-op.
pub fn resolve_for_write<S: AsRef<str>>(container: &mut Map<String, Value>, steps: &[S], value: Value) {
    let Some((leaf, parents)) = steps.split_last() else {
        return;
    };
    let Some((first, rest)) = parents.split_first() else {
        container.insert(leaf.as_ref().to_string(), value);
        return;
    };

    let mut current = container
        .entry(first.as_ref().to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    for step in rest {
        current = descend(current, step.as_ref());
    }
    assign(current, leaf.as_ref(), value);
}

/// Step into `current[step]`, making room for it if necessary.
fn descend<'a>(current: &'a mut Value, step: &str) -> &'a mut Value {
    let index = array_index(current, step);
    match (current, index) {
        (Value::Array(items), Some(i)) => &mut items[i],
        (other, _) => ensure_object(other)
            .entry(step.to_string())
            .or_insert_with(|| Value::Object(Map::new())),
    }
}

/// In-range array index named by `step`, if `value` is an array.
fn array_index(value: &Value, step: &str) -> Option<usize> {
    match value {
        Value::Array(items) => step.parse::<usize>().ok().filter(|i| *i < items.len()),
        _ => None,
    }
}

fn assign(parent: &mut Value, leaf: &str, value: Value) {
    let index = array_index(parent, leaf);
    match (parent, index) {
        (Value::Array(items), Some(i)) => items[i] = value,
        (other, _) => {
            ensure_object(other).insert(leaf.to_string(), value);
        }
    }
}

/// Coerce `value` into an object, discarding whatever was there before.
pub(crate) fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}
