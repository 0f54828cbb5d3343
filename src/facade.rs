//! The functions handlers call to read and write request context.
//!
//! All of them resolve the current request through the task-local scope set
//! up by the middleware, so they work the same from the handler body, from a
//! `tracker::spawn`ed task, or from a `tracker::delay`ed timer.
//!
//! Reads never fail: no scope, no namespace or a missing path all come back
//! as `None`. Writes fail with [`ContextError::NoActiveContext`] outside a
//! scope, because a dropped write almost always means the middleware was not
//! mounted.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ContextError, Result};
use crate::namespace::NamespaceStore;
use crate::path::CompositeKey;
use crate::tracker::{self, Scope};

/// Read one namespace object, or the whole root object when `namespace` is
/// `None`.
pub fn get(namespace: Option<&str>) -> Option<Value> {
    let scope = tracker::current_scope()?;
    scope.read(|root| match namespace {
        Some(namespace) => root.get(namespace).cloned(),
        None => Some(Value::Object(root.clone())),
    })
}

/// Write `value` to the single property named by `key` (`"namespace:prop"`).
///
/// The property part is not split on dots.
pub fn set(key: &str, value: impl Into<Value>) -> Result<()> {
    let scope = require_scope(key)?;
    let key = CompositeKey::parse_property(key)?;
    write(&scope, &key, value.into());
    Ok(())
}

/// Read the value at `path` (`"namespace:dotted.path"`).
pub fn get_context(path: &str) -> Option<Value> {
    let scope = tracker::current_scope()?;
    let key = CompositeKey::parse(path).ok()?;
    scope.read(|root| {
        NamespaceStore::new(root, key.namespace())
            .get(key.steps())
            .cloned()
    })
}

/// Write `value` at `path` (`"namespace:dotted.path"`), creating missing
/// intermediate objects.
pub fn set_context(path: &str, value: impl Into<Value>) -> Result<()> {
    let scope = require_scope(path)?;
    let key = CompositeKey::parse(path)?;
    write(&scope, &key, value.into());
    Ok(())
}

/// Read the value at `path` and deserialize it into `T`.
///
/// Returns `Ok(None)` when the path does not resolve.
pub fn get_context_as<T: DeserializeOwned>(path: &str) -> Result<Option<T>> {
    get_context(path)
        .map(serde_json::from_value)
        .transpose()
        .map_err(ContextError::from)
}

/// Serialize `value` and write it at `path`.
pub fn set_context_from<T: Serialize>(path: &str, value: &T) -> Result<()> {
    set_context(path, serde_json::to_value(value)?)
}

/// Whether the calling code runs inside a request scope.
pub fn is_active() -> bool {
    tracker::current_scope().is_some()
}

fn require_scope(key: &str) -> Result<Scope> {
    tracker::current_scope().ok_or_else(|| {
        tracing::warn!(key, "Context write outside of a request scope");
        ContextError::NoActiveContext {
            key: key.to_string(),
        }
    })
}

fn write(scope: &Scope, key: &CompositeKey, value: Value) {
    scope.write(|root| NamespaceStore::new(root, key.namespace()).set(key.steps(), value));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;

    #[tokio::test]
    async fn test_reads_outside_scope_are_none() {
        for _ in 0..3 {
            assert_eq!(get(Some("x")), None);
            assert_eq!(get(None), None);
            assert_eq!(get_context("x:y.z"), None);
        }
        assert!(!is_active());
    }

    #[tokio::test]
    async fn test_writes_outside_scope_fail() {
        for _ in 0..3 {
            assert!(matches!(set("x:y", 1), Err(ContextError::NoActiveContext { .. })));
            assert!(matches!(
                set_context("x:y.z", 1),
                Err(ContextError::NoActiveContext { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_set_then_get_namespace() {
        let value = Scope::new()
            .run(async {
                set("u:name", json!({ "first": "Ann" })).unwrap();
                get(Some("u"))
            })
            .await;
        assert_eq!(value, Some(json!({ "name": { "first": "Ann" } })));
    }

    #[tokio::test]
    async fn test_set_does_not_split_dots() {
        let value = Scope::new()
            .run(async {
                set("u:a.b", 1).unwrap();
                (get(Some("u")), get_context("u:a.b"))
            })
            .await;
        assert_eq!(value, (Some(json!({ "a.b": 1 })), None));
    }

    #[tokio::test]
    async fn test_set_context_round_trip() {
        let value = Scope::new()
            .run(async {
                set_context("test:async.value.object.property", "property").unwrap();
                get_context("test:async.value.object.property")
            })
            .await;
        assert_eq!(value, Some(json!("property")));
    }

    #[tokio::test]
    async fn test_missing_path_reads_none() {
        let value = Scope::new()
            .run(async {
                set_context("test:value.string", "s").unwrap();
                (
                    get_context("test:nothing.here"),
                    get_context("test:value.string.deeper"),
                    get_context("other:value"),
                    get_context("malformed"),
                )
            })
            .await;
        assert_eq!(value, (None, None, None, None));
    }

    #[tokio::test]
    async fn test_invalid_key_write_fails() {
        let result = Scope::new().run(async { set_context("no-namespace", 1) }).await;
        assert!(matches!(result, Err(ContextError::InvalidKey { .. })));
    }

    #[tokio::test]
    async fn test_get_none_returns_whole_root() {
        let root = Scope::new()
            .run(async {
                set("a:v", 1).unwrap();
                set("b:v", 2).unwrap();
                get(None)
            })
            .await;
        assert_eq!(root, Some(json!({ "a": { "v": 1 }, "b": { "v": 2 } })));
    }

    #[tokio::test]
    async fn test_timer_writes_visible_to_later_reads() {
        let value = Scope::new()
            .run(async {
                set("u:name", json!({ "first": "Ann" })).unwrap();
                tracker::delay(Duration::from_millis(5), async {
                    set_context("u:async.ready", true).unwrap();
                })
                .await
                .unwrap();
                get(Some("u"))
            })
            .await;
        assert_eq!(
            value,
            Some(json!({ "name": { "first": "Ann" }, "async": { "ready": true } }))
        );
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        first: String,
        admin: bool,
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        let user = User {
            first: "Ann".to_string(),
            admin: false,
        };
        let (read, wrong_type) = Scope::new()
            .run(async {
                set_context_from("u:current", &user).unwrap();
                (
                    get_context_as::<User>("u:current").unwrap(),
                    get_context_as::<u32>("u:current.first"),
                )
            })
            .await;
        assert_eq!(read, Some(user));
        assert!(matches!(wrong_type, Err(ContextError::Serialization(_))));
    }
}
