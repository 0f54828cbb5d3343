//! A view over one namespace of a request's root object.

use std::ops::{Deref, DerefMut};

use serde_json::{Map, Value};

use crate::path::{ensure_object, resolve_for_read, resolve_for_write};
use crate::tracker::RootObject;

/// Access limited to `root[namespace]`.
///
/// Built over `&RootObject` it can only read; over `&mut RootObject` it can
/// also write. The namespace object is created on the first write, never on
/// a read.
pub struct NamespaceStore<'n, R> {
    root: R,
    namespace: &'n str,
}

impl<'n, R> NamespaceStore<'n, R>
where
    R: Deref<Target = RootObject>,
{
    pub fn new(root: R, namespace: &'n str) -> Self {
        Self { root, namespace }
    }

    pub fn namespace(&self) -> &str {
        self.namespace
    }

    /// The whole namespace object, if initialized.
    pub fn object(&self) -> Option<&Value> {
        self.root.get(self.namespace)
    }

    /// Value at `steps` inside the namespace, if every step exists.
    pub fn get<S: AsRef<str>>(&self, steps: &[S]) -> Option<&Value> {
        resolve_for_read(self.object()?, steps)
    }
}

impl<'n, R> NamespaceStore<'n, R>
where
    R: DerefMut<Target = RootObject>,
{
    /// Write `value` at `steps`, creating the namespace and any missing
    /// intermediates.
    pub fn set<S: AsRef<str>>(&mut self, steps: &[S], value: Value) {
        resolve_for_write(self.object_mut(), steps, value);
    }

    fn object_mut(&mut self) -> &mut Map<String, Value> {
        // A namespace holding a non-object is replaced, like any other
        // intermediate on the write path.
        ensure_object(
            self.root
                .entry(self.namespace.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
        )
    }
}
