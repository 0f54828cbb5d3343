//! Uncaught failures inside a request scope and the listeners that react to them.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::response::ResponseState;
use crate::tracker::ScopeId;

/// A panic that escaped a handler or one of its continuations.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub scope_id: ScopeId,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl HandlerFailure {
    pub fn new(scope_id: ScopeId, message: impl Into<String>) -> Self {
        Self {
            scope_id,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }

    /// Build a failure from a panic payload as returned by `catch_unwind`.
    pub fn from_panic(scope_id: ScopeId, payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked with a non-string payload".to_string()
        };
        Self::new(scope_id, message)
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uncaught failure in scope {}: {}", self.scope_id, self.message)
    }
}

/// Callback invoked for every failure in a scope.
pub type FailureListener = Arc<dyn Fn(&HandlerFailure, &ResponseState) + Send + Sync>;

/// Listeners installed on one request, at most one per namespace.
#[derive(Default)]
pub struct FailureListeners {
    by_namespace: Mutex<HashMap<String, FailureListener>>,
}

impl FailureListeners {
    /// Install `listener` for `namespace`. Returns false if one was already
    /// installed; the existing listener is kept.
    pub fn install(&self, namespace: &str, listener: FailureListener) -> bool {
        let mut by_namespace = self.by_namespace.lock().unwrap_or_else(|e| e.into_inner());
        if by_namespace.contains_key(namespace) {
            return false;
        }
        by_namespace.insert(namespace.to_string(), listener);
        true
    }

    pub fn len(&self) -> usize {
        self.by_namespace.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every listener against `failure`.
    pub fn notify(&self, failure: &HandlerFailure, response: &ResponseState) {
        // Snapshot so a listener can install another listener without deadlocking.
        let listeners: Vec<FailureListener> = self
            .by_namespace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(failure, response);
        }
    }
}

impl fmt::Debug for FailureListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let namespaces: Vec<String> = self
            .by_namespace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        f.debug_struct("FailureListeners")
            .field("namespaces", &namespaces)
            .finish()
    }
}
