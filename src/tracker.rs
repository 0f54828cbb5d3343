//! Tracks which request scope the running code belongs to.
//!
//! A [`Scope`] is entered with a tokio task-local, so every `.await` inside
//! the request future sees it without passing anything around. Work that
//! leaves the current task (spawned tasks, blocking sections, timers) must go
//! through [`spawn`], [`spawn_blocking`] or [`delay`], which capture the scope
//! at scheduling time and re-enter it when the continuation runs.
//!
//! ```text
//!   request scope (root R)
//!     ├── spawn ───────────▶ child scope (root R)
//!     │                        └── delay ──▶ child scope (root R)
//!     └── spawn_blocking ──▶ child scope (root R)
//! ```
//!
//! Children share the parent's root object and response state by reference.
//! Two requests never share a root: a root is only ever created by
//! [`Scope::new`] / [`Scope::with_root`].

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::failure::{FailureListener, FailureListeners, HandlerFailure};
use crate::response::ResponseState;

/// Namespace name → namespace object, for one request.
pub type RootObject = Map<String, Value>;

/// A root object shared by every scope of one request.
pub type SharedRoot = Arc<RwLock<RootObject>>;

tokio::task_local! {
    static CURRENT_SCOPE: Scope;
}

/// Identifier of one scope in a request's scope tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(Uuid);

impl ScopeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a request's scope tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// The request or at least one of its continuations is still pending.
    Active,
    /// Nothing belonging to the request is pending any more. Final.
    Ended,
}

/// State shared by all scopes of one request.
#[derive(Debug)]
struct RequestShared {
    root: SharedRoot,
    response: Arc<ResponseState>,
    listeners: FailureListeners,
    pending: AtomicUsize,
    ended: AtomicBool,
}

/// Handle to one execution scope. Cheap to clone.
#[derive(Clone)]
pub struct Scope {
    id: ScopeId,
    parent: Option<ScopeId>,
    shared: Arc<RequestShared>,
}

impl Scope {
    /// Create a request scope with a fresh, empty root object.
    pub fn new() -> Self {
        Self::with_root(RootObject::new())
    }

    /// Create a request scope owning `root`.
    pub fn with_root(root: RootObject) -> Self {
        Self::from_shared_root(Arc::new(RwLock::new(root)))
    }

    fn from_shared_root(root: SharedRoot) -> Self {
        let scope = Self {
            id: ScopeId::new(),
            parent: None,
            shared: Arc::new(RequestShared {
                root,
                response: Arc::new(ResponseState::new()),
                listeners: FailureListeners::default(),
                pending: AtomicUsize::new(0),
                ended: AtomicBool::new(false),
            }),
        };
        tracing::debug!(scope = %scope.id, "Created request scope");
        scope
    }

    /// Create a child scope that shares this scope's root and response.
    pub fn child(&self) -> Self {
        Self {
            id: ScopeId::new(),
            parent: Some(self.id),
            shared: self.shared.clone(),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn parent_id(&self) -> Option<ScopeId> {
        self.parent
    }

    /// The root object shared by this scope's request.
    pub fn root(&self) -> &SharedRoot {
        &self.shared.root
    }

    /// The response state of this scope's request.
    pub fn response(&self) -> &ResponseState {
        &self.shared.response
    }

    /// Whether `other` belongs to the same request (shares the same root).
    pub fn same_request(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Run `future` with this scope as the current scope.
    ///
    /// The future counts as pending work until it completes or is dropped.
    pub async fn run<F: Future>(self, future: F) -> F::Output {
        let _guard = self.track();
        CURRENT_SCOPE.scope(self, future).await
    }

    /// Run `f` synchronously with this scope as the current scope.
    pub fn run_sync<R>(self, f: impl FnOnce() -> R) -> R {
        let _guard = self.track();
        CURRENT_SCOPE.sync_scope(self, f)
    }

    /// Read the root object.
    ///
    /// The root lock is held while `f` runs and is not re-entrant: `f` must
    /// not call back into the facade (`get`, `set`, ...) or this scope's
    /// `read`/`write`.
    pub fn read<R>(&self, f: impl FnOnce(&RootObject) -> R) -> R {
        f(&self.read_guard())
    }

    /// Mutate the root object. Same locking rules as [`Scope::read`].
    pub fn write<R>(&self, f: impl FnOnce(&mut RootObject) -> R) -> R {
        f(&mut self.write_guard())
    }

    /// Make sure `root[namespace]` exists. Returns true if it was created.
    pub fn ensure_namespace(&self, namespace: &str) -> bool {
        let created = self.write(|root| {
            if root.contains_key(namespace) {
                false
            } else {
                root.insert(namespace.to_string(), Value::Object(Map::new()));
                true
            }
        });
        if created {
            tracing::debug!(scope = %self.id, namespace, "Initialized context namespace");
        }
        created
    }

    /// Namespaces present on the root object.
    pub fn namespaces(&self) -> Vec<String> {
        self.read(|root| root.keys().cloned().collect())
    }

    /// Register a pending unit of work. The request's scope tree ends when
    /// the last outstanding guard is dropped.
    pub fn track(&self) -> ContinuationGuard {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        ContinuationGuard {
            shared: self.shared.clone(),
        }
    }

    /// Number of tracked units of work still pending.
    pub fn pending_continuations(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ScopeState {
        if self.shared.ended.load(Ordering::Acquire) {
            ScopeState::Ended
        } else {
            ScopeState::Active
        }
    }

    /// Install a failure listener for `namespace`. Returns false if that
    /// namespace already has one on this request.
    pub fn install_failure_listener(&self, namespace: &str, listener: FailureListener) -> bool {
        self.shared.listeners.install(namespace, listener)
    }

    /// Hand `failure` to every listener installed on this request.
    pub fn report_failure(&self, failure: &HandlerFailure) {
        if self.shared.listeners.is_empty() {
            tracing::error!(
                scope = %self.id,
                error = %failure.message,
                "Uncaught failure in request scope with no listener installed"
            );
        }
        self.shared.listeners.notify(failure, &self.shared.response);
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, RootObject> {
        // Poisoning means a writer panicked; the map is still structurally valid.
        self.shared.root.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, RootObject> {
        self.shared.root.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("state", &self.state())
            .field("pending", &self.pending_continuations())
            .finish()
    }
}

/// Keeps a request's scope tree active while held.
#[derive(Debug)]
pub struct ContinuationGuard {
    shared: Arc<RequestShared>,
}

impl Drop for ContinuationGuard {
    fn drop(&mut self) {
        if self.shared.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.ended.store(true, Ordering::Release);
        }
    }
}

/// The scope the calling code runs in, if any.
pub fn current_scope() -> Option<Scope> {
    CURRENT_SCOPE.try_with(Scope::clone).ok()
}

/// The root object of the calling code's scope, if any.
pub fn active_root() -> Option<SharedRoot> {
    CURRENT_SCOPE.try_with(|scope| scope.root().clone()).ok()
}

/// Run `future` inside a new request scope bound to `root`.
///
/// Every continuation scheduled through this module from within `future`
/// observes `root` via [`active_root`].
pub async fn bind_root<F: Future>(root: SharedRoot, future: F) -> F::Output {
    Scope::from_shared_root(root).run(future).await
}

/// Wrap `future` so it runs in the current scope wherever it is polled.
///
/// Unlike [`spawn`], the wrapped future keeps the current scope itself
/// instead of a child and its panics are not reported. Use it for futures
/// handed to foreign executors or combinators.
pub fn bind<F: Future>(future: F) -> impl Future<Output = F::Output> {
    let scope = current_scope();
    async move {
        match scope {
            Some(scope) => scope.run(future).await,
            None => future.await,
        }
    }
}

/// Spawn a task that runs in a child of the current scope.
///
/// Outside any scope this is a plain `tokio::spawn`.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let Some(parent) = current_scope() else {
        return tokio::spawn(future);
    };

    let scope = parent.child();
    let guard = scope.track();
    tracing::trace!(scope = %scope.id, parent = %parent.id, "Scheduled continuation");
    tokio::spawn(scope.clone().run(watch(scope, guard, future)))
}

/// Run blocking `f` on the blocking pool in a child of the current scope.
pub fn spawn_blocking<F, R>(f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let Some(parent) = current_scope() else {
        return tokio::task::spawn_blocking(f);
    };

    let scope = parent.child();
    let guard = scope.track();
    tracing::trace!(scope = %scope.id, parent = %parent.id, "Scheduled blocking continuation");
    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        let reporter = scope.clone();
        scope.run_sync(move || match std::panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(output) => output,
            Err(payload) => {
                reporter.report_failure(&HandlerFailure::from_panic(reporter.id, payload.as_ref()));
                std::panic::resume_unwind(payload)
            }
        })
    })
}

/// Run `future` after `duration`, in a child of the current scope.
pub fn delay<F>(duration: Duration, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn(async move {
        tokio::time::sleep(duration).await;
        future.await
    })
}

/// Drive `future`, reporting a panic to the scope before letting it unwind.
async fn watch<F: Future>(scope: Scope, _guard: ContinuationGuard, future: F) -> F::Output {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(output) => output,
        Err(payload) => {
            scope.report_failure(&HandlerFailure::from_panic(scope.id, payload.as_ref()));
            std::panic::resume_unwind(payload)
        }
    }
}
