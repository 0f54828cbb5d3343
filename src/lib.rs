//! Request-scoped context storage for axum/tower pipelines.
//!
//! Mount [`middleware`] once per namespace. Handlers, and any work they
//! schedule through [`tracker::spawn`], [`tracker::spawn_blocking`] or
//! [`tracker::delay`], can then read and write a per-request JSON store by
//! composite key without threading a context object through signatures:
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use axum::{Router, routing::get};
//! use request_context::{set, set_context, tracker};
//!
//! async fn handler() -> String {
//!     set("user:name", "Ann").unwrap();
//!     tracker::delay(Duration::from_millis(10), async {
//!         set_context("user:async.ready", true).unwrap();
//!     })
//!     .await
//!     .unwrap();
//!     request_context::get(Some("user")).unwrap().to_string()
//! }
//!
//! let app: Router = Router::new()
//!     .route("/", get(handler))
//!     .layer(request_context::middleware("user"));
//! ```
//!
//! Each request gets its own root object. Requests never see each other's
//! context, even when their continuations interleave on the same worker.

pub mod config;
pub mod error;
pub mod facade;
pub mod failure;
pub mod middleware;
pub mod namespace;
pub mod path;
pub mod response;
pub mod tracker;

pub use config::ContextConfig;
pub use error::{ContextError, Result};
pub use facade::{get, get_context, get_context_as, is_active, set, set_context, set_context_from};
pub use failure::HandlerFailure;
pub use middleware::{ContextLayer, ContextService, FailureHook, middleware};
pub use tracker::{RootObject, Scope, ScopeId, ScopeState, SharedRoot};
