//! Pipeline stage that opens (or joins) a request scope for one namespace.
//!
//! ```rust,ignore
//! let app = Router::new()
//!     .route("/", get(handler))
//!     .layer(request_context::middleware("session"))
//!     .layer(request_context::middleware("user"));
//! ```
//!
//! The outermost context layer a request meets creates the scope and its
//! root object; every inner one finds the scope already active, adds its
//! namespace to the same root and calls through. Only the creating layer
//! catches panics and finalizes response headers.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use tower::{Layer, Service};

use crate::config::ContextConfig;
use crate::failure::{FailureListener, HandlerFailure};
use crate::response::ResponseState;
use crate::tracker::{self, Scope};

/// Upstream reporter called for every failure a layer's listener sees.
pub type FailureHook = Arc<dyn Fn(&HandlerFailure) + Send + Sync>;

/// Create a context layer for `namespace`.
pub fn middleware(namespace: impl Into<String>) -> ContextLayer {
    ContextLayer::new(namespace)
}

/// `tower::Layer` that mounts one context namespace.
#[derive(Clone)]
pub struct ContextLayer {
    namespace: Arc<str>,
    config: Arc<ContextConfig>,
    hook: Option<FailureHook>,
}

impl ContextLayer {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Arc::from(namespace.into()),
            config: Arc::new(ContextConfig::default()),
            hook: None,
        }
    }

    pub fn with_config(mut self, config: ContextConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Report failures to `hook` in addition to logging them.
    pub fn on_failure(mut self, hook: impl Fn(&HandlerFailure) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Add this layer's namespace and failure listener to `scope`.
    fn attach(&self, scope: &Scope) {
        scope.ensure_namespace(&self.namespace);
        if scope.install_failure_listener(&self.namespace, self.failure_listener()) {
            tracing::trace!(scope = %scope.id(), namespace = %self.namespace, "Installed failure listener");
        }
    }

    fn failure_listener(&self) -> FailureListener {
        let namespace = self.namespace.clone();
        let config = self.config.clone();
        let hook = self.hook.clone();

        Arc::new(move |failure: &HandlerFailure, response: &ResponseState| {
            let headers_sent = response.headers_sent();
            if config.close_connection_on_failure && !headers_sent {
                // Headers may go out between the check and the insert.
                if let Err(e) = response.close_connection() {
                    tracing::debug!(scope = %failure.scope_id, "Could not mark connection for close: {}", e);
                }
            }
            if config.log_failures {
                tracing::error!(
                    scope = %failure.scope_id,
                    namespace = %namespace,
                    headers_sent,
                    occurred_at = %failure.occurred_at,
                    error = %failure.message,
                    "Uncaught failure in request handler"
                );
            }
            if let Some(hook) = &hook {
                hook(failure);
            }
        })
    }

    async fn handle<S>(self, mut inner: S, request: Request) -> Response
    where
        S: Service<Request, Response = Response, Error = Infallible>,
    {
        if let Some(scope) = tracker::current_scope() {
            tracing::debug!(scope = %scope.id(), namespace = %self.namespace, "Joining existing request scope");
            self.attach(&scope);
            return match inner.call(request).await {
                Ok(response) => response,
                Err(never) => match never {},
            };
        }

        let scope = Scope::new();
        self.attach(&scope);
        let request_guard = scope.track();

        let outcome = scope
            .clone()
            .run(AssertUnwindSafe(inner.call(request)).catch_unwind())
            .await;

        let mut response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(never)) => match never {},
            Err(payload) => {
                scope.report_failure(&HandlerFailure::from_panic(scope.id(), payload.as_ref()));
                self.config.failure_status.into_response()
            }
        };

        scope.response().commit(response.headers_mut());
        drop(request_guard);
        response
    }
}

impl fmt::Debug for ContextLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextLayer")
            .field("namespace", &self.namespace)
            .field("config", &self.config)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl<S> Layer<S> for ContextLayer {
    type Service = ContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ContextService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Service produced by [`ContextLayer`].
#[derive(Clone, Debug)]
pub struct ContextService<S> {
    inner: S,
    layer: ContextLayer,
}

impl<S> Service<Request> for ContextService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // Take the service that was polled ready and leave a fresh clone behind.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let layer = self.layer.clone();
        Box::pin(async move { Ok(layer.handle(inner, request).await) })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::http::header::CONNECTION;
    use serde_json::json;
    use tower::ServiceExt;
    use tower::service_fn;

    use super::*;
    use crate::facade;

    fn request() -> Request {
        Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_creates_scope_and_namespace() {
        let service = middleware("test").layer(service_fn(|_req: Request| async {
            let root = facade::get(None);
            Ok::<_, Infallible>(axum::Json(root).into_response())
        }));

        let response = service.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CONNECTION).is_none());
    }

    #[tokio::test]
    async fn test_nested_layers_share_one_root() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let handler = service_fn(move |_req: Request| {
            let sink = sink.clone();
            async move {
                facade::set("a:v", 1).unwrap();
                facade::set("b:v", 2).unwrap();
                *sink.lock().unwrap() = facade::get(None);
                Ok::<_, Infallible>(StatusCode::OK.into_response())
            }
        });
        let service = middleware("outer").layer(middleware("inner").layer(handler));

        service.oneshot(request()).await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            Some(json!({ "outer": {}, "inner": {}, "a": { "v": 1 }, "b": { "v": 2 } }))
        );
    }

    #[tokio::test]
    async fn test_handler_panic_closes_connection() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let layer = middleware("test").on_failure(move |failure| {
            sink.lock().unwrap().push(failure.message.clone());
        });
        let service = layer.layer(service_fn(|_req: Request| async {
            if facade::is_active() {
                panic!("handler exploded");
            }
            Ok::<_, Infallible>(StatusCode::OK.into_response())
        }));

        let response = service.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get(CONNECTION).unwrap(), "close");
        assert_eq!(*reported.lock().unwrap(), vec!["handler exploded".to_string()]);
    }

    #[tokio::test]
    async fn test_close_on_failure_can_be_disabled() {
        let config = ContextConfig {
            close_connection_on_failure: false,
            failure_status: StatusCode::SERVICE_UNAVAILABLE,
            log_failures: false,
        };
        let service = middleware("test")
            .with_config(config)
            .layer(service_fn(|_req: Request| async {
                if facade::is_active() {
                    panic!("handler exploded");
                }
                Ok::<_, Infallible>(StatusCode::OK.into_response())
            }));

        let response = service.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(CONNECTION).is_none());
    }
}
