//! The slice of the HTTP response a request scope is allowed to touch.
//!
//! Handlers and failure listeners never hold the real response. They see a
//! shared `ResponseState` that records headers to apply and whether the
//! response has gone out. The middleware applies the pending headers when
//! the inner service returns, then marks the state as sent.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::header::{CONNECTION, HeaderName, HeaderValue};
use axum::http::HeaderMap;

use crate::error::{ContextError, Result};

/// Response headers pending for one request.
#[derive(Debug, Default)]
pub struct ResponseState {
    headers_sent: AtomicBool,
    pending: Mutex<HeaderMap>,
}

impl ResponseState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the response headers have already been written.
    pub fn headers_sent(&self) -> bool {
        self.headers_sent.load(Ordering::Acquire)
    }

    /// Queue a header for the response.
    ///
    /// Fails once headers are sent; mutating them afterwards has no effect on
    /// the wire and is treated as a programming error.
    pub fn set_header(&self, name: &str, value: &str) -> Result<()> {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| ContextError::InvalidHeader {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| ContextError::InvalidHeader {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        self.insert(header_name, header_value)
    }

    /// Ask for the connection to be torn down after this response.
    pub fn close_connection(&self) -> Result<()> {
        self.insert(CONNECTION, HeaderValue::from_static("close"))
    }

    /// Whether `Connection: close` is queued.
    pub fn closes_connection(&self) -> bool {
        self.lock()
            .get(CONNECTION)
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"close"))
    }

    /// Move every queued header onto `headers` and mark the response as sent.
    ///
    /// Later calls to [`set_header`](Self::set_header) fail.
    pub fn commit(&self, headers: &mut HeaderMap) {
        let mut pending = self.lock();
        self.headers_sent.store(true, Ordering::Release);
        headers.extend(std::mem::take(&mut *pending));
    }

    fn insert(&self, name: HeaderName, value: HeaderValue) -> Result<()> {
        let mut pending = self.lock();
        if self.headers_sent() {
            return Err(ContextError::HeadersAlreadySent {
                name: name.as_str().to_string(),
            });
        }
        pending.insert(name, value);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HeaderMap> {
        // A poisoned lock only means a listener panicked mid-insert; the map
        // itself is still usable.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_headers_applied_on_commit() {
        let state = ResponseState::new();
        state.set_header("x-request-stage", "auth").unwrap();
        state.close_connection().unwrap();
        assert!(state.closes_connection());
        assert!(!state.headers_sent());

        let mut headers = HeaderMap::new();
        state.commit(&mut headers);

        assert!(state.headers_sent());
        assert_eq!(headers.get("x-request-stage").unwrap(), "auth");
        assert_eq!(headers.get(CONNECTION).unwrap(), "close");
    }

    #[test]
    fn test_set_header_after_commit_fails() {
        let state = ResponseState::new();
        state.commit(&mut HeaderMap::new());

        let result = state.close_connection();
        assert!(matches!(
            result,
            Err(ContextError::HeadersAlreadySent { ref name }) if name == "connection"
        ));
        assert!(!state.closes_connection());
    }

    #[test]
    fn test_invalid_header_rejected() {
        let state = ResponseState::new();
        let result = state.set_header("bad header", "v");
        assert!(matches!(result, Err(ContextError::InvalidHeader { .. })));
    }
}
