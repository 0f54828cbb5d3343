//! Error types for request context access.

/// Errors that can occur while reading or writing request context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// A write was attempted with no request scope active.
    ///
    /// Usually means the handler is not mounted behind a context middleware,
    /// or the work was scheduled with a plain `tokio::spawn` instead of the
    /// scope-aware `tracker::spawn`.
    #[error("No active request context for write to '{key}'")]
    NoActiveContext { key: String },

    /// The composite key is not of the form `namespace:path`.
    #[error("Invalid context key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// A response header was mutated after headers went out.
    #[error("Cannot set header '{name}': headers already sent")]
    HeadersAlreadySent { name: String },

    /// Header name or value is not valid HTTP.
    #[error("Invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    /// A value could not be converted to or from its JSON representation.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config { reason: String },
}

/// Result type for context operations.
pub type Result<T> = std::result::Result<T, ContextError>;
