//! Binding error types

use thiserror::Error;

/// Errors raised while talking to or decoding from the platform binding
#[derive(Debug, Error)]
pub enum BindingError {
    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON document exceeds the accepted size
    #[error("Document too large: {size} bytes (max: {max})")]
    DocumentTooLarge { size: usize, max: usize },

    /// The binding worker is no longer reachable
    #[error("Binding channel closed: {0}")]
    ChannelClosed(String),
}

/// Type alias for binding results
pub type Result<T> = std::result::Result<T, BindingError>;
