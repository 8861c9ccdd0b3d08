//! Error types for the tree visibility engine.

/// Result type alias for visibility operations.
pub type Result<T> = std::result::Result<T, VisibilityError>;

/// Errors that can occur while computing or changing visibility.
///
/// The error is `Clone` because one failed batched query is delivered to
/// every caller waiting on that batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VisibilityError {
    /// A relationship or element query failed.
    #[error("Query failed: {message}")]
    Query { message: String },

    /// A cooperative cancellation token was triggered.
    #[error("Operation was cancelled")]
    Cancelled,

    /// The owning cache, listener or handler has been disposed.
    #[error("Visibility handler has been disposed")]
    Disposed,

    /// Viewport state disagrees with cached id relationships.
    ///
    /// This is a lifecycle error: the cache has to be disposed and rebuilt.
    #[error("Inconsistent visibility state: {message}")]
    InconsistentState { message: String },

    /// A hierarchy node could not be classified.
    #[error("Invalid hierarchy node: {message}")]
    InvalidNode { message: String },

    /// An id string is not a valid 64-bit id.
    #[error("Invalid id '{value}'")]
    InvalidId { value: String },

    /// A filter path could not be converted into visibility targets.
    #[error("Invalid filter path: {message}")]
    InvalidFilterPath { message: String },

    /// A component that spawns tasks was created outside a Tokio runtime.
    #[error("No Tokio runtime available")]
    NoRuntime,

    /// Configuration could not be parsed.
    #[error("Invalid configuration: {message}")]
    Config { message: String },
}

impl VisibilityError {
    /// Create a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Create an inconsistent state error.
    pub fn inconsistent_state(message: impl Into<String>) -> Self {
        Self::InconsistentState {
            message: message.into(),
        }
    }

    /// Create an invalid node error.
    pub fn invalid_node(message: impl Into<String>) -> Self {
        Self::InvalidNode {
            message: message.into(),
        }
    }

    /// Create an invalid id error.
    pub fn invalid_id(value: impl Into<String>) -> Self {
        Self::InvalidId {
            value: value.into(),
        }
    }

    /// Create an invalid filter path error.
    pub fn invalid_filter_path(message: impl Into<String>) -> Self {
        Self::InvalidFilterPath {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns `true` for errors that a later retry may not hit again.
    ///
    /// Query failures are transient; lifecycle and validation errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Query { .. })
    }
}

impl From<serde_json::Error> for VisibilityError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}
