//! Errors raised by plugin code across the contract boundary.

/// Errors a plugin reports back to the host.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// `configure()` could not produce a descriptor.
    #[error("configure failed: {0}")]
    Configure(String),

    /// `shutdown()` failed to release resources.
    #[error("shutdown failed: {0}")]
    Shutdown(String),

    /// A tool was invoked with parameters that do not match its schema.
    #[error("invalid parameters for tool {tool}: {message}")]
    InvalidParams {
        /// Tool name.
        tool: String,
        /// What was wrong.
        message: String,
    },

    /// A tool invocation failed.
    #[error("tool {tool} failed: {message}")]
    ToolFailed {
        /// Tool name.
        tool: String,
        /// Failure reason.
        message: String,
    },

    /// A schema or descriptor violated its structural rules.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

/// Result type for contract operations.
pub type ApiResult<T> = Result<T, ApiError>;
