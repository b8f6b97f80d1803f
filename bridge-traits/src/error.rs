use thiserror::Error;

/// Transport-layer failures reported by bridge implementations.
///
/// Every variant represents a failure below the application protocol: the
/// request never produced a well-formed HTTP response. Application-level
/// rejections (non-2xx statuses with a body) are *not* bridge errors; they
/// are returned as ordinary `HttpResponse` values and interpreted by the
/// caller.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
