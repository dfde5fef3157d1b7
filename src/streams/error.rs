use std::{error::Error, sync::Arc};
use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;
pub type StreamResult<T> = Result<T, StreamError>;

/// Failures reported by byte sources and by the bridge itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The source reached end-of-stream or was explicitly closed.
    #[error("byte source is closed")]
    ResourceClosed,
    /// Any other read, subscribe or activation failure.
    #[error("byte source failed: {0}")]
    ResourceFailure(String),
    #[error("failed to allocate a {0}-byte chunk")]
    AllocationFailure(usize),
    /// The bridge is already closed, or the operation is only valid before
    /// reading started.
    #[error("bridge is in an invalid state for this operation")]
    InvalidState,
    /// The owning context began shutting down before the bridge could attach.
    #[error("owning context is shutting down")]
    OwnerShuttingDown,
}

impl BridgeError {
    pub fn failure(message: impl Into<String>) -> Self {
        BridgeError::ResourceFailure(message.into())
    }

    /// Whether this error is the benign end-of-stream signal rather than a
    /// failure the consumer must see as an error.
    pub fn is_closed(&self) -> bool {
        matches!(self, BridgeError::ResourceClosed)
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::ResourceFailure(e.to_string())
    }
}

/// Errors observed by consumers of a readable byte stream.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("Stream operation was canceled")]
    Canceled(Option<String>),
    #[error("Stream is closed")]
    Closed,
    /// The only error a bridge ever hands to its consumer; source failure
    /// details stay in the logs.
    #[error("Error in byte stream")]
    Generic,
    #[error("Stream task was dropped")]
    TaskDropped,
    #[error("{0}")]
    Other(Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        #[derive(Debug, Error)]
        #[error("{0}")]
        struct SimpleError(String);
        StreamError::Other(Arc::new(SimpleError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::from(s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_resource_closed_classifies_as_closed() {
        assert!(BridgeError::ResourceClosed.is_closed());
        assert!(!BridgeError::failure("reset").is_closed());
        assert!(!BridgeError::AllocationFailure(16).is_closed());
        assert!(!BridgeError::InvalidState.is_closed());
    }

    #[test]
    fn io_errors_become_resource_failures() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let err: BridgeError = io_err.into();
        assert_eq!(err, BridgeError::ResourceFailure("pipe broke".into()));
    }

    #[test]
    fn generic_error_does_not_leak_details() {
        assert_eq!(StreamError::Generic.to_string(), "Error in byte stream");
    }

    #[test]
    fn string_conversions_wrap_into_other() {
        let err: StreamError = "boom".into();
        assert!(matches!(err, StreamError::Other(_)));
        assert_eq!(err.to_string(), "boom");
        assert!(err.source().is_none());
    }
}
