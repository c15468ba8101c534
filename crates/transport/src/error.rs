//! Error types for the transport layer.

use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by interfaces and transport endpoints.
///
/// `NoResource` is the only transient variant: the operation may succeed if
/// retried after the worker made progress. Everything else is final for the
/// operation that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No send resources right now; queue the request or retry after progress.
    #[error("no resources are available to initiate the operation")]
    NoResource,
    /// The endpoint has no destination yet.
    #[error("endpoint is not connected")]
    NotConnected,
    /// The destination device or interface cannot be reached.
    #[error("destination is unreachable")]
    Unreachable,
    /// The capability is not provided by this transport.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    /// The payload exceeds the transport's limit for this operation.
    #[error("message of {len} bytes exceeds the limit of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },
    /// A peer address could not be decoded.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// The request was released without being performed.
    #[error("operation canceled")]
    Canceled,
    /// The endpoint was replaced or torn down.
    #[error("endpoint is closed")]
    EndpointClosed,
}

impl Error {
    /// True if the caller should keep the operation around and retry it.
    #[inline]
    pub fn is_no_resource(&self) -> bool {
        matches!(self, Error::NoResource)
    }
}
