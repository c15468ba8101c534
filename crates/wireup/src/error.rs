//! Error types for endpoint wire-up.

use crate::config::EpOp;
use thiserror::Error;

/// Result type alias for the wire-up crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while creating or wiring up endpoints.
#[derive(Debug, Error)]
pub enum Error {
    /// Failure reported by a transport, passed through unchanged.
    #[error(transparent)]
    Transport(#[from] transport::Error),
    /// Every candidate was disqualified by the scoring function.
    #[error("no suitable {purpose} transport to {peer}: {reasons}")]
    NoSuitableResource {
        purpose: &'static str,
        peer: String,
        reasons: String,
    },
    /// The endpoint configuration has no resource for this category.
    #[error("no transport resource configured for {0}")]
    NotConfigured(EpOp),
    /// A wire-up message referred to a peer this worker does not know.
    #[error("unknown peer {0:016x}")]
    UnknownPeer(u64),
    /// A wire-up message could not be encoded or decoded.
    #[error("malformed wire-up message: {0}")]
    Codec(#[from] bincode::Error),
}

impl Error {
    /// The transport error, if this is one.
    pub fn as_transport(&self) -> Option<&transport::Error> {
        match self {
            Error::Transport(err) => Some(err),
            _ => None,
        }
    }
}
