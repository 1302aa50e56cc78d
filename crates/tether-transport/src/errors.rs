//! Error taxonomy for transport selection and connection establishment.
//!
//! Transport-level connect/disconnect failures propagate to the router's
//! caller as typed variants. Registration anomalies and shutdown failures
//! are recoverable; they are logged rather than surfaced (see
//! `TransportRegistry`).

use crate::relay::LinkState;
use crate::types::TransportType;
use thiserror::Error;

/// Unified error for transport and routing operations.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The requested transport type has no registered backend.
    #[error("transport not registered: {0}")]
    TransportNotRegistered(TransportType),

    /// Every candidate in the preference/fallback chain failed or was
    /// unavailable. Wraps the last underlying failure when one exists.
    #[error("no transport available for target")]
    NoTransportAvailable {
        #[source]
        source: Option<Box<TransportError>>,
    },

    /// The relay link was not connected when a per-peer connect was
    /// attempted. Distinct from a per-peer handshake failure.
    #[error("relay link unavailable (link state: {state:?})")]
    RelayUnavailable { state: LinkState },

    /// Per-peer negotiation failed.
    #[error("peer handshake failed: {0}")]
    HandshakeFailed(String),

    /// The target carries no addressing field.
    #[error("invalid connection target: {0}")]
    InvalidTarget(String),

    /// The selection budget ran out before the attempt resolved.
    #[error("connect attempt timed out")]
    Timeout,

    /// Wrapped collaborator failure with no better classification.
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether the failure is worth retrying on another transport.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransportError::InvalidTarget(_) | TransportError::TransportNotRegistered(_)
        )
    }
}
