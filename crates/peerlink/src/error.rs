//! Unified error type for peerlink.

use peerlink_engine::EngineError;
use peerlink_protocol::ProtocolError;
use peerlink_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant generates `From` impls, so the
/// `?` operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum PeerlinkError {
    /// A transport-level error (listen, connect, stream).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An engine error (library load, context lifecycle).
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// An address error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
