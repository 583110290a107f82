//! Error types for the engine binding.

use peerlink_protocol::ProtocolError;

use crate::{ContextHandle, SocketHandle};

/// Errors returned by [`Engine`](crate::Engine) entry points.
///
/// `Clone` so a failed library load can be cached and handed to every
/// later caller without retrying.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The native library could not be opened or is missing a symbol.
    #[error("failed to load uTP library: {0}")]
    Load(String),

    /// `utp_init` returned null.
    #[error("engine initialization failed")]
    InitFailed,

    /// The context was already destroyed (or never created by this engine).
    #[error("context {0} is not live")]
    ContextDestroyed(ContextHandle),

    /// The socket was never registered or has already been torn down.
    #[error("socket {0} is not live")]
    UnknownSocket(SocketHandle),

    /// An entry point returned its failure code.
    #[error("{call} failed with code {code}")]
    CallFailed {
        /// Name of the native entry point.
        call: &'static str,
        /// Raw return value.
        code: i64,
    },

    /// An address argument could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
