use peerlink_engine::EngineError;
use peerlink_protocol::ProtocolError;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// `listen` was called on a server that is already listening.
    #[error("server is already listening")]
    AlreadyListening,

    /// `listen` was called while an earlier `listen` is still binding.
    #[error("listen already in progress")]
    ListenInProgress,

    /// The operation needs a listening server.
    #[error("server is not listening")]
    NotListening,

    /// The stream was destroyed; no more bytes can be written.
    #[error("stream {0} is destroyed")]
    StreamDestroyed(crate::ConnectionId),

    /// The connection failed while bytes were being read.
    #[error("connection lost: {0}")]
    ConnectionLost(#[source] std::io::Error),

    /// uTP streams have no idle timeout of their own.
    #[error("stream timeouts are not supported")]
    TimeoutUnsupported,

    /// Binding a UDP socket failed.
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),

    /// Sending a datagram failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// An engine entry point failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// An address could not be parsed or encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The transport was shut down.
    #[error("transport shut down")]
    Shutdown,
}
