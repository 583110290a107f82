//! The [`Engine`] trait: typed entry points into the transport engine.

use std::ffi::c_int;

use peerlink_protocol::EndpointAddress;

use crate::ffi;
use crate::{ContextHandle, EngineError, SocketHandle};

/// Tunables settable through `utp_context_set_option` / `utp_setsockopt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOption {
    /// Route normal engine logging to the `log` callback (0/1).
    LogNormal,
    /// Route MTU-discovery logging to the `log` callback (0/1).
    LogMtu,
    /// Route debug logging to the `log` callback (0/1).
    LogDebug,
    /// Send buffer size in bytes.
    SendBuffer,
    /// Receive buffer size in bytes.
    RecvBuffer,
    /// LEDBAT target delay in microseconds.
    TargetDelay,
}

impl EngineOption {
    pub fn raw(self) -> c_int {
        match self {
            Self::LogNormal => ffi::UTP_LOG_NORMAL,
            Self::LogMtu => ffi::UTP_LOG_MTU,
            Self::LogDebug => ffi::UTP_LOG_DEBUG,
            Self::SendBuffer => ffi::UTP_SNDBUF,
            Self::RecvBuffer => ffi::UTP_RCVBUF,
            Self::TargetDelay => ffi::UTP_TARGET_DELAY,
        }
    }
}

/// Which direction(s) `utp_shutdown` closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Read,
    Write,
    Both,
}

impl Shutdown {
    pub fn raw(self) -> c_int {
        match self {
            Self::Read => ffi::SHUT_RD,
            Self::Write => ffi::SHUT_WR,
            Self::Both => ffi::SHUT_RDWR,
        }
    }
}

/// Entry points of a uTP engine.
///
/// Calls may synchronously invoke callbacks (through
/// [`dispatch`](crate::dispatch)) before they return. Implementations are
/// not re-entrant across threads: callers must serialize access, while
/// nested calls made from inside a callback on the same thread are allowed.
///
/// `init` registers a [`Context`](crate::Context) wrapper and `destroy`
/// releases it (with all of its sockets); socket entry points on a handle
/// that is no longer live fail with [`EngineError::UnknownSocket`] or are
/// skipped, never forwarded to freed memory.
pub trait Engine: Send + Sync + 'static {
    /// Creates a context with every callback slot wired to the trampolines.
    fn init(&self) -> Result<ContextHandle, EngineError>;

    /// Destroys a context. A second call for the same handle is an error.
    fn destroy(&self, context: ContextHandle) -> Result<(), EngineError>;

    fn set_context_option(
        &self,
        context: ContextHandle,
        option: EngineOption,
        value: i32,
    ) -> Result<(), EngineError>;

    /// Creates an unconnected outbound socket.
    fn create_socket(&self, context: ContextHandle) -> Result<SocketHandle, EngineError>;

    fn set_socket_option(
        &self,
        socket: SocketHandle,
        option: EngineOption,
        value: i32,
    ) -> Result<(), EngineError>;

    /// Starts connecting. Completion arrives as a `Connect` state change.
    fn connect(&self, socket: SocketHandle, peer: &EndpointAddress) -> Result<(), EngineError>;

    /// Queues bytes; returns how many were accepted (0 when the window is full).
    fn write(&self, socket: SocketHandle, data: &[u8]) -> Result<usize, EngineError>;

    fn shutdown(&self, socket: SocketHandle, how: Shutdown);

    /// Starts closing. The engine reports `Destroying` once it is done.
    fn close(&self, socket: SocketHandle);

    /// Tells the engine the application consumed everything it was handed.
    fn read_drained(&self, socket: SocketHandle);

    /// Feeds one received datagram; `true` if the engine recognized it.
    fn process_udp(&self, context: ContextHandle, data: &[u8], from: &EndpointAddress) -> bool;

    /// Retransmits, times out, and otherwise advances timers.
    fn check_timeouts(&self, context: ContextHandle);

    /// Sends acknowledgements deferred while processing datagrams.
    fn issue_deferred_acks(&self, context: ContextHandle);
}
