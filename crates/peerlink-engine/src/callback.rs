//! Typed view of engine callbacks.
//!
//! The engine hands every callback a single [`RawCallbackArgs`] block. The
//! common header is read the same way for all of them; the tail is a C union
//! whose live member depends on the callback kind. [`CallbackKind::tail`]
//! picks the accessor, and [`Callback::decode`] turns the block into an enum
//! the rest of the crate can match on without touching raw memory.

use std::borrow::Cow;
use std::ffi::c_int;
use std::fmt;

use peerlink_protocol::{EndpointAddress, ProtocolError};

use crate::ffi::{self, RawCallbackArgs};
use crate::SocketHandle;

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Callback slots the binding installs a trampoline for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Firewall,
    Accept,
    Error,
    Read,
    StateChange,
    GetReadBufferSize,
    Log,
    SendTo,
}

/// Which union member of the argument tail a callback kind uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailField {
    /// `address` + `address_len`.
    Address,
    /// `error_code`.
    ErrorCode,
    /// `state`.
    State,
    /// The tail is not meaningful.
    Unused,
}

impl CallbackKind {
    /// Every slot, in installation order.
    pub const ALL: [CallbackKind; 8] = [
        Self::Firewall,
        Self::Accept,
        Self::Error,
        Self::Read,
        Self::StateChange,
        Self::GetReadBufferSize,
        Self::Log,
        Self::SendTo,
    ];

    /// The engine's callback slot number.
    pub fn slot(self) -> c_int {
        match self {
            Self::Firewall => ffi::UTP_ON_FIREWALL,
            Self::Accept => ffi::UTP_ON_ACCEPT,
            Self::Error => ffi::UTP_ON_ERROR,
            Self::Read => ffi::UTP_ON_READ,
            Self::StateChange => ffi::UTP_ON_STATE_CHANGE,
            Self::GetReadBufferSize => ffi::UTP_GET_READ_BUFFER_SIZE,
            Self::Log => ffi::UTP_LOG,
            Self::SendTo => ffi::UTP_SENDTO,
        }
    }

    pub fn tail(self) -> TailField {
        match self {
            Self::Firewall | Self::Accept | Self::SendTo => TailField::Address,
            Self::Error => TailField::ErrorCode,
            Self::StateChange => TailField::State,
            Self::Read | Self::GetReadBufferSize | Self::Log => TailField::Unused,
        }
    }

    /// Whether the callback concerns a specific socket.
    pub fn has_socket(self) -> bool {
        !matches!(self, Self::Firewall)
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Firewall => "on_firewall",
            Self::Accept => "on_accept",
            Self::Error => "on_error",
            Self::Read => "on_read",
            Self::StateChange => "on_state_change",
            Self::GetReadBufferSize => "get_read_buffer_size",
            Self::Log => "log",
            Self::SendTo => "sendto",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// States and error codes
// ---------------------------------------------------------------------------

/// Socket lifecycle notifications from `on_state_change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Outbound connection completed (also implies writable).
    Connect,
    /// The send window opened up again.
    Writable,
    /// The peer finished sending.
    Eof,
    /// The socket is about to be freed; its handle is invalid afterwards.
    Destroying,
}

impl SocketState {
    pub fn from_raw(raw: c_int) -> Option<Self> {
        match raw {
            ffi::UTP_STATE_CONNECT => Some(Self::Connect),
            ffi::UTP_STATE_WRITABLE => Some(Self::Writable),
            ffi::UTP_STATE_EOF => Some(Self::Eof),
            ffi::UTP_STATE_DESTROYING => Some(Self::Destroying),
            _ => None,
        }
    }

    pub fn raw(self) -> c_int {
        match self {
            Self::Connect => ffi::UTP_STATE_CONNECT,
            Self::Writable => ffi::UTP_STATE_WRITABLE,
            Self::Eof => ffi::UTP_STATE_EOF,
            Self::Destroying => ffi::UTP_STATE_DESTROYING,
        }
    }
}

/// Connection failures reported through `on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ConnectionRefused,
    ConnectionReset,
    TimedOut,
    /// A code this binding does not know about.
    Unknown(c_int),
}

impl ErrorCode {
    pub fn from_raw(raw: c_int) -> Self {
        match raw {
            ffi::UTP_ECONNREFUSED => Self::ConnectionRefused,
            ffi::UTP_ECONNRESET => Self::ConnectionReset,
            ffi::UTP_ETIMEDOUT => Self::TimedOut,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(self) -> c_int {
        match self {
            Self::ConnectionRefused => ffi::UTP_ECONNREFUSED,
            Self::ConnectionReset => ffi::UTP_ECONNRESET,
            Self::TimedOut => ffi::UTP_ETIMEDOUT,
            Self::Unknown(raw) => raw,
        }
    }

    /// The matching `std::io::ErrorKind`.
    pub fn io_kind(self) -> std::io::ErrorKind {
        match self {
            Self::ConnectionRefused => std::io::ErrorKind::ConnectionRefused,
            Self::ConnectionReset => std::io::ErrorKind::ConnectionReset,
            Self::TimedOut => std::io::ErrorKind::TimedOut,
            Self::Unknown(_) => std::io::ErrorKind::Other,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionRefused => f.write_str("connection refused"),
            Self::ConnectionReset => f.write_str("connection reset by peer"),
            Self::TimedOut => f.write_str("connection timed out"),
            Self::Unknown(code) => write!(f, "unknown uTP error {code}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoded callbacks
// ---------------------------------------------------------------------------

/// One decoded engine callback.
///
/// Borrowed data (`data`, `message`) points into engine-owned memory and is
/// only valid for the duration of the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback<'a> {
    Firewall {
        address: EndpointAddress,
    },
    Accept {
        socket: SocketHandle,
        address: EndpointAddress,
    },
    Error {
        socket: SocketHandle,
        code: ErrorCode,
    },
    Read {
        socket: SocketHandle,
        data: &'a [u8],
    },
    StateChange {
        socket: SocketHandle,
        state: SocketState,
    },
    GetReadBufferSize {
        socket: SocketHandle,
    },
    Log {
        socket: Option<SocketHandle>,
        message: Cow<'a, str>,
    },
    SendTo {
        socket: Option<SocketHandle>,
        data: &'a [u8],
        address: EndpointAddress,
        flags: u32,
    },
}

impl Callback<'_> {
    pub fn kind(&self) -> CallbackKind {
        match self {
            Self::Firewall { .. } => CallbackKind::Firewall,
            Self::Accept { .. } => CallbackKind::Accept,
            Self::Error { .. } => CallbackKind::Error,
            Self::Read { .. } => CallbackKind::Read,
            Self::StateChange { .. } => CallbackKind::StateChange,
            Self::GetReadBufferSize { .. } => CallbackKind::GetReadBufferSize,
            Self::Log { .. } => CallbackKind::Log,
            Self::SendTo { .. } => CallbackKind::SendTo,
        }
    }
}

/// Why an argument block could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{0} callback without a socket")]
    MissingSocket(CallbackKind),
    #[error("{0} callback without an address")]
    MissingAddress(CallbackKind),
    #[error("unknown socket state {0}")]
    UnknownState(c_int),
    #[error("{0} callback argument tail holds the wrong member")]
    TailMismatch(CallbackKind),
    #[error(transparent)]
    Address(#[from] ProtocolError),
}

/// Value of the argument tail, read through the member `kind` selects.
enum TailValue<'a> {
    Address(Option<&'a [u8]>),
    ErrorCode(c_int),
    State(c_int),
    Unused,
}

impl TailValue<'_> {
    fn error_code(&self, kind: CallbackKind) -> Result<c_int, DecodeError> {
        match self {
            Self::ErrorCode(code) => Ok(*code),
            _ => Err(DecodeError::TailMismatch(kind)),
        }
    }

    fn state(&self, kind: CallbackKind) -> Result<c_int, DecodeError> {
        match self {
            Self::State(raw) => Ok(*raw),
            _ => Err(DecodeError::TailMismatch(kind)),
        }
    }
}

impl RawCallbackArgs {
    /// The `buf`/`len` pair as a slice (empty when `buf` is null).
    ///
    /// # Safety
    /// `buf` must point at `len` readable bytes that outlive `'a`.
    unsafe fn buffer<'a>(&'a self) -> &'a [u8] {
        if self.buf.is_null() || self.len == 0 {
            &[]
        } else {
            // SAFETY: guaranteed by the caller.
            unsafe { std::slice::from_raw_parts(self.buf, self.len) }
        }
    }

    /// Reads the union tail through the member `kind` says is live.
    ///
    /// # Safety
    /// The block must come from the engine for a callback of `kind`.
    unsafe fn tail_value<'a>(&'a self, kind: CallbackKind) -> TailValue<'a> {
        // SAFETY: the engine writes the member that matches the callback
        // kind; the other members are never read.
        unsafe {
            match kind.tail() {
                TailField::Address => {
                    let ptr = self.tail.address;
                    let len = self.tail2.address_len as usize;
                    if ptr.is_null() || len == 0 {
                        TailValue::Address(None)
                    } else {
                        TailValue::Address(Some(std::slice::from_raw_parts(ptr.cast::<u8>(), len)))
                    }
                }
                TailField::ErrorCode => TailValue::ErrorCode(self.tail.error_code),
                TailField::State => TailValue::State(self.tail.state),
                TailField::Unused => TailValue::Unused,
            }
        }
    }
}

impl<'a> Callback<'a> {
    /// Decodes a raw argument block for a callback of `kind`.
    ///
    /// # Safety
    /// `args` must be a block the engine passed to the `kind` callback, and
    /// the returned value must not outlive that callback.
    pub unsafe fn decode(
        kind: CallbackKind,
        args: &'a RawCallbackArgs,
    ) -> Result<Self, DecodeError> {
        let socket = SocketHandle::from_ptr(args.socket);
        let require_socket = || socket.ok_or(DecodeError::MissingSocket(kind));

        // SAFETY: forwarded from the caller.
        let (buffer, tail) = unsafe { (args.buffer(), args.tail_value(kind)) };

        let address = |tail: &TailValue<'_>| -> Result<EndpointAddress, DecodeError> {
            match tail {
                TailValue::Address(Some(bytes)) => Ok(EndpointAddress::decode(bytes)?),
                _ => Err(DecodeError::MissingAddress(kind)),
            }
        };

        let callback = match kind {
            CallbackKind::Firewall => Self::Firewall {
                address: address(&tail)?,
            },
            CallbackKind::Accept => Self::Accept {
                socket: require_socket()?,
                address: address(&tail)?,
            },
            CallbackKind::Error => Self::Error {
                socket: require_socket()?,
                code: ErrorCode::from_raw(tail.error_code(kind)?),
            },
            CallbackKind::Read => Self::Read {
                socket: require_socket()?,
                data: buffer,
            },
            CallbackKind::StateChange => {
                let raw = tail.state(kind)?;
                Self::StateChange {
                    socket: require_socket()?,
                    state: SocketState::from_raw(raw).ok_or(DecodeError::UnknownState(raw))?,
                }
            }
            CallbackKind::GetReadBufferSize => Self::GetReadBufferSize {
                socket: require_socket()?,
            },
            CallbackKind::Log => {
                // The engine passes a NUL-terminated string and len 0.
                let message = if args.buf.is_null() {
                    Cow::Borrowed("")
                } else {
                    // SAFETY: log buffers are NUL-terminated C strings.
                    let cstr = unsafe { std::ffi::CStr::from_ptr(args.buf.cast()) };
                    cstr.to_string_lossy()
                };
                Self::Log { socket, message }
            }
            CallbackKind::SendTo => Self::SendTo {
                socket,
                data: buffer,
                address: address(&tail)?,
                flags: args.flags,
            },
        };
        Ok(callback)
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::c_void;
    use std::ptr;

    use super::*;
    use crate::ffi::{RawArgsTail, RawArgsTail2, RawSocket};

    fn blank(kind: CallbackKind) -> RawCallbackArgs {
        RawCallbackArgs {
            context: ptr::null_mut(),
            socket: ptr::null_mut(),
            len: 0,
            flags: 0,
            callback_type: kind.slot(),
            buf: ptr::null(),
            tail: RawArgsTail { address: ptr::null() },
            tail2: RawArgsTail2 { address_len: 0 },
        }
    }

    fn fake_socket(slot: &mut u64) -> *mut RawSocket {
        (slot as *mut u64).cast()
    }

    #[test]
    fn test_wrong_tail_member_is_a_decode_error() {
        assert_eq!(
            TailValue::Unused.state(CallbackKind::StateChange),
            Err(DecodeError::TailMismatch(CallbackKind::StateChange))
        );
        assert_eq!(
            TailValue::State(2).error_code(CallbackKind::Error),
            Err(DecodeError::TailMismatch(CallbackKind::Error))
        );
        assert_eq!(TailValue::ErrorCode(7).error_code(CallbackKind::Error), Ok(7));
    }

    #[test]
    fn test_decode_state_change_reads_state_member() {
        let mut slot = 0u64;
        let mut args = blank(CallbackKind::StateChange);
        args.socket = fake_socket(&mut slot);
        args.tail = RawArgsTail {
            state: ffi::UTP_STATE_EOF,
        };
        let cb = unsafe { Callback::decode(CallbackKind::StateChange, &args) }.unwrap();
        assert!(matches!(
            cb,
            Callback::StateChange {
                state: SocketState::Eof,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_unknown_state_fails() {
        let mut slot = 0u64;
        let mut args = blank(CallbackKind::StateChange);
        args.socket = fake_socket(&mut slot);
        args.tail = RawArgsTail { state: 42 };
        let err = unsafe { Callback::decode(CallbackKind::StateChange, &args) }.unwrap_err();
        assert_eq!(err, DecodeError::UnknownState(42));
    }

    #[test]
    fn test_decode_accept_reads_address_member() {
        let mut slot = 0u64;
        let peer = EndpointAddress::parse("10.1.2.3", 4000).unwrap();
        let mut args = blank(CallbackKind::Accept);
        args.socket = fake_socket(&mut slot);
        args.tail = RawArgsTail {
            address: peer.encode().as_ptr().cast::<c_void>(),
        };
        args.tail2 = RawArgsTail2 {
            address_len: peer.encode().len() as u32,
        };
        let cb = unsafe { Callback::decode(CallbackKind::Accept, &args) }.unwrap();
        match cb {
            Callback::Accept { address, .. } => assert_eq!(address, peer),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_read_without_socket_fails() {
        let data = b"abc";
        let mut args = blank(CallbackKind::Read);
        args.buf = data.as_ptr();
        args.len = data.len();
        let err = unsafe { Callback::decode(CallbackKind::Read, &args) }.unwrap_err();
        assert_eq!(err, DecodeError::MissingSocket(CallbackKind::Read));
    }

    #[test]
    fn test_decode_sendto_carries_flags_and_payload() {
        let dest = EndpointAddress::parse("192.0.2.1", 6000).unwrap();
        let payload = [0x41u8; 20];
        let mut args = blank(CallbackKind::SendTo);
        args.buf = payload.as_ptr();
        args.len = payload.len();
        args.flags = ffi::UTP_UDP_DONTFRAG;
        args.tail = RawArgsTail {
            address: dest.encode().as_ptr().cast(),
        };
        args.tail2 = RawArgsTail2 {
            address_len: dest.encode().len() as u32,
        };
        let cb = unsafe { Callback::decode(CallbackKind::SendTo, &args) }.unwrap();
        assert_eq!(
            cb,
            Callback::SendTo {
                socket: None,
                data: &payload,
                address: dest,
                flags: ffi::UTP_UDP_DONTFRAG,
            }
        );
    }

    #[test]
    fn test_decode_log_reads_c_string() {
        let text = c"hello engine";
        let mut args = blank(CallbackKind::Log);
        args.buf = text.as_ptr().cast();
        let cb = unsafe { Callback::decode(CallbackKind::Log, &args) }.unwrap();
        assert_eq!(
            cb,
            Callback::Log {
                socket: None,
                message: Cow::Borrowed("hello engine"),
            }
        );
    }

    #[test]
    fn test_error_code_messages() {
        assert_eq!(ErrorCode::from_raw(0).to_string(), "connection refused");
        assert_eq!(ErrorCode::from_raw(2), ErrorCode::TimedOut);
        assert_eq!(ErrorCode::from_raw(9), ErrorCode::Unknown(9));
    }

    #[test]
    fn test_every_kind_has_distinct_slot() {
        let mut slots: Vec<_> = CallbackKind::ALL.iter().map(|k| k.slot()).collect();
        slots.sort();
        slots.dedup();
        assert_eq!(slots.len(), CallbackKind::ALL.len());
    }
}
