//! Raw ABI of the native uTP engine (libutp, `utp.h`).
//!
//! Everything here must match the loaded library exactly: callback slot
//! numbers, state and error codes, option ids, and the layout of
//! `utp_callback_arguments`. The layout is asserted at compile time for the
//! target's pointer width.

use std::ffi::{c_int, c_void};
use std::mem::{offset_of, size_of};

/// Version argument passed to `utp_init`.
pub const UTP_API_VERSION: c_int = 2;

/// Value returned from a callback when nothing needs to be reported.
pub const NEUTRAL: u64 = 0;

/// Flag on `sendto` callbacks asking for the don't-fragment bit.
pub const UTP_UDP_DONTFRAG: u32 = 2;

// ---------------------------------------------------------------------------
// Opaque objects
// ---------------------------------------------------------------------------

/// `struct utp_context`.
#[repr(C)]
pub struct RawContext {
    _private: [u8; 0],
}

/// `struct utp_socket`.
#[repr(C)]
pub struct RawSocket {
    _private: [u8; 0],
}

// ---------------------------------------------------------------------------
// Callback slots and option ids (one shared enum in utp.h)
// ---------------------------------------------------------------------------

pub const UTP_ON_FIREWALL: c_int = 0;
pub const UTP_ON_ACCEPT: c_int = 1;
pub const UTP_ON_CONNECT: c_int = 2;
pub const UTP_ON_ERROR: c_int = 3;
pub const UTP_ON_READ: c_int = 4;
pub const UTP_ON_OVERHEAD_STATISTICS: c_int = 5;
pub const UTP_ON_STATE_CHANGE: c_int = 6;
pub const UTP_GET_READ_BUFFER_SIZE: c_int = 7;
pub const UTP_ON_DELAY_SAMPLE: c_int = 8;
pub const UTP_GET_UDP_MTU: c_int = 9;
pub const UTP_GET_UDP_OVERHEAD: c_int = 10;
pub const UTP_GET_MILLISECONDS: c_int = 11;
pub const UTP_GET_MICROSECONDS: c_int = 12;
pub const UTP_GET_RANDOM: c_int = 13;
pub const UTP_LOG: c_int = 14;
pub const UTP_SENDTO: c_int = 15;

pub const UTP_LOG_NORMAL: c_int = 16;
pub const UTP_LOG_MTU: c_int = 17;
pub const UTP_LOG_DEBUG: c_int = 18;
pub const UTP_SNDBUF: c_int = 19;
pub const UTP_RCVBUF: c_int = 20;
pub const UTP_TARGET_DELAY: c_int = 21;

// ---------------------------------------------------------------------------
// Socket states and error codes
// ---------------------------------------------------------------------------

pub const UTP_STATE_CONNECT: c_int = 1;
pub const UTP_STATE_WRITABLE: c_int = 2;
pub const UTP_STATE_EOF: c_int = 3;
pub const UTP_STATE_DESTROYING: c_int = 4;

pub const UTP_ECONNREFUSED: c_int = 0;
pub const UTP_ECONNRESET: c_int = 1;
pub const UTP_ETIMEDOUT: c_int = 2;

// `how` argument of utp_shutdown.
pub const SHUT_RD: c_int = 0;
pub const SHUT_WR: c_int = 1;
pub const SHUT_RDWR: c_int = 2;

// ---------------------------------------------------------------------------
// utp_callback_arguments
// ---------------------------------------------------------------------------

/// First tagged-union member: which field is live depends on the callback.
#[repr(C)]
#[derive(Clone, Copy)]
pub union RawArgsTail {
    /// `on_accept`, `on_firewall`, `sendto`.
    pub address: *const c_void,
    pub send: c_int,
    pub sample_ms: c_int,
    /// `on_error`.
    pub error_code: c_int,
    /// `on_state_change`.
    pub state: c_int,
}

/// Second tagged-union member.
#[repr(C)]
#[derive(Clone, Copy)]
pub union RawArgsTail2 {
    /// Paired with `address`. `socklen_t` is 32 bits on every supported target.
    pub address_len: u32,
    pub kind: c_int,
}

/// `utp_callback_arguments`: one block per callback invocation.
///
/// The header (`context` through `buf`) is common to every callback. The
/// two unions after it overlap and are only meaningful for specific
/// callback kinds; see [`CallbackKind::tail`](crate::CallbackKind::tail).
#[repr(C)]
pub struct RawCallbackArgs {
    pub context: *mut RawContext,
    pub socket: *mut RawSocket,
    pub len: usize,
    pub flags: u32,
    pub callback_type: c_int,
    pub buf: *const u8,
    pub tail: RawArgsTail,
    pub tail2: RawArgsTail2,
}

const PTR: usize = size_of::<*const c_void>();

const _: () = {
    assert!(offset_of!(RawCallbackArgs, context) == 0);
    assert!(offset_of!(RawCallbackArgs, socket) == PTR);
    assert!(offset_of!(RawCallbackArgs, len) == 2 * PTR);
    assert!(offset_of!(RawCallbackArgs, flags) == 3 * PTR);
    assert!(offset_of!(RawCallbackArgs, callback_type) == 3 * PTR + 4);
    assert!(offset_of!(RawCallbackArgs, buf) == 3 * PTR + 8);
    assert!(offset_of!(RawCallbackArgs, tail) == 4 * PTR + 8);
    assert!(offset_of!(RawCallbackArgs, tail2) == 5 * PTR + 8);
    assert!(size_of::<RawArgsTail>() == PTR);
};

/// `utp_callback_t`.
pub type RawCallback = unsafe extern "C" fn(*mut RawCallbackArgs) -> u64;

// ---------------------------------------------------------------------------
// Entry point signatures
// ---------------------------------------------------------------------------

pub type UtpInit = unsafe extern "C" fn(version: c_int) -> *mut RawContext;
pub type UtpDestroy = unsafe extern "C" fn(ctx: *mut RawContext);
pub type UtpSetCallback =
    unsafe extern "C" fn(ctx: *mut RawContext, name: c_int, proc_: Option<RawCallback>);
pub type UtpContextSetOption =
    unsafe extern "C" fn(ctx: *mut RawContext, opt: c_int, val: c_int) -> c_int;
pub type UtpProcessUdp = unsafe extern "C" fn(
    ctx: *mut RawContext,
    buf: *const u8,
    len: usize,
    to: *const c_void,
    tolen: u32,
) -> c_int;
pub type UtpCheckTimeouts = unsafe extern "C" fn(ctx: *mut RawContext);
pub type UtpIssueDeferredAcks = unsafe extern "C" fn(ctx: *mut RawContext);
pub type UtpCreateSocket = unsafe extern "C" fn(ctx: *mut RawContext) -> *mut RawSocket;
pub type UtpSetSockOpt = unsafe extern "C" fn(s: *mut RawSocket, opt: c_int, val: c_int) -> c_int;
pub type UtpConnect =
    unsafe extern "C" fn(s: *mut RawSocket, to: *const c_void, tolen: u32) -> c_int;
pub type UtpWrite = unsafe extern "C" fn(s: *mut RawSocket, buf: *mut c_void, count: usize) -> isize;
pub type UtpReadDrained = unsafe extern "C" fn(s: *mut RawSocket);
pub type UtpShutdown = unsafe extern "C" fn(s: *mut RawSocket, how: c_int);
pub type UtpClose = unsafe extern "C" fn(s: *mut RawSocket);
