//! Binding to the native uTP transport engine.
//!
//! The engine (libutp) is a C library driven entirely by callbacks: you feed
//! it datagrams and timer ticks, and it calls you back to deliver bytes,
//! report state changes, and ask you to send datagrams. This crate owns
//! every piece of that boundary:
//!
//! - **ABI** ([`ffi`]): constants and the `utp_callback_arguments` layout.
//! - **Loading** ([`NativeLibrary`], [`NativeEngine`]): the library is opened
//!   once per process with `libloading`.
//! - **Entry points** ([`Engine`]): typed wrappers around the C functions.
//! - **Callbacks** ([`Callback`], [`dispatch`]): one trampoline per slot
//!   decodes the argument block and routes it to a handler.
//! - **Identity** ([`Context`], [`NativeSocket`], [`Registry`]): each native
//!   pointer maps to exactly one long-lived wrapper.
//!
//! # Threading
//!
//! The engine is single-threaded. Callers serialize every [`Engine`] call;
//! callbacks run synchronously inside those calls and may re-enter the
//! engine on the same thread.
//!
//! # Feature Flags
//!
//! - `test-util`: [`testing::ScriptedEngine`], an in-memory engine for tests

mod callback;
mod dispatch;
mod engine;
mod error;
pub mod ffi;
mod handle;
mod native;
mod registry;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use callback::{Callback, CallbackKind, DecodeError, ErrorCode, SocketState, TailField};
pub use dispatch::dispatch;
pub use engine::{Engine, EngineOption, Shutdown};
pub use error::EngineError;
pub use handle::{ContextHandle, SocketHandle};
pub use native::{DEFAULT_LIBRARY, LIBRARY_ENV, NativeEngine, NativeLibrary, default_library_path};
pub use registry::{
    AcceptHandler, Context, ErrorHandler, FirewallHandler, LogHandler, NativeSocket,
    ReadBufferSizeHandler, ReadHandler, Registry, SendToHandler, StateChangeHandler,
};
