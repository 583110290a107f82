//! The real engine: libutp loaded at runtime through `libloading`.
//!
//! The library is opened at most once per process. Whatever happens on the
//! first attempt, success or failure, is cached and returned to every later
//! caller; a missing library is never retried.

use std::ffi::{OsStr, OsString, c_void};
use std::sync::OnceLock;

use libloading::Library;
use peerlink_protocol::EndpointAddress;

use crate::callback::CallbackKind;
use crate::dispatch::trampoline_for;
use crate::engine::{Engine, EngineOption, Shutdown};
use crate::ffi::{self, UTP_API_VERSION};
use crate::registry::{Context, NativeSocket};
use crate::{ContextHandle, EngineError, SocketHandle};

/// Environment variable that overrides the library path.
pub const LIBRARY_ENV: &str = "PEERLINK_UTP_LIBRARY";

/// File name of the engine library on this platform.
#[cfg(target_os = "windows")]
pub const DEFAULT_LIBRARY: &str = "utp.dll";
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub const DEFAULT_LIBRARY: &str = "libutp.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "ios")))]
pub const DEFAULT_LIBRARY: &str = "libutp.so";

static LIBRARY: OnceLock<Result<NativeLibrary, EngineError>> = OnceLock::new();

/// Resolved entry points. The `Library` is kept alive alongside them.
pub struct NativeLibrary {
    _library: Library,
    path: OsString,
    init: ffi::UtpInit,
    destroy: ffi::UtpDestroy,
    set_callback: ffi::UtpSetCallback,
    context_set_option: ffi::UtpContextSetOption,
    process_udp: ffi::UtpProcessUdp,
    check_timeouts: ffi::UtpCheckTimeouts,
    issue_deferred_acks: ffi::UtpIssueDeferredAcks,
    create_socket: ffi::UtpCreateSocket,
    setsockopt: ffi::UtpSetSockOpt,
    connect: ffi::UtpConnect,
    write: ffi::UtpWrite,
    read_drained: ffi::UtpReadDrained,
    shutdown: ffi::UtpShutdown,
    close: ffi::UtpClose,
}

/// The path used when none is given: `$PEERLINK_UTP_LIBRARY` or [`DEFAULT_LIBRARY`].
pub fn default_library_path() -> OsString {
    std::env::var_os(LIBRARY_ENV).unwrap_or_else(|| OsString::from(DEFAULT_LIBRARY))
}

impl NativeLibrary {
    /// Loads the library from [`default_library_path`].
    pub fn load() -> Result<&'static NativeLibrary, EngineError> {
        Self::load_from(default_library_path())
    }

    /// Loads the library from `path` unless a load was already attempted,
    /// in which case the cached outcome is returned and `path` is ignored.
    pub fn load_from(path: impl AsRef<OsStr>) -> Result<&'static NativeLibrary, EngineError> {
        LIBRARY
            .get_or_init(|| {
                let path = path.as_ref();
                let result = Self::open(path);
                match &result {
                    Ok(_) => tracing::info!(path = %path.to_string_lossy(), "loaded uTP library"),
                    Err(e) => tracing::error!(path = %path.to_string_lossy(), error = %e, "uTP library unavailable"),
                }
                result
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    fn open(path: &OsStr) -> Result<Self, EngineError> {
        // SAFETY: loading libutp runs no initializers with preconditions.
        let library = unsafe { Library::new(path) }.map_err(|e| EngineError::Load(e.to_string()))?;

        Ok(Self {
            path: path.to_os_string(),
            init: unsafe { symbol(&library, "utp_init")? },
            destroy: unsafe { symbol(&library, "utp_destroy")? },
            set_callback: unsafe { symbol(&library, "utp_set_callback")? },
            context_set_option: unsafe { symbol(&library, "utp_context_set_option")? },
            process_udp: unsafe { symbol(&library, "utp_process_udp")? },
            check_timeouts: unsafe { symbol(&library, "utp_check_timeouts")? },
            issue_deferred_acks: unsafe { symbol(&library, "utp_issue_deferred_acks")? },
            create_socket: unsafe { symbol(&library, "utp_create_socket")? },
            setsockopt: unsafe { symbol(&library, "utp_setsockopt")? },
            connect: unsafe { symbol(&library, "utp_connect")? },
            write: unsafe { symbol(&library, "utp_write")? },
            read_drained: unsafe { symbol(&library, "utp_read_drained")? },
            shutdown: unsafe { symbol(&library, "utp_shutdown")? },
            close: unsafe { symbol(&library, "utp_close")? },
            _library: library,
        })
    }

    /// Where the library was loaded from.
    pub fn path(&self) -> &OsStr {
        &self.path
    }
}

/// Looks up one entry point and copies the function pointer out.
///
/// # Safety
/// `T` must be the exact function pointer type of the symbol.
unsafe fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T, EngineError> {
    let mut cname = name.as_bytes().to_vec();
    cname.push(0);
    // SAFETY: forwarded from the caller.
    unsafe { library.get::<T>(&cname) }
        .map(|sym| *sym)
        .map_err(|e| EngineError::Load(format!("{name}: {e}")))
}

// ---------------------------------------------------------------------------
// NativeEngine
// ---------------------------------------------------------------------------

/// [`Engine`] backed by the loaded native library.
#[derive(Clone, Copy)]
pub struct NativeEngine {
    lib: &'static NativeLibrary,
}

impl NativeEngine {
    /// Loads (or reuses) the process-wide library from the default path.
    pub fn load() -> Result<Self, EngineError> {
        Ok(Self {
            lib: NativeLibrary::load()?,
        })
    }

    /// Loads (or reuses) the process-wide library from `path`.
    pub fn load_from(path: impl AsRef<OsStr>) -> Result<Self, EngineError> {
        Ok(Self {
            lib: NativeLibrary::load_from(path)?,
        })
    }

    pub fn library(&self) -> &'static NativeLibrary {
        self.lib
    }

    fn live_socket(&self, socket: SocketHandle) -> Result<*mut ffi::RawSocket, EngineError> {
        if NativeSocket::is_live(socket) {
            Ok(socket.as_ptr())
        } else {
            Err(EngineError::UnknownSocket(socket))
        }
    }

    fn live_context(&self, context: ContextHandle) -> Result<*mut ffi::RawContext, EngineError> {
        if Context::lookup(context).is_some() {
            Ok(context.as_ptr())
        } else {
            Err(EngineError::ContextDestroyed(context))
        }
    }
}

impl std::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEngine")
            .field("path", &self.lib.path)
            .finish()
    }
}

impl Engine for NativeEngine {
    fn init(&self) -> Result<ContextHandle, EngineError> {
        // SAFETY: utp_init has no preconditions.
        let raw = unsafe { (self.lib.init)(UTP_API_VERSION) };
        let handle = ContextHandle::from_ptr(raw).ok_or(EngineError::InitFailed)?;
        for kind in CallbackKind::ALL {
            // SAFETY: `raw` is a live context; the trampoline matches the slot.
            unsafe { (self.lib.set_callback)(raw, kind.slot(), Some(trampoline_for(kind))) };
        }
        Context::resolve(handle);
        tracing::debug!(context = %handle, "engine context created");
        Ok(handle)
    }

    fn destroy(&self, context: ContextHandle) -> Result<(), EngineError> {
        let raw = self.live_context(context)?;
        // SAFETY: the context is registered, so it has not been destroyed.
        unsafe { (self.lib.destroy)(raw) };
        Context::release(context);
        tracing::debug!(%context, "engine context destroyed");
        Ok(())
    }

    fn set_context_option(
        &self,
        context: ContextHandle,
        option: EngineOption,
        value: i32,
    ) -> Result<(), EngineError> {
        let raw = self.live_context(context)?;
        // SAFETY: live context.
        let code = unsafe { (self.lib.context_set_option)(raw, option.raw(), value) };
        if code < 0 {
            return Err(EngineError::CallFailed {
                call: "utp_context_set_option",
                code: code.into(),
            });
        }
        Ok(())
    }

    fn create_socket(&self, context: ContextHandle) -> Result<SocketHandle, EngineError> {
        let raw = self.live_context(context)?;
        // SAFETY: live context.
        let socket = unsafe { (self.lib.create_socket)(raw) };
        let handle = SocketHandle::from_ptr(socket).ok_or(EngineError::CallFailed {
            call: "utp_create_socket",
            code: 0,
        })?;
        NativeSocket::resolve(handle, context);
        Ok(handle)
    }

    fn set_socket_option(
        &self,
        socket: SocketHandle,
        option: EngineOption,
        value: i32,
    ) -> Result<(), EngineError> {
        let raw = self.live_socket(socket)?;
        // SAFETY: live socket.
        let code = unsafe { (self.lib.setsockopt)(raw, option.raw(), value) };
        if code < 0 {
            return Err(EngineError::CallFailed {
                call: "utp_setsockopt",
                code: code.into(),
            });
        }
        Ok(())
    }

    fn connect(&self, socket: SocketHandle, peer: &EndpointAddress) -> Result<(), EngineError> {
        let raw = self.live_socket(socket)?;
        let addr = peer.encode();
        // SAFETY: live socket; `addr` is a sockaddr of the stated length.
        let code = unsafe { (self.lib.connect)(raw, addr.as_ptr().cast::<c_void>(), addr.len() as u32) };
        if code < 0 {
            return Err(EngineError::CallFailed {
                call: "utp_connect",
                code: code.into(),
            });
        }
        Ok(())
    }

    fn write(&self, socket: SocketHandle, data: &[u8]) -> Result<usize, EngineError> {
        let raw = self.live_socket(socket)?;
        // SAFETY: live socket. utp_write takes a non-const pointer but only reads.
        let written = unsafe { (self.lib.write)(raw, data.as_ptr().cast_mut().cast::<c_void>(), data.len()) };
        usize::try_from(written).map_err(|_| EngineError::CallFailed {
            call: "utp_write",
            code: written as i64,
        })
    }

    fn shutdown(&self, socket: SocketHandle, how: Shutdown) {
        match self.live_socket(socket) {
            // SAFETY: live socket.
            Ok(raw) => unsafe { (self.lib.shutdown)(raw, how.raw()) },
            Err(e) => tracing::debug!(%socket, error = %e, "skipping shutdown"),
        }
    }

    fn close(&self, socket: SocketHandle) {
        match self.live_socket(socket) {
            // SAFETY: live socket.
            Ok(raw) => unsafe { (self.lib.close)(raw) },
            Err(e) => tracing::debug!(%socket, error = %e, "skipping close"),
        }
    }

    fn read_drained(&self, socket: SocketHandle) {
        match self.live_socket(socket) {
            // SAFETY: live socket.
            Ok(raw) => unsafe { (self.lib.read_drained)(raw) },
            Err(e) => tracing::trace!(%socket, error = %e, "skipping read_drained"),
        }
    }

    fn process_udp(&self, context: ContextHandle, data: &[u8], from: &EndpointAddress) -> bool {
        let Ok(raw) = self.live_context(context) else {
            return false;
        };
        let addr = from.encode();
        // SAFETY: live context; both buffers are valid for the call.
        let handled = unsafe {
            (self.lib.process_udp)(
                raw,
                data.as_ptr(),
                data.len(),
                addr.as_ptr().cast::<c_void>(),
                addr.len() as u32,
            )
        };
        handled != 0
    }

    fn check_timeouts(&self, context: ContextHandle) {
        if let Ok(raw) = self.live_context(context) {
            // SAFETY: live context.
            unsafe { (self.lib.check_timeouts)(raw) };
        }
    }

    fn issue_deferred_acks(&self, context: ContextHandle) {
        if let Ok(raw) = self.live_context(context) {
            // SAFETY: live context.
            unsafe { (self.lib.issue_deferred_acks)(raw) };
        }
    }
}
