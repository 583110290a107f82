//! Callback dispatch and the `extern "C"` trampolines.
//!
//! The engine calls one trampoline per callback slot. A trampoline decodes
//! the argument block, then hands the typed [`Callback`] to [`dispatch`],
//! which resolves the wrapper through the registry and runs its handler.
//!
//! Nothing may unwind into the engine. Handler panics are caught here,
//! logged, and turned into [`NEUTRAL`].

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::callback::{Callback, CallbackKind};
use crate::ffi::{NEUTRAL, RawCallback, RawCallbackArgs};
use crate::registry::{Context, NativeSocket};
use crate::{ContextHandle, SocketHandle, SocketState};

/// Routes one decoded callback to its handler and returns the engine reply.
///
/// This is the single entry point for both the native trampolines and
/// in-process engines; handler panics never escape it.
pub fn dispatch(context: ContextHandle, callback: Callback<'_>) -> u64 {
    let kind = callback.kind();
    match catch_unwind(AssertUnwindSafe(|| route(context, callback))) {
        Ok(reply) => reply,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".into());
            tracing::error!(%context, %kind, %message, "callback handler panicked");
            NEUTRAL
        }
    }
}

fn route(context: ContextHandle, callback: Callback<'_>) -> u64 {
    match callback {
        Callback::Firewall { address } => {
            let Some(ctx) = Context::lookup(context) else {
                return NEUTRAL;
            };
            match ctx.firewall_handler() {
                Some(handler) => u64::from(handler(&address)),
                None => NEUTRAL,
            }
        }

        Callback::Accept { socket, address } => {
            let ctx = Context::resolve(context);
            let wrapper = NativeSocket::resolve(socket, context);
            if let Some(handler) = ctx.accept_handler() {
                handler(wrapper, address);
            } else {
                tracing::debug!(%context, %socket, %address, "accept with no handler installed");
            }
            NEUTRAL
        }

        Callback::Error { socket, code } => {
            let Some(wrapper) = known_socket(context, socket, "error") else {
                return NEUTRAL;
            };
            if let Some(handler) = wrapper.error_handler() {
                handler(code);
            }
            NEUTRAL
        }

        Callback::Read { socket, data } => {
            let Some(wrapper) = known_socket(context, socket, "read") else {
                return NEUTRAL;
            };
            if let Some(handler) = wrapper.read_handler() {
                handler(data);
            }
            NEUTRAL
        }

        Callback::StateChange { socket, state } => {
            let Some(wrapper) = known_socket(context, socket, "state change") else {
                return NEUTRAL;
            };
            if let Some(handler) = wrapper.state_change_handler() {
                handler(state);
            }
            if state == SocketState::Destroying {
                NativeSocket::release(socket);
                wrapper.clear_handlers();
                tracing::trace!(%context, %socket, "socket released");
            }
            NEUTRAL
        }

        Callback::GetReadBufferSize { socket } => {
            let Some(wrapper) = NativeSocket::lookup(socket) else {
                return NEUTRAL;
            };
            match wrapper.read_buffer_size_handler() {
                Some(handler) => handler() as u64,
                None => NEUTRAL,
            }
        }

        Callback::Log { socket, message } => {
            let handler = socket
                .and_then(NativeSocket::lookup)
                .and_then(|s| s.log_handler())
                .or_else(|| Context::lookup(context).and_then(|c| c.log_handler()));
            match handler {
                Some(handler) => handler(&message),
                None => tracing::debug!(target: "utp", %context, "{message}"),
            }
            NEUTRAL
        }

        Callback::SendTo {
            socket,
            data,
            address,
            flags,
        } => {
            let handler = socket
                .and_then(NativeSocket::lookup)
                .and_then(|s| s.sendto_handler())
                .or_else(|| Context::lookup(context).and_then(|c| c.sendto_handler()));
            match handler {
                Some(handler) => handler(socket, data, &address, flags),
                None => {
                    tracing::warn!(%context, %address, len = data.len(), "dropping datagram: no sendto handler")
                }
            }
            NEUTRAL
        }
    }
}

/// Sockets enter the registry through `create_socket` or accept. A
/// per-socket callback for any other handle (one already released by
/// DESTROYING, say) is dropped rather than registering it again.
fn known_socket(
    context: ContextHandle,
    socket: SocketHandle,
    what: &'static str,
) -> Option<std::sync::Arc<NativeSocket>> {
    let wrapper = NativeSocket::lookup(socket);
    if wrapper.is_none() {
        tracing::trace!(%context, %socket, callback = what, "callback for unknown socket dropped");
    }
    wrapper
}

// ---------------------------------------------------------------------------
// Trampolines
// ---------------------------------------------------------------------------

/// Shared body of every trampoline.
///
/// # Safety
/// `args` must be the argument block the engine passed for `kind`.
unsafe fn trampoline(kind: CallbackKind, args: *mut RawCallbackArgs) -> u64 {
    // SAFETY: the engine passes a valid block for the duration of the call.
    let Some(args) = (unsafe { args.as_ref() }) else {
        return NEUTRAL;
    };
    let Some(context) = ContextHandle::from_ptr(args.context) else {
        return NEUTRAL;
    };
    // SAFETY: `args` came from the engine for a `kind` callback and the
    // decoded value does not outlive this call.
    match unsafe { Callback::decode(kind, args) } {
        Ok(callback) => dispatch(context, callback),
        Err(e) => {
            tracing::warn!(%context, %kind, error = %e, "undecodable callback arguments");
            NEUTRAL
        }
    }
}

macro_rules! trampolines {
    ($($name:ident => $kind:ident),* $(,)?) => {
        $(
            unsafe extern "C" fn $name(args: *mut RawCallbackArgs) -> u64 {
                // SAFETY: only ever installed in the slot for this kind.
                unsafe { trampoline(CallbackKind::$kind, args) }
            }
        )*

        /// The trampoline for each callback slot.
        pub(crate) fn trampoline_for(kind: CallbackKind) -> RawCallback {
            match kind {
                $(CallbackKind::$kind => $name,)*
            }
        }
    };
}

trampolines! {
    on_firewall => Firewall,
    on_accept => Accept,
    on_error => Error,
    on_read => Read,
    on_state_change => StateChange,
    get_read_buffer_size => GetReadBufferSize,
    on_log => Log,
    on_sendto => SendTo,
}

#[cfg(test)]
mod tests {
    use std::ffi::c_void;
    use std::ptr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use peerlink_protocol::EndpointAddress;

    use super::*;
    use crate::ffi::{self, RawArgsTail, RawArgsTail2};

    fn ctx(n: usize) -> ContextHandle {
        ContextHandle::new(0xd15_0000 + n)
    }

    fn sock(n: usize) -> SocketHandle {
        SocketHandle::new(0xd15_1000 + n)
    }

    #[test]
    fn test_missing_handlers_return_neutral() {
        let c = ctx(1);
        Context::resolve(c);
        let reply = dispatch(
            c,
            Callback::Read {
                socket: sock(1),
                data: b"x",
            },
        );
        assert_eq!(reply, NEUTRAL);
        let addr = EndpointAddress::parse("1.2.3.4", 5).unwrap();
        assert_eq!(dispatch(c, Callback::Firewall { address: addr }), NEUTRAL);
        Context::release(c);
    }

    #[test]
    fn test_callbacks_for_released_socket_do_not_register_it() {
        let c = ctx(5);
        let s = NativeSocket::resolve(sock(5), c);
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reads);
        s.on_read(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        dispatch(
            c,
            Callback::StateChange {
                socket: sock(5),
                state: SocketState::Destroying,
            },
        );
        assert!(!NativeSocket::is_live(sock(5)));

        let late = [
            Callback::Read {
                socket: sock(5),
                data: b"late",
            },
            Callback::Error {
                socket: sock(5),
                code: crate::ErrorCode::ConnectionReset,
            },
            Callback::StateChange {
                socket: sock(5),
                state: SocketState::Writable,
            },
            Callback::StateChange {
                socket: sock(5),
                state: SocketState::Destroying,
            },
        ];
        for callback in late {
            assert_eq!(dispatch(c, callback), NEUTRAL);
            assert!(!NativeSocket::is_live(sock(5)));
        }
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_panic_becomes_neutral() {
        let c = ctx(2);
        let s = NativeSocket::resolve(sock(2), c);
        s.on_read(|_| panic!("boom"));
        let reply = dispatch(
            c,
            Callback::Read {
                socket: sock(2),
                data: b"payload",
            },
        );
        assert_eq!(reply, NEUTRAL);
        NativeSocket::release(sock(2));
    }

    #[test]
    fn test_firewall_reply_reflects_handler() {
        let c = ctx(3);
        Context::resolve(c).on_firewall(|addr| addr.port() == 666);
        let blocked = EndpointAddress::parse("1.1.1.1", 666).unwrap();
        let allowed = EndpointAddress::parse("1.1.1.1", 667).unwrap();
        assert_eq!(dispatch(c, Callback::Firewall { address: blocked }), 1);
        assert_eq!(dispatch(c, Callback::Firewall { address: allowed }), 0);
        Context::release(c);
    }

    #[test]
    fn test_destroying_releases_socket_after_handler() {
        let c = ctx(4);
        let seen = Arc::new(AtomicUsize::new(0));
        let s = NativeSocket::resolve(sock(4), c);
        let counter = Arc::clone(&seen);
        s.on_state_change(move |state| {
            assert_eq!(state, SocketState::Destroying);
            assert!(NativeSocket::is_live(sock(4)));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        dispatch(
            c,
            Callback::StateChange {
                socket: sock(4),
                state: SocketState::Destroying,
            },
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!NativeSocket::is_live(sock(4)));
    }

    #[test]
    fn test_trampoline_decodes_and_dispatches() {
        let mut ctx_slot = 0u64;
        let mut sock_slot = 0u64;
        let raw_ctx: *mut ffi::RawContext = (&mut ctx_slot as *mut u64).cast();
        let raw_sock: *mut ffi::RawSocket = (&mut sock_slot as *mut u64).cast();
        let c = ContextHandle::from_ptr(raw_ctx).unwrap();
        let s = SocketHandle::from_ptr(raw_sock).unwrap();

        let got = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        NativeSocket::resolve(s, c).on_read(move |data| sink.lock().extend_from_slice(data));

        let payload = b"hello";
        let mut args = RawCallbackArgs {
            context: raw_ctx,
            socket: raw_sock,
            len: payload.len(),
            flags: 0,
            callback_type: ffi::UTP_ON_READ,
            buf: payload.as_ptr(),
            tail: RawArgsTail {
                address: ptr::null::<c_void>(),
            },
            tail2: RawArgsTail2 { address_len: 0 },
        };
        let tramp = trampoline_for(CallbackKind::Read);
        let reply = unsafe { tramp(&mut args) };
        assert_eq!(reply, NEUTRAL);
        assert_eq!(got.lock().as_slice(), b"hello");
        Context::release(c);
    }

    #[test]
    fn test_trampoline_with_null_args_is_neutral() {
        let tramp = trampoline_for(CallbackKind::StateChange);
        assert_eq!(unsafe { tramp(ptr::null_mut()) }, NEUTRAL);
    }
}
