//! Handle registry: native handle → long-lived wrapper.
//!
//! The engine identifies objects only by pointer, and it calls back with
//! those pointers many times over an object's life. The registry makes sure
//! every callback for the same handle lands on the same [`Context`] or
//! [`NativeSocket`] instance.
//!
//! Entries are created lazily on first sight and dropped deterministically:
//! sockets when the engine reports `DESTROYING`, contexts when they are
//! destroyed (which also drops every socket they owned).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use peerlink_protocol::EndpointAddress;

use crate::{ContextHandle, ErrorCode, SocketHandle, SocketState};

/// A map from handle to shared wrapper.
///
/// The lock is only held for map operations, never while a handler runs,
/// so handlers may freely re-enter the registry.
pub struct Registry<H, W> {
    entries: Mutex<HashMap<H, Arc<W>>>,
}

impl<H: Copy + Eq + Hash, W> Registry<H, W> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the wrapper for `handle`, creating it with `make` if absent.
    pub fn resolve(&self, handle: H, make: impl FnOnce() -> W) -> Arc<W> {
        let mut entries = self.entries.lock();
        Arc::clone(entries.entry(handle).or_insert_with(|| Arc::new(make())))
    }

    pub fn get(&self, handle: H) -> Option<Arc<W>> {
        self.entries.lock().get(&handle).cloned()
    }

    /// Removes the entry, returning it if it was present.
    pub fn release(&self, handle: H) -> Option<Arc<W>> {
        self.entries.lock().remove(&handle)
    }

    /// Drops every entry for which `keep` returns false.
    pub fn retain(&self, mut keep: impl FnMut(&H, &W) -> bool) {
        self.entries.lock().retain(|h, w| keep(h, w));
    }

    pub fn contains(&self, handle: H) -> bool {
        self.entries.lock().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H: Copy + Eq + Hash, W> Default for Registry<H, W> {
    fn default() -> Self {
        Self::new()
    }
}

static CONTEXTS: LazyLock<Registry<ContextHandle, Context>> = LazyLock::new(Registry::new);
static SOCKETS: LazyLock<Registry<SocketHandle, NativeSocket>> = LazyLock::new(Registry::new);

// ---------------------------------------------------------------------------
// Handler types
// ---------------------------------------------------------------------------

/// New inbound connection: the socket wrapper and the peer's address.
pub type AcceptHandler = Arc<dyn Fn(Arc<NativeSocket>, EndpointAddress) + Send + Sync>;
/// Return `true` to reject a connection attempt from the address.
pub type FirewallHandler = Arc<dyn Fn(&EndpointAddress) -> bool + Send + Sync>;
/// Outbound datagram: originating socket (if any), payload, destination, flags.
pub type SendToHandler =
    Arc<dyn Fn(Option<SocketHandle>, &[u8], &EndpointAddress, u32) + Send + Sync>;
pub type LogHandler = Arc<dyn Fn(&str) + Send + Sync>;
pub type ReadHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type StateChangeHandler = Arc<dyn Fn(SocketState) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(ErrorCode) + Send + Sync>;
/// Bytes received but not yet consumed; the engine sizes its window from it.
pub type ReadBufferSizeHandler = Arc<dyn Fn() -> usize + Send + Sync>;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ContextHandlers {
    accept: Option<AcceptHandler>,
    firewall: Option<FirewallHandler>,
    sendto: Option<SendToHandler>,
    log: Option<LogHandler>,
}

/// Wrapper for one engine instance.
pub struct Context {
    handle: ContextHandle,
    handlers: Mutex<ContextHandlers>,
}

impl Context {
    fn new(handle: ContextHandle) -> Self {
        Self {
            handle,
            handlers: Mutex::new(ContextHandlers::default()),
        }
    }

    /// The wrapper for `handle`, created on first use.
    pub fn resolve(handle: ContextHandle) -> Arc<Context> {
        CONTEXTS.resolve(handle, || Context::new(handle))
    }

    /// The wrapper for `handle` if the context is live.
    pub fn lookup(handle: ContextHandle) -> Option<Arc<Context>> {
        CONTEXTS.get(handle)
    }

    /// Forgets the context and every socket it owned.
    ///
    /// Returns `false` if the context was not registered.
    pub fn release(handle: ContextHandle) -> bool {
        let existed = CONTEXTS.release(handle).is_some();
        SOCKETS.retain(|_, socket| socket.context != handle);
        existed
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub fn on_accept(&self, f: impl Fn(Arc<NativeSocket>, EndpointAddress) + Send + Sync + 'static) {
        self.handlers.lock().accept = Some(Arc::new(f));
    }

    pub fn on_firewall(&self, f: impl Fn(&EndpointAddress) -> bool + Send + Sync + 'static) {
        self.handlers.lock().firewall = Some(Arc::new(f));
    }

    pub fn on_sendto(
        &self,
        f: impl Fn(Option<SocketHandle>, &[u8], &EndpointAddress, u32) + Send + Sync + 'static,
    ) {
        self.handlers.lock().sendto = Some(Arc::new(f));
    }

    pub fn on_log(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.handlers.lock().log = Some(Arc::new(f));
    }

    /// Removes every handler, breaking any reference cycles through closures.
    pub fn clear_handlers(&self) {
        *self.handlers.lock() = ContextHandlers::default();
    }

    pub(crate) fn accept_handler(&self) -> Option<AcceptHandler> {
        self.handlers.lock().accept.clone()
    }

    pub(crate) fn firewall_handler(&self) -> Option<FirewallHandler> {
        self.handlers.lock().firewall.clone()
    }

    pub(crate) fn sendto_handler(&self) -> Option<SendToHandler> {
        self.handlers.lock().sendto.clone()
    }

    pub(crate) fn log_handler(&self) -> Option<LogHandler> {
        self.handlers.lock().log.clone()
    }
}

// ---------------------------------------------------------------------------
// NativeSocket
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SocketHandlers {
    read: Option<ReadHandler>,
    state_change: Option<StateChangeHandler>,
    error: Option<ErrorHandler>,
    read_buffer_size: Option<ReadBufferSizeHandler>,
    sendto: Option<SendToHandler>,
    log: Option<LogHandler>,
}

/// Wrapper for one engine connection.
pub struct NativeSocket {
    handle: SocketHandle,
    context: ContextHandle,
    handlers: Mutex<SocketHandlers>,
}

impl NativeSocket {
    fn new(handle: SocketHandle, context: ContextHandle) -> Self {
        Self {
            handle,
            context,
            handlers: Mutex::new(SocketHandlers::default()),
        }
    }

    /// The wrapper for `handle`, created (and tied to `context`) on first use.
    pub fn resolve(handle: SocketHandle, context: ContextHandle) -> Arc<NativeSocket> {
        SOCKETS.resolve(handle, || NativeSocket::new(handle, context))
    }

    /// The wrapper for `handle` if the socket is live.
    pub fn lookup(handle: SocketHandle) -> Option<Arc<NativeSocket>> {
        SOCKETS.get(handle)
    }

    /// Whether the engine still considers the socket valid.
    pub fn is_live(handle: SocketHandle) -> bool {
        SOCKETS.contains(handle)
    }

    /// Forgets the socket. Called once the engine reports `DESTROYING`.
    pub fn release(handle: SocketHandle) -> Option<Arc<NativeSocket>> {
        SOCKETS.release(handle)
    }

    pub fn handle(&self) -> SocketHandle {
        self.handle
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    pub fn on_read(&self, f: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.handlers.lock().read = Some(Arc::new(f));
    }

    pub fn on_state_change(&self, f: impl Fn(SocketState) + Send + Sync + 'static) {
        self.handlers.lock().state_change = Some(Arc::new(f));
    }

    pub fn on_error(&self, f: impl Fn(ErrorCode) + Send + Sync + 'static) {
        self.handlers.lock().error = Some(Arc::new(f));
    }

    pub fn on_read_buffer_size(&self, f: impl Fn() -> usize + Send + Sync + 'static) {
        self.handlers.lock().read_buffer_size = Some(Arc::new(f));
    }

    /// Overrides the context-level `sendto` handler for this socket.
    pub fn on_sendto(
        &self,
        f: impl Fn(Option<SocketHandle>, &[u8], &EndpointAddress, u32) + Send + Sync + 'static,
    ) {
        self.handlers.lock().sendto = Some(Arc::new(f));
    }

    /// Overrides the context-level log handler for this socket.
    pub fn on_log(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.handlers.lock().log = Some(Arc::new(f));
    }

    pub fn clear_handlers(&self) {
        *self.handlers.lock() = SocketHandlers::default();
    }

    pub(crate) fn read_handler(&self) -> Option<ReadHandler> {
        self.handlers.lock().read.clone()
    }

    pub(crate) fn state_change_handler(&self) -> Option<StateChangeHandler> {
        self.handlers.lock().state_change.clone()
    }

    pub(crate) fn error_handler(&self) -> Option<ErrorHandler> {
        self.handlers.lock().error.clone()
    }

    pub(crate) fn read_buffer_size_handler(&self) -> Option<ReadBufferSizeHandler> {
        self.handlers.lock().read_buffer_size.clone()
    }

    pub(crate) fn sendto_handler(&self) -> Option<SendToHandler> {
        self.handlers.lock().sendto.clone()
    }

    pub(crate) fn log_handler(&self) -> Option<LogHandler> {
        self.handlers.lock().log.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Unique handle values so tests sharing the global registry never collide.
    fn ctx(n: usize) -> ContextHandle {
        ContextHandle::new(0x5eed_0000 + n)
    }

    fn sock(n: usize) -> SocketHandle {
        SocketHandle::new(0x5eed_1000 + n)
    }

    #[test]
    fn test_registry_resolve_returns_same_instance() {
        let reg: Registry<u32, String> = Registry::new();
        let a = reg.resolve(1, || "first".into());
        let b = reg.resolve(1, || "second".into());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, "first");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_registry_release_forgets_entry() {
        let reg: Registry<u32, u32> = Registry::new();
        reg.resolve(7, || 70);
        assert!(reg.release(7).is_some());
        assert!(reg.release(7).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_socket_resolve_is_stable() {
        let a = NativeSocket::resolve(sock(1), ctx(1));
        let b = NativeSocket::resolve(sock(1), ctx(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.context(), ctx(1));
        NativeSocket::release(sock(1));
        assert!(!NativeSocket::is_live(sock(1)));
    }

    #[test]
    fn test_context_release_drops_owned_sockets() {
        Context::resolve(ctx(2));
        NativeSocket::resolve(sock(2), ctx(2));
        NativeSocket::resolve(sock(3), ctx(2));
        NativeSocket::resolve(sock(4), ctx(3));

        assert!(Context::release(ctx(2)));
        assert!(!Context::release(ctx(2)));
        assert!(!NativeSocket::is_live(sock(2)));
        assert!(!NativeSocket::is_live(sock(3)));
        assert!(NativeSocket::is_live(sock(4)));
        NativeSocket::release(sock(4));
    }
}
