//! An in-memory [`Engine`] for tests.
//!
//! `ScriptedEngine` never touches the network. It hands out synthetic
//! handles, records every entry-point call, and lets a test fire callbacks
//! through the real [`dispatch`] path, so wrappers, registry, and handlers
//! behave exactly as they would under the native library.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use peerlink_protocol::EndpointAddress;

use crate::engine::{Engine, EngineOption, Shutdown};
use crate::registry::{Context, NativeSocket};
use crate::{Callback, ContextHandle, EngineError, ErrorCode, SocketHandle, SocketState, dispatch};

// Synthetic handles start high and never repeat within a process, so tests
// running in parallel never share registry entries.
static NEXT_HANDLE: AtomicUsize = AtomicUsize::new(0x7e57_0000);

fn next_handle() -> usize {
    NEXT_HANDLE.fetch_add(0x10, Ordering::Relaxed)
}

/// One recorded entry-point call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Init(ContextHandle),
    Destroy(ContextHandle),
    SetContextOption(ContextHandle, EngineOption, i32),
    CreateSocket(ContextHandle, SocketHandle),
    SetSocketOption(SocketHandle, EngineOption, i32),
    Connect(SocketHandle, EndpointAddress),
    Write(SocketHandle, Vec<u8>),
    Shutdown(SocketHandle, Shutdown),
    Close(SocketHandle),
    ReadDrained(SocketHandle),
    ProcessUdp(ContextHandle, Vec<u8>, EndpointAddress),
    CheckTimeouts(ContextHandle),
    IssueDeferredAcks(ContextHandle),
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    /// Per-socket cap on bytes `write` accepts; absent means unlimited.
    write_budget: HashMap<SocketHandle, usize>,
}

/// See the module docs.
#[derive(Default)]
pub struct ScriptedEngine {
    state: Mutex<State>,
    /// When set, `close` synchronously reports `Destroying` like a socket
    /// that had nothing left to flush.
    destroy_on_close: bool,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine whose `close` immediately fires `Destroying`.
    pub fn destroying_on_close() -> Self {
        Self {
            destroy_on_close: true,
            ..Self::default()
        }
    }

    /// Snapshot of every call so far.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Concatenation of every payload written to `socket`.
    pub fn written(&self, socket: SocketHandle) -> Vec<u8> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Write(s, data) if *s == socket => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// Limits how many more bytes `write` accepts on `socket`.
    pub fn set_write_budget(&self, socket: SocketHandle, bytes: usize) {
        self.state.lock().write_budget.insert(socket, bytes);
    }

    /// Removes the write limit on `socket`.
    pub fn clear_write_budget(&self, socket: SocketHandle) {
        self.state.lock().write_budget.remove(&socket);
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }

    // -----------------------------------------------------------------------
    // Firing callbacks
    // -----------------------------------------------------------------------

    /// Dispatches an arbitrary callback for `context`.
    pub fn fire(&self, context: ContextHandle, callback: Callback<'_>) -> u64 {
        dispatch(context, callback)
    }

    /// Simulates an inbound connection from `peer`; returns the new socket.
    pub fn accept(&self, context: ContextHandle, peer: EndpointAddress) -> SocketHandle {
        let socket = SocketHandle::new(next_handle());
        self.fire(
            context,
            Callback::Accept {
                socket,
                address: peer,
            },
        );
        socket
    }

    pub fn state_change(&self, socket: SocketHandle, state: SocketState) {
        if let Some(context) = NativeSocket::lookup(socket).map(|s| s.context()) {
            self.fire(context, Callback::StateChange { socket, state });
        }
    }

    pub fn read(&self, socket: SocketHandle, data: &[u8]) {
        if let Some(context) = NativeSocket::lookup(socket).map(|s| s.context()) {
            self.fire(context, Callback::Read { socket, data });
        }
    }

    pub fn error(&self, socket: SocketHandle, code: ErrorCode) {
        if let Some(context) = NativeSocket::lookup(socket).map(|s| s.context()) {
            self.fire(context, Callback::Error { socket, code });
        }
    }

    /// Asks the socket's handler how many unread bytes it holds.
    pub fn read_buffer_size(&self, socket: SocketHandle) -> u64 {
        match NativeSocket::lookup(socket).map(|s| s.context()) {
            Some(context) => self.fire(context, Callback::GetReadBufferSize { socket }),
            None => 0,
        }
    }

    /// Has the engine emit an outbound datagram through the `sendto` handler.
    pub fn send_to(&self, context: ContextHandle, socket: Option<SocketHandle>, data: &[u8], to: EndpointAddress) {
        self.fire(
            context,
            Callback::SendTo {
                socket,
                data,
                address: to,
                flags: 0,
            },
        );
    }
}

impl Engine for ScriptedEngine {
    fn init(&self) -> Result<ContextHandle, EngineError> {
        let handle = ContextHandle::new(next_handle());
        Context::resolve(handle);
        self.record(Call::Init(handle));
        Ok(handle)
    }

    fn destroy(&self, context: ContextHandle) -> Result<(), EngineError> {
        if Context::lookup(context).is_none() {
            return Err(EngineError::ContextDestroyed(context));
        }
        self.record(Call::Destroy(context));
        Context::release(context);
        Ok(())
    }

    fn set_context_option(
        &self,
        context: ContextHandle,
        option: EngineOption,
        value: i32,
    ) -> Result<(), EngineError> {
        if Context::lookup(context).is_none() {
            return Err(EngineError::ContextDestroyed(context));
        }
        self.record(Call::SetContextOption(context, option, value));
        Ok(())
    }

    fn create_socket(&self, context: ContextHandle) -> Result<SocketHandle, EngineError> {
        if Context::lookup(context).is_none() {
            return Err(EngineError::ContextDestroyed(context));
        }
        let socket = SocketHandle::new(next_handle());
        NativeSocket::resolve(socket, context);
        self.record(Call::CreateSocket(context, socket));
        Ok(socket)
    }

    fn set_socket_option(
        &self,
        socket: SocketHandle,
        option: EngineOption,
        value: i32,
    ) -> Result<(), EngineError> {
        if !NativeSocket::is_live(socket) {
            return Err(EngineError::UnknownSocket(socket));
        }
        self.record(Call::SetSocketOption(socket, option, value));
        Ok(())
    }

    fn connect(&self, socket: SocketHandle, peer: &EndpointAddress) -> Result<(), EngineError> {
        if !NativeSocket::is_live(socket) {
            return Err(EngineError::UnknownSocket(socket));
        }
        self.record(Call::Connect(socket, peer.clone()));
        Ok(())
    }

    fn write(&self, socket: SocketHandle, data: &[u8]) -> Result<usize, EngineError> {
        if !NativeSocket::is_live(socket) {
            return Err(EngineError::UnknownSocket(socket));
        }
        let mut state = self.state.lock();
        let accepted = match state.write_budget.get_mut(&socket) {
            Some(budget) => {
                let n = data.len().min(*budget);
                *budget -= n;
                n
            }
            None => data.len(),
        };
        if accepted > 0 {
            state.calls.push(Call::Write(socket, data[..accepted].to_vec()));
        }
        Ok(accepted)
    }

    fn shutdown(&self, socket: SocketHandle, how: Shutdown) {
        self.record(Call::Shutdown(socket, how));
    }

    fn close(&self, socket: SocketHandle) {
        self.record(Call::Close(socket));
        if self.destroy_on_close {
            self.state_change(socket, SocketState::Destroying);
        }
    }

    fn read_drained(&self, socket: SocketHandle) {
        self.record(Call::ReadDrained(socket));
    }

    fn process_udp(&self, context: ContextHandle, data: &[u8], from: &EndpointAddress) -> bool {
        if Context::lookup(context).is_none() {
            return false;
        }
        self.record(Call::ProcessUdp(context, data.to_vec(), from.clone()));
        true
    }

    fn check_timeouts(&self, context: ContextHandle) {
        self.record(Call::CheckTimeouts(context));
    }

    fn issue_deferred_acks(&self, context: ContextHandle) {
        self.record(Call::IssueDeferredAcks(context));
    }
}
