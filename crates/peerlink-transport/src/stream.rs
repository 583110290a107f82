//! One engine connection as a duplex byte stream.
//!
//! The engine pushes: bytes arrive through the `read` callback whenever a
//! datagram is processed, and state changes arrive the same way. A
//! [`UtpStream`] turns those pushes into a pull-based stream:
//!
//! - **Reads** land in an unbounded queue. The number of queued-but-unread
//!   bytes is what the stream reports through `get_read_buffer_size`, so the
//!   engine shrinks its advertised window as the queue grows.
//! - **Writes** loop over `utp_write`; when the engine accepts zero bytes the
//!   writer parks until `Connect` or `Writable` wakes it.
//! - **Lifecycle** is reported as [`StreamEvent`]s.
//!
//! ```text
//! Open ──CONNECT──▶ Readable ──EOF──▶ Ended ─┐
//!   │                  │                     ├─▶ close emitted ─▶ Closed
//!   └──error/destroy───┴──────▶ Destroyed ───┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::{Pin, pin};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::{Buf, Bytes};
use futures_util::task::AtomicWaker;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use peerlink_engine::{ErrorCode, NativeSocket, Shutdown, SocketHandle, SocketState};
use peerlink_protocol::EndpointAddress;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::{Connection, ConnectionId, EngineGate, TransportError};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Where a stream is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Created; the handshake has not completed.
    Open,
    /// Connected; bytes flow both ways.
    Readable,
    /// The peer finished sending.
    Ended,
    /// Torn down locally or by an error.
    Destroyed,
    /// `Close` has been emitted. Terminal.
    Closed,
}

/// Lifecycle notifications, delivered in order through
/// [`UtpStream::next_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The handshake completed.
    Connect,
    /// The engine can take more bytes.
    Drain,
    /// The peer will send nothing more.
    End,
    /// The connection failed. Always followed by `Close { had_error: true }`.
    Error {
        kind: io::ErrorKind,
        message: String,
    },
    /// Emitted exactly once; the last event of every stream.
    Close { had_error: bool },
}

type ReadItem = io::Result<Bytes>;

// ---------------------------------------------------------------------------
// Shared state (reached from both the handle and the engine callbacks)
// ---------------------------------------------------------------------------

struct StreamState {
    phase: StreamPhase,
    readable: bool,
    closed: bool,
    destroyed: bool,
    /// The engine reported `Destroying`; the socket must not be touched again.
    released: bool,
    read_tx: Option<mpsc::UnboundedSender<ReadItem>>,
}

pub(crate) struct StreamShared {
    id: ConnectionId,
    socket: SocketHandle,
    remote: EndpointAddress,
    gate: Arc<EngineGate>,
    state: Mutex<StreamState>,
    /// Bytes queued for the reader but not yet consumed.
    buffered: AtomicUsize,
    read_drained: AtomicBool,
    close_emitted: AtomicBool,
    writer: AtomicWaker,
    events: Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
    tracker: Option<Arc<ConnectionTracker>>,
}

impl StreamShared {
    fn emit(&self, event: StreamEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn on_state_change(&self, state: SocketState) {
        match state {
            SocketState::Connect => {
                {
                    let mut s = self.state.lock();
                    if s.destroyed {
                        return;
                    }
                    if s.phase == StreamPhase::Open {
                        s.phase = StreamPhase::Readable;
                    }
                    s.readable = true;
                }
                tracing::debug!(id = %self.id, remote = %self.remote, "stream connected");
                self.emit(StreamEvent::Connect);
                self.writer.wake();
            }
            SocketState::Writable => {
                if self.state.lock().destroyed {
                    return;
                }
                self.emit(StreamEvent::Drain);
                self.writer.wake();
            }
            SocketState::Eof => {
                {
                    let mut s = self.state.lock();
                    if s.destroyed {
                        return;
                    }
                    s.phase = StreamPhase::Ended;
                    s.readable = false;
                }
                tracing::debug!(id = %self.id, "stream ended by peer");
                self.emit(StreamEvent::End);
                self.destroy(None);
            }
            SocketState::Destroying => {
                let finish = {
                    let mut s = self.state.lock();
                    s.released = true;
                    if s.destroyed {
                        None
                    } else {
                        s.destroyed = true;
                        s.closed = true;
                        s.readable = false;
                        s.phase = StreamPhase::Destroyed;
                        Some(s.read_tx.take())
                    }
                };
                if let Some(read_tx) = finish {
                    drop(read_tx);
                    self.flush_once();
                    self.emit_close(false);
                }
                self.writer.wake();
            }
        }
    }

    fn on_read(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let s = self.state.lock();
        if s.destroyed {
            return;
        }
        if let Some(tx) = &s.read_tx {
            self.buffered.fetch_add(data.len(), Ordering::AcqRel);
            let _ = tx.send(Ok(Bytes::copy_from_slice(data)));
        }
    }

    fn on_error(&self, code: ErrorCode) {
        self.destroy(Some((code.io_kind(), code.to_string())));
    }

    /// Tears the stream down. Idempotent.
    ///
    /// Ends the read queue (with `err`, if any), closes the native socket
    /// unless the engine already released it, and emits `Close`.
    pub(crate) fn destroy(&self, err: Option<(io::ErrorKind, String)>) {
        let (read_tx, released) = {
            let mut s = self.state.lock();
            if s.destroyed {
                return;
            }
            s.destroyed = true;
            s.closed = true;
            s.readable = false;
            if s.phase != StreamPhase::Ended {
                s.phase = StreamPhase::Destroyed;
            }
            (s.read_tx.take(), s.released)
        };

        if let (Some(tx), Some((kind, message))) = (&read_tx, &err) {
            let _ = tx.send(Err(io::Error::new(*kind, message.clone())));
        }
        drop(read_tx);
        self.flush_once();

        if !released {
            self.gate.with(|e| e.close(self.socket));
        }

        let had_error = err.is_some();
        if let Some((kind, message)) = err {
            tracing::debug!(id = %self.id, error = %message, "stream failed");
            self.emit(StreamEvent::Error { kind, message });
        }
        self.emit_close(had_error);
        self.writer.wake();
    }

    /// Sends `read_drained` to the engine, at most once per stream.
    fn flush_once(&self) {
        if self.read_drained.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.state.lock().released {
            tracing::trace!(id = %self.id, "socket released, skipping read_drained");
            return;
        }
        self.gate.with(|e| e.read_drained(self.socket));
    }

    fn emit_close(&self, had_error: bool) {
        if self.close_emitted.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.lock().phase = StreamPhase::Closed;
        if let Some(tracker) = &self.tracker {
            tracker.remove(self.id);
        }
        tracing::debug!(id = %self.id, had_error, "stream closed");
        self.emit(StreamEvent::Close { had_error });
        // Close is the last event; dropping the sender ends `next_event`.
        self.events.lock().take();
    }

    fn poll_write(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<Result<usize, TransportError>> {
        // Register first so a wake between the check and the write is not lost.
        self.writer.register(cx.waker());
        if self.state.lock().destroyed {
            return Poll::Ready(Err(TransportError::StreamDestroyed(self.id)));
        }
        match self.gate.with(|e| e.write(self.socket, data)) {
            Ok(0) => {
                tracing::trace!(id = %self.id, pending = data.len(), "send window full");
                Poll::Pending
            }
            Ok(n) => Poll::Ready(Ok(n)),
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }

    fn consumed(&self, n: usize) {
        self.buffered.fetch_sub(n, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Connection tracking (for the listening server)
// ---------------------------------------------------------------------------

/// Live streams of one server, keyed by id. Entries leave when `Close` is
/// emitted.
#[derive(Default)]
pub(crate) struct ConnectionTracker {
    streams: Mutex<HashMap<ConnectionId, Weak<StreamShared>>>,
}

impl ConnectionTracker {
    fn insert(&self, id: ConnectionId, stream: Weak<StreamShared>) {
        self.streams.lock().insert(id, stream);
    }

    fn remove(&self, id: ConnectionId) {
        self.streams.lock().remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.lock().len()
    }

    /// Every tracked stream still alive. The lock is released before return
    /// so callers may destroy them.
    pub(crate) fn live(&self) -> Vec<Arc<StreamShared>> {
        self.streams
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// UtpStream
// ---------------------------------------------------------------------------

struct Reader {
    rx: mpsc::UnboundedReceiver<ReadItem>,
    /// Unread remainder of a chunk partially consumed by `poll_read`.
    pending: Bytes,
}

/// A uTP connection.
///
/// Dropping the stream destroys it.
pub struct UtpStream {
    shared: Arc<StreamShared>,
    reader: tokio::sync::Mutex<Reader>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<StreamEvent>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl UtpStream {
    /// Wraps a native socket, installing its read, state, error, and
    /// read-buffer-size handlers.
    pub fn attach(gate: Arc<EngineGate>, socket: &NativeSocket, remote: EndpointAddress) -> Self {
        Self::attach_tracked(gate, socket, remote, None)
    }

    pub(crate) fn attach_tracked(
        gate: Arc<EngineGate>,
        socket: &NativeSocket,
        remote: EndpointAddress,
        tracker: Option<Arc<ConnectionTracker>>,
    ) -> Self {
        let id = ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(StreamShared {
            id,
            socket: socket.handle(),
            remote,
            gate,
            state: Mutex::new(StreamState {
                phase: StreamPhase::Open,
                readable: false,
                closed: false,
                destroyed: false,
                released: false,
                read_tx: Some(read_tx),
            }),
            buffered: AtomicUsize::new(0),
            read_drained: AtomicBool::new(false),
            close_emitted: AtomicBool::new(false),
            writer: AtomicWaker::new(),
            events: Mutex::new(Some(event_tx)),
            tracker,
        });

        if let Some(tracker) = &shared.tracker {
            tracker.insert(id, Arc::downgrade(&shared));
        }

        let s = Arc::clone(&shared);
        socket.on_state_change(move |state| s.on_state_change(state));
        let s = Arc::clone(&shared);
        socket.on_read(move |data| s.on_read(data));
        let s = Arc::clone(&shared);
        socket.on_error(move |code| s.on_error(code));
        let s = Arc::clone(&shared);
        socket.on_read_buffer_size(move || s.buffered.load(Ordering::Acquire));

        tracing::debug!(%id, socket = %shared.socket, remote = %shared.remote, "stream attached");

        Self {
            shared,
            reader: tokio::sync::Mutex::new(Reader {
                rx: read_rx,
                pending: Bytes::new(),
            }),
            events: tokio::sync::Mutex::new(event_rx),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn socket(&self) -> SocketHandle {
        self.shared.socket
    }

    pub fn remote_addr(&self) -> &EndpointAddress {
        &self.shared.remote
    }

    pub fn remote_host(&self) -> &str {
        self.shared.remote.host()
    }

    pub fn remote_port(&self) -> u16 {
        self.shared.remote.port()
    }

    pub fn phase(&self) -> StreamPhase {
        self.shared.state.lock().phase
    }

    pub fn is_readable(&self) -> bool {
        self.shared.state.lock().readable
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.state.lock().destroyed
    }

    /// Bytes received but not yet read.
    pub fn buffered_len(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    /// The next lifecycle event, or `None` once `Close` has been taken.
    pub async fn next_event(&self) -> Option<StreamEvent> {
        self.events.lock().await.recv().await
    }

    /// The next lifecycle event if one is already queued.
    pub fn try_next_event(&self) -> Option<StreamEvent> {
        self.events.try_lock().ok()?.try_recv().ok()
    }

    /// Writes all of `data`, waiting for the send window whenever it is full.
    pub async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let _writing = self.write_lock.lock().await;
        let mut written = 0;
        while written < data.len() {
            let rest = &data[written..];
            written += std::future::poll_fn(|cx| self.shared.poll_write(cx, rest)).await?;
        }
        Ok(())
    }

    /// Writes every chunk of `source`, then tells the engine the stream's
    /// reads are drained.
    pub async fn sink<S>(&self, source: S) -> Result<(), TransportError>
    where
        S: Stream,
        S::Item: AsRef<[u8]>,
    {
        let mut source = pin!(source);
        while let Some(chunk) = source.next().await {
            self.write(chunk.as_ref()).await?;
        }
        self.shared.flush_once();
        Ok(())
    }

    /// Next received chunk; `None` at end of stream.
    pub async fn read_chunk(&self) -> Result<Option<Bytes>, TransportError> {
        let mut reader = self.reader.lock().await;
        if !reader.pending.is_empty() {
            let chunk = std::mem::take(&mut reader.pending);
            self.shared.consumed(chunk.len());
            return Ok(Some(chunk));
        }
        match reader.rx.recv().await {
            Some(Ok(chunk)) => {
                self.shared.consumed(chunk.len());
                Ok(Some(chunk))
            }
            Some(Err(e)) => Err(TransportError::ConnectionLost(e)),
            None => Ok(None),
        }
    }

    /// Ends the stream.
    ///
    /// uTP half-close is not exposed: ending destroys the stream, and the
    /// engine flushes queued bytes before sending its FIN.
    pub fn end(&self) {
        self.shared.destroy(None);
    }

    /// Destroys the stream. Idempotent; `Close` is emitted once.
    pub fn destroy(&self) {
        self.shared.destroy(None);
    }

    /// Asks the engine to stop sending on this socket, leaving reads open.
    pub fn shutdown_write(&self) {
        if self.is_destroyed() {
            return;
        }
        let socket = self.shared.socket;
        self.shared.gate.with(|e| e.shutdown(socket, Shutdown::Write));
    }

    /// Streams have no idle timeout; only `None` is accepted.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        match timeout {
            None => Ok(()),
            Some(_) => Err(TransportError::TimeoutUnsupported),
        }
    }
}

impl Drop for UtpStream {
    fn drop(&mut self) {
        self.shared.destroy(None);
    }
}

impl fmt::Debug for UtpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtpStream")
            .field("id", &self.shared.id)
            .field("remote", &self.shared.remote)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Connection for UtpStream {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        self.write(data).await
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.read_chunk().await?.map(Vec::from))
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.end();
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.shared.id
    }
}

impl AsyncRead for UtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let reader = this.reader.get_mut();
        if reader.pending.is_empty() {
            match ready!(reader.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => reader.pending = chunk,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = reader.pending.len().min(buf.remaining());
        buf.put_slice(&reader.pending[..n]);
        reader.pending.advance(n);
        this.shared.consumed(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for UtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        self.shared
            .poll_write(cx, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Same as [`UtpStream::end`].
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.end();
        Poll::Ready(Ok(()))
    }
}
