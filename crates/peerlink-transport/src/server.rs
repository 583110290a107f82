//! The listening server: one UDP endpoint, one engine context.
//!
//! ```text
//!             ┌──────────── driver task ────────────┐
//! datagram ──▶│ process_udp → issue_deferred_acks   │──▶ callbacks
//! tick ──────▶│ check_timeouts                      │      │
//!             └─────────────────────────────────────┘      ▼
//!                          accept ──▶ UtpStream ──▶ Transport::accept
//!                          sendto ──▶ UDP socket ──▶ peer
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_engine::{ContextHandle, EngineOption, NativeSocket};
use peerlink_protocol::EndpointAddress;
use peerlink_tick::{TickConfig, TimeoutTicker};
use serde::{Deserialize, Serialize};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backoff::RecvBackoff;
use crate::demux::{Datagram, DemuxEndpoint};
use crate::stream::ConnectionTracker;
use crate::{EngineGate, Transport, TransportError, UtpStream};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Listening server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Timeout ticker settings (default: every 500 ms).
    pub tick: TickConfig,
    /// Receive buffer for one datagram.
    pub max_datagram_size: usize,
    /// Engine receive buffer (`UTP_RCVBUF`), if overridden.
    pub recv_buffer: Option<u32>,
    /// Engine send buffer (`UTP_SNDBUF`), if overridden.
    pub send_buffer: Option<u32>,
    /// Inbound connections are rejected once this many streams are live.
    pub max_connections: usize,
    /// When `false`, every inbound connection is rejected.
    pub accept_incoming: bool,
    /// Ask the engine for its normal-level log output.
    pub engine_log: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick: TickConfig::default(),
            max_datagram_size: 4096,
            recv_buffer: None,
            send_buffer: None,
            max_connections: 256,
            accept_incoming: true,
            engine_log: false,
        }
    }
}

impl ServerConfig {
    /// Smallest datagram buffer; smaller would truncate uTP packets.
    pub const MIN_DATAGRAM_SIZE: usize = 1500;
    /// Largest UDP payload.
    pub const MAX_DATAGRAM_SIZE: usize = 65_507;

    /// Clamp out-of-range values so the config is safe to use.
    pub fn validated(mut self) -> Self {
        self.tick = self.tick.validated();
        let size = self
            .max_datagram_size
            .clamp(Self::MIN_DATAGRAM_SIZE, Self::MAX_DATAGRAM_SIZE);
        if size != self.max_datagram_size {
            tracing::warn!(
                requested = self.max_datagram_size,
                clamped = size,
                "max_datagram_size out of range, clamping"
            );
            self.max_datagram_size = size;
        }
        if self.max_connections == 0 {
            tracing::warn!("max_connections is 0, using 1");
            self.max_connections = 1;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Lifecycle of a [`UtpServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Inactive,
    Binding,
    Listening,
    Closed,
}

struct ServerState {
    phase: ServerPhase,
    context: Option<ContextHandle>,
    local_addr: Option<SocketAddr>,
    driver: Option<JoinHandle<()>>,
}

struct ServerInner {
    gate: Arc<EngineGate>,
    config: ServerConfig,
    state: Mutex<ServerState>,
    connections: Arc<ConnectionTracker>,
    accept_tx: Mutex<Option<mpsc::UnboundedSender<UtpStream>>>,
}

/// Where inbound datagrams come from.
enum Ingress {
    Socket(Arc<UdpSocket>),
    Shared(mpsc::Receiver<Datagram>),
}

impl Ingress {
    /// The next datagram; `None` once a shared feed is closed.
    async fn recv(&mut self, buf: &mut [u8]) -> Option<io::Result<Datagram>> {
        match self {
            Self::Socket(socket) => Some(
                socket
                    .recv_from(buf)
                    .await
                    .map(|(n, from)| Datagram::new(Bytes::copy_from_slice(&buf[..n]), from)),
            ),
            Self::Shared(rx) => rx.recv().await.map(Ok),
        }
    }
}

/// A uTP listening server.
///
/// # Example
///
/// ```rust,ignore
/// let gate = EngineGate::new(Arc::new(NativeEngine::load()?));
/// let mut server = UtpServer::new(gate, ServerConfig::default());
/// server.listen("0.0.0.0:0").await?;
/// while let Ok(stream) = server.accept().await {
///     tokio::spawn(handle(stream));
/// }
/// ```
pub struct UtpServer {
    inner: Arc<ServerInner>,
    incoming: mpsc::UnboundedReceiver<UtpStream>,
}

impl UtpServer {
    pub fn new(gate: Arc<EngineGate>, config: ServerConfig) -> Self {
        let (accept_tx, incoming) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ServerInner {
                gate,
                config: config.validated(),
                state: Mutex::new(ServerState {
                    phase: ServerPhase::Inactive,
                    context: None,
                    local_addr: None,
                    driver: None,
                }),
                connections: Arc::new(ConnectionTracker::default()),
                accept_tx: Mutex::new(Some(accept_tx)),
            }),
            incoming,
        }
    }

    pub fn phase(&self) -> ServerPhase {
        self.inner.state.lock().phase
    }

    /// The engine context, while listening.
    pub fn context(&self) -> Option<ContextHandle> {
        self.inner.state.lock().context
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// The bound UDP address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.inner
            .state
            .lock()
            .local_addr
            .ok_or(TransportError::NotListening)
    }

    /// Number of live streams (accepted and outbound).
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Binds a UDP socket and starts serving it. Port 0 picks an ephemeral
    /// port.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr, TransportError> {
        self.begin_listen()?;
        let socket = match UdpSocket::bind(addr).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.abort_listen();
                return Err(TransportError::Bind(e));
            }
        };
        let local = match socket.local_addr() {
            Ok(local) => local,
            Err(e) => {
                self.abort_listen();
                return Err(TransportError::Bind(e));
            }
        };
        self.start(Ingress::Socket(Arc::clone(&socket)), socket, local)
    }

    /// Serves engine datagrams routed by a [`Demux`](crate::Demux). Replies
    /// leave through the demux's shared socket.
    pub fn listen_shared(&self, endpoint: DemuxEndpoint) -> Result<SocketAddr, TransportError> {
        self.begin_listen()?;
        let (rx, socket, local) = endpoint.into_parts();
        self.start(Ingress::Shared(rx), socket, local)
    }

    fn begin_listen(&self) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        match state.phase {
            ServerPhase::Inactive => {
                state.phase = ServerPhase::Binding;
                Ok(())
            }
            ServerPhase::Binding => Err(TransportError::ListenInProgress),
            ServerPhase::Listening => Err(TransportError::AlreadyListening),
            ServerPhase::Closed => Err(TransportError::Shutdown),
        }
    }

    /// Back to `Inactive` after a failed bind, unless closed meanwhile.
    fn abort_listen(&self) {
        let mut state = self.inner.state.lock();
        if state.phase == ServerPhase::Binding {
            state.phase = ServerPhase::Inactive;
        }
    }

    fn start(
        &self,
        ingress: Ingress,
        egress: Arc<UdpSocket>,
        local: SocketAddr,
    ) -> Result<SocketAddr, TransportError> {
        let inner = &self.inner;
        let config = &inner.config;

        let context = match inner.gate.with(|e| -> Result<_, TransportError> {
            let ctx = e.init()?;
            if let Some(bytes) = config.recv_buffer {
                e.set_context_option(ctx, EngineOption::RecvBuffer, bytes as i32)?;
            }
            if let Some(bytes) = config.send_buffer {
                e.set_context_option(ctx, EngineOption::SendBuffer, bytes as i32)?;
            }
            if config.engine_log {
                e.set_context_option(ctx, EngineOption::LogNormal, 1)?;
            }
            Ok(ctx)
        }) {
            Ok(ctx) => ctx,
            Err(e) => {
                self.abort_listen();
                return Err(e);
            }
        };

        install_handlers(inner, context, egress);

        let driver = tokio::spawn(drive(
            Arc::downgrade(inner),
            Arc::clone(&inner.gate),
            context,
            ingress,
            TimeoutTicker::new(config.tick.clone()),
            config.max_datagram_size,
        ));

        let mut state = inner.state.lock();
        if state.phase != ServerPhase::Binding {
            // Closed while binding.
            drop(state);
            driver.abort();
            if let Err(e) = inner.gate.with(|e| e.destroy(context)) {
                tracing::warn!(%context, error = %e, "failed to destroy context");
            }
            return Err(TransportError::Shutdown);
        }
        state.phase = ServerPhase::Listening;
        state.context = Some(context);
        state.local_addr = Some(local);
        state.driver = Some(driver);
        drop(state);

        tracing::info!(addr = %local, %context, "uTP server listening");
        Ok(local)
    }

    /// Opens an outbound stream to `peer`. The stream starts `Open` and
    /// emits `Connect` once the handshake completes.
    pub fn connect(&self, peer: &EndpointAddress) -> Result<UtpStream, TransportError> {
        let context = self.listening_context()?;
        let inner = &self.inner;
        inner.gate.with(|e| {
            let socket = e.create_socket(context)?;
            let native = NativeSocket::resolve(socket, context);
            let stream = UtpStream::attach_tracked(
                Arc::clone(&inner.gate),
                &native,
                peer.clone(),
                Some(Arc::clone(&inner.connections)),
            );
            e.connect(socket, peer)?;
            tracing::debug!(id = %stream.id(), %peer, "connecting");
            Ok(stream)
        })
    }

    /// Parses `host` and connects to it.
    pub fn connect_host(&self, host: &str, port: u16) -> Result<UtpStream, TransportError> {
        self.connect(&EndpointAddress::parse(host, port)?)
    }

    fn listening_context(&self) -> Result<ContextHandle, TransportError> {
        let state = self.inner.state.lock();
        match (state.phase, state.context) {
            (ServerPhase::Listening, Some(ctx)) => Ok(ctx),
            _ => Err(TransportError::NotListening),
        }
    }

    /// Stops the server. Idempotent, and safe in any phase.
    ///
    /// Live streams are destroyed, the context is destroyed, the driver is
    /// stopped, and pending `accept` calls fail with `Shutdown`.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl ServerInner {
    fn close(&self) {
        let (prev, context, driver) = {
            let mut state = self.state.lock();
            if state.phase == ServerPhase::Closed {
                return;
            }
            let prev = std::mem::replace(&mut state.phase, ServerPhase::Closed);
            (prev, state.context.take(), state.driver.take())
        };

        for stream in self.connections.live() {
            stream.destroy(None);
        }
        if let Some(context) = context {
            if let Err(e) = self.gate.with(|e| e.destroy(context)) {
                tracing::warn!(%context, error = %e, "failed to destroy context");
            }
        }
        if let Some(driver) = driver {
            driver.abort();
        }
        self.accept_tx.lock().take();

        tracing::info!(from = ?prev, "uTP server closed");
    }
}

impl Drop for UtpServer {
    fn drop(&mut self) {
        self.close();
    }
}

impl Transport for UtpServer {
    type Connection = UtpStream;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error> {
        self.incoming.recv().await.ok_or(TransportError::Shutdown)
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        self.close();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine wiring
// ---------------------------------------------------------------------------

fn install_handlers(inner: &Arc<ServerInner>, context: ContextHandle, egress: Arc<UdpSocket>) {
    let ctx = peerlink_engine::Context::resolve(context);

    let weak: Weak<ServerInner> = Arc::downgrade(inner);
    ctx.on_accept(move |native, peer| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let stream = UtpStream::attach_tracked(
            Arc::clone(&inner.gate),
            &native,
            peer,
            Some(Arc::clone(&inner.connections)),
        );
        tracing::debug!(id = %stream.id(), peer = %stream.remote_addr(), "accepted uTP connection");
        if let Some(tx) = inner.accept_tx.lock().as_ref() {
            // A closed receiver hands the stream back; dropping it destroys it.
            let _ = tx.send(stream);
        }
    });

    let weak = Arc::downgrade(inner);
    ctx.on_firewall(move |peer| {
        let Some(inner) = weak.upgrade() else {
            return true;
        };
        let reject = !inner.config.accept_incoming
            || inner.connections.len() >= inner.config.max_connections;
        if reject {
            tracing::debug!(%peer, "rejecting inbound connection");
        }
        reject
    });

    ctx.on_sendto(move |_socket, data, to, _flags| {
        match egress.try_send_to(data, to.socket_addr()) {
            Ok(_) => tracing::trace!(%to, len = data.len(), "sent datagram"),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::trace!(%to, len = data.len(), "socket buffer full, dropping datagram")
            }
            Err(e) => tracing::warn!(%to, error = %e, "datagram send failed"),
        }
    });
}

/// The driver: datagrams in, timeout ticks, until aborted or the feed ends.
///
/// A shared feed ends when its demultiplexer stops routing; the server is
/// closed then, since nothing can reach its engine any more.
async fn drive(
    server: Weak<ServerInner>,
    gate: Arc<EngineGate>,
    context: ContextHandle,
    mut ingress: Ingress,
    mut ticker: TimeoutTicker,
    max_datagram_size: usize,
) {
    let mut buf = vec![0u8; max_datagram_size];
    let mut backoff = RecvBackoff::default();
    loop {
        tokio::select! {
            recv = ingress.recv(&mut buf) => match recv {
                Some(Ok(datagram)) => {
                    backoff.reset();
                    let from = EndpointAddress::from(datagram.from);
                    gate.with(|e| {
                        if !e.process_udp(context, &datagram.data, &from) {
                            tracing::trace!(%from, len = datagram.data.len(), "datagram not handled by engine");
                        }
                        e.issue_deferred_acks(context);
                    });
                }
                // Per-datagram errors (e.g. ICMP port unreachable surfacing on
                // some platforms) do not end the loop.
                Some(Err(e)) => backoff.failed("server", &e).await,
                None => {
                    tracing::warn!(%context, "datagram feed closed, closing server");
                    if let Some(server) = server.upgrade() {
                        server.close();
                    }
                    break;
                }
            },
            _ = ticker.wait_for_tick() => gate.with(|e| e.check_timeouts(context)),
        }
    }
}
