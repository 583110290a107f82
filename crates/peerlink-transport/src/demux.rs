//! Shared-port demultiplexer.
//!
//! Lets the uTP engine share one UDP port with another datagram protocol.
//! Every datagram on the external socket is classified by its first bytes
//! ([`classify`]): engine traffic goes to the engine route, everything else
//! to an mpsc channel of [`Datagram`]s.
//!
//! Classification is stateless and can misfire on foreign datagrams that
//! happen to look like uTP headers; the engine drops those as unknown.
//!
//! With [`EngineRoute::Loopback`] each remote peer gets its own relay
//! socket on loopback. The engine sees the relay as the peer, and whatever
//! it sends to the relay leaves the shared port addressed to that peer.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use peerlink_protocol::{Traffic, classify};
use serde::{Deserialize, Serialize};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};

use crate::TransportError;
use crate::backoff::RecvBackoff;

/// One received datagram and its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Bytes,
    pub from: SocketAddr,
}

impl Datagram {
    pub fn new(data: Bytes, from: SocketAddr) -> Self {
        Self { data, from }
    }
}

/// Where engine traffic goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineRoute {
    /// Forward each engine datagram unmodified to a server listening at
    /// this address, from a loopback relay socket dedicated to the sender.
    /// Datagrams the server sends back to a relay leave the shared port
    /// addressed to that relay's peer.
    Loopback(SocketAddr),
    /// Deliver in-process, with the original sender, to the
    /// [`DemuxEndpoint`] from [`Demux::engine_endpoint`]. A server that
    /// `listen_shared`s on it replies through the shared socket.
    Endpoint,
}

/// Demultiplexer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemuxConfig {
    /// Receive buffer for one datagram.
    pub max_datagram_size: usize,
    /// Datagrams of other traffic held before new ones are dropped.
    pub other_channel_capacity: usize,
    /// Engine datagrams held for an in-process endpoint.
    pub engine_channel_capacity: usize,
    /// Loopback route only: relay sockets (one per remote peer) kept at
    /// once. Engine datagrams from further peers are dropped.
    pub max_relays: usize,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            max_datagram_size: 65_507,
            other_channel_capacity: 1024,
            engine_channel_capacity: 1024,
            max_relays: 256,
        }
    }
}

impl DemuxConfig {
    /// Clamp out-of-range values so the config is safe to use.
    pub fn validated(mut self) -> Self {
        self.max_datagram_size = self.max_datagram_size.clamp(1500, 65_507);
        self.other_channel_capacity = self.other_channel_capacity.max(1);
        self.engine_channel_capacity = self.engine_channel_capacity.max(1);
        self.max_relays = self.max_relays.max(1);
        self
    }
}

/// The engine's side of a shared port, consumed by
/// [`UtpServer::listen_shared`](crate::UtpServer::listen_shared).
#[derive(Debug)]
pub struct DemuxEndpoint {
    rx: mpsc::Receiver<Datagram>,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl DemuxEndpoint {
    /// The shared external address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn into_parts(self) -> (mpsc::Receiver<Datagram>, Arc<UdpSocket>, SocketAddr) {
        (self.rx, self.socket, self.local_addr)
    }
}

enum EngineTarget {
    Relay(RelayTable),
    Channel(mpsc::Sender<Datagram>),
}

/// Per-peer relay sockets for the loopback route.
///
/// Dropping the table aborts every reply task.
struct RelayTable {
    engine: SocketAddr,
    bind: SocketAddr,
    limit: usize,
    max_datagram_size: usize,
    // TODO: evict relays whose peer has been silent longer than the
    // engine's connection timeout instead of holding them until close.
    relays: HashMap<SocketAddr, Arc<UdpSocket>>,
    replies: JoinSet<()>,
}

impl RelayTable {
    fn new(engine: SocketAddr, limit: usize, max_datagram_size: usize) -> Self {
        let bind: SocketAddr = if engine.is_ipv6() {
            (Ipv6Addr::LOCALHOST, 0).into()
        } else {
            (Ipv4Addr::LOCALHOST, 0).into()
        };
        Self {
            engine,
            bind,
            limit,
            max_datagram_size,
            relays: HashMap::new(),
            replies: JoinSet::new(),
        }
    }

    /// The relay for `peer`, bound (with its reply task) on first use.
    /// `None` when the table is full.
    async fn relay_for(
        &mut self,
        peer: SocketAddr,
        external: &Arc<UdpSocket>,
    ) -> std::io::Result<Option<Arc<UdpSocket>>> {
        if let Some(relay) = self.relays.get(&peer) {
            return Ok(Some(Arc::clone(relay)));
        }
        if self.relays.len() >= self.limit {
            return Ok(None);
        }
        let relay = Arc::new(UdpSocket::bind(self.bind).await?);
        tracing::debug!(%peer, relay = ?relay.local_addr().ok(), "relay opened");
        self.replies.spawn(relay_replies(
            Arc::clone(&relay),
            Arc::clone(external),
            peer,
            self.engine,
            self.max_datagram_size,
        ));
        self.relays.insert(peer, Arc::clone(&relay));
        Ok(Some(relay))
    }

    async fn forward(&mut self, data: &[u8], peer: SocketAddr, external: &Arc<UdpSocket>) {
        let relay = match self.relay_for(peer, external).await {
            Ok(Some(relay)) => relay,
            Ok(None) => {
                tracing::debug!(%peer, limit = self.limit, "relay table full, dropping datagram");
                return;
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "failed to open relay");
                return;
            }
        };
        if let Err(e) = relay.send_to(data, self.engine).await {
            tracing::warn!(to = %self.engine, %peer, error = %e, "loopback relay failed");
        }
    }
}

/// Sends what the engine addresses to `relay` out of the shared port to `peer`.
async fn relay_replies(
    relay: Arc<UdpSocket>,
    external: Arc<UdpSocket>,
    peer: SocketAddr,
    engine: SocketAddr,
    max_datagram_size: usize,
) {
    let mut buf = vec![0u8; max_datagram_size];
    let mut backoff = RecvBackoff::default();
    loop {
        let (n, from) = match relay.recv_from(&mut buf).await {
            Ok(received) => {
                backoff.reset();
                received
            }
            Err(e) => {
                backoff.failed("relay", &e).await;
                continue;
            }
        };
        if from != engine {
            tracing::trace!(%from, %peer, "relay datagram not from the engine, ignoring");
            continue;
        }
        if let Err(e) = external.send_to(&buf[..n], peer).await {
            tracing::warn!(%peer, error = %e, "relay reply failed");
        }
    }
}

/// A UDP port shared between the engine and another protocol.
pub struct Demux {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    other: mpsc::Receiver<Datagram>,
    endpoint: Option<DemuxEndpoint>,
    task: JoinHandle<()>,
}

impl Demux {
    /// Binds the external socket and starts routing.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        route: EngineRoute,
        config: DemuxConfig,
    ) -> Result<Self, TransportError> {
        let config = config.validated();
        let socket = Arc::new(UdpSocket::bind(addr).await.map_err(TransportError::Bind)?);
        let local_addr = socket.local_addr().map_err(TransportError::Bind)?;

        let (other_tx, other) = mpsc::channel(config.other_channel_capacity);
        let (target, endpoint) = match route {
            EngineRoute::Loopback(to) => (
                EngineTarget::Relay(RelayTable::new(
                    to,
                    config.max_relays,
                    config.max_datagram_size,
                )),
                None,
            ),
            EngineRoute::Endpoint => {
                let (tx, rx) = mpsc::channel(config.engine_channel_capacity);
                let endpoint = DemuxEndpoint {
                    rx,
                    socket: Arc::clone(&socket),
                    local_addr,
                };
                (EngineTarget::Channel(tx), Some(endpoint))
            }
        };

        let task = tokio::spawn(route_datagrams(
            Arc::clone(&socket),
            target,
            other_tx,
            config.max_datagram_size,
        ));
        tracing::info!(addr = %local_addr, ?route, "demux listening");

        Ok(Self {
            socket,
            local_addr,
            other,
            endpoint,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Takes the in-process engine endpoint. `None` for the loopback route
    /// or once taken.
    pub fn engine_endpoint(&mut self) -> Option<DemuxEndpoint> {
        self.endpoint.take()
    }

    /// The next datagram of other traffic; `None` once routing stopped.
    pub async fn recv(&mut self) -> Option<Datagram> {
        self.other.recv().await
    }

    /// Sends a datagram from the shared port.
    pub async fn send_to(&self, data: &[u8], to: SocketAddr) -> Result<usize, TransportError> {
        self.socket
            .send_to(data, to)
            .await
            .map_err(TransportError::SendFailed)
    }

    /// Stops routing. Idempotent.
    pub fn close(&self) {
        if !self.task.is_finished() {
            self.task.abort();
            tracing::info!(addr = %self.local_addr, "demux closed");
        }
    }
}

impl Drop for Demux {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn route_datagrams(
    socket: Arc<UdpSocket>,
    mut target: EngineTarget,
    other: mpsc::Sender<Datagram>,
    max_datagram_size: usize,
) {
    let mut buf = vec![0u8; max_datagram_size];
    let mut backoff = RecvBackoff::default();
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => {
                backoff.reset();
                received
            }
            Err(e) => {
                backoff.failed("demux", &e).await;
                continue;
            }
        };
        let data = &buf[..n];
        let traffic = classify(data);
        tracing::trace!(%from, len = n, %traffic, "demux datagram");

        match (traffic, &mut target) {
            (Traffic::Engine, EngineTarget::Relay(relays)) => {
                relays.forward(data, from, &socket).await;
            }
            (Traffic::Engine, EngineTarget::Channel(tx)) => {
                forward(tx, Datagram::new(Bytes::copy_from_slice(data), from), traffic);
            }
            (Traffic::Other, _) => {
                forward(&other, Datagram::new(Bytes::copy_from_slice(data), from), traffic);
            }
        }
    }
}

fn forward(tx: &mpsc::Sender<Datagram>, datagram: Datagram, traffic: Traffic) {
    match tx.try_send(datagram) {
        Ok(()) => {}
        Err(TrySendError::Full(d)) => {
            tracing::debug!(from = %d.from, %traffic, "channel full, dropping datagram")
        }
        Err(TrySendError::Closed(d)) => {
            tracing::trace!(from = %d.from, %traffic, "no receiver, dropping datagram")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validated_clamps() {
        let cfg = DemuxConfig {
            max_datagram_size: 10,
            other_channel_capacity: 0,
            engine_channel_capacity: 0,
            max_relays: 0,
        }
        .validated();
        assert_eq!(cfg.max_datagram_size, 1500);
        assert_eq!(cfg.other_channel_capacity, 1);
        assert_eq!(cfg.engine_channel_capacity, 1);
        assert_eq!(cfg.max_relays, 1);
    }

    #[test]
    fn test_route_serde() {
        let route = EngineRoute::Loopback("127.0.0.1:9000".parse().unwrap());
        let json = serde_json::to_string(&route).unwrap();
        let back: EngineRoute = serde_json::from_str(&json).unwrap();
        assert_eq!(back, route);
    }
}
