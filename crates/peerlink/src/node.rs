//! `PeerNode` builder and wiring.
//!
//! A node is one uTP server, optionally sharing its UDP port with another
//! protocol through a [`Demux`]. It ties the layers together:
//! engine → gate → server (→ demux).

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use peerlink_engine::{Engine, NativeEngine};
use peerlink_protocol::EndpointAddress;
use peerlink_transport::{
    Datagram, Demux, DemuxConfig, EngineGate, EngineRoute, ServerConfig, Transport, UtpServer,
    UtpStream,
};
use serde::{Deserialize, Serialize};

use crate::PeerlinkError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything needed to start a [`PeerNode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// UDP address to bind. Port 0 picks an ephemeral port.
    pub bind: SocketAddr,
    /// Share the port with other traffic through a demultiplexer.
    pub shared_port: bool,
    /// Engine library to load instead of the platform default.
    pub library_path: Option<PathBuf>,
    pub server: ServerConfig,
    pub demux: DemuxConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: (Ipv4Addr::UNSPECIFIED, 0).into(),
            shared_port: false,
            library_path: None,
            server: ServerConfig::default(),
            demux: DemuxConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Clamp out-of-range values in every section.
    pub fn validated(mut self) -> Self {
        self.server = self.server.validated();
        self.demux = self.demux.validated();
        self
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for configuring and starting a [`PeerNode`].
///
/// # Example
///
/// ```rust,ignore
/// use peerlink::prelude::*;
///
/// let mut node = PeerNode::builder()
///     .bind("0.0.0.0:7400".parse()?)
///     .shared_port(true)
///     .start()
///     .await?;
/// let stream = node.accept().await?;
/// ```
pub struct PeerNodeBuilder {
    config: NodeConfig,
    engine: Option<Arc<dyn Engine>>,
}

impl PeerNodeBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            engine: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the UDP address to bind.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.bind = addr;
        self
    }

    /// Shares the port with other traffic.
    pub fn shared_port(mut self, shared: bool) -> Self {
        self.config.shared_port = shared;
        self
    }

    /// Loads the engine library from `path`.
    pub fn library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.library_path = Some(path.into());
        self
    }

    /// Sets the server configuration.
    pub fn server_config(mut self, config: ServerConfig) -> Self {
        self.config.server = config;
        self
    }

    /// Sets the demultiplexer configuration.
    pub fn demux_config(mut self, config: DemuxConfig) -> Self {
        self.config.demux = config;
        self
    }

    /// Uses `engine` instead of loading the native library.
    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Loads the engine (unless one was given), binds, and starts listening.
    pub async fn start(self) -> Result<PeerNode, PeerlinkError> {
        let config = self.config.validated();
        let engine: Arc<dyn Engine> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(match &config.library_path {
                Some(path) => NativeEngine::load_from(path)?,
                None => NativeEngine::load()?,
            }),
        };
        let gate = EngineGate::new(engine);
        let server = UtpServer::new(Arc::clone(&gate), config.server.clone());

        let demux = if config.shared_port {
            let mut demux =
                Demux::bind(config.bind, EngineRoute::Endpoint, config.demux.clone()).await?;
            if let Some(endpoint) = demux.engine_endpoint() {
                server.listen_shared(endpoint)?;
            }
            Some(demux)
        } else {
            server.listen(config.bind).await?;
            None
        };

        let local_addr = server.local_addr()?;
        tracing::info!(addr = %local_addr, shared = config.shared_port, "peer node started");

        Ok(PeerNode {
            server,
            demux,
            gate,
            config,
        })
    }
}

impl Default for PeerNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A running peer: a listening uTP server, plus a demultiplexer when the
/// port is shared.
pub struct PeerNode {
    server: UtpServer,
    demux: Option<Demux>,
    gate: Arc<EngineGate>,
    config: NodeConfig,
}

impl PeerNode {
    /// Creates a new builder.
    pub fn builder() -> PeerNodeBuilder {
        PeerNodeBuilder::new()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The engine gate shared by every server of this node.
    pub fn gate(&self) -> &Arc<EngineGate> {
        &self.gate
    }

    pub fn server(&self) -> &UtpServer {
        &self.server
    }

    /// The UDP address peers reach this node at.
    pub fn local_addr(&self) -> Result<SocketAddr, PeerlinkError> {
        match &self.demux {
            Some(demux) => Ok(demux.local_addr()),
            None => Ok(self.server.local_addr()?),
        }
    }

    /// Opens a uTP stream to `peer`.
    pub fn connect(&self, peer: &EndpointAddress) -> Result<UtpStream, PeerlinkError> {
        Ok(self.server.connect(peer)?)
    }

    /// Waits for the next inbound uTP stream.
    pub async fn accept(&mut self) -> Result<UtpStream, PeerlinkError> {
        Ok(self.server.accept().await?)
    }

    /// The next datagram of non-uTP traffic on a shared port. `None` when
    /// the port is not shared or routing stopped.
    pub async fn recv_other(&mut self) -> Option<Datagram> {
        match &mut self.demux {
            Some(demux) => demux.recv().await,
            None => None,
        }
    }

    /// Sends non-uTP traffic from the shared port.
    pub async fn send_other(&self, data: &[u8], to: SocketAddr) -> Result<usize, PeerlinkError> {
        match &self.demux {
            Some(demux) => Ok(demux.send_to(data, to).await?),
            None => Err(peerlink_transport::TransportError::NotListening.into()),
        }
    }

    /// Closes the server, then the demultiplexer. Idempotent.
    pub fn close(&self) {
        self.server.close();
        if let Some(demux) = &self.demux {
            demux.close();
        }
    }
}
