//! # Peerlink
//!
//! Peer-to-peer uTP connectivity from async Rust.
//!
//! Peerlink drives a native uTP engine (libutp) from a tokio runtime: the
//! engine owns congestion control and retransmission, peerlink owns the
//! UDP socket, the timeout ticks, and the stream surface. A node can share
//! its UDP port with another datagram protocol.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peerlink::prelude::*;
//!
//! // peerlink::init_tracing();
//! // let mut node = PeerNode::builder()
//! //     .bind("0.0.0.0:7400".parse()?)
//! //     .start()
//! //     .await?;
//! // let stream = node.accept().await?;
//! ```

mod error;
mod node;

pub use error::PeerlinkError;
pub use node::{NodeConfig, PeerNode, PeerNodeBuilder};

pub use peerlink_engine as engine;
pub use peerlink_protocol as protocol;
pub use peerlink_tick as tick;
pub use peerlink_transport as transport;

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub mod prelude {
    pub use crate::{NodeConfig, PeerNode, PeerNodeBuilder, PeerlinkError};
    pub use peerlink_engine::{Engine, NativeEngine};
    pub use peerlink_protocol::EndpointAddress;
    pub use peerlink_tick::TickConfig;
    pub use peerlink_transport::{
        Connection, Datagram, DemuxConfig, ServerConfig, StreamEvent, StreamPhase, Transport,
        UtpServer, UtpStream,
    };
}
