//! Echo over uTP.
//!
//! ```text
//! utp-echo listen 0.0.0.0:7400
//! utp-echo connect 127.0.0.1:7400 "hello"
//! ```
//!
//! Needs libutp; set `PEERLINK_UTP_LIBRARY` if it is not on the loader path.

use std::net::SocketAddr;
use std::time::Duration;

use peerlink::prelude::*;

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

async fn listen(bind: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut node = PeerNode::builder().bind(bind).start().await?;
    eprintln!("echoing on {}", node.local_addr()?);

    loop {
        let stream = node.accept().await?;
        tokio::spawn(async move {
            let peer = stream.remote_addr().clone();
            tracing::info!(%peer, "peer connected");
            loop {
                match stream.read_chunk().await {
                    Ok(Some(chunk)) => {
                        if let Err(e) = stream.write(&chunk).await {
                            tracing::warn!(%peer, error = %e, "echo failed");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "read failed");
                        break;
                    }
                }
            }
            tracing::info!(%peer, "peer gone");
        });
    }
}

async fn connect(peer: SocketAddr, message: String) -> Result<(), Box<dyn std::error::Error>> {
    let node = PeerNode::builder().start().await?;
    let stream = node.connect(&EndpointAddress::from(peer))?;

    stream.write(message.as_bytes()).await?;
    let mut echoed = Vec::new();
    while echoed.len() < message.len() {
        let chunk = tokio::time::timeout(Duration::from_secs(10), stream.read_chunk()).await?;
        match chunk? {
            Some(chunk) => echoed.extend_from_slice(&chunk),
            None => break,
        }
    }
    println!("{}", String::from_utf8_lossy(&echoed));

    stream.end();
    node.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    peerlink::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [mode, bind] if mode == "listen" => listen(bind.parse()?).await,
        [mode, peer, message] if mode == "connect" => {
            connect(peer.parse()?, message.clone()).await
        }
        _ => {
            eprintln!("usage: utp-echo listen <addr> | utp-echo connect <addr> <message>");
            std::process::exit(2);
        }
    }
}
