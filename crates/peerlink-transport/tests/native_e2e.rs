//! End-to-end over the real engine library.
//!
//! Ignored by default because it needs libutp. Run it with
//!
//! ```text
//! PEERLINK_UTP_LIBRARY=/path/to/libutp.so cargo test -p peerlink-transport -- --ignored
//! ```
//!
//! Once asked for, a missing library is a failure, not a skip.

use std::sync::Arc;
use std::time::Duration;

use peerlink_engine::{LIBRARY_ENV, NativeEngine};
use peerlink_protocol::EndpointAddress;
use peerlink_tick::TickConfig;
use peerlink_transport::{
    Connection, EngineGate, ServerConfig, StreamEvent, Transport, UtpServer,
};

fn engine() -> NativeEngine {
    match NativeEngine::load() {
        Ok(engine) => engine,
        Err(e) => panic!("libutp not loadable (set {LIBRARY_ENV}): {e}"),
    }
}

fn config() -> ServerConfig {
    ServerConfig {
        tick: TickConfig::with_interval(Duration::from_millis(50)),
        ..Default::default()
    }
}

#[tokio::test]
#[ignore = "needs libutp; set PEERLINK_UTP_LIBRARY and pass --ignored"]
async fn test_hello_between_two_servers() {
    let gate = EngineGate::new(Arc::new(engine()));

    let mut a = UtpServer::new(Arc::clone(&gate), config());
    let b = UtpServer::new(Arc::clone(&gate), config());
    let a_addr = a.listen("127.0.0.1:0").await.unwrap();
    let b_addr = b.listen("127.0.0.1:0").await.unwrap();

    let outbound = b.connect(&EndpointAddress::from(a_addr)).unwrap();
    let inbound = tokio::time::timeout(Duration::from_secs(5), a.accept())
        .await
        .expect("accepted in time")
        .unwrap();
    assert_eq!(inbound.remote_host(), b_addr.ip().to_string());
    assert_eq!(inbound.remote_port(), b_addr.port());

    outbound.send(b"hello").await.unwrap();
    let mut got = Vec::new();
    while got.len() < 5 {
        let chunk = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("data in time")
            .unwrap()
            .expect("stream still open");
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, b"hello");

    outbound.end();
    let mut events = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(5), inbound.next_event()).await
    {
        let done = matches!(event, StreamEvent::Close { .. });
        events.push(event);
        if done {
            break;
        }
    }
    let end = events.iter().position(|e| *e == StreamEvent::End);
    let close = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Close { .. }));
    assert!(end.is_some(), "no End before Close: {events:?}");
    assert!(close.is_some(), "no Close: {events:?}");
    assert!(end < close, "End after Close: {events:?}");

    a.close();
    b.close();
}
