//! Stream adapter behavior, driven through the scripted engine.
//!
//! Callbacks fired with `ScriptedEngine` take the same dispatch path as the
//! native trampolines, so these tests exercise the real registry and
//! handler wiring.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use peerlink_engine::testing::{Call, ScriptedEngine};
use peerlink_engine::{Engine, ErrorCode, NativeSocket, SocketHandle, SocketState};
use peerlink_protocol::EndpointAddress;
use peerlink_transport::{
    Connection, EngineGate, StreamEvent, StreamPhase, TransportError, UtpStream,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// =========================================================================
// Helpers
// =========================================================================

fn setup() -> (Arc<ScriptedEngine>, UtpStream) {
    setup_with(ScriptedEngine::new())
}

fn setup_with(engine: ScriptedEngine) -> (Arc<ScriptedEngine>, UtpStream) {
    let engine = Arc::new(engine);
    let gate = EngineGate::new(engine.clone());
    let ctx = engine.init().unwrap();
    let sock = engine.create_socket(ctx).unwrap();
    let native = NativeSocket::lookup(sock).unwrap();
    let remote = EndpointAddress::parse("192.168.1.20", 6881).unwrap();
    let stream = UtpStream::attach(gate, &native, remote);
    (engine, stream)
}

fn closes(engine: &ScriptedEngine, sock: SocketHandle) -> usize {
    engine.count(|c| *c == Call::Close(sock))
}

fn drains(engine: &ScriptedEngine, sock: SocketHandle) -> usize {
    engine.count(|c| *c == Call::ReadDrained(sock))
}

fn drain_events(stream: &UtpStream) -> Vec<StreamEvent> {
    std::iter::from_fn(|| stream.try_next_event()).collect()
}

// =========================================================================
// State changes
// =========================================================================

#[tokio::test]
async fn test_connect_makes_stream_readable() {
    let (engine, stream) = setup();
    engine.state_change(stream.socket(), SocketState::Connect);

    assert_eq!(stream.next_event().await, Some(StreamEvent::Connect));
    assert!(stream.is_readable());
    assert_eq!(stream.phase(), StreamPhase::Readable);
}

#[tokio::test]
async fn test_writable_emits_drain() {
    let (engine, stream) = setup();
    engine.state_change(stream.socket(), SocketState::Writable);
    assert_eq!(stream.next_event().await, Some(StreamEvent::Drain));
}

#[tokio::test]
async fn test_eof_ends_then_closes() {
    let (engine, stream) = setup();
    let sock = stream.socket();
    engine.state_change(sock, SocketState::Connect);
    engine.read(sock, b"last words");
    engine.state_change(sock, SocketState::Eof);

    assert_eq!(
        drain_events(&stream),
        vec![
            StreamEvent::Connect,
            StreamEvent::End,
            StreamEvent::Close { had_error: false },
        ]
    );
    assert!(!stream.is_readable());
    assert!(stream.is_destroyed());
    assert_eq!(closes(&engine, sock), 1);

    // Bytes queued before EOF are still delivered, then end of stream.
    assert_eq!(stream.recv().await.unwrap(), Some(b"last words".to_vec()));
    assert_eq!(stream.recv().await.unwrap(), None);
    assert_eq!(stream.next_event().await, None);
}

#[tokio::test]
async fn test_destroying_closes_without_native_close() {
    let (engine, stream) = setup();
    let sock = stream.socket();
    engine.state_change(sock, SocketState::Destroying);

    assert_eq!(
        drain_events(&stream),
        vec![StreamEvent::Close { had_error: false }]
    );
    assert_eq!(closes(&engine, sock), 0);
    assert!(stream.is_closed());
    assert_eq!(stream.phase(), StreamPhase::Closed);
    assert!(!NativeSocket::is_live(sock));

    // Destroying an already-released stream does not touch the engine.
    stream.destroy();
    assert_eq!(closes(&engine, sock), 0);
}

#[tokio::test]
async fn test_error_emits_error_then_close() {
    let (engine, stream) = setup();
    let sock = stream.socket();
    engine.error(sock, ErrorCode::ConnectionReset);

    let events = drain_events(&stream);
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0],
        StreamEvent::Error { kind: ErrorKind::ConnectionReset, .. }
    ));
    assert_eq!(events[1], StreamEvent::Close { had_error: true });
    assert!(stream.is_closed());
    assert_eq!(closes(&engine, sock), 1);

    let err = stream.recv().await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectionLost(e) if e.kind() == ErrorKind::ConnectionReset));
}

// =========================================================================
// Destroy
// =========================================================================

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let (engine, stream) = setup();
    let sock = stream.socket();
    stream.destroy();
    stream.destroy();
    stream.end();

    assert_eq!(closes(&engine, sock), 1);
    assert_eq!(
        drain_events(&stream),
        vec![StreamEvent::Close { had_error: false }]
    );
}

#[tokio::test]
async fn test_close_reported_once_when_engine_destroys_synchronously() {
    let (engine, stream) = setup_with(ScriptedEngine::destroying_on_close());
    let sock = stream.socket();
    stream.destroy();

    assert_eq!(closes(&engine, sock), 1);
    assert_eq!(
        drain_events(&stream),
        vec![StreamEvent::Close { had_error: false }]
    );
    assert!(!NativeSocket::is_live(sock));
}

#[tokio::test]
async fn test_reads_after_destroy_are_dropped() {
    let (engine, stream) = setup();
    let sock = stream.socket();
    stream.destroy();
    engine.read(sock, b"late");
    assert_eq!(stream.buffered_len(), 0);
    assert_eq!(stream.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_drop_destroys() {
    let (engine, stream) = setup();
    let sock = stream.socket();
    drop(stream);
    assert_eq!(closes(&engine, sock), 1);
}

// =========================================================================
// Read path and backpressure
// =========================================================================

#[tokio::test]
async fn test_read_buffer_size_tracks_unread_bytes() {
    let (engine, stream) = setup();
    let sock = stream.socket();
    engine.read(sock, b"abc");
    engine.read(sock, b"defgh");

    assert_eq!(engine.read_buffer_size(sock), 8);
    assert_eq!(stream.buffered_len(), 8);

    assert_eq!(stream.read_chunk().await.unwrap().unwrap().as_ref(), b"abc");
    assert_eq!(engine.read_buffer_size(sock), 5);
    assert_eq!(stream.read_chunk().await.unwrap().unwrap().as_ref(), b"defgh");
    assert_eq!(engine.read_buffer_size(sock), 0);
}

#[tokio::test]
async fn test_async_read_to_end() {
    let (engine, mut stream) = setup();
    let sock = stream.socket();
    engine.state_change(sock, SocketState::Connect);
    engine.read(sock, b"hello ");
    engine.read(sock, b"world");
    engine.state_change(sock, SocketState::Eof);

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"hello world");
    assert_eq!(stream.buffered_len(), 0);
}

#[tokio::test]
async fn test_partial_async_read_keeps_remainder() {
    let (engine, mut stream) = setup();
    let sock = stream.socket();
    engine.read(sock, b"0123456789");

    let mut small = [0u8; 4];
    stream.read_exact(&mut small).await.unwrap();
    assert_eq!(&small, b"0123");
    assert_eq!(engine.read_buffer_size(sock), 6);

    let rest = stream.read_chunk().await.unwrap().unwrap();
    assert_eq!(rest.as_ref(), b"456789");
}

// =========================================================================
// Write path
// =========================================================================

#[tokio::test]
async fn test_write_passes_bytes_to_engine() {
    let (engine, stream) = setup();
    stream.send(b"ping").await.unwrap();
    assert_eq!(engine.written(stream.socket()), b"ping");
}

#[tokio::test]
async fn test_write_waits_for_window() {
    let (engine, stream) = setup();
    let stream = Arc::new(stream);
    let sock = stream.socket();
    engine.set_write_budget(sock, 3);

    let writer = {
        let stream = Arc::clone(&stream);
        tokio::spawn(async move { stream.write(b"hello").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(engine.written(sock), b"hel");
    assert!(!writer.is_finished());

    engine.clear_write_budget(sock);
    engine.state_change(sock, SocketState::Writable);
    tokio::time::timeout(Duration::from_secs(1), writer)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(engine.written(sock), b"hello");
}

#[tokio::test]
async fn test_blocked_write_fails_on_destroy() {
    let (engine, stream) = setup();
    let stream = Arc::new(stream);
    let sock = stream.socket();
    engine.set_write_budget(sock, 0);

    let writer = {
        let stream = Arc::clone(&stream);
        tokio::spawn(async move { stream.write(b"never").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.destroy();

    let result = tokio::time::timeout(Duration::from_secs(1), writer)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(TransportError::StreamDestroyed(id)) if id == stream.id()));
}

#[tokio::test]
async fn test_async_write_all() {
    let (engine, mut stream) = setup();
    stream.write_all(b"via AsyncWrite").await.unwrap();
    stream.flush().await.unwrap();
    assert_eq!(engine.written(stream.socket()), b"via AsyncWrite");
}

// =========================================================================
// read_drained
// =========================================================================

#[tokio::test]
async fn test_sink_sends_read_drained_once() {
    let (engine, stream) = setup();
    let sock = stream.socket();
    let chunks = futures_util::stream::iter(vec![b"a".to_vec(), b"bc".to_vec()]);

    stream.sink(chunks).await.unwrap();
    assert_eq!(engine.written(sock), b"abc");
    assert_eq!(drains(&engine, sock), 1);

    stream.destroy();
    assert_eq!(drains(&engine, sock), 1);
}

#[tokio::test]
async fn test_destroy_sends_read_drained_once() {
    let (engine, stream) = setup();
    let sock = stream.socket();
    stream.destroy();
    stream.destroy();
    assert_eq!(drains(&engine, sock), 1);
}

// =========================================================================
// Misc
// =========================================================================

#[tokio::test]
async fn test_set_timeout() {
    let (_engine, stream) = setup();
    assert!(stream.set_timeout(None).is_ok());
    assert!(matches!(
        stream.set_timeout(Some(Duration::from_secs(5))),
        Err(TransportError::TimeoutUnsupported)
    ));
}

#[tokio::test]
async fn test_shutdown_write_reaches_engine() {
    let (engine, stream) = setup();
    let sock = stream.socket();
    stream.shutdown_write();
    assert!(engine.calls().contains(&Call::Shutdown(sock, peerlink_engine::Shutdown::Write)));
    assert!(!stream.is_destroyed());
}

#[tokio::test]
async fn test_connection_close_destroys() {
    let (engine, stream) = setup();
    Connection::close(&stream).await.unwrap();
    assert!(stream.is_destroyed());
    assert_eq!(closes(&engine, stream.socket()), 1);
}
