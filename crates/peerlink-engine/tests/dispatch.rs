//! Registry identity and handler routing, driven through `ScriptedEngine`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use peerlink_engine::testing::{Call, ScriptedEngine};
use peerlink_engine::{
    Callback, Context, Engine, EngineError, ErrorCode, NativeSocket, SocketHandle, SocketState,
};
use peerlink_protocol::EndpointAddress;

fn addr(port: u16) -> EndpointAddress {
    EndpointAddress::parse("10.1.2.3", port).unwrap()
}

// =========================================================================
// Identity
// =========================================================================

#[test]
fn test_repeated_callbacks_resolve_same_wrapper() {
    let engine = ScriptedEngine::new();
    let ctx = engine.init().unwrap();
    let sock = engine.create_socket(ctx).unwrap();

    let first = NativeSocket::lookup(sock).unwrap();
    let again = NativeSocket::resolve(sock, ctx);
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(first.context(), ctx);

    let c1 = Context::lookup(ctx).unwrap();
    let c2 = Context::resolve(ctx);
    assert!(Arc::ptr_eq(&c1, &c2));
    engine.destroy(ctx).unwrap();
}

#[test]
fn test_accepted_socket_is_registered_lazily() {
    let engine = ScriptedEngine::new();
    let ctx = engine.init().unwrap();
    let seen = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&seen);
    Context::lookup(ctx)
        .unwrap()
        .on_accept(move |socket, peer| *slot.lock() = Some((socket.handle(), peer)));

    let sock = engine.accept(ctx, addr(7777));
    let (handle, peer) = seen.lock().clone().unwrap();
    assert_eq!(handle, sock);
    assert_eq!(peer, addr(7777));
    assert!(NativeSocket::is_live(sock));
    engine.destroy(ctx).unwrap();
}

// =========================================================================
// Lifecycle
// =========================================================================

#[test]
fn test_double_destroy_is_reported() {
    let engine = ScriptedEngine::new();
    let ctx = engine.init().unwrap();
    engine.destroy(ctx).unwrap();
    assert!(matches!(
        engine.destroy(ctx),
        Err(EngineError::ContextDestroyed(c)) if c == ctx
    ));
}

#[test]
fn test_destroy_releases_context_sockets() {
    let engine = ScriptedEngine::new();
    let ctx = engine.init().unwrap();
    let a = engine.create_socket(ctx).unwrap();
    let b = engine.create_socket(ctx).unwrap();
    engine.destroy(ctx).unwrap();

    assert!(!NativeSocket::is_live(a));
    assert!(!NativeSocket::is_live(b));
    assert!(matches!(
        engine.write(a, b"x"),
        Err(EngineError::UnknownSocket(s)) if s == a
    ));
    assert!(matches!(
        engine.create_socket(ctx),
        Err(EngineError::ContextDestroyed(_))
    ));
}

#[test]
fn test_destroying_releases_socket() {
    let engine = ScriptedEngine::new();
    let ctx = engine.init().unwrap();
    let sock = engine.create_socket(ctx).unwrap();
    engine.state_change(sock, SocketState::Destroying);
    assert!(NativeSocket::lookup(sock).is_none());
    engine.destroy(ctx).unwrap();
}

// =========================================================================
// Routing
// =========================================================================

#[test]
fn test_socket_handlers_receive_their_callbacks() {
    let engine = ScriptedEngine::new();
    let ctx = engine.init().unwrap();
    let sock = engine.create_socket(ctx).unwrap();
    let native = NativeSocket::lookup(sock).unwrap();

    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let l = Arc::clone(&log);
    native.on_read(move |data| l.lock().push(format!("read:{}", String::from_utf8_lossy(data))));
    let l = Arc::clone(&log);
    native.on_state_change(move |state| l.lock().push(format!("state:{state:?}")));
    let l = Arc::clone(&log);
    native.on_error(move |code| l.lock().push(format!("error:{code:?}")));
    native.on_read_buffer_size(|| 42);

    engine.state_change(sock, SocketState::Connect);
    engine.read(sock, b"abc");
    engine.error(sock, ErrorCode::TimedOut);
    assert_eq!(engine.read_buffer_size(sock), 42);

    assert_eq!(
        *log.lock(),
        vec!["state:Connect", "read:abc", "error:TimedOut"]
    );
    engine.destroy(ctx).unwrap();
}

#[test]
fn test_sendto_prefers_socket_handler() {
    let engine = ScriptedEngine::new();
    let ctx = engine.init().unwrap();
    let sock = engine.create_socket(ctx).unwrap();

    let by_context = Arc::new(AtomicUsize::new(0));
    let by_socket = Arc::new(AtomicUsize::new(0));
    let n = Arc::clone(&by_context);
    Context::lookup(ctx).unwrap().on_sendto(move |_, _, _, _| {
        n.fetch_add(1, Ordering::SeqCst);
    });
    let n = Arc::clone(&by_socket);
    NativeSocket::lookup(sock).unwrap().on_sendto(move |s, _, _, _| {
        assert_eq!(s, Some(sock));
        n.fetch_add(1, Ordering::SeqCst);
    });

    engine.send_to(ctx, Some(sock), b"data", addr(1));
    engine.send_to(ctx, None, b"data", addr(1));
    assert_eq!(by_socket.load(Ordering::SeqCst), 1);
    assert_eq!(by_context.load(Ordering::SeqCst), 1);
    engine.destroy(ctx).unwrap();
}

#[test]
fn test_log_falls_back_to_context_handler() {
    let engine = ScriptedEngine::new();
    let ctx = engine.init().unwrap();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&lines);
    Context::lookup(ctx)
        .unwrap()
        .on_log(move |line| l.lock().push(line.to_string()));

    engine.fire(
        ctx,
        Callback::Log {
            socket: Some(SocketHandle::new(0xdead_0000)),
            message: "mtu discovery".into(),
        },
    );
    assert_eq!(*lines.lock(), vec!["mtu discovery".to_string()]);
    engine.destroy(ctx).unwrap();
}

#[test]
fn test_scripted_engine_records_calls() {
    let engine = ScriptedEngine::new();
    let ctx = engine.init().unwrap();
    let sock = engine.create_socket(ctx).unwrap();
    engine.connect(sock, &addr(9)).unwrap();
    engine.set_write_budget(sock, 2);
    assert_eq!(engine.write(sock, b"xyz").unwrap(), 2);
    assert_eq!(engine.write(sock, b"z").unwrap(), 0);

    assert_eq!(
        engine.calls(),
        vec![
            Call::Init(ctx),
            Call::CreateSocket(ctx, sock),
            Call::Connect(sock, addr(9)),
            Call::Write(sock, b"xy".to_vec()),
        ]
    );
    engine.destroy(ctx).unwrap();
}
