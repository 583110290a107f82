//! Serialized access to the engine.

use std::fmt;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use peerlink_engine::Engine;

/// The only way into the engine.
///
/// The engine must never be entered from two threads at once. Callbacks run
/// synchronously inside engine calls and often call back in (an EOF destroys
/// the stream, which closes the socket, which reports `Destroying`), so the
/// lock is reentrant on the owning thread.
///
/// Never hold the gate across an `.await`, and never take it while holding a
/// lock that a callback handler also takes.
pub struct EngineGate {
    engine: Arc<dyn Engine>,
    lock: ReentrantMutex<()>,
}

impl EngineGate {
    pub fn new(engine: Arc<dyn Engine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            lock: ReentrantMutex::new(()),
        })
    }

    /// Runs `f` with exclusive access to the engine.
    pub fn with<R>(&self, f: impl FnOnce(&dyn Engine) -> R) -> R {
        let _entered = self.lock.lock();
        f(&*self.engine)
    }
}

impl fmt::Debug for EngineGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineGate")
            .field("held", &self.lock.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use peerlink_engine::testing::{Call, ScriptedEngine};

    use super::*;

    #[test]
    fn test_gate_is_reentrant_on_one_thread() {
        let engine = Arc::new(ScriptedEngine::new());
        let gate = EngineGate::new(engine.clone());
        let ctx = gate.with(|e| {
            let ctx = e.init().unwrap();
            // Nested entry, as a callback handler would do.
            gate.with(|e| e.check_timeouts(ctx));
            ctx
        });
        assert_eq!(
            engine.calls(),
            vec![Call::Init(ctx), Call::CheckTimeouts(ctx)]
        );
        gate.with(|e| e.destroy(ctx)).unwrap();
    }

    #[test]
    fn test_gate_serializes_threads() {
        let engine = Arc::new(ScriptedEngine::new());
        let gate = EngineGate::new(engine.clone());
        let ctx = gate.with(|e| e.init()).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        gate.with(|e| e.issue_deferred_acks(ctx));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(engine.count(|c| matches!(c, Call::IssueDeferredAcks(_))), 100);
        gate.with(|e| e.destroy(ctx)).unwrap();
    }
}
