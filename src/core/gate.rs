//! Consistency gate between the mutators and the snapshot publisher.
//!
//! Every component that mutates shared aggregates (aggregation workers, the
//! sweeper, the registry, the metrics engine) holds an `update` guard for the
//! duration of one logical mutation. The publisher takes the `freeze` guard
//! while it copies state, so a snapshot never observes half of a mutation,
//! e.g. a connection evicted but not yet rolled into its device.
//!
//! Update guards are shared, so mutators do not serialize against each other;
//! per-entry locking is left to the DashMaps. The gate is never acquired
//! re-entrantly: only the outermost public entry point of a component takes it.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub struct StateGate {
    lock: RwLock<()>,
}

impl StateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared guard for one logical mutation.
    pub fn update(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Exclusive guard: no mutation is in progress while it is held.
    pub fn freeze(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_updates_share_the_gate() {
        let gate = StateGate::new();
        let _a = gate.update();
        let _b = gate.update();
    }

    #[test]
    fn test_freeze_waits_for_update_to_finish() {
        let gate = Arc::new(StateGate::new());
        let (tx, rx) = mpsc::channel();

        let update = gate.update();
        let handle = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || {
                let _frozen = gate.freeze();
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(update);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        handle.join().unwrap();
    }
}
