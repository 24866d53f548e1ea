//! Cooperative pause/cancel signalling.
//!
//! Signals are checked at iteration and phase boundaries only — an
//! in-flight provider call is never preempted. Cancel wins over pause
//! when both are set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Pause/cancel flags for one run, cheaply cloneable.
#[derive(Debug, Clone, Default)]
pub struct RunSignals {
    pause: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl RunSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::Relaxed);
    }

    pub fn clear_pause(&self) {
        self.pause.store(false, Ordering::Relaxed);
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::Relaxed)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Per-run signal registry owned by the orchestrator.
#[derive(Default)]
pub(crate) struct SignalRegistry {
    inner: Mutex<HashMap<String, RunSignals>>,
}

impl SignalRegistry {
    pub fn signals_for(&self, run_id: &str) -> RunSignals {
        self.inner
            .lock()
            .unwrap()
            .entry(run_id.to_string())
            .or_default()
            .clone()
    }

    pub fn remove(&self, run_id: &str) {
        self.inner.lock().unwrap().remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signals_shared_across_clones() {
        let registry = SignalRegistry::default();
        let a = registry.signals_for("run-1");
        let b = registry.signals_for("run-1");
        a.request_pause();
        assert!(b.pause_requested());
        b.clear_pause();
        assert!(!a.pause_requested());
        a.request_cancel();
        assert!(b.cancel_requested());
    }

    #[test]
    fn test_runs_have_independent_signals() {
        let registry = SignalRegistry::default();
        registry.signals_for("run-1").request_cancel();
        assert!(!registry.signals_for("run-2").cancel_requested());
    }
}
