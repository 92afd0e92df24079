pub mod opcode;
pub mod tracker;
pub mod tsvd;

use std::sync::{Arc, OnceLock};

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("violation pair breaks the tid/addr invariant")]
    InconsistentViolation,
}

/// Strategy-independent instrumentation surface. `log_access` is invoked
/// from every guest thread and must tolerate arbitrary parallelism.
pub trait AccessEngine: Send + Sync {
    /// Called once per iteration before instrumented code executes.
    fn log_start(&self, _max_instructions: u32) {}

    /// Record one guest load or store.
    fn log_access(&self, tid: u64, addr: u32, opcode: u32, inst_idx: u32);

    /// Called once per iteration after execution.
    fn log_end(&self) {}

    /// Serialize the profile, preceded by `prefix` verbatim.
    fn collect_profile(&self, prefix: &[u8]) -> Result<Vec<u8>, ProfileError>;
}

/// Install-once indirection between the engine's host functions and the
/// per-iteration access engine. The engine is built only after the guest
/// is instantiated (its memory bound must be known), but the host
/// functions are registered before; calls that arrive in between are
/// dropped.
#[derive(Default)]
pub struct AccessDispatch {
    slot: OnceLock<Arc<dyn AccessEngine>>,
}

impl AccessDispatch {
    pub fn install(&self, engine: Arc<dyn AccessEngine>) {
        let _ = self.slot.set(engine);
    }

    pub fn log_start(&self, max_instructions: u32) {
        if let Some(engine) = self.slot.get() {
            engine.log_start(max_instructions);
        }
    }

    pub fn log_access(&self, tid: u64, addr: u32, opcode: u32, inst_idx: u32) {
        if let Some(engine) = self.slot.get() {
            engine.log_access(tid, addr, opcode, inst_idx);
        }
    }

    pub fn log_end(&self) {
        if let Some(engine) = self.slot.get() {
            engine.log_end();
        }
    }
}

/// Which engine an instrumentation scheme selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SharedTracker,
    TsvdProbe,
}

impl Strategy {
    /// Schemes mentioning tsvd probe for violations; everything else,
    /// including uninstrumented runs, tracks shared accesses.
    pub fn for_scheme(scheme: Option<&str>) -> Self {
        match scheme {
            Some(scheme) if scheme.contains("tsvd") => Self::TsvdProbe,
            _ => Self::SharedTracker,
        }
    }
}

/// Build the engine for one iteration.
pub fn build_engine(strategy: Strategy, max_memory: u64, delay_units: u32) -> Arc<dyn AccessEngine> {
    match strategy {
        Strategy::SharedTracker => Arc::new(tracker::SharedTracker::new(max_memory)),
        Strategy::TsvdProbe => Arc::new(tsvd::TsvdProbe::new(delay_units)),
    }
}
