#[cfg(feature = "wasmtime")]
pub mod wasm;

use crate::access::AccessDispatch;
use shared::rpc::{ModuleSpec, RuntimeSettings};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    #[error("failed to read module file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to load module: {0}")]
    Load(String),
    #[error("failed to instantiate module: {0}")]
    Instantiate(String),
    #[error("missing export: {0}")]
    MissingExport(String),
    #[error("guest execution failed: {0}")]
    Execution(String),
    #[error("guest exited with status {0}")]
    ExitCode(i32),
    #[error("no guest engine compiled into this build")]
    EngineUnavailable,
}

/// Rewrites a guest binary for an instrumentation scheme. The actual
/// rewriter ships outside this crate; binaries normally arrive already
/// instrumented, so the default is a pass-through.
pub trait InstrumentRewriter: Send + Sync {
    fn rewrite(
        &self,
        binary: Vec<u8>,
        scheme: &str,
        args: &[String],
    ) -> Result<Vec<u8>, GuestError>;
}

pub struct IdentityRewriter;

impl InstrumentRewriter for IdentityRewriter {
    fn rewrite(
        &self,
        binary: Vec<u8>,
        _scheme: &str,
        _args: &[String],
    ) -> Result<Vec<u8>, GuestError> {
        Ok(binary)
    }
}

/// Opaque guest engine surface consumed by the child runner.
pub trait GuestEngine {
    type Instance: GuestInstance;

    /// Read, rewrite, load, and instantiate one guest module, wiring the
    /// instrumentation imports to `access`.
    fn instantiate(
        &self,
        spec: &ModuleSpec,
        settings: &RuntimeSettings,
        access: Arc<AccessDispatch>,
    ) -> Result<Self::Instance, GuestError>;
}

pub trait GuestInstance {
    /// Upper bound of the guest linear memory, in bytes.
    fn max_memory(&mut self) -> u64;

    /// Value of an exported i32 global.
    fn global_u32(&mut self, name: &str) -> Result<u32, GuestError>;

    /// Write into guest linear memory.
    fn write_memory(&mut self, offset: u64, bytes: &[u8]) -> Result<(), GuestError>;

    /// Invoke the guest entry point. A zero `proc_exit` is success.
    fn run_main(&mut self) -> Result<(), GuestError>;
}
