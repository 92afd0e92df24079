use super::{GuestEngine, GuestError, GuestInstance, IdentityRewriter, InstrumentRewriter};
use crate::access::AccessDispatch;
use crate::constants;
use shared::rpc::{ModuleSpec, RuntimeSettings};
use std::sync::Arc;
use wasmtime::{Caller, Config, Engine, Instance, Linker, Module, Store, Val};
use wasmtime_wasi::sync::{Dir, WasiCtxBuilder, ambient_authority};
use wasmtime_wasi::{I32Exit, WasiCtx};

/// Pages of a 32-bit linear memory when no maximum is declared.
const MAX_PAGES: u64 = 65536;

struct StoreCtx {
    wasi: WasiCtx,
    access: Arc<AccessDispatch>,
}

/// wasmtime-backed guest engine.
pub struct WasmtimeEngine {
    engine: Engine,
    rewriter: Box<dyn InstrumentRewriter>,
}

impl WasmtimeEngine {
    pub fn new(settings: &RuntimeSettings) -> Result<Self, GuestError> {
        let mut config = Config::new();
        config.max_wasm_stack(settings.stack_size as usize);
        let engine = Engine::new(&config).map_err(|e| GuestError::Load(e.to_string()))?;
        Ok(Self {
            engine,
            rewriter: Box::new(IdentityRewriter),
        })
    }

    /// Swap in an external instrumentation rewriter.
    pub fn with_rewriter(mut self, rewriter: Box<dyn InstrumentRewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    /// Kernel thread id of the calling guest thread. Nonzero by
    /// construction, preserving the never-accessed sentinel.
    fn current_tid() -> u64 {
        unsafe { libc::syscall(libc::SYS_gettid) as u64 }
    }

    fn add_instrument_imports(linker: &mut Linker<StoreCtx>) -> Result<(), GuestError> {
        linker
            .func_wrap(
                constants::INSTRUMENT_MODULE,
                "logstart",
                |caller: Caller<'_, StoreCtx>, max_instructions: u32| {
                    caller.data().access.log_start(max_instructions);
                },
            )
            .map_err(|e| GuestError::Instantiate(e.to_string()))?;
        linker
            .func_wrap(
                constants::INSTRUMENT_MODULE,
                "logaccess",
                |caller: Caller<'_, StoreCtx>, addr: u32, opcode: u32, inst_idx: u32| {
                    caller
                        .data()
                        .access
                        .log_access(Self::current_tid(), addr, opcode, inst_idx);
                },
            )
            .map_err(|e| GuestError::Instantiate(e.to_string()))?;
        linker
            .func_wrap(
                constants::INSTRUMENT_MODULE,
                "logend",
                |caller: Caller<'_, StoreCtx>| {
                    caller.data().access.log_end();
                },
            )
            .map_err(|e| GuestError::Instantiate(e.to_string()))?;
        Ok(())
    }

    fn build_wasi(spec: &ModuleSpec) -> Result<WasiCtx, GuestError> {
        let mut binding = WasiCtxBuilder::new();
        let mut builder = binding.inherit_stdio();
        builder = builder
            .args(&spec.argv)
            .map_err(|e| GuestError::Instantiate(e.to_string()))?;
        for entry in &spec.env {
            match entry.split_once('=') {
                Some((key, value)) => {
                    builder = builder
                        .env(key, value)
                        .map_err(|e| GuestError::Instantiate(e.to_string()))?;
                }
                None => tracing::warn!("ignoring malformed environment entry {entry:?}"),
            }
        }
        for dir in &spec.dirs {
            let handle = Dir::open_ambient_dir(dir, ambient_authority())
                .map_err(|e| GuestError::Instantiate(format!("preopen {dir}: {e}")))?;
            builder = builder
                .preopened_dir(handle, dir)
                .map_err(|e| GuestError::Instantiate(format!("preopen {dir}: {e}")))?;
        }
        Ok(builder.build())
    }
}

impl GuestEngine for WasmtimeEngine {
    type Instance = WasmtimeInstance;

    fn instantiate(
        &self,
        spec: &ModuleSpec,
        _settings: &RuntimeSettings,
        access: Arc<AccessDispatch>,
    ) -> Result<WasmtimeInstance, GuestError> {
        tracing::debug!("reading module...");
        let mut binary = std::fs::read(&spec.path)?;
        if let Some(instrumentation) = &spec.instrumentation {
            binary = self
                .rewriter
                .rewrite(binary, &instrumentation.scheme, &instrumentation.args)?;
        }

        tracing::debug!("loading module...");
        let module =
            Module::new(&self.engine, &binary).map_err(|e| GuestError::Load(e.to_string()))?;

        let mut linker: Linker<StoreCtx> = Linker::new(&self.engine);
        wasmtime_wasi::add_to_linker(&mut linker, |ctx: &mut StoreCtx| &mut ctx.wasi)
            .map_err(|e| GuestError::Instantiate(e.to_string()))?;
        Self::add_instrument_imports(&mut linker)?;

        let wasi = Self::build_wasi(spec)?;
        let mut store = Store::new(&self.engine, StoreCtx { wasi, access });

        tracing::debug!("instantiating module...");
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| GuestError::Instantiate(e.to_string()))?;

        Ok(WasmtimeInstance { store, instance })
    }
}

pub struct WasmtimeInstance {
    store: Store<StoreCtx>,
    instance: Instance,
}

impl GuestInstance for WasmtimeInstance {
    fn max_memory(&mut self) -> u64 {
        match self.instance.get_memory(&mut self.store, "memory") {
            Some(memory) => {
                let pages = memory.ty(&self.store).maximum().unwrap_or(MAX_PAGES);
                pages.min(MAX_PAGES) * constants::WASM_PAGE_SIZE
            }
            None => 0,
        }
    }

    fn global_u32(&mut self, name: &str) -> Result<u32, GuestError> {
        let global = self
            .instance
            .get_global(&mut self.store, name)
            .ok_or_else(|| GuestError::MissingExport(name.to_string()))?;
        match global.get(&mut self.store) {
            Val::I32(value) => Ok(value as u32),
            other => Err(GuestError::Execution(format!(
                "global {name} has unexpected type {other:?}"
            ))),
        }
    }

    fn write_memory(&mut self, offset: u64, bytes: &[u8]) -> Result<(), GuestError> {
        let memory = self
            .instance
            .get_memory(&mut self.store, "memory")
            .ok_or_else(|| GuestError::MissingExport("memory".to_string()))?;
        memory
            .write(&mut self.store, offset as usize, bytes)
            .map_err(|e| GuestError::Execution(e.to_string()))
    }

    fn run_main(&mut self) -> Result<(), GuestError> {
        let main = self
            .instance
            .get_typed_func::<(), ()>(&mut self.store, "_start")
            .map_err(|_| GuestError::MissingExport("_start".to_string()))?;
        match main.call(&mut self.store, ()) {
            Ok(()) => Ok(()),
            Err(trap) => match trap.downcast_ref::<I32Exit>() {
                Some(I32Exit(0)) => Ok(()),
                Some(I32Exit(code)) => Err(GuestError::ExitCode(*code)),
                None => Err(GuestError::Execution(format!("{trap:#}"))),
            },
        }
    }
}
