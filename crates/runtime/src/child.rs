use crate::access::{self, AccessDispatch, Strategy};
use crate::constants;
use crate::guest::{GuestEngine, GuestInstance};
use crate::profile::{Rusage, cpu_time_raw_us};
use crate::utils;
use shared::bus::{self, MessageSender};
use shared::protocol::Message;
use shared::rpc::{self, ModuleSpec, RuntimeSettings};
use std::sync::Arc;
use std::time::Duration;

/// Child-mode entry: run one guest iteration, streaming frames (logs,
/// then the profile) to the parent. Returns the process exit code.
pub async fn run(delay_units: u32) -> i32 {
    let pipe = match utils::steal_stdout() {
        Ok(file) => file,
        // Nowhere to report to; the parent sees the early exit.
        Err(_) => return constants::CHILD_FAILURE_CODE,
    };
    let sender = bus::spawn_writer(tokio::fs::File::from_std(pipe));
    shared::logging::init(sender.clone());

    let success = run_from_stdin(delay_units, &sender).await;

    sender.drain().await;
    if success { 0 } else { constants::CHILD_FAILURE_CODE }
}

async fn run_from_stdin(delay_units: u32, sender: &MessageSender) -> bool {
    let mut stdin = tokio::io::stdin();
    let create = match Message::read(&mut stdin).await {
        Ok(message) => message,
        Err(e) => {
            tracing::error!("child could not read its spec: {e}");
            return false;
        }
    };
    let (spec, _metadata) = match rpc::decode_create(&create.payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::error!("child received a malformed spec: {e}");
            return false;
        }
    };

    run_once(&spec, &RuntimeSettings::default(), delay_units, sender).await
}

#[cfg(feature = "wasmtime")]
async fn run_once(
    spec: &ModuleSpec,
    settings: &RuntimeSettings,
    delay_units: u32,
    sender: &MessageSender,
) -> bool {
    let engine = match crate::guest::wasm::WasmtimeEngine::new(settings) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("guest engine init failed: {e}");
            return false;
        }
    };
    run_iteration(&engine, spec, settings, delay_units, sender).await
}

#[cfg(not(feature = "wasmtime"))]
async fn run_once(
    _spec: &ModuleSpec,
    _settings: &RuntimeSettings,
    _delay_units: u32,
    _sender: &MessageSender,
) -> bool {
    tracing::error!("{}", crate::guest::GuestError::EngineUnavailable);
    false
}

/// One guest iteration against any engine: instantiate, install the
/// access engine, run timed, serialize and emit the profile.
pub async fn run_iteration<E: GuestEngine>(
    engine: &E,
    spec: &ModuleSpec,
    settings: &RuntimeSettings,
    delay_units: u32,
    sender: &MessageSender,
) -> bool {
    let dispatch = Arc::new(AccessDispatch::default());
    let mut instance = match engine.instantiate(spec, settings, Arc::clone(&dispatch)) {
        Ok(instance) => instance,
        Err(e) => {
            tracing::error!("failed to prepare guest: {e}");
            return false;
        }
    };

    // The table is sized only once the instance exists.
    let max_memory = instance.max_memory();
    let access = access::build_engine(Strategy::for_scheme(spec.scheme()), max_memory, delay_units);
    dispatch.install(Arc::clone(&access));

    if spec.scheme() == Some(constants::SCHEME_STOCHASTIC) {
        if let Err(e) = write_stochastic_mask(&mut instance, spec) {
            tracing::error!("stochastic mask setup failed: {e}");
            return false;
        }
    }

    tracing::info!("running main: {} | argc: {}", spec.path, spec.argv.len());
    let started = cpu_time_raw_us();
    let result = instance.run_main();
    let rusage = Rusage {
        cpu_time_us: cpu_time_raw_us().saturating_sub(started),
    };
    if let Err(e) = result {
        tracing::error!("guest run failed: {e}");
        return false;
    }
    tracing::info!("successfully executed main");

    let profile = match access.collect_profile(&rusage.to_le_bytes()) {
        Ok(profile) => profile,
        Err(e) => {
            tracing::error!("profile serialization failed: {e}");
            return false;
        }
    };
    if profile.len() > u16::MAX as usize {
        tracing::error!("profile of {} bytes exceeds the frame limit", profile.len());
        return false;
    }
    tracing::debug!("generated profile of {} bytes", profile.len());

    // Pace tight guests so the manager is not flooded with profiles.
    if rusage.cpu_time_us < constants::PROFILE_PACING_US {
        tokio::time::sleep(Duration::from_micros(
            constants::PROFILE_PACING_US - rusage.cpu_time_us,
        ))
        .await;
    }

    sender.send(Message::profile(profile));
    true
}

/// Seed the guest's instrumentation mask region with a density-driven
/// pseudorandom 0/1 pattern.
fn write_stochastic_mask<I: GuestInstance>(
    instance: &mut I,
    spec: &ModuleSpec,
) -> Result<(), crate::guest::GuestError> {
    let args = spec
        .instrumentation
        .as_ref()
        .map(|i| i.args.as_slice())
        .unwrap_or_default();
    let density = match args.first() {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("invalid mask density {raw:?}, using 0");
            0
        }),
        None => {
            tracing::warn!("stochastic scheme without a density argument, using 0");
            0
        }
    };

    let membase = u64::from(instance.global_u32("__inst_membase")?) * constants::WASM_PAGE_SIZE;
    let max_instructions = instance.global_u32("__inst_max")?;
    let mask = utils::random_inst_mask(density, max_instructions as usize);
    instance.write_memory(membase + 1, &mask)?;

    tracing::info!("stochastic mask with density {density} written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::GuestError;
    use parking_lot::Mutex;
    use shared::protocol::kind;
    use shared::rpc::Instrumentation;

    const LOAD: u32 = 0x28;
    const STORE: u32 = 0x36;

    /// Scripted access the fake guest replays through the dispatch.
    #[derive(Debug, Clone, Copy)]
    struct Access {
        tid: u64,
        addr: u32,
        opcode: u32,
        inst_idx: u32,
    }

    #[derive(Default)]
    struct FakeBehavior {
        accesses: Vec<Access>,
        globals: Vec<(&'static str, u32)>,
        fail_instantiate: bool,
        fail_run: bool,
    }

    struct FakeEngine {
        behavior: FakeBehavior,
        writes: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    }

    impl FakeEngine {
        fn new(behavior: FakeBehavior) -> Self {
            Self {
                behavior,
                writes: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    struct FakeInstance {
        accesses: Vec<Access>,
        globals: Vec<(&'static str, u32)>,
        fail_run: bool,
        dispatch: Arc<AccessDispatch>,
        writes: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    }

    impl GuestEngine for FakeEngine {
        type Instance = FakeInstance;

        fn instantiate(
            &self,
            _spec: &ModuleSpec,
            _settings: &RuntimeSettings,
            access: Arc<AccessDispatch>,
        ) -> Result<FakeInstance, GuestError> {
            if self.behavior.fail_instantiate {
                return Err(GuestError::Load("scripted failure".into()));
            }
            Ok(FakeInstance {
                accesses: self.behavior.accesses.clone(),
                globals: self.behavior.globals.clone(),
                fail_run: self.behavior.fail_run,
                dispatch: access,
                writes: Arc::clone(&self.writes),
            })
        }
    }

    impl GuestInstance for FakeInstance {
        fn max_memory(&mut self) -> u64 {
            1 << 20
        }

        fn global_u32(&mut self, name: &str) -> Result<u32, GuestError> {
            self.globals
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| *v)
                .ok_or_else(|| GuestError::MissingExport(name.to_string()))
        }

        fn write_memory(&mut self, offset: u64, bytes: &[u8]) -> Result<(), GuestError> {
            self.writes.lock().push((offset, bytes.to_vec()));
            Ok(())
        }

        fn run_main(&mut self) -> Result<(), GuestError> {
            self.dispatch.log_start(64);
            for access in &self.accesses {
                self.dispatch
                    .log_access(access.tid, access.addr, access.opcode, access.inst_idx);
            }
            self.dispatch.log_end();
            if self.fail_run {
                return Err(GuestError::Execution("scripted trap".into()));
            }
            Ok(())
        }
    }

    fn spec(instrumentation: Option<Instrumentation>) -> ModuleSpec {
        ModuleSpec {
            path: "/g.wasm".into(),
            dirs: Vec::new(),
            env: Vec::new(),
            argv: vec!["/g.wasm".into()],
            repeat: 1,
            instrumentation,
        }
    }

    async fn frames_from(mut reader: tokio::io::DuplexStream) -> Vec<Message> {
        let mut frames = Vec::new();
        while let Ok(frame) = Message::read(&mut reader).await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn successful_iteration_emits_a_profile_frame() {
        let (writer, reader) = tokio::io::duplex(1 << 16);
        let sender = bus::spawn_writer(writer);
        let engine = FakeEngine::new(FakeBehavior {
            accesses: vec![
                Access { tid: 1, addr: 0x100, opcode: LOAD, inst_idx: 7 },
                Access { tid: 2, addr: 0x100, opcode: STORE, inst_idx: 9 },
            ],
            ..Default::default()
        });

        let ok = run_iteration(
            &engine,
            &spec(None),
            &RuntimeSettings::default(),
            0,
            &sender,
        )
        .await;
        assert!(ok);
        sender.drain().await;
        drop(sender);

        let frames = frames_from(reader).await;
        let profile = frames
            .iter()
            .find(|f| f.h2 == kind::PROFILE)
            .expect("profile frame");

        // Rusage prefix, then {7, 9} shared, one shared addr, no partials.
        let body = &profile.payload[Rusage::LEN..];
        let count = u32::from_le_bytes(body[0..4].try_into().unwrap());
        assert_eq!(count, 2);
        let idxs = [
            u32::from_le_bytes(body[4..8].try_into().unwrap()),
            u32::from_le_bytes(body[8..12].try_into().unwrap()),
        ];
        assert_eq!(idxs, [7, 9]);
        let addr_count = u32::from_le_bytes(body[12..16].try_into().unwrap());
        assert_eq!(addr_count, 1);
        assert_eq!(
            u32::from_le_bytes(body[16..20].try_into().unwrap()),
            0x100
        );
        assert_eq!(body.len(), 20);
    }

    #[tokio::test]
    async fn failed_instantiation_emits_no_profile() {
        let (writer, reader) = tokio::io::duplex(1 << 16);
        let sender = bus::spawn_writer(writer);
        let engine = FakeEngine::new(FakeBehavior {
            fail_instantiate: true,
            ..Default::default()
        });

        let ok = run_iteration(
            &engine,
            &spec(None),
            &RuntimeSettings::default(),
            0,
            &sender,
        )
        .await;
        assert!(!ok);
        sender.drain().await;
        drop(sender);

        let frames = frames_from(reader).await;
        assert!(frames.iter().all(|f| f.h2 != kind::PROFILE));
    }

    #[tokio::test]
    async fn failed_run_skips_the_profile() {
        let (writer, reader) = tokio::io::duplex(1 << 16);
        let sender = bus::spawn_writer(writer);
        let engine = FakeEngine::new(FakeBehavior {
            fail_run: true,
            ..Default::default()
        });

        let ok = run_iteration(
            &engine,
            &spec(None),
            &RuntimeSettings::default(),
            0,
            &sender,
        )
        .await;
        assert!(!ok);
        sender.drain().await;
        drop(sender);

        let frames = frames_from(reader).await;
        assert!(frames.iter().all(|f| f.h2 != kind::PROFILE));
    }

    #[tokio::test]
    async fn stochastic_scheme_writes_the_mask_region() {
        let (writer, _reader) = tokio::io::duplex(1 << 16);
        let sender = bus::spawn_writer(writer);
        let engine = FakeEngine::new(FakeBehavior {
            globals: vec![("__inst_membase", 2), ("__inst_max", 32)],
            ..Default::default()
        });
        let writes = Arc::clone(&engine.writes);

        let instrumentation = Instrumentation {
            scheme: constants::SCHEME_STOCHASTIC.to_string(),
            args: vec!["100".to_string()],
        };
        let ok = run_iteration(
            &engine,
            &spec(Some(instrumentation)),
            &RuntimeSettings::default(),
            0,
            &sender,
        )
        .await;
        assert!(ok);

        let writes = writes.lock();
        assert_eq!(writes.len(), 1);
        let (offset, bytes) = &writes[0];
        assert_eq!(*offset, 2 * constants::WASM_PAGE_SIZE + 1);
        // Density 100 sets every mask byte.
        assert_eq!(bytes, &vec![1u8; 32]);
    }

    #[tokio::test]
    async fn missing_mask_globals_fail_the_iteration() {
        let (writer, _reader) = tokio::io::duplex(1 << 16);
        let sender = bus::spawn_writer(writer);
        let engine = FakeEngine::new(FakeBehavior::default());

        let instrumentation = Instrumentation {
            scheme: constants::SCHEME_STOCHASTIC.to_string(),
            args: vec!["50".to_string()],
        };
        let ok = run_iteration(
            &engine,
            &spec(Some(instrumentation)),
            &RuntimeSettings::default(),
            0,
            &sender,
        )
        .await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn tight_iterations_are_paced() {
        let (writer, _reader) = tokio::io::duplex(1 << 16);
        let sender = bus::spawn_writer(writer);
        let engine = FakeEngine::new(FakeBehavior::default());

        let started = std::time::Instant::now();
        let ok = run_iteration(
            &engine,
            &spec(None),
            &RuntimeSettings::default(),
            0,
            &sender,
        )
        .await;
        assert!(ok);
        assert!(started.elapsed() >= Duration::from_millis(9));
    }
}
