use std::time::Duration;

/// Environment variable marking a child-mode invocation.
pub const CHILD_MODE_ENV: &str = "RUNTIME_CHILD";

/// Environment variable carrying the probe delay into children.
pub const CHILD_DELAY_ENV: &str = "RUNTIME_DELAY";

/// Default busy-delay length of the probe window, in spin units.
pub const DEFAULT_DELAY_UNITS: u32 = 500;

/// Wall-clock timeout for one iteration outside budget mode.
pub const ITERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Minimum gap between starting the guest and emitting its profile.
pub const PROFILE_PACING_US: u64 = 10_000;

/// Exit code a child reports when an iteration fails.
pub const CHILD_FAILURE_CODE: i32 = 11;

/// WebAssembly linear-memory page size.
pub const WASM_PAGE_SIZE: u64 = 65536;

/// Import module name of the instrumentation host functions.
pub const INSTRUMENT_MODULE: &str = "instrument";

/// Scheme that seeds guest memory with a stochastic instruction mask.
pub const SCHEME_STOCHASTIC: &str = "memaccess-stochastic";
