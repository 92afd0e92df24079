use crate::constants;
use shared::bus::MessageSender;
use shared::protocol::{H_CONTROL, Message, kind};
use shared::rpc::ModuleSpec;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{Instant, timeout_at};

/// How one child iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Success,
    ExitCode(i32),
    Signaled { signal: i32, core_dumped: bool },
    TimedOut,
    SpawnFailed,
    Unknown,
}

impl IterationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    fn classify(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            if code == 0 {
                Self::Success
            } else {
                Self::ExitCode(code)
            }
        } else if let Some(signal) = status.signal() {
            Self::Signaled {
                signal,
                core_dumped: status.core_dumped(),
            }
        } else {
            Self::Unknown
        }
    }
}

/// Tally of one CREATE's iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTally {
    pub successes: u32,
    pub attempts: u32,
}

/// Command template for child iterations.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub delay_units: u32,
}

impl ChildCommand {
    /// Child-mode re-exec of the current executable.
    pub fn current_exe(delay_units: u32) -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: Vec::new(),
            delay_units,
        })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(constants::CHILD_MODE_ENV, "1")
            .env(constants::CHILD_DELAY_ENV, self.delay_units.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

/// Owns the execute-one-iteration state machine: spawns an isolated child
/// per iteration, forwards its frames, enforces the timeout or budget,
/// classifies exits, and reports exactly one EXITED per CREATE.
pub struct Supervisor {
    bus: MessageSender,
    child: ChildCommand,
    iteration_timeout: Duration,
    budget: Option<Duration>,
}

impl Supervisor {
    pub fn new(
        bus: MessageSender,
        child: ChildCommand,
        iteration_timeout: Duration,
        budget_seconds: u32,
    ) -> Self {
        Self {
            bus,
            child,
            iteration_timeout,
            budget: (budget_seconds > 0).then(|| Duration::from_secs(u64::from(budget_seconds))),
        }
    }

    /// Run one CREATE to completion.
    pub async fn run(&self, spec: &ModuleSpec, create_payload: &[u8]) -> RunTally {
        let tally = match self.budget {
            None => self.run_repeat(spec, create_payload).await,
            Some(budget) => self.run_budget(spec, create_payload, budget).await,
        };
        tracing::info!(
            "'{}' successfully executed {}/{} times",
            spec.path,
            tally.successes,
            tally.attempts
        );
        self.bus.send(Message::exited());
        tally
    }

    /// Exactly `repeat` children, each under the per-iteration timeout.
    async fn run_repeat(&self, spec: &ModuleSpec, payload: &[u8]) -> RunTally {
        let mut successes = 0;
        for iteration in 1..=spec.repeat {
            let deadline = Instant::now() + self.iteration_timeout;
            let outcome = self.run_iteration(payload, deadline).await;
            if outcome.is_success() {
                successes += 1;
            } else {
                log_failure(&spec.path, iteration, outcome);
            }
        }
        RunTally {
            successes,
            attempts: spec.repeat,
        }
    }

    /// Back-to-back children until the budget elapses. A child still
    /// running at expiry is killed, which also ends the loop.
    async fn run_budget(&self, spec: &ModuleSpec, payload: &[u8], budget: Duration) -> RunTally {
        let deadline = Instant::now() + budget;
        let mut successes = 0;
        let mut attempts = 0;
        while Instant::now() < deadline {
            attempts += 1;
            let outcome = self.run_iteration(payload, deadline).await;
            if outcome.is_success() {
                successes += 1;
            } else {
                log_failure(&spec.path, attempts, outcome);
            }
            if outcome == IterationOutcome::TimedOut {
                break;
            }
        }
        RunTally {
            successes,
            attempts,
        }
    }

    /// Spawn one child, hand it the CREATE payload, forward its frames to
    /// the manager, and classify how it exits. `deadline` bounds the whole
    /// iteration; on expiry the child gets exactly one SIGKILL.
    async fn run_iteration(&self, payload: &[u8], deadline: Instant) -> IterationOutcome {
        let mut child = match self.child.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("failed to spawn child: {e}");
                return IterationOutcome::SpawnFailed;
            }
        };

        // Hand over the spec, then close stdin so the child sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            let frame = Message::new(H_CONTROL, kind::CREATE, payload.to_vec());
            if frame.write_to(&mut stdin).await.is_err() {
                tracing::error!("failed to hand the spec to the child");
            }
        }

        let mut timed_out = false;
        if let Some(stdout) = child.stdout.as_mut() {
            loop {
                match timeout_at(deadline, Message::read(stdout)).await {
                    Ok(Ok(frame)) => self.bus.send(frame),
                    // Pipe closed; the child is done talking.
                    Ok(Err(_)) => break,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                }
            }
        }

        if !timed_out {
            match timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => return IterationOutcome::classify(status),
                Ok(Err(e)) => {
                    tracing::error!("wait on child failed: {e}");
                    return IterationOutcome::Unknown;
                }
                // Deadline expired while reaping; fall through to the kill.
                Err(_) => {}
            }
        }

        if child.start_kill().is_err() {
            tracing::error!("could not kill timed-out child");
        }
        let _ = child.wait().await;
        IterationOutcome::TimedOut
    }
}

fn log_failure(path: &str, iteration: u32, outcome: IterationOutcome) {
    tracing::error!("'{path}' | iteration {iteration} failed");
    match outcome {
        IterationOutcome::ExitCode(code) => {
            tracing::error!("reason: invalid exit code ({code})");
        }
        IterationOutcome::Signaled {
            signal,
            core_dumped,
        } => {
            tracing::error!("reason: terminated by signal {signal}");
            if core_dumped {
                tracing::error!("child dumped core");
            }
        }
        IterationOutcome::TimedOut => tracing::error!("reason: wall-clock timeout"),
        IterationOutcome::SpawnFailed => tracing::error!("reason: could not spawn child"),
        IterationOutcome::Unknown => tracing::error!("reason: unknown termination method"),
        IterationOutcome::Success => {}
    }
}
