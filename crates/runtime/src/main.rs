use runtime::supervisor::{ChildCommand, Supervisor};
use runtime::{child, constants};
use shared::bus::{self, ControlCommand};
use shared::protocol::{Message, ProtocolError};
use shared::{logging, rpc};
use std::io::ErrorKind;

#[tokio::main]
async fn main() -> Result<(), RuntimeError> {
    // Children re-exec this binary; divert them before touching the socket.
    if std::env::var_os(constants::CHILD_MODE_ENV).is_some() {
        let delay_units = std::env::var(constants::CHILD_DELAY_ENV)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(constants::DEFAULT_DELAY_UNITS);
        std::process::exit(child::run(delay_units).await);
    }

    let args: Vec<String> = std::env::args().collect();
    let index: u8 = args
        .get(1)
        .and_then(|value| value.parse().ok())
        .ok_or(RuntimeError::Usage)?;
    let delay_units: u32 = match args.get(2) {
        Some(value) => value.parse().map_err(|_| RuntimeError::Usage)?,
        None => constants::DEFAULT_DELAY_UNITS,
    };
    let budget_seconds: u32 = match args.get(3) {
        Some(value) => value.parse().map_err(|_| RuntimeError::Usage)?,
        None => 0,
    };

    let stream = shared::protocol::connect(index, None).await?;
    let (mut reader, writer) = stream.into_split();
    let sender = bus::spawn_writer(writer);
    logging::init(sender.clone());

    if delay_units != constants::DEFAULT_DELAY_UNITS {
        tracing::info!("delay parameter set to {delay_units}");
    }
    if budget_seconds != 0 {
        tracing::info!("time budget is {budget_seconds}s");
    }
    tracing::info!("runtime launched and connected to socket");

    let child = ChildCommand::current_exe(delay_units)?;
    let supervisor = Supervisor::new(
        sender.clone(),
        child,
        constants::ITERATION_TIMEOUT,
        budget_seconds,
    );

    loop {
        let message = match Message::read(&mut reader).await {
            Ok(message) => message,
            Err(ProtocolError::Io(e)) if is_closed(&e) => return Err(RuntimeError::ManagerClosed),
            Err(e) => {
                tracing::warn!("dropping unreadable frame: {e}");
                continue;
            }
        };

        match ControlCommand::decode(&message) {
            Some(ControlCommand::Create(payload)) => {
                tracing::debug!("runtime received create ({} bytes)", payload.len());
                match rpc::decode_create(payload) {
                    Ok((spec, metadata)) => {
                        tracing::info!(
                            "create module '{}' ({}) index {}",
                            metadata.name,
                            metadata.uuid,
                            metadata.index
                        );
                        supervisor.run(&spec, payload).await;
                    }
                    Err(e) => tracing::warn!("dropping malformed create: {e}"),
                }
            }
            Some(ControlCommand::Keepalive) => {}
            Some(ControlCommand::Delete) | Some(ControlCommand::Stop) => {
                tracing::debug!("unsupported control message ignored");
            }
            Some(ControlCommand::Unknown(kind)) => {
                tracing::warn!("unknown control kind {kind:#04x}");
            }
            // Data-plane frame; nothing for the runtime to do.
            None => {}
        }
    }
}

fn is_closed(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    )
}

#[derive(Debug, thiserror::Error)]
enum RuntimeError {
    #[error("usage: runtime <runtime_index> [<delay_param> [<budget_seconds>]]")]
    Usage,
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    #[error("manager connection closed")]
    ManagerClosed,
}
