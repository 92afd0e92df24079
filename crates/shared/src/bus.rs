use crate::protocol::{H_CONTROL, Message, kind};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};

/// Body the manager expects on EXITED, byte for byte.
const EXITED_BODY: &[u8] = br#"{"status": "exited"}"#;

/// Direction byte of a channel-open body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDirection {
    ReadOnly = 0,
    WriteOnly = 1,
    ReadWrite = 2,
}

impl Message {
    pub fn keepalive() -> Self {
        Self::new(H_CONTROL, kind::KEEPALIVE, Vec::new())
    }

    /// Runtime log line; the first payload byte is the numeric level.
    pub fn log_runtime(level: u8, text: &str) -> Self {
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.push(level);
        payload.extend_from_slice(text.as_bytes());
        Self::new(H_CONTROL, kind::LOG_RUNTIME, payload)
    }

    pub fn exited() -> Self {
        Self::new(H_CONTROL, kind::EXITED, EXITED_BODY.to_vec())
    }

    pub fn profile(bytes: Vec<u8>) -> Self {
        Self::new(H_CONTROL, kind::PROFILE, bytes)
    }

    pub fn channel_open(index: u8, direction: ChannelDirection, qos: u8, name: &str) -> Self {
        let mut payload = Vec::with_capacity(name.len() + 2);
        payload.push(direction as u8);
        payload.push(qos);
        payload.extend_from_slice(name.as_bytes());
        Self::new(H_CONTROL | (index & !H_CONTROL), kind::CH_OPEN, payload)
    }

    pub fn channel_close(index: u8) -> Self {
        Self::new(H_CONTROL | (index & !H_CONTROL), kind::CH_CLOSE, Vec::new())
    }

    pub fn log_module(index: u8, text: &str) -> Self {
        Self::new(
            H_CONTROL | (index & !H_CONTROL),
            kind::LOG_MODULE,
            text.as_bytes().to_vec(),
        )
    }
}

/// Decoded runtime-bound control message.
#[derive(Debug, PartialEq, Eq)]
pub enum ControlCommand<'a> {
    Keepalive,
    Create(&'a [u8]),
    Delete,
    Stop,
    Unknown(u8),
}

impl<'a> ControlCommand<'a> {
    /// `None` for data-plane frames; the runtime only acts on control.
    pub fn decode(message: &'a Message) -> Option<Self> {
        if !message.is_control() {
            return None;
        }
        Some(match message.h2 {
            // CREATE and KEEPALIVE share a code; an empty body is a ping.
            kind::CREATE if message.payload.is_empty() => Self::Keepalive,
            kind::CREATE => Self::Create(&message.payload),
            kind::DELETE => Self::Delete,
            kind::STOP => Self::Stop,
            other => Self::Unknown(other),
        })
    }
}

enum Command {
    Frame(Message),
    Flush(oneshot::Sender<()>),
}

/// Clonable handle to the single writer task that owns a stream's write
/// half. Every producer goes through here, so exactly one writer touches
/// the wire.
#[derive(Clone)]
pub struct MessageSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl MessageSender {
    pub fn send(&self, message: Message) {
        let _ = self.tx.send(Command::Frame(message));
    }

    /// Resolves once every frame queued before this call has been written.
    pub async fn drain(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

/// Spawn the writer task for `stream` and hand back its sender.
pub fn spawn_writer<W>(mut stream: W) -> MessageSender
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Frame(message) => {
                    if message.write_to(&mut stream).await.is_err() {
                        break;
                    }
                }
                Command::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    });
    MessageSender { tx }
}
