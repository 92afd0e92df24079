use crate::bus::MessageSender;
use crate::protocol::Message;
use std::fmt::Write as _;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Numeric log levels of the manager protocol.
pub const L_CRI: u8 = 50;
pub const L_ERR: u8 = 40;
pub const L_WRN: u8 = 30;
pub const L_INF: u8 = 20;
pub const L_DBG: u8 = 10;

/// Longest log text shipped in one frame; the rest is cut.
const LOG_MAX_LEN: usize = 1023;

fn level_code(level: &Level) -> u8 {
    match *level {
        Level::ERROR => L_ERR,
        Level::WARN => L_WRN,
        Level::INFO => L_INF,
        _ => L_DBG,
    }
}

/// Forwards every event to the manager as a LOG_RUNTIME frame.
pub struct SocketLayer {
    sender: MessageSender,
}

impl SocketLayer {
    pub fn new(sender: MessageSender) -> Self {
        Self { sender }
    }
}

impl<S: Subscriber> Layer<S> for SocketLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut text = String::new();
        event.record(&mut MessageVisitor { text: &mut text });
        if text.len() > LOG_MAX_LEN {
            let mut cut = LOG_MAX_LEN;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        self.sender
            .send(Message::log_runtime(level_code(event.metadata().level()), &text));
    }
}

struct MessageVisitor<'a> {
    text: &'a mut String,
}

impl Visit for MessageVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.text.push_str(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.text, "{value:?}");
        }
    }
}

/// Install socket logging for this process. Safe to call once; later
/// calls are no-ops.
pub fn init(sender: MessageSender) {
    use tracing_subscriber::prelude::*;
    let _ = tracing_subscriber::registry()
        .with(SocketLayer::new(sender))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::spawn_writer;
    use crate::protocol::kind;
    use tracing_subscriber::prelude::*;

    #[tokio::test]
    async fn events_become_log_frames() {
        let (a, mut b) = tokio::io::duplex(4096);
        let sender = spawn_writer(a);
        let subscriber = tracing_subscriber::registry().with(SocketLayer::new(sender.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("guest {} launched", 7);
            tracing::error!("boom");
        });
        sender.drain().await;

        let info = Message::read(&mut b).await.unwrap();
        assert_eq!(info.h2, kind::LOG_RUNTIME);
        assert_eq!(info.payload[0], L_INF);
        assert_eq!(&info.payload[1..], b"guest 7 launched");

        let error = Message::read(&mut b).await.unwrap();
        assert_eq!(error.payload[0], L_ERR);
        assert_eq!(&error.payload[1..], b"boom");
    }

    #[tokio::test]
    async fn oversized_messages_are_cut_to_the_frame_limit() {
        let (a, mut b) = tokio::io::duplex(8192);
        let sender = spawn_writer(a);
        let subscriber = tracing_subscriber::registry().with(SocketLayer::new(sender.clone()));

        let long = "x".repeat(5000);
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("{long}");
        });
        sender.drain().await;

        let frame = Message::read(&mut b).await.unwrap();
        assert_eq!(frame.payload.len(), LOG_MAX_LEN + 1);
        assert_eq!(frame.payload[0], L_WRN);
    }
}
