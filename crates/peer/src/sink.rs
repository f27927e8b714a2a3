//! Destinations for inbound messages.
//!
//! Neither transport buffers or reassembles what it receives: each inbound
//! unit (a data channel message, or a raw read chunk from a direct
//! connection) is handed to a [`MessageSink`] exactly as it arrived.

use std::io::Write;

use tokio::sync::mpsc;

/// Receives inbound messages from channels and direct sessions.
pub trait MessageSink: Send + Sync {
    /// Delivers one inbound unit. `origin` is a channel label or peer address.
    fn deliver(&self, origin: &str, payload: &[u8]);
}

/// Prints inbound messages for the operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink {
    raw: bool,
}

impl StdoutSink {
    /// One line per data channel message, prefixed with the channel label.
    pub fn channels() -> Self {
        Self { raw: false }
    }

    /// Raw chunks as received from a byte stream, without added framing.
    pub fn raw() -> Self {
        Self { raw: true }
    }
}

impl MessageSink for StdoutSink {
    fn deliver(&self, origin: &str, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        let mut stdout = std::io::stdout().lock();
        let result = if self.raw {
            write!(stdout, "{}", text)
        } else {
            writeln!(stdout, "[{}] {}", origin, text)
        };
        if let Err(e) = result.and_then(|()| stdout.flush()) {
            tracing::debug!("failed to write inbound message to stdout: {}", e);
        }
    }
}

/// An inbound message captured by a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Channel label or peer address.
    pub origin: String,
    /// Message bytes, unmodified.
    pub payload: Vec<u8>,
}

/// Forwards inbound messages into an mpsc queue.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl ChannelSink {
    /// Creates a sink and the receiver that observes it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageSink for ChannelSink {
    fn deliver(&self, origin: &str, payload: &[u8]) {
        let message = InboundMessage {
            origin: origin.to_string(),
            payload: payload.to_vec(),
        };
        if self.tx.send(message).is_err() {
            tracing::debug!("inbound message from '{}' dropped: receiver gone", origin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_preserves_bytes() {
        let (sink, mut rx) = ChannelSink::new();
        sink.deliver("chat", b"partial line without newl");

        let message = rx.recv().await.unwrap();
        assert_eq!(message.origin, "chat");
        assert_eq!(message.payload, b"partial line without newl");
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.deliver("chat", b"ignored");
    }
}
