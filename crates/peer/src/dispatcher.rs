//! Interactive command dispatcher for `chat` mode.
//!
//! Operator lines are parsed into [`Command`]s and executed against a
//! [`SessionNegotiator`]. Anything that is not a known command is treated as
//! a pasted envelope. Engine events are drained between operator lines so
//! channels register and messages print while the operator is typing.

use std::fmt;

use protocol::error::ProtocolError;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, Lines};

use crate::network::{BroadcastReport, NegotiationState, SessionNegotiator};

const HELP: &str = "\
commands:
  offer           start a negotiation and print the offer envelope
  send <text>     send text on every open channel
  send            prompt for the text to send
  channels        list registered channels
  help            show this help
  quit | exit     leave
anything else is read as an envelope from the peer";

/// One parsed operator line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Offer,
    /// `send` with inline text, or `None` to prompt for it.
    Send(Option<String>),
    Channels,
    Help,
    Quit,
    /// A pasted envelope.
    Envelope(String),
    Empty,
}

impl Command {
    /// Parses one operator line.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }

        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word {
            "offer" if rest.is_empty() => Command::Offer,
            "send" if rest.is_empty() => Command::Send(None),
            "send" => Command::Send(Some(rest.to_string())),
            "channels" if rest.is_empty() => Command::Channels,
            "help" if rest.is_empty() => Command::Help,
            "quit" | "exit" if rest.is_empty() => Command::Quit,
            _ => Command::Envelope(line.to_string()),
        }
    }
}

/// Result of executing a line, rendered for the operator.
#[derive(Debug)]
pub enum Reply {
    /// An envelope to relay to the peer.
    Envelope { kind: &'static str, text: String },
    /// An answer envelope was applied.
    AnswerAccepted,
    /// Per-channel outcome of a send.
    Sent(BroadcastReport),
    /// Registered channels and the negotiation state.
    Channels {
        state: NegotiationState,
        labels: Vec<String>,
    },
    /// Waiting for the text of a bare `send`.
    Prompt,
    Help,
    Failed(ProtocolError),
    Quit,
    Nothing,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Envelope { kind, text } => {
                write!(f, "{} envelope (send this to your peer):\n{}", kind, text)
            }
            Reply::AnswerAccepted => write!(f, "answer accepted, waiting for the channel to open"),
            Reply::Sent(report) => {
                let mut first = true;
                for (label, outcome) in report.outcomes() {
                    if !first {
                        writeln!(f)?;
                    }
                    first = false;
                    match outcome {
                        Ok(()) => write!(f, "sent on '{}'", label)?,
                        Err(e) => write!(f, "not sent on '{}': {}", label, e)?,
                    }
                }
                Ok(())
            }
            Reply::Channels { state, labels } if labels.is_empty() => {
                write!(f, "state: {}, no channels", state)
            }
            Reply::Channels { state, labels } => {
                write!(f, "state: {}, channels: {}", state, labels.join(", "))
            }
            Reply::Prompt => write!(f, "message: "),
            Reply::Help => write!(f, "{}", HELP),
            Reply::Failed(e) => write!(f, "error: {}", e),
            Reply::Quit | Reply::Nothing => Ok(()),
        }
    }
}

/// Executes operator commands against a negotiator.
pub struct Dispatcher {
    negotiator: SessionNegotiator,
    awaiting_message: bool,
}

impl Dispatcher {
    pub fn new(negotiator: SessionNegotiator) -> Self {
        Self {
            negotiator,
            awaiting_message: false,
        }
    }

    pub fn negotiator(&self) -> &SessionNegotiator {
        &self.negotiator
    }

    pub fn into_negotiator(self) -> SessionNegotiator {
        self.negotiator
    }

    /// Executes one operator line.
    ///
    /// After a bare `send` the next line is sent verbatim, whatever it holds.
    pub async fn execute(&mut self, line: &str) -> Reply {
        self.negotiator.process_events().await;

        if self.awaiting_message {
            self.awaiting_message = false;
            return self.send(line).await;
        }

        match Command::parse(line) {
            Command::Offer => match self.negotiator.start_offer().await {
                Ok(text) => Reply::Envelope { kind: "offer", text },
                Err(e) => Reply::Failed(e),
            },
            Command::Send(Some(text)) => self.send(&text).await,
            Command::Send(None) => {
                self.awaiting_message = true;
                Reply::Prompt
            }
            Command::Channels => Reply::Channels {
                state: self.negotiator.state(),
                labels: self.negotiator.registry().labels().await,
            },
            Command::Help => Reply::Help,
            Command::Quit => Reply::Quit,
            Command::Envelope(text) => match self.negotiator.receive_envelope(&text).await {
                Ok(Some(answer)) => Reply::Envelope {
                    kind: "answer",
                    text: answer,
                },
                Ok(None) => Reply::AnswerAccepted,
                Err(e) => Reply::Failed(e),
            },
            Command::Empty => Reply::Nothing,
        }
    }

    async fn send(&self, text: &str) -> Reply {
        match self.negotiator.broadcast(text.as_bytes()).await {
            Ok(report) => Reply::Sent(report),
            Err(e) => Reply::Failed(e),
        }
    }

    /// Runs the interactive loop until `quit` or end of input.
    pub async fn run<R, W>(&mut self, input: &mut Lines<R>, output: &mut W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut events_open = true;

        loop {
            tokio::select! {
                event = self.negotiator.next_event(), if events_open => match event {
                    Some(event) => self.negotiator.handle_event(event).await,
                    None => {
                        tracing::debug!("engine event stream ended");
                        events_open = false;
                    }
                },
                line = input.next_line() => {
                    let Some(line) = line? else {
                        tracing::debug!("operator input closed");
                        return Ok(());
                    };

                    let reply = self.execute(&line).await;
                    match reply {
                        Reply::Quit => return Ok(()),
                        Reply::Nothing => {}
                        Reply::Prompt => output.write_all(reply.to_string().as_bytes()).await?,
                        reply => output.write_all(format!("{}\n", reply).as_bytes()).await?,
                    }
                    output.flush().await?;
                }
            }
        }
    }
}
