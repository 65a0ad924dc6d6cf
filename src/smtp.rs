//! The SMTP exchange as a pure state machine.
//!
//! [`transition`] decides, from the current [`State`] and the server's
//! [`Reply`], what to send next. It performs no I/O, so the whole
//! conversation can be checked without a socket. The loop that actually
//! talks to the server lives in [`crate::relay`].

use std::fmt;

use base64ct::{Base64, Encoding};

/// An error during an SMTP exchange.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("TLS handshake failed: {0}")]
    Tls(std::io::Error),
    #[error("STARTTLS failed: {0:?}")]
    StartTlsRejected(String),
    #[error("Authentication failed: {0:?}")]
    AuthFailed(String),
    #[error("unexpected reply to {step}; expected {expected}, actual {actual:?}")]
    UnexpectedReply {
        step: &'static str,
        expected: &'static str,
        actual: String,
    },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("connection closed by server")]
    ConnectionClosed,
    #[error("reply exceeds {0} bytes")]
    ReplyTooLong(usize),
}

/// A complete, possibly multi-line, reply from the server.
///
/// Lines are stored without their line terminator and trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    lines: Vec<String>,
}

impl Reply {
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    /// The final line decides the outcome, earlier lines are continuations.
    pub fn line(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or_default()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Check the status code with a textual prefix match.
    pub fn starts_with(&self, code: &str) -> bool {
        self.line().starts_with(code)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lines.join(" | "))
    }
}

/// Whether `line` ends a reply: `250 Ok` does, `250-SIZE` does not.
pub fn is_final_line(line: &str) -> bool {
    line.as_bytes().get(3) != Some(&b'-')
}

/// A command sent by the client.
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    StartTls,
    AuthLogin,
    AuthUsername(String),
    AuthPassword(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// The message itself, already terminated by `\r\n.\r\n`.
    Payload(String),
    Quit,
}

impl Command {
    /// The exact bytes to put on the wire.
    pub fn to_wire(&self) -> String {
        match self {
            Command::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Command::StartTls => "STARTTLS\r\n".to_string(),
            Command::AuthLogin => "AUTH LOGIN\r\n".to_string(),
            Command::AuthUsername(value) | Command::AuthPassword(value) => {
                format!("{}\r\n", Base64::encode_string(value.as_bytes()))
            }
            Command::MailFrom(address) => format!("MAIL FROM:<{address}>\r\n"),
            Command::RcptTo(address) => format!("RCPT TO:<{address}>\r\n"),
            Command::Data => "DATA\r\n".to_string(),
            Command::Payload(message) => message.clone(),
            Command::Quit => "QUIT\r\n".to_string(),
        }
    }
}

/// Logs never see credentials or message contents.
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::AuthUsername(_) => f.write_str("<username>"),
            Command::AuthPassword(_) => f.write_str("<password>"),
            Command::Payload(message) => write!(f, "<message, {} bytes>", message.len()),
            command => f.write_str(command.to_wire().trim_end()),
        }
    }
}

/// The reply the client is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Greeting,
    Ehlo,
    StartTls,
    SecureEhlo,
    AuthLogin,
    AuthUsername,
    AuthPassword,
    MailFrom,
    RcptTo,
    Data,
    Payload,
    Done,
}

impl State {
    /// A short name for the step, used in errors and logs.
    pub fn step(self) -> &'static str {
        match self {
            State::Greeting => "greeting",
            State::Ehlo => "EHLO",
            State::StartTls => "STARTTLS",
            State::SecureEhlo => "EHLO after STARTTLS",
            State::AuthLogin => "AUTH LOGIN",
            State::AuthUsername => "AUTH LOGIN username",
            State::AuthPassword => "AUTH LOGIN password",
            State::MailFrom => "MAIL FROM",
            State::RcptTo => "RCPT TO",
            State::Data => "DATA",
            State::Payload => "end of data",
            State::Done => "QUIT",
        }
    }

    fn expected(self) -> &'static str {
        match self {
            State::Greeting | State::StartTls => "220",
            State::Ehlo | State::SecureEhlo | State::MailFrom | State::Payload => "250",
            State::AuthLogin | State::AuthUsername => "334",
            State::AuthPassword => "235",
            State::RcptTo => "25",
            State::Data => "354",
            State::Done => "221",
        }
    }
}

/// What the I/O loop has to do after a reply was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send the command and wait for the next reply.
    Send(Command),
    /// Negotiate TLS on the connection, then send the command.
    UpgradeAndSend(Command),
    /// Send `QUIT` without waiting for a reply. The exchange is over.
    Quit,
}

/// Everything a single delivery needs to put on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct Exchange {
    pub domain: String,
    pub username: String,
    pub password: String,
    pub sender: String,
    pub recipient: String,
    pub payload: String,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("sender", &self.sender)
            .field("recipient", &self.recipient)
            .finish_non_exhaustive()
    }
}

/// Advance the exchange by one step.
pub fn transition(
    state: State,
    reply: &Reply,
    exchange: &Exchange,
) -> Result<(State, Action), Error> {
    if !reply.starts_with(state.expected()) {
        let actual = reply.to_string();
        return Err(match state {
            State::StartTls => Error::StartTlsRejected(actual),
            State::AuthLogin | State::AuthUsername | State::AuthPassword => {
                Error::AuthFailed(actual)
            }
            _ => Error::UnexpectedReply {
                step: state.step(),
                expected: state.expected(),
                actual,
            },
        });
    }

    let ehlo = || Command::Ehlo(exchange.domain.clone());

    Ok(match state {
        State::Greeting => (State::Ehlo, Action::Send(ehlo())),
        State::Ehlo => (State::StartTls, Action::Send(Command::StartTls)),
        State::StartTls => (State::SecureEhlo, Action::UpgradeAndSend(ehlo())),
        State::SecureEhlo => (State::AuthLogin, Action::Send(Command::AuthLogin)),
        State::AuthLogin => (
            State::AuthUsername,
            Action::Send(Command::AuthUsername(exchange.username.clone())),
        ),
        State::AuthUsername => (
            State::AuthPassword,
            Action::Send(Command::AuthPassword(exchange.password.clone())),
        ),
        State::AuthPassword => (
            State::MailFrom,
            Action::Send(Command::MailFrom(exchange.sender.clone())),
        ),
        State::MailFrom => (
            State::RcptTo,
            Action::Send(Command::RcptTo(exchange.recipient.clone())),
        ),
        State::RcptTo => (State::Data, Action::Send(Command::Data)),
        State::Data => (
            State::Payload,
            Action::Send(Command::Payload(exchange.payload.clone())),
        ),
        State::Payload => (State::Done, Action::Quit),
        State::Done => {
            return Err(Error::UnexpectedReply {
                step: state.step(),
                expected: "no reply",
                actual: reply.to_string(),
            })
        }
    })
}
