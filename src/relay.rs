use std::{future::Future, time::Duration};

use tracing::{debug, instrument, trace, warn};

use crate::{
    config::Credentials,
    email::OutboundMessage,
    smtp::{self, Action, Command, Error, Exchange, Reply, State},
    transport::{Channel, Connector},
};

/// The most bytes a single server reply may take up.
pub const MAX_REPLY_LEN: usize = 16 * 1024;

/// Delivers contact messages to their final inbox.
#[cfg_attr(test, mockall::automock)]
pub trait Relay: Send + Sync + 'static {
    fn relay(&self, message: OutboundMessage) -> impl Future<Output = Result<(), Error>> + Send;
}

/// How [`SmtpRelay`] introduces and authenticates itself.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// The domain announced with `EHLO`.
    pub ehlo_domain: String,
    /// The display name used in the `From` header.
    pub sender_name: String,
    /// Defaults to the authenticated account.
    pub recipient: Option<String>,
    pub credentials: Credentials,
    /// Applies to connecting and to every single step of the exchange.
    pub timeout: Duration,
}

/// Sends every message over a fresh SMTP connection.
#[derive(Debug, Clone)]
pub struct SmtpRelay<C> {
    connector: C,
    settings: RelaySettings,
}

impl<C: Connector> SmtpRelay<C> {
    pub fn new(connector: C, settings: RelaySettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    fn exchange(&self, message: &OutboundMessage) -> Exchange {
        let settings = &self.settings;
        let sender = settings.credentials.username.clone();
        let recipient = settings
            .recipient
            .clone()
            .unwrap_or_else(|| sender.clone());
        Exchange {
            domain: settings.ehlo_domain.clone(),
            username: settings.credentials.username.clone(),
            password: settings.credentials.token.clone(),
            payload: message.to_payload(&settings.sender_name, &sender, &recipient),
            sender,
            recipient,
        }
    }
}

impl<C: Connector> Relay for SmtpRelay<C> {
    async fn relay(&self, message: OutboundMessage) -> Result<(), Error> {
        let exchange = self.exchange(&message);
        deliver(&self.connector, &exchange, self.settings.timeout).await
    }
}

/// Run one complete SMTP exchange.
///
/// The connection is closed exactly once, whether the exchange succeeds
/// or fails at any step.
#[instrument(level = "debug", skip_all)]
pub async fn deliver<C: Connector>(
    connector: &C,
    exchange: &Exchange,
    timeout: Duration,
) -> Result<(), Error> {
    let stream = tokio::time::timeout(timeout, connector.connect())
        .await
        .map_err(|_| Error::Timeout("connect"))??;
    let mut channel = Channel::Plain(stream);

    let result = converse(connector, &mut channel, exchange, timeout).await;
    channel.close().await;

    match &result {
        Ok(()) => debug!("message delivered"),
        Err(err) => warn!("smtp exchange failed: {err}"),
    }
    result
}

async fn converse<C: Connector>(
    connector: &C,
    channel: &mut Channel<C::Plain, C::Secure>,
    exchange: &Exchange,
    timeout: Duration,
) -> Result<(), Error> {
    let mut reader = ReplyReader::default();
    let mut state = State::Greeting;

    loop {
        let reply = tokio::time::timeout(timeout, reader.read(channel))
            .await
            .map_err(|_| Error::Timeout(state.step()))??;
        trace!(step = state.step(), recv = %reply);

        let (next, action) = smtp::transition(state, &reply, exchange)?;
        state = next;

        let command = match action {
            Action::Send(command) => command,
            Action::UpgradeAndSend(command) => {
                // Anything after the STARTTLS reply was sent in plaintext.
                if reader.has_pending() {
                    return Err(Error::StartTlsRejected(
                        "data received after STARTTLS reply".to_string(),
                    ));
                }
                channel.upgrade(connector, timeout).await?;
                debug!("connection upgraded to TLS");
                command
            }
            Action::Quit => {
                send(channel, &Command::Quit, state, timeout).await?;
                return Ok(());
            }
        };
        send(channel, &command, state, timeout).await?;
    }
}

async fn send<P, S>(
    channel: &mut Channel<P, S>,
    command: &Command,
    state: State,
    timeout: Duration,
) -> Result<(), Error>
where
    P: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    tokio::time::timeout(timeout, channel.send(command))
        .await
        .map_err(|_| Error::Timeout(state.step()))?
}

/// Splits the byte stream from the server into replies.
#[derive(Debug, Default)]
struct ReplyReader {
    buffer: Vec<u8>,
}

impl ReplyReader {
    async fn read<P, S>(&mut self, channel: &mut Channel<P, S>) -> Result<Reply, Error>
    where
        P: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
    {
        loop {
            if let Some(reply) = self.take_reply() {
                return Ok(reply);
            }
            if self.buffer.len() > MAX_REPLY_LEN {
                return Err(Error::ReplyTooLong(MAX_REPLY_LEN));
            }
            if channel.read_into(&mut self.buffer).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Remove and return the first complete reply in the buffer.
    fn take_reply(&mut self) -> Option<Reply> {
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(end) = find_crlf(&self.buffer[start..]) {
            let line = String::from_utf8_lossy(&self.buffer[start..start + end])
                .trim()
                .to_string();
            start += end + 2;
            let last = smtp::is_final_line(&line);
            lines.push(line);
            if last {
                self.buffer.drain(..start);
                return Some(Reply::new(lines));
            }
        }
        None
    }

    fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}
