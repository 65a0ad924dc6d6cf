//! Connections to the upstream SMTP server.
//!
//! A [`Connector`] opens the plaintext connection and later upgrades it to
//! TLS. The [`Channel`] owns whichever stream is current, so the plaintext
//! stream cannot be used again once it was handed to the TLS layer.

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use rustls::pki_types::{InvalidDnsNameError, ServerName};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
    time::Sleep,
};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{debug, trace};

use crate::smtp::{Command, Error};

/// Opens connections and negotiates STARTTLS on them.
pub trait Connector: Send + Sync + 'static {
    type Plain: AsyncRead + AsyncWrite + Unpin + Send;
    type Secure: AsyncRead + AsyncWrite + Unpin + Send;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Plain>> + Send;

    /// Run the TLS handshake on `stream`, giving up after `timeout` with
    /// [`io::ErrorKind::TimedOut`].
    ///
    /// On failure, including a timeout, the plaintext stream is handed back
    /// so that it can still be closed.
    fn upgrade(
        &self,
        stream: Self::Plain,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Secure, (io::Error, Self::Plain)>> + Send;
}

/// Connects over TCP and verifies the server against the webpki roots.
#[derive(Clone)]
pub struct StartTlsConnector {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    tls: TlsConnector,
}

impl StartTlsConnector {
    pub fn new(host: &str, port: u16) -> Result<Self, InvalidDnsNameError> {
        let server_name = ServerName::try_from(host.to_string())?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            host: host.to_string(),
            port,
            server_name,
            tls: TlsConnector::from(Arc::new(config)),
        })
    }
}

impl std::fmt::Debug for StartTlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartTlsConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl Connector for StartTlsConnector {
    type Plain = TcpStream;
    type Secure = TlsStream<Deadline<TcpStream>>;

    async fn connect(&self) -> io::Result<TcpStream> {
        debug!(host = %self.host, port = self.port, "connecting to smtp server");
        TcpStream::connect((self.host.as_str(), self.port)).await
    }

    async fn upgrade(
        &self,
        stream: TcpStream,
        timeout: Duration,
    ) -> Result<Self::Secure, (io::Error, TcpStream)> {
        let stream = Deadline::new(stream, timeout);
        match self
            .tls
            .connect(self.server_name.clone(), stream)
            .into_fallible()
            .await
        {
            Ok(mut secure) => {
                secure.get_mut().0.clear();
                Ok(secure)
            }
            Err((err, stream)) => Err((err, stream.into_inner())),
        }
    }
}

/// A stream whose reads and writes fail with [`io::ErrorKind::TimedOut`]
/// once its deadline has passed.
///
/// The TLS handshake runs on top of it, so a stalled handshake fails like
/// any other and the stream can still be recovered and closed.
pub struct Deadline<T> {
    stream: T,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl<T> Deadline<T> {
    pub fn new(stream: T, timeout: Duration) -> Self {
        Self {
            stream,
            sleep: Some(Box::pin(tokio::time::sleep(timeout))),
        }
    }

    /// Remove the deadline.
    pub fn clear(&mut self) {
        self.sleep = None;
    }

    pub fn into_inner(self) -> T {
        self.stream
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        let expired = match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        };
        if expired {
            Err(io::Error::new(io::ErrorKind::TimedOut, "deadline expired"))
        } else {
            Ok(())
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Deadline<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.poll_expired(cx)?;
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Deadline<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.poll_expired(cx)?;
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.poll_expired(cx)?;
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// The current stream of a single SMTP connection.
pub enum Channel<P, S> {
    Plain(P),
    Secure(S),
    Closed,
}

impl<P, S> Channel<P, S>
where
    P: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub async fn send(&mut self, command: &Command) -> Result<(), Error> {
        trace!(send = ?command);
        let data = command.to_wire();
        match self {
            Channel::Plain(stream) => write(stream, data.as_bytes()).await,
            Channel::Secure(stream) => write(stream, data.as_bytes()).await,
            Channel::Closed => Err(not_connected()),
        }
    }

    /// Read whatever is available into `buffer`, returning the number of
    /// bytes read. Zero means the server closed the connection.
    pub async fn read_into(&mut self, buffer: &mut Vec<u8>) -> Result<usize, Error> {
        let len = match self {
            Channel::Plain(stream) => stream.read_buf(buffer).await?,
            Channel::Secure(stream) => stream.read_buf(buffer).await?,
            Channel::Closed => return Err(not_connected()),
        };
        Ok(len)
    }

    /// Replace the plaintext stream with a TLS stream.
    ///
    /// If the handshake fails or takes longer than `timeout`, the channel
    /// keeps the plaintext stream.
    pub async fn upgrade<C>(&mut self, connector: &C, timeout: Duration) -> Result<(), Error>
    where
        C: Connector<Plain = P, Secure = S>,
    {
        match std::mem::replace(self, Channel::Closed) {
            Channel::Plain(stream) => match connector.upgrade(stream, timeout).await {
                Ok(secure) => {
                    *self = Channel::Secure(secure);
                    Ok(())
                }
                Err((err, stream)) => {
                    *self = Channel::Plain(stream);
                    match err.kind() {
                        io::ErrorKind::TimedOut => Err(Error::Timeout("TLS handshake")),
                        _ => Err(Error::Tls(err)),
                    }
                }
            },
            other => {
                *self = other;
                Err(Error::Tls(io::Error::other(
                    "connection is not in plaintext mode",
                )))
            }
        }
    }

    /// Shut the stream down. Closing an already closed channel does nothing.
    pub async fn close(&mut self) {
        let result = match std::mem::replace(self, Channel::Closed) {
            Channel::Plain(mut stream) => stream.shutdown().await,
            Channel::Secure(mut stream) => stream.shutdown().await,
            Channel::Closed => return,
        };
        match result {
            Ok(()) => debug!("smtp connection closed"),
            Err(err) => debug!("error while closing smtp connection: {err}"),
        }
    }
}

async fn write(
    stream: &mut (impl AsyncWrite + Unpin),
    data: &[u8],
) -> Result<(), Error> {
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

fn not_connected() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "smtp connection already closed",
    ))
}
