//! Connection management for proxied requests.
//!
//! A [`Connection`] owns exactly one TCP connection to the proxy and shares a
//! single deadline across connect, send and receive. How the proxy is used is
//! a [`ProxyConnector`] strategy: [`ForwardConnector`] hands the proxy an
//! absolute-form request, [`TunnelConnector`] opens a `CONNECT` tunnel first
//! and wraps it in TLS for `https` targets.

use std::sync::Arc;

use async_trait::async_trait;
use scopeguard::ScopeGuard;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::auth::ProxyCredentials;
use crate::error::{ProxyError, Stage};
use crate::request::{connect_request, RequestForm};
use crate::response::{ParseError, Progress, ResponseParser};
use crate::stats::ClientStats;
use crate::target::{Scheme, TargetUrl};
use crate::tls::TlsContext;

const READ_CHUNK_SIZE: usize = 4096;

pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

/// Where and how to reach the upstream proxy.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
    pub user_agent: String,
}

impl ProxyEndpoint {
    pub fn authorization(&self) -> Option<String> {
        self.credentials.as_ref().map(ProxyCredentials::header_value)
    }
}

fn count_close(stats: Arc<ClientStats>) {
    stats.connection_closed();
}

fn check_deadline(deadline: Instant, stage: Stage) -> Result<(), ProxyError> {
    if Instant::now() >= deadline {
        return Err(ProxyError::Timeout(stage));
    }
    Ok(())
}

/// One exclusively owned connection to the proxy.
///
/// The socket closes when the value is dropped, so every early return in the
/// request lifecycle releases it.
pub struct Connection {
    stream: Box<dyn ProxyStream>,
    deadline: Instant,
    peer: String,
    pending: Vec<u8>,
    stats: ScopeGuard<Arc<ClientStats>, fn(Arc<ClientStats>)>,
}

impl Connection {
    pub async fn open(
        host: &str,
        port: u16,
        deadline: Instant,
        stats: Arc<ClientStats>,
    ) -> Result<Self, ProxyError> {
        check_deadline(deadline, Stage::Connect)?;

        let stream = timeout_at(deadline, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ProxyError::Timeout(Stage::Connect))?
            .map_err(|e| ProxyError::Connect(format!("{host}:{port}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not disable nagle");
        }

        stats.connection_opened();
        let peer = format!("{host}:{port}");
        debug!(peer = %peer, "connected to proxy");

        Ok(Self::from_stream(Box::new(stream), peer, deadline, stats))
    }

    /// Wrap an already connected stream; the stats guard counts it closed on drop.
    pub fn from_stream(
        stream: Box<dyn ProxyStream>,
        peer: String,
        deadline: Instant,
        stats: Arc<ClientStats>,
    ) -> Self {
        Self {
            stream,
            deadline,
            peer,
            pending: Vec::new(),
            stats: scopeguard::guard(stats, count_close as fn(Arc<ClientStats>)),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, bytes: &[u8], stage: Stage) -> Result<(), ProxyError> {
        check_deadline(self.deadline, stage)?;
        let stream = &mut self.stream;
        timeout_at(self.deadline, async move {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| ProxyError::Timeout(stage))?
        .map_err(|e| ProxyError::io(stage, e))?;
        self.stats.record_sent(bytes.len());
        Ok(())
    }

    /// Next chunk of bytes from the peer, or `None` once it has closed.
    pub async fn next_chunk(&mut self, stage: Stage) -> Result<Option<Vec<u8>>, ProxyError> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        check_deadline(self.deadline, stage)?;

        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let n = timeout_at(self.deadline, self.stream.read(&mut buf))
            .await
            .map_err(|_| ProxyError::Timeout(stage))?
            .map_err(|e| ProxyError::io(stage, e))?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        self.stats.record_received(n);
        Ok(Some(buf))
    }

    /// Hand bytes read past the end of a handshake back to the next reader.
    fn unread(&mut self, mut bytes: Vec<u8>) {
        bytes.append(&mut self.pending);
        self.pending = bytes;
    }

    /// Graceful shutdown, bounded by the request deadline.
    pub async fn close(mut self) {
        if Instant::now() < self.deadline {
            if let Ok(Err(e)) = timeout_at(self.deadline, self.stream.shutdown()).await {
                debug!(peer = %self.peer, error = %e, "shutdown failed");
            }
        }
        debug!(peer = %self.peer, "connection closed");
    }

    /// Run a TLS handshake with `server_name` over this connection.
    pub async fn into_tls(self, server_name: &str, tls: &TlsContext) -> Result<Self, ProxyError> {
        let Connection {
            stream,
            deadline,
            peer,
            pending,
            stats,
        } = self;
        if !pending.is_empty() {
            return Err(ProxyError::Tls(
                "proxy sent data before the TLS handshake".into(),
            ));
        }
        check_deadline(deadline, Stage::Handshake)?;

        let name = rustls::ServerName::try_from(server_name)
            .map_err(|_| ProxyError::Tls(format!("invalid server name `{server_name}`")))?;
        let tls_stream = timeout_at(deadline, tls.connector().connect(name, stream))
            .await
            .map_err(|_| ProxyError::Timeout(Stage::Handshake))?
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        debug!(peer = %peer, server_name, "tls established through tunnel");

        Ok(Self {
            stream: Box::new(tls_stream),
            deadline,
            peer,
            pending: Vec::new(),
            stats,
        })
    }
}

/// Strategy for reaching the target through the proxy.
#[async_trait]
pub trait ProxyConnector: Send + Sync {
    /// Request-line form used once the connection is ready.
    fn form(&self) -> RequestForm;

    /// Whether `Proxy-Authorization` belongs on the request itself.
    fn inline_credentials(&self) -> bool {
        self.form() == RequestForm::Absolute
    }

    /// Whether [`negotiate`](Self::negotiate) performs a round trip.
    fn negotiates(&self) -> bool {
        false
    }

    async fn connect(
        &self,
        endpoint: &ProxyEndpoint,
        deadline: Instant,
        stats: Arc<ClientStats>,
    ) -> Result<Connection, ProxyError> {
        Connection::open(&endpoint.host, endpoint.port, deadline, stats).await
    }

    async fn negotiate(
        &self,
        connection: Connection,
        _endpoint: &ProxyEndpoint,
        _target: &TargetUrl,
    ) -> Result<Connection, ProxyError> {
        Ok(connection)
    }
}

/// Inline-forwarding proxy: the request goes to the proxy as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForwardConnector;

#[async_trait]
impl ProxyConnector for ForwardConnector {
    fn form(&self) -> RequestForm {
        RequestForm::Absolute
    }
}

/// `CONNECT` tunnel through the proxy, with TLS inside for `https` targets.
#[derive(Debug, Default, Clone)]
pub struct TunnelConnector {
    tls: Option<TlsContext>,
}

impl TunnelConnector {
    pub fn new(tls: Option<TlsContext>) -> Self {
        Self { tls }
    }
}

#[async_trait]
impl ProxyConnector for TunnelConnector {
    fn form(&self) -> RequestForm {
        RequestForm::Origin
    }

    fn negotiates(&self) -> bool {
        true
    }

    async fn negotiate(
        &self,
        mut connection: Connection,
        endpoint: &ProxyEndpoint,
        target: &TargetUrl,
    ) -> Result<Connection, ProxyError> {
        let authorization = endpoint.authorization();
        let request = connect_request(target, &endpoint.user_agent, authorization.as_deref());
        connection.send(&request, Stage::Tunnel).await?;

        let mut parser = ResponseParser::new(false, 0);
        loop {
            match connection.next_chunk(Stage::Tunnel).await? {
                Some(chunk) => {
                    if parser.feed(&chunk)? == Progress::Complete {
                        break;
                    }
                }
                None => {
                    parser.finish()?;
                    break;
                }
            }
        }

        let leftover = parser.take_remaining();
        let response = parser
            .into_response()
            .ok_or(ProxyError::Parse(ParseError::IncompleteHead))?;
        if !response.is_success() {
            warn!(
                proxy = %connection.peer(),
                target = %target.connect_authority(),
                status = response.status(),
                "proxy refused tunnel"
            );
            return Err(ProxyError::Tunnel(response.status_line()));
        }
        debug!(target = %target.connect_authority(), "tunnel established");
        connection.unread(leftover);

        match target.scheme() {
            Scheme::Http => Ok(connection),
            Scheme::Https => {
                let tls = self.tls.as_ref().ok_or_else(|| {
                    ProxyError::configuration("https target requires a TLS context")
                })?;
                connection.into_tls(target.host(), tls).await
            }
        }
    }
}
