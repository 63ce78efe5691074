use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::action::InFlightRequest;
use crate::auth::ProxyCredentials;
use crate::config::{ProxyClientConfig, ProxyMode};
use crate::error::ProxyError;
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::stats::{ClientStats, StatsSnapshot};
use crate::target::{Scheme, TargetUrl};
use crate::tls::TlsContext;
use crate::transport::{ForwardConnector, ProxyConnector, ProxyEndpoint, TunnelConnector};

pub(crate) struct ClientInner {
    pub(crate) endpoint: ProxyEndpoint,
    pub(crate) timeout: Duration,
    pub(crate) mode: ProxyMode,
    pub(crate) max_response_size: usize,
    pub(crate) stats: Arc<ClientStats>,
    connector: Option<Arc<dyn ProxyConnector>>,
    // Loaded at most once; a failure is kept so later requests fail fast.
    tls: OnceCell<Result<TlsContext, String>>,
}

/// Long-lived, read-only proxy configuration shared by every request.
///
/// Cloning is cheap; clones share configuration and counters but never
/// connection state.
#[derive(Clone)]
pub struct ProxyClient {
    inner: Arc<ClientInner>,
}

/// Builds a [`ProxyClient`] with a custom strategy or TLS settings.
pub struct ProxyClientBuilder {
    config: ProxyClientConfig,
    connector: Option<Arc<dyn ProxyConnector>>,
    tls: Option<TlsContext>,
}

impl ProxyClientBuilder {
    /// Use `connector` for every request instead of choosing by [`ProxyMode`].
    pub fn connector(mut self, connector: Arc<dyn ProxyConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// TLS settings for `https` targets; native roots are loaded lazily otherwise.
    pub fn tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Validate the configuration. Fails on an empty host, port 0 or a zero timeout.
    pub fn build(self) -> Result<ProxyClient, ProxyError> {
        let config = self.config;

        let host = config.proxy_host.trim();
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(ProxyError::configuration(format!(
                "invalid proxy host `{}`",
                config.proxy_host
            )));
        }
        if config.proxy_port == 0 {
            return Err(ProxyError::configuration("proxy port must not be 0"));
        }
        if config.timeout.is_zero() {
            return Err(ProxyError::configuration("timeout must be positive"));
        }
        if config.max_response_size == 0 {
            return Err(ProxyError::configuration("max_response_size must be positive"));
        }

        let credentials = ProxyCredentials::from_parts(
            config.proxy_username.as_deref(),
            config.proxy_password.as_deref(),
        );
        if credentials.is_none()
            && (config.proxy_username.is_some() || config.proxy_password.is_some())
        {
            warn!("proxy username and password must both be set; sending no credentials");
        }

        let tls = match self.tls {
            Some(context) => OnceCell::new_with(Some(Ok(context))),
            None => OnceCell::new(),
        };

        Ok(ProxyClient {
            inner: Arc::new(ClientInner {
                endpoint: ProxyEndpoint {
                    host: host.to_string(),
                    port: config.proxy_port,
                    credentials,
                    user_agent: config.user_agent,
                },
                timeout: config.timeout,
                mode: config.mode,
                max_response_size: config.max_response_size,
                stats: Arc::new(ClientStats::new()),
                connector: self.connector,
                tls,
            }),
        })
    }
}

impl ProxyClient {
    /// Validate `config` and build a client using the built-in strategies.
    pub fn new(config: ProxyClientConfig) -> Result<Self, ProxyError> {
        Self::builder(config).build()
    }

    /// Start a builder for a custom connector or TLS context.
    pub fn builder(config: ProxyClientConfig) -> ProxyClientBuilder {
        ProxyClientBuilder {
            config,
            connector: None,
            tls: None,
        }
    }

    /// Proxy host with surrounding whitespace trimmed.
    pub fn proxy_host(&self) -> &str {
        &self.inner.endpoint.host
    }

    /// Proxy TCP port.
    pub fn proxy_port(&self) -> u16 {
        self.inner.endpoint.port
    }

    /// Deadline applied to each request from connect to the last response byte.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// How requests reach the target through the proxy.
    pub fn mode(&self) -> ProxyMode {
        self.inner.mode
    }

    /// True when both username and password were configured.
    pub fn has_credentials(&self) -> bool {
        self.inner.endpoint.credentials.is_some()
    }

    /// Point-in-time copy of the client's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Emit the counters as one `info` event.
    pub fn log_stats(&self) {
        self.inner.stats.log_summary();
    }

    pub(crate) fn inner(&self) -> &ClientInner {
        &self.inner
    }

    /// Log the effective configuration. The password is never printed.
    pub fn dump_config(&self) {
        let endpoint = &self.inner.endpoint;
        info!(
            proxy_host = %endpoint.host,
            proxy_port = endpoint.port,
            proxy_username = endpoint.credentials.as_ref().map(ProxyCredentials::username),
            timeout_ms = self.inner.timeout.as_millis() as u64,
            mode = ?self.inner.mode,
            "HTTP proxy client"
        );
    }

    /// Send one request through the proxy, without callbacks.
    pub async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, ProxyError> {
        InFlightRequest::new(self).run(request).await
    }
}

impl ClientInner {
    pub(crate) async fn connector_for(
        &self,
        target: &TargetUrl,
    ) -> Result<Arc<dyn ProxyConnector>, ProxyError> {
        if let Some(connector) = &self.connector {
            return Ok(Arc::clone(connector));
        }
        let tunnel = match self.mode {
            ProxyMode::Forward => false,
            ProxyMode::Tunnel => true,
            ProxyMode::Auto => target.scheme() == Scheme::Https,
        };
        if !tunnel {
            return Ok(Arc::new(ForwardConnector));
        }
        let tls = match target.scheme() {
            Scheme::Https => Some(self.tls_context().await?),
            Scheme::Http => None,
        };
        Ok(Arc::new(TunnelConnector::new(tls)))
    }

    /// The configured TLS context, or the native roots loaded off the runtime.
    async fn tls_context(&self) -> Result<TlsContext, ProxyError> {
        let loaded = self
            .tls
            .get_or_init(|| async {
                debug!("loading native root certificates");
                match tokio::task::spawn_blocking(TlsContext::with_native_roots).await {
                    Ok(Ok(context)) => Ok(context),
                    Ok(Err(ProxyError::Tls(message))) => Err(message),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(e) => Err(format!("loading native certificates: {e}")),
                }
            })
            .await;
        if let Err(message) = loaded {
            warn!(error = %message, "no TLS context for https target");
        }
        loaded.clone().map_err(ProxyError::Tls)
    }
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("proxy_host", &self.inner.endpoint.host)
            .field("proxy_port", &self.inner.endpoint.port)
            .field("credentials", &self.inner.endpoint.credentials)
            .field("timeout", &self.inner.timeout)
            .field("mode", &self.inner.mode)
            .finish()
    }
}
