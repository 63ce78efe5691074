use std::sync::Arc;

use rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::ProxyError;

/// Client-side TLS settings for HTTPS targets reached through a tunnel.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
}

impl TlsContext {
    /// Trust the platform's native certificate store.
    pub fn with_native_roots() -> Result<Self, ProxyError> {
        let mut root_store = rustls::RootCertStore::empty();

        let native_certs = rustls_native_certs::load_native_certs()
            .map_err(|e| ProxyError::Tls(format!("loading native certificates: {e}")))?;
        let mut rejected = 0usize;
        for cert in native_certs {
            if root_store.add(&rustls::Certificate(cert.0)).is_err() {
                rejected += 1;
            }
        }
        if root_store.is_empty() {
            return Err(ProxyError::Tls("no usable root certificates found".into()));
        }
        debug!(loaded = root_store.len(), rejected, "loaded native root certificates");

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self::from_config(Arc::new(config)))
    }

    pub fn from_config(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.config))
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}
