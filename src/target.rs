use std::fmt;

use url::{Host, Url};

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// The origin server a request is ultimately addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

impl TargetUrl {
    /// Parse an absolute `http://` or `https://` URL.
    ///
    /// The fragment is dropped, a missing path becomes `/`, and bracketed
    /// IPv6 literals are accepted. Userinfo is rejected rather than silently
    /// forwarded.
    pub fn parse(url: &str) -> Result<Self, ProxyError> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| ProxyError::configuration(format!("invalid url `{url}`: {e}")))?;

        let scheme = match parsed.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(ProxyError::configuration(format!(
                    "unsupported url scheme `{other}`"
                )))
            }
        };

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(ProxyError::configuration(format!(
                "url `{url}` carries userinfo; configure proxy credentials instead"
            )));
        }

        let host = match parsed.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => {
                return Err(ProxyError::configuration(format!("url `{url}` has no host")))
            }
        };

        let port = match parsed.port_or_known_default() {
            Some(0) | None => {
                return Err(ProxyError::configuration(format!("url `{url}` has an invalid port")))
            }
            Some(port) => port,
        };

        let mut path = parsed.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    /// `http` or `https`; decides the default port and whether TLS runs in the tunnel.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host without IPv6 brackets, suitable for DNS and TLS server names.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, or the scheme default.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Origin-form request target: path plus `?query`, never empty.
    pub fn path_and_query(&self) -> &str {
        &self.path
    }

    fn bracketed_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// `host[:port]` with the port omitted when it is the scheme default.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.bracketed_host()
        } else {
            format!("{}:{}", self.bracketed_host(), self.port)
        }
    }

    /// `host:port` as used by a `CONNECT` request line.
    pub fn connect_authority(&self) -> String {
        format!("{}:{}", self.bracketed_host(), self.port)
    }

    /// Request target for a forwarding proxy.
    pub fn absolute_form(&self) -> String {
        format!("{}://{}{}", self.scheme.as_str(), self.host_header(), self.path)
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.absolute_form())
    }
}
