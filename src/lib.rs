//! Asynchronous HTTP client that relays requests through an upstream proxy.
//!
//! A [`ProxyClient`] holds the proxy address, optional Basic credentials and
//! one timeout that bounds every request end to end. A [`SendAction`] describes
//! a request whose URL, method, headers and body may be computed from trigger
//! arguments; each dispatch runs independently and reports through exactly one
//! of its `on_success` / `on_error` callbacks.
//!
//! ```no_run
//! use proxy_client::{ProxyClient, ProxyClientConfig, SendAction};
//!
//! # async fn demo() -> Result<(), proxy_client::ProxyError> {
//! let client = ProxyClient::new(
//!     ProxyClientConfig::new("proxy.lan", 3128).with_credentials("user", "secret"),
//! )?;
//!
//! let mut action: SendAction<()> = SendAction::new(&client);
//! action
//!     .set_url("http://example.com/hook")
//!     .set_method("POST")
//!     .add_header("Content-Type", "text/plain")
//!     .set_body("door opened")
//!     .on_success(|| tracing::info!("delivered"))
//!     .on_error(|message| tracing::warn!(%message, "not delivered"));
//!
//! action.dispatch(()).await.ok();
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod request;
pub mod response;
pub mod stats;
pub mod target;
pub mod template;
pub mod tls;
pub mod transport;

pub use action::{ErrorCallback, RequestState, SendAction, SuccessCallback};
pub use auth::ProxyCredentials;
pub use client::{ProxyClient, ProxyClientBuilder};
pub use config::{ConfigError, FileConfig, ProxyClientConfig, ProxyMode, SendActionConfig};
pub use error::{ProxyError, Stage};
pub use request::{HttpRequest, RequestForm};
pub use response::{HttpResponse, ParseError};
pub use stats::StatsSnapshot;
pub use target::{Scheme, TargetUrl};
pub use template::{ResolutionError, Templatable};
pub use tls::TlsContext;
pub use transport::{ForwardConnector, ProxyConnector, TunnelConnector};
