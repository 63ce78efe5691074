//! The send action and the per-dispatch request state machine.
//!
//! A [`SendAction`] is configured once and dispatched any number of times.
//! Every dispatch resolves its templates, drives one [`InFlightRequest`] to a
//! terminal state and then fires exactly one of `on_success` / `on_error`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::client::ProxyClient;
use crate::config::SendActionConfig;
use crate::error::{ProxyError, Stage};
use crate::request::{HttpRequest, RequestBuilder};
use crate::response::{HttpResponse, ParseError, Progress, ResponseParser};
use crate::template::Templatable;

pub type SuccessCallback = Arc<dyn Fn() + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

const ABANDONED: &str = "request abandoned";

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Connecting,
    Authenticating,
    Sending,
    AwaitingResponse,
    ParsingResponse,
    Done,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Done | RequestState::Failed)
    }
}

/// One request lifecycle against a client, bounded by a single deadline.
pub(crate) struct InFlightRequest<'a> {
    client: &'a ProxyClient,
    id: u64,
    state: RequestState,
    started: Instant,
    deadline: Instant,
}

impl<'a> InFlightRequest<'a> {
    pub(crate) fn new(client: &'a ProxyClient) -> Self {
        let started = Instant::now();
        Self {
            client,
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            state: RequestState::Idle,
            started,
            deadline: started + client.timeout(),
        }
    }

    fn transition(&mut self, next: RequestState) {
        debug!(
            from = ?self.state,
            to = ?next,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "request state"
        );
        self.state = next;
    }

    pub(crate) async fn run(mut self, request: &HttpRequest) -> Result<HttpResponse, ProxyError> {
        let span = info_span!(
            "proxy_request",
            id = self.id,
            method = %request.method,
            url = %request.target,
        );
        async move {
            let client = self.client;
            let stats = &client.inner().stats;
            stats.request_started();
            // Counts as failed unless the lifecycle runs to completion.
            let mut succeeded =
                scopeguard::guard(false, |succeeded| stats.request_finished(succeeded));
            let result = self.drive(request).await;
            match &result {
                Ok(response) => {
                    self.transition(RequestState::Done);
                    debug!(status = response.status(), "request complete");
                }
                Err(e) => {
                    self.transition(RequestState::Failed);
                    debug!(error = %e, "request failed");
                }
            }
            *succeeded = result.is_ok();
            result
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self, request: &HttpRequest) -> Result<HttpResponse, ProxyError> {
        let client = self.client;
        let inner = client.inner();
        let endpoint = &inner.endpoint;
        let connector = inner.connector_for(&request.target).await?;

        let authorization = if connector.inline_credentials() {
            endpoint.authorization()
        } else {
            None
        };
        let wire = RequestBuilder::new(request, connector.form())
            .user_agent(&endpoint.user_agent)
            .proxy_authorization(authorization)
            .build()?;

        self.transition(RequestState::Connecting);
        // Custom connectors are held to the same deadline as the built-in ones.
        let mut connection = timeout_at(
            self.deadline,
            connector.connect(endpoint, self.deadline, Arc::clone(&inner.stats)),
        )
        .await
        .map_err(|_| ProxyError::Timeout(Stage::Connect))??;

        if connector.negotiates() {
            self.transition(RequestState::Authenticating);
            connection = timeout_at(
                self.deadline,
                connector.negotiate(connection, endpoint, &request.target),
            )
            .await
            .map_err(|_| ProxyError::Timeout(Stage::Tunnel))??;
        }

        self.transition(RequestState::Sending);
        connection.send(&wire, Stage::Send).await?;

        self.transition(RequestState::AwaitingResponse);
        let mut parser = ResponseParser::new(request.expects_body(), inner.max_response_size);
        let mut chunk = connection.next_chunk(Stage::Response).await?;
        self.transition(RequestState::ParsingResponse);
        loop {
            match chunk {
                Some(bytes) => {
                    if parser.feed(&bytes)? == Progress::Complete {
                        break;
                    }
                }
                None => {
                    parser.finish()?;
                    break;
                }
            }
            chunk = connection.next_chunk(Stage::Response).await?;
        }
        connection.close().await;

        parser
            .into_response()
            .ok_or(ProxyError::Parse(ParseError::IncompleteHead))
    }
}

/// Delivers the terminal callback for one dispatch.
///
/// Consuming `succeed`/`fail` makes a second delivery impossible; dropping an
/// undelivered completion reports the request as abandoned.
struct Completion {
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
    delivered: bool,
}

impl Completion {
    fn new(on_success: Option<SuccessCallback>, on_error: Option<ErrorCallback>) -> Self {
        Self {
            on_success,
            on_error,
            delivered: false,
        }
    }

    fn succeed(mut self) {
        self.delivered = true;
        if let Some(callback) = self.on_success.take() {
            callback();
        }
    }

    fn fail(mut self, message: String) {
        self.delivered = true;
        if let Some(callback) = self.on_error.take() {
            callback(message);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.delivered {
            return;
        }
        self.delivered = true;
        warn!("request dropped before completing");
        if let Some(callback) = self.on_error.take() {
            callback(ABANDONED.to_string());
        }
    }
}

/// A configured proxied request, triggered with arguments of type `A`.
pub struct SendAction<A> {
    client: ProxyClient,
    url: Option<Templatable<A>>,
    method: Templatable<A>,
    headers: Vec<(String, Templatable<A>)>,
    body: Option<Templatable<A>>,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl<A> Clone for SendAction<A> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            url: self.url.clone(),
            method: self.method.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<A> fmt::Debug for SendAction<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendAction")
            .field("client", &self.client)
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

impl<A> SendAction<A> {
    pub fn new(client: &ProxyClient) -> Self {
        Self {
            client: client.clone(),
            url: None,
            method: Templatable::Static("GET".to_string()),
            headers: Vec::new(),
            body: None,
            on_success: None,
            on_error: None,
        }
    }

    pub fn from_config(client: &ProxyClient, config: SendActionConfig) -> Self {
        let mut action = Self::new(client);
        action.set_url(config.url).set_method(config.method);
        for (name, value) in config.headers {
            action.add_header(name, value);
        }
        if let Some(body) = config.body {
            action.set_body(body);
        }
        action
    }

    pub fn set_url(&mut self, url: impl Into<Templatable<A>>) -> &mut Self {
        self.url = Some(url.into());
        self
    }

    pub fn set_method(&mut self, method: impl Into<Templatable<A>>) -> &mut Self {
        self.method = method.into();
        self
    }

    /// Append a header; an existing header with the same name keeps its
    /// position and takes the new value.
    pub fn add_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Templatable<A>>,
    ) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name, value)),
        }
        self
    }

    pub fn set_body(&mut self, body: impl Into<Templatable<A>>) -> &mut Self {
        self.body = Some(body.into());
        self
    }

    pub fn on_success<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Resolve every template against `args` into a concrete request.
    pub fn resolve(&self, args: &A) -> Result<HttpRequest, ProxyError> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| ProxyError::configuration("send action has no url"))?
            .resolve(args)
            .map_err(|e| e.in_field("url"))?;
        let method = self
            .method
            .resolve(args)
            .map_err(|e| e.in_field("method"))?;

        let mut request = HttpRequest::new(&method, &url)?;
        for (name, value) in &self.headers {
            let value = value
                .resolve(args)
                .map_err(|e| e.in_field(&format!("header `{name}`")))?;
            request.headers.push((name.clone(), value));
        }
        if let Some(body) = &self.body {
            request.body = Some(body.resolve(args).map_err(|e| e.in_field("body"))?);
        }
        Ok(request)
    }

    /// Run one dispatch to completion on the current task.
    ///
    /// Fires the configured callback and also returns the outcome.
    pub async fn execute(&self, args: A) -> Result<HttpResponse, ProxyError> {
        self.complete(args, self.completion()).await
    }

    fn completion(&self) -> Completion {
        Completion::new(self.on_success.clone(), self.on_error.clone())
    }

    async fn complete(&self, args: A, completion: Completion) -> Result<HttpResponse, ProxyError> {
        let resolved = self.resolve(&args);
        drop(args);
        let outcome = match resolved {
            Ok(request) => self.client.send(&request).await,
            Err(e) => {
                warn!(error = %e, "request not sent");
                Err(e)
            }
        };

        match &outcome {
            Ok(response) => {
                info!(status = response.status(), "request successful");
                completion.succeed();
            }
            Err(e) => {
                error!(error = %e, "request failed");
                completion.fail(e.to_string());
            }
        }
        outcome
    }
}

impl<A: Send + 'static> SendAction<A> {
    /// Start one independent request lifecycle on the current runtime.
    ///
    /// The callback is armed before the task is spawned, so a task that is
    /// never polled still reports `request abandoned`.
    pub fn dispatch(&self, args: A) -> JoinHandle<()> {
        let action = self.clone();
        let completion = self.completion();
        tokio::spawn(async move {
            let _ = action.complete(args, completion).await;
        })
    }
}
