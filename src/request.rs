use crate::auth::PROXY_AUTHORIZATION;
use crate::error::ProxyError;
use crate::target::TargetUrl;

/// How the request line addresses the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestForm {
    /// `GET http://host/path HTTP/1.1`, for forwarding proxies.
    Absolute,
    /// `GET /path HTTP/1.1`, for requests sent through a tunnel.
    Origin,
}

/// A fully resolved request, ready to be serialized.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub target: TargetUrl,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    /// Validate `method` as an HTTP token and parse `url` as the target.
    pub fn new(method: &str, url: &str) -> Result<Self, ProxyError> {
        let method = method.trim().to_string();
        if !is_token(&method) {
            return Err(ProxyError::configuration(format!(
                "invalid request method `{method}`"
            )));
        }
        Ok(Self {
            method,
            target: TargetUrl::parse(url)?,
            headers: Vec::new(),
            body: None,
        })
    }

    /// Append a header. Duplicates are kept in order.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Set the body; `Content-Length` is added when the request is built.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// `HEAD` responses never carry a body regardless of their framing headers.
    pub fn expects_body(&self) -> bool {
        !self.method.eq_ignore_ascii_case("HEAD")
    }
}

/// Serializes an [`HttpRequest`] into the bytes written to the wire.
#[derive(Debug, Clone)]
pub struct RequestBuilder<'a> {
    request: &'a HttpRequest,
    form: RequestForm,
    user_agent: Option<&'a str>,
    proxy_authorization: Option<String>,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(request: &'a HttpRequest, form: RequestForm) -> Self {
        Self {
            request,
            form,
            user_agent: None,
            proxy_authorization: None,
        }
    }

    pub fn user_agent(mut self, user_agent: &'a str) -> Self {
        self.user_agent = Some(user_agent);
        self
    }

    pub fn proxy_authorization(mut self, value: Option<String>) -> Self {
        self.proxy_authorization = value;
        self
    }

    pub fn build(&self) -> Result<Vec<u8>, ProxyError> {
        let request = self.request;
        for (name, value) in &request.headers {
            validate_header(name, value)?;
        }

        let target = match self.form {
            RequestForm::Absolute => request.target.absolute_form(),
            RequestForm::Origin => request.target.path_and_query().to_string(),
        };

        let mut head = format!("{} {} HTTP/1.1\r\n", request.method, target);
        push_header(&mut head, "Host", &request.target.host_header());

        if let Some(agent) = self.user_agent {
            if !request.has_header("User-Agent") {
                push_header(&mut head, "User-Agent", agent);
            }
        }

        for (name, value) in &request.headers {
            push_header(&mut head, name, value);
        }

        if let Some(auth) = &self.proxy_authorization {
            if !request.has_header(PROXY_AUTHORIZATION) {
                push_header(&mut head, PROXY_AUTHORIZATION, auth);
            }
        }

        if let Some(body) = &request.body {
            if !request.has_header("Content-Length") {
                push_header(&mut head, "Content-Length", &body.len().to_string());
            }
        }

        if !request.has_header("Connection") {
            push_header(&mut head, "Connection", "close");
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        if let Some(body) = &request.body {
            bytes.extend_from_slice(body.as_bytes());
        }
        Ok(bytes)
    }
}

/// Serialize the `CONNECT` request that opens a tunnel to `target`.
pub fn connect_request(
    target: &TargetUrl,
    user_agent: &str,
    proxy_authorization: Option<&str>,
) -> Vec<u8> {
    let authority = target.connect_authority();
    let mut head = format!("CONNECT {authority} HTTP/1.1\r\n");
    push_header(&mut head, "Host", &authority);
    push_header(&mut head, "User-Agent", user_agent);
    if let Some(auth) = proxy_authorization {
        push_header(&mut head, PROXY_AUTHORIZATION, auth);
    }
    head.push_str("\r\n");
    head.into_bytes()
}

fn push_header(head: &mut String, name: &str, value: &str) {
    head.push_str(name);
    head.push_str(": ");
    head.push_str(value);
    head.push_str("\r\n");
}

fn validate_header(name: &str, value: &str) -> Result<(), ProxyError> {
    if !is_token(name) {
        return Err(ProxyError::configuration(format!(
            "invalid header name `{name}`"
        )));
    }
    if value.contains(['\r', '\n']) {
        return Err(ProxyError::configuration(format!(
            "header `{name}` value contains a line break"
        )));
    }
    Ok(())
}

// RFC 9110 token characters.
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}
