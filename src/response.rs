use std::borrow::Cow;

/// Upper bound for the status line plus header block.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid status line `{0}`")]
    InvalidStatusLine(String),
    #[error("invalid header line `{0}`")]
    InvalidHeader(String),
    #[error("header block exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("invalid content-length `{0}`")]
    InvalidContentLength(String),
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
    #[error("body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("connection closed before the header block completed")]
    IncompleteHead,
    #[error("body truncated after {received} of {expected} bytes")]
    TruncatedBody { expected: usize, received: usize },
    #[error("connection closed inside a chunked body")]
    TruncatedChunk,
}

/// A completely received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    version: String,
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn status_line(&self) -> String {
        format!("{} {} {}", self.version, self.status, self.reason)
            .trim_end()
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(usize),
    Chunked(Chunk),
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Head,
    Body(Framing),
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    NeedMore,
    Complete,
}

/// Incremental HTTP/1.x response parser.
///
/// Bytes are pushed with [`feed`](Self::feed) as they arrive; the parser keeps
/// any incomplete line or chunk between calls. [`finish`](Self::finish) tells
/// it the peer closed the connection, which completes a read-until-close body
/// and turns every other unfinished state into an error.
#[derive(Debug)]
pub struct ResponseParser {
    buffer: Vec<u8>,
    phase: Phase,
    expects_body: bool,
    max_body: usize,
    head_bytes: usize,
    status: Option<(String, u16, String)>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ResponseParser {
    /// `expects_body` is false for responses to `HEAD` and `CONNECT`.
    pub fn new(expects_body: bool, max_body: usize) -> Self {
        Self {
            buffer: Vec::new(),
            phase: Phase::Head,
            expects_body,
            max_body,
            head_bytes: 0,
            status: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Progress, ParseError> {
        if self.phase == Phase::Complete {
            self.buffer.extend_from_slice(data);
            return Ok(Progress::Complete);
        }
        self.buffer.extend_from_slice(data);

        loop {
            match self.phase {
                Phase::Complete => return Ok(Progress::Complete),
                Phase::Head => {
                    if !self.parse_head()? {
                        return Ok(Progress::NeedMore);
                    }
                    self.end_of_head()?;
                }
                Phase::Body(framing) => {
                    if !self.parse_body(framing)? {
                        return Ok(Progress::NeedMore);
                    }
                }
            }
        }
    }

    /// Signal end of stream.
    pub fn finish(&mut self) -> Result<(), ParseError> {
        match self.phase {
            Phase::Complete => Ok(()),
            Phase::Head => Err(ParseError::IncompleteHead),
            Phase::Body(Framing::UntilClose) => {
                self.phase = Phase::Complete;
                Ok(())
            }
            Phase::Body(Framing::Length(remaining)) => Err(ParseError::TruncatedBody {
                expected: self.body.len() + remaining,
                received: self.body.len(),
            }),
            Phase::Body(Framing::Chunked(_)) => Err(ParseError::TruncatedChunk),
        }
    }

    /// Bytes received after the end of the message, e.g. early tunnel data.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub fn into_response(self) -> Option<HttpResponse> {
        if self.phase != Phase::Complete {
            return None;
        }
        let (version, status, reason) = self.status?;
        Some(HttpResponse {
            version,
            status,
            reason,
            headers: self.headers,
            body: self.body,
        })
    }

    fn take_line(&mut self) -> Option<(String, usize)> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.buffer.drain(..=end).collect();
        let mut line = &raw[..raw.len() - 1];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        Some((String::from_utf8_lossy(line).into_owned(), raw.len()))
    }

    /// Returns true once the blank line closing the header block is consumed.
    fn parse_head(&mut self) -> Result<bool, ParseError> {
        loop {
            let Some((line, consumed)) = self.take_line() else {
                if self.head_bytes + self.buffer.len() > MAX_HEAD_SIZE {
                    return Err(ParseError::HeadTooLarge(MAX_HEAD_SIZE));
                }
                return Ok(false);
            };
            self.head_bytes += consumed;
            if self.head_bytes > MAX_HEAD_SIZE {
                return Err(ParseError::HeadTooLarge(MAX_HEAD_SIZE));
            }

            if self.status.is_none() {
                if line.is_empty() {
                    continue;
                }
                self.status = Some(parse_status_line(&line)?);
                continue;
            }

            if line.is_empty() {
                return Ok(true);
            }
            self.push_header_line(line)?;
        }
    }

    fn push_header_line(&mut self, line: String) -> Result<(), ParseError> {
        if line.starts_with([' ', '\t']) {
            // obs-fold
            let (_, value) = self
                .headers
                .last_mut()
                .ok_or_else(|| ParseError::InvalidHeader(line.clone()))?;
            value.push(' ');
            value.push_str(line.trim());
            return Ok(());
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::InvalidHeader(line.clone()))?;
        if name.is_empty() || name.trim_end() != name {
            return Err(ParseError::InvalidHeader(line.clone()));
        }
        self.headers
            .push((name.to_string(), value.trim().to_string()));
        Ok(())
    }

    fn end_of_head(&mut self) -> Result<(), ParseError> {
        let status = self.status.as_ref().map(|(_, code, _)| *code).unwrap_or(0);

        if (100..200).contains(&status) && status != 101 {
            self.status = None;
            self.headers.clear();
            self.head_bytes = 0;
            return Ok(());
        }

        // Trailers get their own header budget.
        self.head_bytes = 0;
        self.phase = match self.framing(status)? {
            None | Some(Framing::Length(0)) => Phase::Complete,
            Some(framing) => Phase::Body(framing),
        };
        Ok(())
    }

    fn framing(&self, status: u16) -> Result<Option<Framing>, ParseError> {
        if !self.expects_body || (100..200).contains(&status) || status == 204 || status == 304
        {
            return Ok(None);
        }

        let transfer_codings: Vec<String> = self
            .header_values("Transfer-Encoding")
            .flat_map(|v| v.split(','))
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        if let Some(last) = transfer_codings.last() {
            return Ok(Some(if last == "chunked" {
                Framing::Chunked(Chunk::Size)
            } else {
                Framing::UntilClose
            }));
        }

        let mut length: Option<usize> = None;
        for raw in self.header_values("Content-Length").flat_map(|v| v.split(',')) {
            let raw = raw.trim();
            let parsed = raw
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength(raw.to_string()))?;
            match length {
                Some(previous) if previous != parsed => {
                    return Err(ParseError::InvalidContentLength(format!(
                        "{previous} conflicts with {parsed}"
                    )))
                }
                _ => length = Some(parsed),
            }
        }

        match length {
            Some(n) if n > self.max_body => Err(ParseError::BodyTooLarge(self.max_body)),
            Some(n) => Ok(Some(Framing::Length(n))),
            None => Ok(Some(Framing::UntilClose)),
        }
    }

    fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns false when more input is needed.
    fn parse_body(&mut self, framing: Framing) -> Result<bool, ParseError> {
        match framing {
            Framing::Length(remaining) => {
                let take = remaining.min(self.buffer.len());
                self.body.extend(self.buffer.drain(..take));
                let remaining = remaining - take;
                if remaining == 0 {
                    self.phase = Phase::Complete;
                    Ok(true)
                } else {
                    self.phase = Phase::Body(Framing::Length(remaining));
                    Ok(false)
                }
            }
            Framing::UntilClose => {
                if self.body.len() + self.buffer.len() > self.max_body {
                    return Err(ParseError::BodyTooLarge(self.max_body));
                }
                self.body.append(&mut self.buffer);
                Ok(false)
            }
            Framing::Chunked(chunk) => self.parse_chunk(chunk),
        }
    }

    fn parse_chunk(&mut self, chunk: Chunk) -> Result<bool, ParseError> {
        let next = match chunk {
            Chunk::Size => {
                let Some((line, _)) = self.take_line() else {
                    if self.buffer.len() > MAX_CHUNK_LINE {
                        return Err(ParseError::InvalidChunk("size line too long".into()));
                    }
                    return Ok(false);
                };
                let size_field = line.split(';').next().unwrap_or_default().trim();
                let size = usize::from_str_radix(size_field, 16)
                    .map_err(|_| ParseError::InvalidChunk(format!("bad size `{size_field}`")))?;
                if size == 0 {
                    Chunk::Trailers
                } else {
                    if self.body.len().saturating_add(size) > self.max_body {
                        return Err(ParseError::BodyTooLarge(self.max_body));
                    }
                    Chunk::Data(size)
                }
            }
            Chunk::Data(remaining) => {
                if self.buffer.is_empty() {
                    return Ok(false);
                }
                let take = remaining.min(self.buffer.len());
                self.body.extend(self.buffer.drain(..take));
                match remaining - take {
                    0 => Chunk::DataEnd,
                    left => Chunk::Data(left),
                }
            }
            Chunk::DataEnd => {
                if self.buffer.starts_with(b"\r\n") {
                    self.buffer.drain(..2);
                } else if self.buffer.starts_with(b"\n") {
                    self.buffer.drain(..1);
                } else if self.buffer.is_empty() || self.buffer == b"\r" {
                    return Ok(false);
                } else {
                    return Err(ParseError::InvalidChunk(
                        "missing line break after chunk data".into(),
                    ));
                }
                Chunk::Size
            }
            Chunk::Trailers => {
                let Some((line, consumed)) = self.take_line() else {
                    if self.head_bytes + self.buffer.len() > MAX_HEAD_SIZE {
                        return Err(ParseError::HeadTooLarge(MAX_HEAD_SIZE));
                    }
                    return Ok(false);
                };
                self.head_bytes += consumed;
                if self.head_bytes > MAX_HEAD_SIZE {
                    return Err(ParseError::HeadTooLarge(MAX_HEAD_SIZE));
                }
                if line.is_empty() {
                    self.phase = Phase::Complete;
                    return Ok(true);
                }
                self.push_header_line(line)?;
                Chunk::Trailers
            }
        };
        self.phase = Phase::Body(Framing::Chunked(next));
        Ok(true)
    }
}

fn parse_status_line(line: &str) -> Result<(String, u16, String), ParseError> {
    let invalid = || ParseError::InvalidStatusLine(line.to_string());
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().filter(|v| v.starts_with("HTTP/")).ok_or_else(invalid)?;
    let code = parts
        .next()
        .filter(|c| c.len() == 3 && c.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|c| c.parse::<u16>().ok())
        .filter(|c| *c >= 100)
        .ok_or_else(invalid)?;
    let reason = parts.next().unwrap_or_default().trim().to_string();
    Ok((version.to_string(), code, reason))
}
