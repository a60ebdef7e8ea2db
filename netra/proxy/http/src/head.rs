use bytes::BytesMut;
use std::str;

/// The most headers accepted in one message head.
pub const MAX_HEADERS: usize = 100;

/// How a message body is framed on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BodyKind {
    /// Exactly this many bytes follow the head.
    Fixed(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Bytes until the peer closes (responses without a length).
    UntilEof,
    /// No body at all.
    Empty,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request head: {0}")]
    Request(httparse::Error),

    #[error("malformed response head: {0}")]
    Response(httparse::Error),

    #[error("message head exceeds the sniff buffer")]
    TooLong,

    #[error("stream ended inside a message head")]
    Truncated,

    #[error("invalid {0} header")]
    BadHeader(&'static str),
}

/// One header line, name and value kept as raw wire bytes so casing and
/// ordering survive re-encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

#[derive(Clone, Debug)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub headers: Headers,
}

#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

/// Attempts to parse a request head from `buf`.
///
/// Returns the head and its length in bytes when complete, `None` when more
/// bytes are needed, and an error for input that can never become a valid
/// head.
pub fn parse_request(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let head = RequestHead {
                method: req.method.expect("complete request").to_string(),
                target: req.path.expect("complete request").to_string(),
                version: req.version.expect("complete request"),
                headers: Headers::from_parsed(req.headers),
            };
            Ok(Some((head, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ParseError::Request(e)),
    }
}

pub fn parse_response(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut rsp = httparse::Response::new(&mut headers);
    match rsp.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let head = ResponseHead {
                version: rsp.version.expect("complete response"),
                status: rsp.code.expect("complete response"),
                reason: rsp.reason.unwrap_or("").to_string(),
                headers: Headers::from_parsed(rsp.headers),
            };
            Ok(Some((head, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ParseError::Response(e)),
    }
}

// === impl Headers ===

impl Headers {
    fn from_parsed(parsed: &[httparse::Header<'_>]) -> Self {
        Headers(
            parsed
                .iter()
                .map(|h| Header {
                    name: h.name.as_bytes().to_vec(),
                    value: h.value.to_vec(),
                })
                .collect(),
        )
    }

    /// Returns the first value for `name`, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name.as_bytes()))
            .map(|h| h.value.as_slice())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| str::from_utf8(v).ok())
    }

    /// Replaces the first value for `name`, or appends the header.
    pub fn set(&mut self, name: &str, value: &str) {
        match self
            .0
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(name.as_bytes()))
        {
            Some(h) => h.value = value.as_bytes().to_vec(),
            None => self.0.push(Header {
                name: name.as_bytes().to_vec(),
                value: value.as_bytes().to_vec(),
            }),
        }
    }

    /// True when the `name` header's comma-separated value list contains
    /// `token` (ASCII case-insensitive).
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_str(name)
            .map(|v| {
                v.split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }

    /// Looks `name` up in the `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<String> {
        let cookies = self.get_str("Cookie")?;
        cookies.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == name).then(|| v.to_string())
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        for h in &self.0 {
            buf.extend_from_slice(&h.name);
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(&h.value);
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
    }

    fn content_length(&self) -> Result<Option<u64>, ParseError> {
        match self.get("Content-Length") {
            None => Ok(None),
            Some(v) => str::from_utf8(v)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Some)
                .ok_or(ParseError::BadHeader("Content-Length")),
        }
    }

    fn is_chunked(&self) -> bool {
        self.contains_token("Transfer-Encoding", "chunked")
    }

    fn is_upgrade(&self) -> bool {
        self.contains_token("Connection", "upgrade")
    }
}

// The tracing bridge sees headers as a propagation carrier.

impl netra_trace::Extractor for Headers {
    fn get(&self, key: &str) -> Option<&str> {
        self.get_str(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter_map(|h| str::from_utf8(&h.name).ok())
            .collect()
    }
}

impl netra_trace::Injector for Headers {
    fn set(&mut self, key: &str, value: String) {
        Headers::set(self, key, &value);
    }
}

// === impl RequestHead ===

impl RequestHead {
    pub fn host(&self) -> &str {
        self.headers.get_str("Host").unwrap_or("")
    }

    pub fn path(&self) -> &str {
        &self.target
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get_str("User-Agent")
    }

    pub fn is_upgrade(&self) -> bool {
        self.headers.is_upgrade()
    }

    /// Requests without a length have no body.
    pub fn body_kind(&self) -> Result<BodyKind, ParseError> {
        if self.headers.is_chunked() {
            return Ok(BodyKind::Chunked);
        }
        match self.headers.content_length()? {
            Some(0) | None => Ok(BodyKind::Empty),
            Some(n) => Ok(BodyKind::Fixed(n)),
        }
    }

    /// Re-encodes the (possibly mutated) head exactly as it goes on the
    /// wire.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(self.method.as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.target.as_bytes());
        buf.extend_from_slice(b" HTTP/1.");
        buf.extend_from_slice(if self.version == 0 { b"0" } else { b"1" });
        buf.extend_from_slice(b"\r\n");
        self.headers.encode_into(buf);
    }
}

// === impl ResponseHead ===

impl ResponseHead {
    pub fn is_upgrade(&self) -> bool {
        self.headers.is_upgrade()
    }

    /// Responses without a length run until the peer closes, except for
    /// statuses that never carry a body.
    pub fn body_kind(&self) -> Result<BodyKind, ParseError> {
        if self.status < 200 || self.status == 204 || self.status == 304 {
            return Ok(BodyKind::Empty);
        }
        if self.headers.is_chunked() {
            return Ok(BodyKind::Chunked);
        }
        match self.headers.content_length()? {
            Some(0) => Ok(BodyKind::Empty),
            Some(n) => Ok(BodyKind::Fixed(n)),
            None => Ok(BodyKind::UntilEof),
        }
    }
}
