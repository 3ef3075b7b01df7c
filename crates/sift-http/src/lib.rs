use std::io;

use thiserror::Error;

mod body;
mod rewrite;

pub use body::{BodyReader, BufferedStream, DecodedBody};
pub use rewrite::{
    build_block_response, build_text_response, remove_elements, RewriteError, RewriteOutcome,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeadError {
    #[error("head is not valid UTF-8")]
    NotUtf8,
    #[error("head ended before the start line")]
    MissingStartLine,
    #[error("malformed {0} line")]
    MalformedStartLine(&'static str),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("unparseable Content-Length: {0}")]
    BadContentLength(String),
    #[error("conflicting Content-Length values")]
    ConflictingContentLength,
    #[error("unparseable response status: {0}")]
    BadStatus(String),
}

impl From<HeadError> for io::Error {
    fn from(error: HeadError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }

    fn of(text: &str) -> Result<Self, HeadError> {
        match text {
            "HTTP/1.1" => Ok(Self::Http11),
            "HTTP/1.0" => Ok(Self::Http10),
            other => Err(HeadError::UnsupportedVersion(other.to_string())),
        }
    }
}

/// How the message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Header list plus the framing facts the interception path needs, all
/// gathered in the same pass that validates the header lines.
#[derive(Debug, Default)]
struct HeaderBlock {
    headers: Vec<Header>,
    declared_length: Option<u64>,
    chunked: bool,
    close_token: bool,
    keep_alive_token: bool,
    host_header: Option<String>,
}

impl HeaderBlock {
    fn collect(text: &str) -> Result<Self, HeadError> {
        let mut block = Self::default();
        for line in text.split("\r\n") {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HeadError::MalformedHeader(line.to_string()))?;
            let name = name.trim();
            let value = value.trim();

            if name.eq_ignore_ascii_case("content-length") {
                let length = value
                    .parse::<u64>()
                    .map_err(|_| HeadError::BadContentLength(value.to_string()))?;
                match block.declared_length {
                    Some(previous) if previous != length => {
                        return Err(HeadError::ConflictingContentLength)
                    }
                    _ => block.declared_length = Some(length),
                }
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                block.chunked |= list_has_token(value, "chunked");
            } else if name.eq_ignore_ascii_case("connection") {
                block.close_token |= list_has_token(value, "close");
                block.keep_alive_token |= list_has_token(value, "keep-alive");
            } else if name.eq_ignore_ascii_case("host") && block.host_header.is_none() {
                block.host_header = Some(value.to_string());
            }

            block.headers.push(Header {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
        Ok(block)
    }

    fn request_body_mode(&self) -> BodyMode {
        if self.chunked {
            return BodyMode::Chunked;
        }
        match self.declared_length {
            Some(length) if length > 0 => BodyMode::ContentLength(length),
            _ => BodyMode::None,
        }
    }

    fn response_body_mode(&self, request_method: &str, status_code: u16) -> BodyMode {
        if request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&status_code)
            || status_code == 204
            || status_code == 304
        {
            return BodyMode::None;
        }
        if self.chunked {
            return BodyMode::Chunked;
        }
        match self.declared_length {
            Some(0) => BodyMode::None,
            Some(length) => BodyMode::ContentLength(length),
            None => BodyMode::CloseDelimited,
        }
    }

    fn closes_after(&self, version: HttpVersion) -> bool {
        match version {
            HttpVersion::Http11 => self.close_token,
            HttpVersion::Http10 => !self.keep_alive_token,
        }
    }
}

fn list_has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<Header>,
    pub body_mode: BodyMode,
    pub connection_close: bool,
    /// Intercepted origin, resolved while parsing: the absolute-form target
    /// wins, then the CONNECT authority, then the Host header.
    resolved_host: Option<(String, Option<u16>)>,
}

impl RequestHead {
    pub fn parse(raw: &[u8]) -> Result<Self, HeadError> {
        let text = std::str::from_utf8(raw).map_err(|_| HeadError::NotUtf8)?;
        let (start_line, header_text) =
            text.split_once("\r\n").ok_or(HeadError::MissingStartLine)?;

        let (method, rest) = start_line
            .split_once(' ')
            .ok_or(HeadError::MalformedStartLine("request"))?;
        let (target, version_text) = rest
            .rsplit_once(' ')
            .ok_or(HeadError::MalformedStartLine("request"))?;
        if method.is_empty() || target.is_empty() || target.contains(' ') {
            return Err(HeadError::MalformedStartLine("request"));
        }
        let version = HttpVersion::of(version_text)?;

        let block = HeaderBlock::collect(header_text)?;
        let resolved_host = resolve_request_host(method, target, block.host_header.as_deref());
        let body_mode = block.request_body_mode();
        let connection_close = block.closes_after(version);

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version,
            headers: block.headers,
            body_mode,
            connection_close,
            resolved_host,
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.headers, name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers
            .retain(|header| !header.name.eq_ignore_ascii_case(name));
    }

    /// Origin this request is aimed at, lowercased, port when one was named.
    pub fn host(&self) -> Option<(String, Option<u16>)> {
        self.resolved_host.clone()
    }

    /// Origin-form path for the upstream request line.
    pub fn origin_form_target(&self) -> String {
        match absolute_form_path_start(&self.target) {
            Some(path_start) => {
                let path = &self.target[path_start..];
                if path.is_empty() {
                    "/".to_string()
                } else {
                    path.to_string()
                }
            }
            None => self.target.clone(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {}\r\n",
            self.method,
            self.target,
            self.version.as_str()
        );
        write_header_lines(&mut out, &self.headers);
        out.into_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Vec<Header>,
    pub body_mode: BodyMode,
    pub connection_close: bool,
}

impl ResponseHead {
    pub fn parse(raw: &[u8], request_method: &str) -> Result<Self, HeadError> {
        let text = std::str::from_utf8(raw).map_err(|_| HeadError::NotUtf8)?;
        let (status_line, header_text) =
            text.split_once("\r\n").ok_or(HeadError::MissingStartLine)?;

        let (version_text, rest) = status_line
            .split_once(' ')
            .ok_or(HeadError::MalformedStartLine("status"))?;
        let version = HttpVersion::of(version_text)?;
        let (status_text, reason_phrase) = match rest.split_once(' ') {
            Some((status, reason)) => (status, reason),
            None => (rest, ""),
        };
        let status_code = status_text
            .parse::<u16>()
            .map_err(|_| HeadError::BadStatus(status_text.to_string()))?;

        let block = HeaderBlock::collect(header_text)?;
        let body_mode = block.response_body_mode(request_method, status_code);
        let connection_close =
            block.closes_after(version) || body_mode == BodyMode::CloseDelimited;

        Ok(Self {
            version,
            status_code,
            reason_phrase: reason_phrase.to_string(),
            headers: block.headers,
            body_mode,
            connection_close,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.headers, name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers
            .retain(|header| !header.name.eq_ignore_ascii_case(name));
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }

    /// Re-frame this head to carry an identity body of exactly `body_len`
    /// bytes; used after a buffered body was rewritten or replaced.
    pub fn set_identity_body(&mut self, body_len: u64) {
        self.remove_header("transfer-encoding");
        self.remove_header("content-encoding");
        self.set_header("content-length", &body_len.to_string());
        self.body_mode = if body_len == 0 {
            BodyMode::None
        } else {
            BodyMode::ContentLength(body_len)
        };
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = format!("{} {}", self.version.as_str(), self.status_code);
        if !self.reason_phrase.is_empty() {
            out.push(' ');
            out.push_str(&self.reason_phrase);
        }
        out.push_str("\r\n");
        write_header_lines(&mut out, &self.headers);
        out.into_bytes()
    }
}

/// Rewrite a parsed client request for the upstream origin: origin-form
/// target, proxy-hop headers dropped, and identity encoding forced when the
/// response may have to be inspected.
pub fn normalize_for_upstream(request: &mut RequestHead, force_identity_encoding: bool) {
    request.target = request.origin_form_target();
    request.remove_header("proxy-connection");
    if force_identity_encoding {
        request.set_header("accept-encoding", "identity");
    }
}

fn write_header_lines(out: &mut String, headers: &[Header]) {
    for header in headers {
        out.push_str(&header.name);
        out.push_str(": ");
        out.push_str(&header.value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
}

fn header_value<'h>(headers: &'h [Header], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

fn set_header(headers: &mut Vec<Header>, name: &str, value: &str) {
    for header in headers.iter_mut() {
        if header.name.eq_ignore_ascii_case(name) {
            header.value = value.to_string();
            return;
        }
    }
    headers.push(Header {
        name: name.to_string(),
        value: value.to_string(),
    });
}

fn resolve_request_host(
    method: &str,
    target: &str,
    host_header: Option<&str>,
) -> Option<(String, Option<u16>)> {
    if let Some(authority) = absolute_form_authority(target) {
        return split_host_port(authority);
    }
    if method.eq_ignore_ascii_case("CONNECT") {
        return split_host_port(target);
    }
    host_header.and_then(split_host_port)
}

/// Host portion of an absolute `http(s)://` URL, lowercased; used for
/// Referer-derived context.
pub fn url_host(url: &str) -> Option<String> {
    absolute_form_authority(url)
        .and_then(split_host_port)
        .map(|(host, _)| host)
}

/// `http://authority/...` → authority substring, when the target is in
/// absolute form.
fn absolute_form_authority(target: &str) -> Option<&str> {
    let rest = strip_http_scheme(target)?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Byte offset where the origin-form path begins inside an absolute-form
/// target.
fn absolute_form_path_start(target: &str) -> Option<usize> {
    let rest = strip_http_scheme(target)?;
    let authority_len = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    Some(target.len() - rest.len() + authority_len)
}

fn strip_http_scheme(target: &str) -> Option<&str> {
    if target.len() >= 7 && target[..7].eq_ignore_ascii_case("http://") {
        Some(&target[7..])
    } else if target.len() >= 8 && target[..8].eq_ignore_ascii_case("https://") {
        Some(&target[8..])
    } else {
        None
    }
}

fn split_host_port(authority: &str) -> Option<(String, Option<u16>)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']')?;
        let host = rest[..close].to_ascii_lowercase();
        let port = match rest[close + 1..].strip_prefix(':') {
            Some(port_text) => Some(port_text.parse::<u16>().ok()?),
            None => None,
        };
        return Some((host, port));
    }

    match authority.rsplit_once(':') {
        Some((host, port_text)) if !host.contains(':') => {
            let port = port_text.parse::<u16>().ok()?;
            Some((host.to_ascii_lowercase(), Some(port)))
        }
        _ => Some((authority.to_ascii_lowercase(), None)),
    }
}
