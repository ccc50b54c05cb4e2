//! Minimal HTTP/1.1 request parsing and response encoding
//!
//! Only what the server needs: GET, HEAD and POST, a `Content-Length` body
//! and one request per connection. The parser reads incrementally so a
//! request split across several TCP segments is assembled correctly, and it
//! enforces fixed limits on the head and the body.

use serde::Serialize;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Largest accepted request line plus headers (8 KiB)
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Largest accepted request body (4 KiB)
pub const MAX_BODY_SIZE: usize = 4 * 1024;

/// Default deadline for receiving a complete request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Default deadline for a single response write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(15);

const READ_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
}

impl Method {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    RequestTimeout,
    PayloadTooLarge,
    HeaderFieldsTooLarge,
    InternalServerError,
    NotImplemented,
    ServiceUnavailable,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::RequestTimeout => 408,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::HeaderFieldsTooLarge => 431,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::HeaderFieldsTooLarge => "Request Header Fields Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// Request parsing errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Connection closed before a complete request arrived")]
    ConnectionClosed,

    #[error("Timed out waiting for the request")]
    Timeout,

    #[error("Request head too large")]
    HeadTooLarge,

    #[error("Request body too large")]
    BodyTooLarge,

    #[error("Malformed request: {0}")]
    Malformed(&'static str),

    #[error("Unsupported method")]
    UnsupportedMethod,

    #[error("Chunked request bodies are not supported")]
    ChunkedBody,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HttpError {
    /// Status to answer with, `None` when the peer is gone and nothing can be sent
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::ConnectionClosed | HttpError::Io(_) => None,
            HttpError::Timeout => Some(StatusCode::RequestTimeout),
            HttpError::HeadTooLarge => Some(StatusCode::HeaderFieldsTooLarge),
            HttpError::BodyTooLarge => Some(StatusCode::PayloadTooLarge),
            HttpError::Malformed(_) => Some(StatusCode::BadRequest),
            HttpError::UnsupportedMethod => Some(StatusCode::MethodNotAllowed),
            HttpError::ChunkedBody => Some(StatusCode::NotImplemented),
        }
    }
}

/// A parsed request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Path without any query string
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read one request, giving up after `deadline`
pub async fn read_request<R>(reader: &mut R, deadline: Duration) -> Result<Request, HttpError>
where
    R: AsyncRead + Unpin,
{
    timeout(deadline, read_request_inner(reader))
        .await
        .map_err(|_| HttpError::Timeout)?
}

async fn read_request_inner<R>(reader: &mut R) -> Result<Request, HttpError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    let (head_len, body_start) = loop {
        if let Some(found) = find_head_end(&buf) {
            break found;
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge);
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    if head_len > MAX_HEAD_SIZE {
        return Err(HttpError::HeadTooLarge);
    }

    let head = std::str::from_utf8(&buf[..head_len])
        .map_err(|_| HttpError::Malformed("request head is not UTF-8"))?;
    let (method, path, headers) = parse_head(head)?;

    let mut request = Request {
        method,
        path,
        headers,
        body: Vec::new(),
    };

    if request
        .header("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        return Err(HttpError::ChunkedBody);
    }

    let content_length = match request.header("content-length") {
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| HttpError::Malformed("invalid Content-Length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_SIZE {
        return Err(HttpError::BodyTooLarge);
    }

    let mut body = buf.split_off(body_start);
    while body.len() < content_length {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::ConnectionClosed);
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    request.body = body;

    Ok(request)
}

/// Locate the blank line ending the head
///
/// Returns the head length (excluding the terminator) and where the body
/// starts. Bare `\n\n` is tolerated.
fn find_head_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = buf.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(c), Some(l)) if l < c => Some((l, l + 2)),
        (Some(c), _) => Some((c, c + 4)),
        (None, Some(l)) => Some((l, l + 2)),
        (None, None) => None,
    }
}

type Head = (Method, String, Vec<(String, String)>);

fn parse_head(head: &str) -> Result<Head, HttpError> {
    let mut lines = head.lines();
    let request_line = lines
        .next()
        .ok_or(HttpError::Malformed("empty request"))?;

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HttpError::Malformed("bad request line"));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::Malformed("unsupported HTTP version"));
    }
    let method = Method::parse(method).ok_or(HttpError::UnsupportedMethod)?;
    if !target.starts_with('/') {
        return Err(HttpError::Malformed("request target must be a path"));
    }
    let path = target
        .split_once('?')
        .map_or(target, |(path, _)| path)
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or(HttpError::Malformed("header without colon"))?;
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(HttpError::Malformed("bad header name"));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Ok((method, path, headers))
}

/// A complete response, sent with `Connection: close`
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
    /// Send the head only, with the `Content-Length` of the full body
    pub head_only: bool,
}

impl Response {
    pub fn new(status: StatusCode, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type,
            headers: Vec::new(),
            body: body.into(),
            head_only: false,
        }
    }

    /// Serialize `value` as the JSON body
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status, "application/json", body),
            Err(_) => Self::new(
                StatusCode::InternalServerError,
                "application/json",
                r#"{"status":"failed","error":"serialization failed"}"#,
            ),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn head_only(mut self, head_only: bool) -> Self {
        self.head_only = head_only;
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
            self.status.as_u16(),
            self.status.reason(),
            self.content_type,
            self.body.len()
        );
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        if !self.head_only {
            bytes.extend_from_slice(&self.body);
        }
        bytes
    }
}

/// Write raw bytes, failing if the peer does not drain them within `deadline`
pub async fn write_all_timeout<W>(writer: &mut W, bytes: &[u8], deadline: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    timeout(deadline, async {
        writer.write_all(bytes).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
}

pub async fn write_response<W>(writer: &mut W, response: &Response, deadline: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_all_timeout(writer, &response.to_bytes(), deadline).await
}
