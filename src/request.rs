//! Request-line and header parsing for client requests.
//!
//! The parser is pure: it never touches a socket. Callers hand it the bytes
//! read from the client up to and including the blank line that ends the
//! header block.

use crate::error::ProxyError;
use bytes::Bytes;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;

pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

const REQUEST_LINE_PATTERN: &str = r"^(?P<method>[A-Z]+) (?:(?P<scheme>(?i:https?))://)?(?P<host>[^\s/:?#@]+)(?::(?P<port>\d+))?(?P<path>[/?]\S*)? HTTP/1\.1$";

/// Returns the offset just past the `\r\n\r\n` that ends a message head.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Connect,
    Other(String),
}

impl Method {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "CONNECT" => Some(Method::Connect),
            "HEAD" | "PUT" | "DELETE" | "OPTIONS" | "PATCH" | "TRACE" => {
                Some(Method::Other(token.to_string()))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Connect => "CONNECT",
            Method::Other(token) => token,
        }
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, Method::Connect)
    }

    pub fn is_head(&self) -> bool {
        matches!(self, Method::Other(token) if token == "HEAD")
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    pub host: String,
    pub port: u16,
    /// Path plus query string, `/` when the request line carries none.
    pub path: String,
    /// Keyed by lowercased name; a repeated header keeps its last value.
    pub headers: HashMap<String, String>,
    /// The request head exactly as received, terminator included.
    pub raw: Bytes,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Declared body length; zero when no `Content-Length` was sent.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Compiled request-line grammar. Built once and shared read-only.
#[derive(Debug, Clone)]
pub struct RequestParser {
    request_line: Regex,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            request_line: Regex::new(REQUEST_LINE_PATTERN).expect("request line pattern is valid"),
        }
    }

    /// Parses a request head.
    ///
    /// Header lines without a `:` separator reject the whole request rather
    /// than being skipped, as does any non-numeric `Content-Length` line.
    pub fn parse(&self, raw: &[u8]) -> Result<ParsedRequest, ProxyError> {
        let head = match find_header_end(raw) {
            Some(end) => &raw[..end],
            None => raw,
        };
        let text = std::str::from_utf8(head)
            .map_err(|_| ProxyError::InvalidRequest("request head is not valid UTF-8".to_string()))?;

        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let captures = self
            .request_line
            .captures(request_line)
            .ok_or_else(|| ProxyError::InvalidRequest(format!("malformed request line: {:?}", request_line)))?;

        let method = Method::from_token(&captures["method"])
            .ok_or_else(|| ProxyError::InvalidRequest(format!("unsupported method: {}", &captures["method"])))?;
        let host = captures["host"].to_string();
        let https = captures
            .name("scheme")
            .is_some_and(|scheme| scheme.as_str().eq_ignore_ascii_case("https"));

        let port = match captures.name("port") {
            Some(port) => match port.as_str().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => return Err(ProxyError::InvalidRequest(format!("invalid port: {}", port.as_str()))),
            },
            None if https || method.is_connect() => 443,
            None => 80,
        };

        let path = captures
            .name("path")
            .map(|path| path.as_str())
            .filter(|path| !path.is_empty())
            .map(|path| {
                if path.starts_with('?') {
                    format!("/{}", path)
                } else {
                    path.to_string()
                }
            })
            .unwrap_or_else(|| "/".to_string());

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| ProxyError::InvalidRequest(format!("malformed header line: {:?}", line)))?;
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(ProxyError::InvalidRequest(format!("malformed header name: {:?}", key)));
            }
            let value = value.trim();
            if key.eq_ignore_ascii_case("Content-Length") && value.parse::<usize>().is_err() {
                return Err(ProxyError::InvalidRequest(format!("invalid Content-Length: {}", value)));
            }
            headers.insert(key.to_ascii_lowercase(), value.to_string());
        }

        Ok(ParsedRequest {
            method,
            host,
            port,
            path,
            headers,
            raw: Bytes::copy_from_slice(head),
        })
    }
}
