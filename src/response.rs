use crate::error::ProxyError;
use crate::request::find_header_end;
use bytes::Bytes;
use std::time::SystemTime;

/// Sent to the client once a CONNECT tunnel's upstream leg is open.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Status line and headers of an upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub status_line: String,
    /// Headers in wire order; duplicates are kept.
    pub headers: Vec<(String, String)>,
    /// The head exactly as received, terminator included.
    pub raw: Bytes,
}

impl ResponseHead {
    /// Parses the head at the front of `buf`, returning it with the offset of the first body byte.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), ProxyError> {
        let end = find_header_end(buf)
            .ok_or_else(|| ProxyError::UpstreamResponse("response head is incomplete".to_string()))?;
        let text = String::from_utf8_lossy(&buf[..end]);
        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or_default().to_string();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(ProxyError::UpstreamResponse(format!("malformed status line: {:?}", status_line)));
        }
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| ProxyError::UpstreamResponse(format!("malformed status line: {:?}", status_line)))?;

        // Header lines without a separator are dropped here only; `raw` keeps them.
        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.to_string(), value.trim().to_string()))
            .collect();

        let raw = Bytes::copy_from_slice(&buf[..end]);
        Ok((Self { status, status_line, headers, raw }, end))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length").and_then(|value| value.trim().parse().ok())
    }

    /// True when any `name` header lists `directive` (comma separated, case-insensitive).
    pub fn has_directive(&self, name: &str, directive: &str) -> bool {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .flat_map(|(_, value)| value.split(','))
            .map(|token| token.split('=').next().unwrap_or_default().trim())
            .any(|token| token.eq_ignore_ascii_case(directive))
    }

    /// Whether a body follows this head at all.
    pub fn has_body(&self, request_was_head: bool) -> bool {
        !(request_was_head || (100..200).contains(&self.status) || self.status == 204 || self.status == 304)
    }
}

fn synthesized(status_line: &str) -> Bytes {
    Bytes::from(format!(
        "{}\r\nDate: {}\r\nContent-Length: 0\r\nContent-Type: text/html; charset=UTF-8\r\nConnection: Closed\r\n\r\n",
        status_line,
        httpdate::fmt_http_date(SystemTime::now())
    ))
}

/// Written to the client when its request cannot be parsed.
pub fn bad_request() -> Bytes {
    synthesized("HTTP/1.1 400 Bad Request")
}

/// Written to the client when the upstream cannot be reached.
pub fn bad_gateway() -> Bytes {
    synthesized("HTTP/1.1 502 Bad Gateway")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_head() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 4\r\n\r\nPNG!";
        let (head, offset) = ResponseHead::parse(raw).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.status_line, "HTTP/1.1 200 OK");
        assert_eq!(head.content_length(), Some(4));
        assert_eq!(head.header("content-type"), Some("image/png"));
        assert_eq!(&raw[offset..], b"PNG!");
        assert_eq!(&head.raw[..], &raw[..offset]);
    }

    #[test]
    fn test_raw_keeps_irregular_lines() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length:4\r\nX-Tag:  v\r\nno separator\r\nX-Bin: \xff\r\n\r\n";
        let (head, offset) = ResponseHead::parse(raw).unwrap();
        assert_eq!(offset, raw.len());
        assert_eq!(&head.raw[..], &raw[..]);
        assert_eq!(head.content_length(), Some(4));
        assert_eq!(head.header("X-Tag"), Some("v"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ResponseHead::parse(b"HTTP/1.1 200 OK\r\n").is_err());
        assert!(ResponseHead::parse(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
        assert!(ResponseHead::parse(b"HTTP/1.1 abc OK\r\n\r\n").is_err());
    }

    #[test]
    fn test_directives() {
        let raw = b"HTTP/1.1 200 OK\r\ncache-control: max-age=60, PRIVATE\r\npragma: no-cache\r\n\r\n";
        let (head, _) = ResponseHead::parse(raw).unwrap();
        assert!(head.has_directive("Cache-Control", "private"));
        assert!(head.has_directive("Cache-Control", "max-age"));
        assert!(!head.has_directive("Cache-Control", "no-cache"));
        assert!(head.has_directive("Pragma", "no-cache"));
    }

    #[test]
    fn test_has_body() {
        let (ok, _) = ResponseHead::parse(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert!(ok.has_body(false));
        assert!(!ok.has_body(true));
        let (not_modified, _) = ResponseHead::parse(b"HTTP/1.1 304 Not Modified\r\n\r\n").unwrap();
        assert!(!not_modified.has_body(false));
    }

    #[test]
    fn test_bad_request_shape() {
        let bytes = bad_request();
        let text = std::str::from_utf8(&bytes).unwrap();
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert_eq!(lines[0], "HTTP/1.1 400 Bad Request");
        assert!(lines[1].starts_with("Date: "));
        assert!(httpdate::parse_http_date(&lines[1]["Date: ".len()..]).is_ok());
        assert_eq!(lines[2], "Content-Length: 0");
        assert_eq!(lines[3], "Content-Type: text/html; charset=UTF-8");
        assert_eq!(lines[4], "Connection: Closed");
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_bad_gateway_status_line() {
        assert!(bad_gateway().starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
    }
}
