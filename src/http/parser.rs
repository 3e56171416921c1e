//! HTTP request line and header parsing.

use super::Method;
use thiserror::Error;

/// Largest number of header lines accepted in one message.
pub const MAX_HEADERS: usize = 64;

/// Parse errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Missing request line or fewer than three tokens.
    #[error("invalid HTTP request line")]
    InvalidRequest,
    /// Method outside the supported set.
    #[error("unsupported HTTP method: {0}")]
    InvalidMethod(String),
    /// Version other than HTTP/1.0 or HTTP/1.1.
    #[error("unsupported HTTP version: {0}")]
    InvalidVersion(String),
    /// Header line without a name.
    #[error("malformed header line")]
    InvalidHeader,
    /// More than [`MAX_HEADERS`] header lines.
    #[error("more than {MAX_HEADERS} headers")]
    TooManyHeaders,
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Empty header list.
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append a header.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Headers in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of header lines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parsed HTTP request head.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Request target. The router replaces it with the decoded, normalised path.
    pub uri: String,
    /// Part of the target after `?`, still encoded.
    pub query_string: Option<String>,
    /// `1.0` or `1.1`, without the `HTTP/` prefix.
    pub http_version: String,
    /// Header lines in arrival order.
    pub headers: Headers,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::GET,
            uri: String::new(),
            query_string: None,
            http_version: "1.1".to_string(),
            headers: Headers::new(),
        }
    }
}

fn lines(block: &[u8]) -> impl Iterator<Item = String> + '_ {
    block
        .split(|&b| b == b'\n')
        .map(|line| String::from_utf8_lossy(line.strip_suffix(b"\r").unwrap_or(line)).into_owned())
}

/// Parse `name: value` lines up to the first empty line.
pub fn parse_headers<I: Iterator<Item = String>>(lines: I) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        let name = name.trim_end();
        if name.is_empty() {
            return Err(ParseError::InvalidHeader);
        }
        if headers.len() == MAX_HEADERS {
            return Err(ParseError::TooManyHeaders);
        }
        headers.push(name, value.trim());
    }
    Ok(headers)
}

/// Parse a header block that carries no request line (CGI output, upstream responses
/// after the status line has been removed).
pub fn parse_header_block(block: &[u8]) -> Result<Headers, ParseError> {
    parse_headers(lines(block))
}

impl Request {
    /// Parse a framed request head: request line, headers, blank line.
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let start = block
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .ok_or(ParseError::InvalidRequest)?;
        let mut lines = lines(&block[start..]);

        let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
        let mut parts = request_line.split_ascii_whitespace();
        let (Some(method), Some(uri), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::InvalidRequest);
        };

        let method = Method::from_bytes(method.as_bytes())
            .ok_or_else(|| ParseError::InvalidMethod(method.to_string()))?;

        let http_version = version
            .strip_prefix("HTTP/")
            .filter(|v| matches!(*v, "1.0" | "1.1"))
            .ok_or_else(|| ParseError::InvalidVersion(version.to_string()))?;

        let headers = parse_headers(lines)?;

        Ok(Request {
            method,
            uri: uri.to_string(),
            query_string: None,
            http_version: http_version.to_string(),
            headers,
        })
    }

    /// Declared body length. `None` when absent; `Some(Err(()))` when unparsable.
    pub fn content_length(&self) -> Option<Result<u64, ()>> {
        self.headers
            .get("Content-Length")
            .map(|v| v.trim().parse::<u64>().map_err(|_| ()))
    }

    /// Whether the client asked to keep the connection open.
    pub fn wants_keep_alive(&self) -> bool {
        match self.headers.get("Connection") {
            Some(v) => v.eq_ignore_ascii_case("keep-alive"),
            None => self.http_version == "1.1",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_request() {
        let request = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let req = Request::parse(request).unwrap();

        assert_eq!(req.method, Method::GET);
        assert_eq!(req.uri, "/index.html");
        assert_eq!(req.http_version, "1.1");
        assert_eq!(req.headers.get("host"), Some("localhost"));
    }

    #[test]
    fn test_parse_post_with_length() {
        let request = b"POST /api/users HTTP/1.0\r\nContent-Length:    13\r\n\r\n";
        let req = Request::parse(request).unwrap();

        assert_eq!(req.method, Method::POST);
        assert_eq!(req.content_length(), Some(Ok(13)));
        assert!(!req.wants_keep_alive());
    }

    #[test]
    fn recovers_every_supplied_header() {
        for count in [0usize, 1, 7, MAX_HEADERS] {
            let mut raw = String::from("PROPFIND /dav/ HTTP/1.1\r\n");
            for i in 0..count {
                raw.push_str(&format!("X-H{i}: value {i}\r\n"));
            }
            raw.push_str("\r\n");
            let req = Request::parse(raw.as_bytes()).unwrap();
            assert_eq!(req.method, Method::PROPFIND);
            assert_eq!(req.uri, "/dav/");
            assert_eq!(req.headers.len(), count);
            for (i, (name, value)) in req.headers.iter().enumerate() {
                assert_eq!(name, format!("X-H{i}"));
                assert_eq!(value, format!("value {i}"));
            }
        }
    }

    #[test]
    fn header_overflow_is_an_error() {
        let mut raw = String::from("GET / HTTP/1.1\r\n");
        for i in 0..=MAX_HEADERS {
            raw.push_str(&format!("X-{i}: v\r\n"));
        }
        raw.push_str("\r\n");
        assert_eq!(Request::parse(raw.as_bytes()).unwrap_err(), ParseError::TooManyHeaders);
    }

    #[test]
    fn rejects_unknown_method_and_version() {
        assert!(matches!(
            Request::parse(b"BREW /pot HTTP/1.1\r\n\r\n"),
            Err(ParseError::InvalidMethod(_))
        ));
        assert!(matches!(
            Request::parse(b"GET / HTTP/2.0\r\n\r\n"),
            Err(ParseError::InvalidVersion(_))
        ));
        assert!(matches!(
            Request::parse(b"GET /\r\n\r\n"),
            Err(ParseError::InvalidRequest)
        ));
    }

    #[test]
    fn lf_only_and_leading_blank_lines() {
        let req = Request::parse(b"\r\nGET / HTTP/1.0\nConnection: keep-alive\n\n").unwrap();
        assert_eq!(req.http_version, "1.0");
        assert!(req.wants_keep_alive());
    }

    #[test]
    fn header_block_without_request_line() {
        let headers = parse_header_block(b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\n").unwrap();
        assert_eq!(headers.get("status"), Some("404 Not Found"));
        assert_eq!(headers.len(), 2);
    }
}
