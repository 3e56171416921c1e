//! HTTP response builder

use std::io::{Result as IoResult, Write};
use std::time::SystemTime;

/// Value of the `Server` header.
pub const SERVER_NAME: &str = concat!("embedserve/", env!("CARGO_PKG_VERSION"));

/// HTTP status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Ok = 200,
    Created = 201,
    PartialContent = 206,
    MultiStatus = 207,
    MovedPermanently = 301,
    Found = 302,
    NotModified = 304,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    LengthRequired = 411,
    PayloadTooLarge = 413,
    RangeNotSatisfiable = 416,
    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
}

impl Status {
    /// Numeric code
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Get status text
    pub fn text(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::PartialContent => "Partial Content",
            Self::MultiStatus => "Multi-Status",
            Self::MovedPermanently => "Moved Permanently",
            Self::Found => "Found",
            Self::NotModified => "Not Modified",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::LengthRequired => "Length Required",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::RangeNotSatisfiable => "Range Not Satisfiable",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::BadGateway => "Bad Gateway",
        }
    }

    /// Reason phrase for an arbitrary code, as forwarded from CGI output.
    pub fn reason_for(code: u16) -> &'static str {
        match code {
            100 => "Continue",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            207 => "Multi-Status",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            411 => "Length Required",
            413 => "Payload Too Large",
            416 => "Range Not Satisfiable",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }

    pub(crate) fn has_body(&self) -> bool {
        !matches!(self, Self::NotModified)
    }
}

/// HTTP response builder
///
/// Used for complete in-memory responses and, with
/// [`Response::content_length`], for the head of a streamed body.
#[derive(Debug, Clone)]
pub struct Response {
    pub(crate) status: Status,
    pub(crate) headers: Vec<(&'static str, String)>,
    pub(crate) body: Vec<u8>,
    length: Option<u64>,
    until_close: bool,
}

impl Response {
    /// Create new response with status
    pub fn new(status: Status) -> Self {
        Self {
            status,
            headers: vec![
                ("Server", SERVER_NAME.to_string()),
                ("Date", httpdate::fmt_http_date(SystemTime::now())),
            ],
            body: Vec::new(),
            length: None,
            until_close: false,
        }
    }

    /// Status of this response.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Set a header, replacing an earlier value.
    pub fn header(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.headers.retain(|(k, _)| *k != key);
        self.headers.push((key, value.into()));
        self
    }

    /// Set body
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Announce the length of a body the caller will stream after the head.
    pub fn content_length(mut self, len: u64) -> Self {
        self.length = Some(len);
        self
    }

    /// Omit `Content-Length`: the streamed body ends when the connection closes.
    pub fn until_close(mut self) -> Self {
        self.until_close = true;
        self
    }

    /// Plain-text error page: status code and reason phrase only.
    pub fn error(status: Status) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(format!("Error {}: {}", status.code(), status.text()))
    }

    /// Write status line and headers, including `Content-Length` and `Connection`.
    pub fn write_head<W: Write>(&self, writer: &mut W, keep_alive: bool) -> IoResult<()> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status.code(), self.status.text());
        for (key, value) in &self.headers {
            head.push_str(&format!("{key}: {value}\r\n"));
        }
        if self.status.has_body() && !self.until_close {
            let len = self.length.unwrap_or(self.body.len() as u64);
            head.push_str(&format!("Content-Length: {len}\r\n"));
        }
        head.push_str(if keep_alive {
            "Connection: keep-alive\r\n\r\n"
        } else {
            "Connection: close\r\n\r\n"
        });
        writer.write_all(head.as_bytes())
    }
}

// Convenience constructors
impl Response {
    /// 200 OK response
    pub fn ok() -> Self {
        Self::new(Status::Ok)
    }
}
