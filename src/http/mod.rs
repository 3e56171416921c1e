//! HTTP/1.x protocol core: framing, parsing, responses, connection loop and
//! request routing, plus the queue and worker pool that drive them.

pub mod concurrent_queue;
pub mod connection;
pub mod framer;
pub mod mime;
pub mod parser;
pub mod response;
pub mod router;
pub mod thread_pool;
pub mod uri;

pub use concurrent_queue::ConnectionQueue;
pub use connection::{Connection, RequestContext};
pub use framer::{Frame, Framer};
pub use parser::{Headers, ParseError, Request};
pub use response::{Response, Status};
pub use thread_pool::ThreadPool;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GET,
    POST,
    HEAD,
    CONNECT,
    PUT,
    DELETE,
    OPTIONS,
    PROPFIND,
}

impl Method {
    /// Parse method from bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"GET" => Some(Self::GET),
            b"POST" => Some(Self::POST),
            b"HEAD" => Some(Self::HEAD),
            b"CONNECT" => Some(Self::CONNECT),
            b"PUT" => Some(Self::PUT),
            b"DELETE" => Some(Self::DELETE),
            b"OPTIONS" => Some(Self::OPTIONS),
            b"PROPFIND" => Some(Self::PROPFIND),
            _ => None,
        }
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GET => "GET",
            Self::POST => "POST",
            Self::HEAD => "HEAD",
            Self::CONNECT => "CONNECT",
            Self::PUT => "PUT",
            Self::DELETE => "DELETE",
            Self::OPTIONS => "OPTIONS",
            Self::PROPFIND => "PROPFIND",
        }
    }

    /// Methods whose requests must carry a `Content-Length`.
    pub fn requires_body_length(&self) -> bool {
        matches!(self, Self::POST | Self::PUT)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of the `Allow` header sent for `OPTIONS`.
pub const ALLOWED_METHODS: &str = "GET, POST, HEAD, CONNECT, PUT, DELETE, OPTIONS, PROPFIND";
