//! Keep-alive loop for one accepted connection and the per-request context.
//!
//! A worker owns the connection from TLS handshake to graceful close. Each
//! request is framed in the worker's own buffer, parsed, routed, logged, and
//! then its unread body is discarded so the next pipelined request lines up
//! at the start of the buffer.

use std::fmt::Display;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::framer::{self, FrameError};
use super::{Method, Request, Response, Status, router};
use crate::ServerContext;
use crate::logging::{AccessEntry, ErrorSource};
use crate::tls::{self, TlsStream};

/// Read timeout while draining a closing connection.
const LINGER: Duration = Duration::from_millis(200);

/// Most bytes swallowed from a peer during graceful close.
const LINGER_BYTES: usize = 64 * 1024;

/// An accepted socket waiting in the queue for a worker.
#[derive(Debug)]
pub struct Connection {
    pub(crate) stream: TcpStream,
    /// Address of the listener that accepted it.
    pub local: SocketAddr,
    /// Peer address.
    pub remote: SocketAddr,
    /// Accepted on a TLS listener.
    pub tls: bool,
    /// Accepted on a proxy listener.
    pub proxy: bool,
}

pub(crate) enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl Stream {
    pub(crate) fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(s) => s,
            Self::Tls(s) => &s.sock,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

/// Retries timed-out reads until the server is told to stop.
struct Patient<'s> {
    stream: &'s mut Stream,
    stop: &'s AtomicBool,
}

impl Read for Patient<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    if self.stop.load(Ordering::Acquire) {
                        return Err(io::Error::other("server stopping"));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }
}

/// Outbound connection cached for the lifetime of a proxy client connection.
pub(crate) struct Upstream {
    pub authority: String,
    pub stream: TcpStream,
}

/// Client connection state that outlives a single request.
pub(crate) struct Session {
    pub stream: Stream,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub tls: bool,
    pub proxy: bool,
    buf: Vec<u8>,
    filled: usize,
    pub upstream: Option<Upstream>,
}

impl Session {
    fn patient<'s>(&'s mut self, stop: &'s AtomicBool) -> Patient<'s> {
        Patient {
            stream: &mut self.stream,
            stop,
        }
    }

    /// Graceful close: TLS close_notify, shutdown for write, drain, close.
    fn close(mut self) -> Vec<u8> {
        if let Stream::Tls(tls) = &mut self.stream {
            tls.conn.send_close_notify();
            let _ = tls.conn.complete_io(&mut tls.sock);
        }
        let mut tcp = self.stream.tcp();
        let _ = tcp.flush();
        let _ = tcp.shutdown(Shutdown::Write);
        let _ = tcp.set_read_timeout(Some(LINGER));
        let mut drained = 0;
        while drained < LINGER_BYTES {
            match tcp.read(&mut self.buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => drained += n,
            }
        }
        self.buf
    }
}

/// Serve every request on `conn`, then close it. Returns the worker's buffer.
pub(crate) fn serve(server: &ServerContext, conn: Connection, buf: Vec<u8>) -> Vec<u8> {
    let Connection {
        stream,
        local,
        remote,
        tls,
        proxy,
    } = conn;

    let stream = match (tls, &server.tls) {
        (false, _) => Stream::Plain(stream),
        (true, Some(config)) => match tls::accept(config.clone(), stream) {
            Ok(s) => Stream::Tls(Box::new(s)),
            Err(e) => {
                tracing::debug!(%remote, error = %e, "TLS handshake failed");
                return buf;
            }
        },
        (true, None) => return buf,
    };

    let mut session = Session {
        stream,
        local,
        remote,
        tls,
        proxy,
        buf,
        filled: 0,
        upstream: None,
    };

    while serve_one(server, &mut session) {}
    session.close()
}

/// One request/response exchange. Returns whether the connection stays open.
fn serve_one(server: &ServerContext, session: &mut Session) -> bool {
    let framed = {
        let Session { stream, buf, filled, .. } = session;
        let mut reader = Patient {
            stream,
            stop: &server.stop,
        };
        framer::read_head(&mut reader, buf, filled)
    };

    let head_len = match framed {
        Ok(len) => len,
        Err(FrameError::Closed) => return false,
        Err(FrameError::Io(e)) => {
            tracing::debug!(remote = %session.remote, error = %e, "read failed");
            return false;
        }
        Err(e) => {
            let status = match e {
                FrameError::TooLarge(_) => Status::PayloadTooLarge,
                _ => Status::BadRequest,
            };
            let mut ctx = RequestContext::new(server, session, 0);
            ctx.must_close = true;
            let _ = ctx.send_error(status, &e);
            ctx.log_access();
            return false;
        }
    };

    let parsed = Request::parse(&session.buf[..head_len]);
    let mut ctx = RequestContext::new(server, session, head_len);
    match parsed {
        Ok(request) => {
            ctx.request = request;
            ctx.parsed = true;
        }
        Err(e) => {
            ctx.must_close = true;
            let _ = ctx.send_error(Status::BadRequest, e);
            ctx.log_access();
            return false;
        }
    }

    match ctx.request.content_length() {
        Some(Ok(len)) => ctx.content_len = Some(len),
        Some(Err(())) => {
            ctx.must_close = true;
            let _ = ctx.send_error(Status::BadRequest, "unparsable Content-Length");
            ctx.log_access();
            return false;
        }
        None if ctx.request.method.requires_body_length() => {
            ctx.must_close = true;
            let _ = ctx.send_error(Status::LengthRequired, "request body without Content-Length");
            ctx.log_access();
            return false;
        }
        None => {}
    }

    let outcome = router::dispatch(&mut ctx).and_then(|()| ctx.flush());
    if let Err(e) = &outcome {
        tracing::debug!(remote = %ctx.remote_addr(), error = %e, "connection aborted");
        ctx.must_close = true;
    }
    ctx.log_access();

    ctx.keep_alive() && ctx.finish().is_ok()
}

/// Everything known about the request being served.
///
/// Handlers and middleware read the request through it and write the
/// response through it. Reading (`io::Read`) yields the request body and
/// never runs past `Content-Length`; writing (`io::Write`) sends response
/// body bytes and counts them for the access log.
pub struct RequestContext<'a> {
    server: &'a ServerContext,
    pub(crate) session: &'a mut Session,
    /// Parsed request head. The router replaces `uri` with the decoded,
    /// normalised path before any handler runs.
    pub request: Request,
    parsed: bool,
    head_len: usize,
    /// Next unread byte of `session.buf`.
    pos: usize,
    /// `None` when the client sent no `Content-Length` (no body).
    content_len: Option<u64>,
    consumed: u64,
    bytes_sent: u64,
    status: u16,
    pub(crate) must_close: bool,
    headers_sent: bool,
    pub(crate) remote_user: Option<String>,
    pub(crate) path: PathBuf,
}

impl<'a> RequestContext<'a> {
    fn new(server: &'a ServerContext, session: &'a mut Session, head_len: usize) -> Self {
        Self {
            server,
            session,
            request: Request {
                uri: "-".to_string(),
                ..Request::default()
            },
            parsed: false,
            head_len,
            pos: head_len,
            content_len: None,
            consumed: 0,
            bytes_sent: 0,
            status: 0,
            must_close: false,
            headers_sent: false,
            remote_user: None,
            path: PathBuf::new(),
        }
    }

    pub(crate) fn server(&self) -> &'a ServerContext {
        self.server
    }

    /// The parsed request.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// First value of a request header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.headers.get(name)
    }

    /// Peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.session.remote
    }

    /// Listener address the request arrived on.
    pub fn local_addr(&self) -> SocketAddr {
        self.session.local
    }

    /// Whether the connection is TLS.
    pub fn is_tls(&self) -> bool {
        self.session.tls
    }

    /// User name accepted by digest authentication.
    pub fn remote_user(&self) -> Option<&str> {
        self.remote_user.as_deref()
    }

    /// Filesystem path the URI maps to.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Request head exactly as received.
    pub(crate) fn raw_head(&self) -> &[u8] {
        &self.session.buf[..self.head_len]
    }

    /// Declared body length; 0 when absent.
    pub fn content_length(&self) -> u64 {
        self.content_len.unwrap_or(0)
    }

    /// Body bytes not read yet.
    pub fn remaining_body(&self) -> u64 {
        self.content_length().saturating_sub(self.consumed)
    }

    /// Status of the response sent so far, 0 before any.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether the response head has gone out.
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Bytes left in the buffer after the head that are not body (pipelined
    /// data, or tunnel payload sent ahead of the `CONNECT` reply).
    pub(crate) fn take_buffered(&mut self) -> Vec<u8> {
        let rest = self.session.buf[self.pos..self.session.filled].to_vec();
        self.pos = self.session.filled;
        rest
    }

    /// Whether the connection may carry another request after this one.
    pub fn keep_alive(&self) -> bool {
        self.parsed
            && !self.must_close
            && self.server.settings.keep_alive
            && self.request.wants_keep_alive()
            && !self.server.stopping()
    }

    /// Close the connection after this response.
    pub fn close_after_response(&mut self) {
        self.must_close = true;
    }

    /// Send `HTTP/1.1 100 Continue` when the client asked for it.
    pub(crate) fn continue_if_expected(&mut self) -> io::Result<()> {
        let expects = self
            .header("Expect")
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));
        if expects && self.request.http_version == "1.1" && self.remaining_body() > 0 {
            self.session.stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
            self.session.stream.flush()?;
        }
        Ok(())
    }

    /// Send status line and headers; the caller streams the body.
    pub fn send_head(&mut self, response: &Response) -> io::Result<()> {
        let keep_alive = self.keep_alive();
        self.status = response.status().code();
        self.headers_sent = true;
        response.write_head(&mut self.session.stream, keep_alive)
    }

    /// Send a status line and header block built elsewhere (CGI, upstream).
    pub(crate) fn send_raw_head(&mut self, status: u16, head: &[u8]) -> io::Result<()> {
        self.status = status;
        self.headers_sent = true;
        self.session.stream.write_all(head)
    }

    /// Send a complete in-memory response; the body is omitted for `HEAD`.
    pub fn send_response(&mut self, response: &Response) -> io::Result<()> {
        self.send_head(response)?;
        if self.request.method != Method::HEAD && response.status().has_body() {
            self.write_all(&response.body)?;
        }
        self.flush()
    }

    /// Log `detail` and answer with a bare error page.
    ///
    /// The client sees only the status; `detail` goes to the error log. If a
    /// response is already under way the connection is closed instead.
    pub fn send_error(&mut self, status: Status, detail: impl Display) -> io::Result<()> {
        self.log_error(&format!("{} {}: {detail}", status.code(), status.text()));
        if self.headers_sent {
            self.must_close = true;
            return Ok(());
        }
        self.send_response(&Response::error(status))
    }

    /// Append a line to the error log for this request.
    pub fn log_error(&self, message: &str) {
        self.server.logs.error(Some(self.error_source()), message);
    }

    fn error_source(&self) -> ErrorSource<'_> {
        ErrorSource {
            remote: self.session.remote.ip(),
            method: if self.parsed { self.request.method.as_str() } else { "-" },
            uri: &self.request.uri,
        }
    }

    fn log_access(&self) {
        let request = &self.request;
        self.server.logs.access(&AccessEntry {
            remote: self.session.remote.ip(),
            user: self.remote_user.as_deref(),
            method: if self.parsed { request.method.as_str() } else { "-" },
            uri: &request.uri,
            query: request.query_string.as_deref(),
            version: &request.http_version,
            status: self.status,
            bytes: self.bytes_sent,
            referer: request.headers.get("Referer"),
            agent: request.headers.get("User-Agent"),
        });
    }

    /// Discard the unread body and move pipelined bytes to the buffer start.
    fn finish(mut self) -> io::Result<()> {
        let mut scratch = [0u8; 4096];
        while self.remaining_body() > 0 {
            if self.read(&mut scratch)? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        let session = self.session;
        session.buf.copy_within(self.pos..session.filled, 0);
        session.filled -= self.pos;
        Ok(())
    }
}

impl Read for RequestContext<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining_body();
        if remaining == 0 || out.is_empty() {
            return Ok(0);
        }
        let want = out.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let buffered = self.session.filled - self.pos;
        let n = if buffered > 0 {
            let n = want.min(buffered);
            out[..n].copy_from_slice(&self.session.buf[self.pos..self.pos + n]);
            self.pos += n;
            n
        } else {
            self.session.patient(&self.server.stop).read(&mut out[..want])?
        };
        self.consumed += n as u64;
        Ok(n)
    }
}

impl Write for RequestContext<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.session.stream.write(buf)?;
        self.bytes_sent += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.session.stream.flush()
    }
}
