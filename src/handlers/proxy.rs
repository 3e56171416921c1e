//! Forward-proxy handling for listeners flagged `p`.
//!
//! Absolute `http://` requests are replayed upstream byte for byte and the
//! upstream response is relayed back unmodified. The outbound connection is
//! cached on the client session and reused while the client keeps talking to
//! the same host. `CONNECT` opens a raw tunnel that lives as long as the
//! client connection.

use std::io::{self, BufRead, BufReader, Cursor, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::http::connection::Upstream;
use crate::http::framer::read_head;
use crate::http::parser::parse_header_block;
use crate::http::{Headers, Method, RequestContext, Status};
use crate::listener::READ_SLICE;

/// How long a forwarded request waits on a silent upstream.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Append `:port` unless `host` already names one.
fn with_default_port(host: &str, port: u16) -> Option<String> {
    if host.is_empty() {
        return None;
    }
    let has_port = match host.strip_prefix('[') {
        Some(v6) => v6.contains("]:"),
        None => host.contains(':'),
    };
    Some(if has_port { host.to_string() } else { format!("{host}:{port}") })
}

/// `host:port` an absolute `http://` URI points at.
pub fn http_authority(uri: &str) -> Option<String> {
    let scheme = uri.get(..7)?;
    if !scheme.eq_ignore_ascii_case("http://") {
        return None;
    }
    let host = uri[7..].split(['/', '?']).next()?;
    let host = host.rsplit('@').next()?;
    with_default_port(host, 80)
}

/// `host:port` of a `CONNECT` target; the port defaults to 443.
pub fn connect_authority(uri: &str) -> Option<String> {
    with_default_port(uri.trim(), 443)
}

/// Status code from an upstream status line such as `HTTP/1.1 200 OK`.
fn status_code(line: &str) -> Option<u16> {
    let mut parts = line.split_ascii_whitespace();
    parts.next().filter(|v| v.starts_with("HTTP/"))?;
    parts.next()?.parse().ok()
}

/// How the upstream response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyLength {
    None,
    Exact(u64),
    Chunked,
    UntilClose,
}

fn body_length(method: Method, code: u16, headers: &Headers) -> BodyLength {
    if method == Method::HEAD || (100..200).contains(&code) || code == 204 || code == 304 {
        return BodyLength::None;
    }
    if headers
        .get("Transfer-Encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        return BodyLength::Chunked;
    }
    match headers.get("Content-Length").map(|v| v.trim().parse::<u64>()) {
        Some(Ok(len)) => BodyLength::Exact(len),
        _ => BodyLength::UntilClose,
    }
}

/// Copy one chunked body, trailers included, from `from` to `to`.
fn relay_chunked<R: BufRead, W: Write>(from: &mut R, to: &mut W) -> io::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if from.read_line(&mut line)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        to.write_all(line.as_bytes())?;
        let size = line.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size, 16).map_err(|_| io::Error::other("bad chunk size"))?;
        if size == 0 {
            break;
        }
        let wanted = size + 2;
        if io::copy(&mut (&mut *from).take(wanted), to)? < wanted {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
    loop {
        line.clear();
        if from.read_line(&mut line)? == 0 {
            return Ok(());
        }
        to.write_all(line.as_bytes())?;
        if line.trim().is_empty() {
            return Ok(());
        }
    }
}

fn connect(authority: &str) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(authority)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// The cached upstream if it serves `authority`, otherwise a fresh one.
/// The flag tells whether the stream came from the cache.
fn upstream_for(ctx: &mut RequestContext<'_>, authority: &str) -> io::Result<(TcpStream, bool)> {
    match ctx.session.upstream.take() {
        Some(cached) if cached.authority == authority => Ok((cached.stream, true)),
        _ => Ok((connect(authority)?, false)),
    }
}

/// Send the request head and body upstream, then read the response head.
fn round_trip(
    ctx: &mut RequestContext<'_>,
    upstream: &mut TcpStream,
    head: &[u8],
    buf: &mut [u8],
    filled: &mut usize,
) -> io::Result<usize> {
    upstream.set_read_timeout(Some(UPSTREAM_TIMEOUT))?;
    upstream.write_all(head)?;
    let expected = ctx.remaining_body();
    let copied = io::copy(&mut (&mut *ctx).take(expected), &mut *upstream)?;
    if copied < expected {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    upstream.flush()?;
    read_head(upstream, buf, filled).map_err(io::Error::other)
}

/// Replay an absolute-URI request upstream and relay the response.
pub(crate) fn forward(ctx: &mut RequestContext<'_>) -> io::Result<()> {
    let Some(authority) = http_authority(&ctx.request.uri) else {
        return ctx.send_error(Status::BadRequest, format!("cannot proxy {}", ctx.request.uri));
    };
    let (mut upstream, cached) = match upstream_for(ctx, &authority) {
        Ok(found) => found,
        Err(e) => return ctx.send_error(Status::BadGateway, format!("connect({authority}): {e}")),
    };

    let head = ctx.raw_head().to_vec();
    ctx.continue_if_expected()?;
    let bodyless = ctx.remaining_body() == 0;

    let mut buf = vec![0u8; ctx.server().settings.max_request_size];
    let mut filled = 0;
    let mut exchanged = round_trip(ctx, &mut upstream, &head, &mut buf, &mut filled);
    // A cached upstream may have been closed by the peer while idle.
    if exchanged.is_err() && cached && bodyless && filled == 0 {
        tracing::debug!(%authority, "cached upstream closed, reconnecting");
        exchanged = match connect(&authority) {
            Ok(fresh) => {
                upstream = fresh;
                round_trip(ctx, &mut upstream, &head, &mut buf, &mut filled)
            }
            Err(e) => Err(e),
        };
    }
    let head_len = match exchanged {
        Ok(len) => len,
        Err(e) => return ctx.send_error(Status::BadGateway, format!("{authority}: {e}")),
    };
    let status_end = buf[..head_len].iter().position(|&b| b == b'\n').unwrap_or(head_len);
    let status_line = String::from_utf8_lossy(&buf[..status_end]);
    let (Some(code), Ok(headers)) = (status_code(&status_line), parse_header_block(&buf[status_end + 1..head_len]))
    else {
        return ctx.send_error(Status::BadGateway, format!("{authority}: malformed response head"));
    };

    let length = body_length(ctx.request.method, code, &headers);
    let reusable = !headers
        .get("Connection")
        .is_some_and(|v| v.eq_ignore_ascii_case("close"));
    if length == BodyLength::UntilClose {
        ctx.close_after_response();
    }
    ctx.send_raw_head(code, &buf[..head_len])?;

    let early = &buf[head_len..filled];
    match length {
        BodyLength::None => {}
        BodyLength::Exact(len) => {
            let mut body = Cursor::new(early).chain(&mut upstream).take(len);
            if io::copy(&mut body, ctx)? < len {
                ctx.close_after_response();
                return ctx.flush();
            }
        }
        BodyLength::Chunked => {
            let mut body = BufReader::new(Cursor::new(early).chain(&mut upstream));
            relay_chunked(&mut body, ctx)?;
            return ctx.flush();
        }
        BodyLength::UntilClose => {
            io::copy(&mut Cursor::new(early).chain(&mut upstream), ctx)?;
            return ctx.flush();
        }
    }

    let leftover = match length {
        BodyLength::Exact(len) => early.len() as u64 > len,
        _ => !early.is_empty(),
    };
    if reusable && !leftover {
        ctx.session.upstream = Some(Upstream {
            authority,
            stream: upstream,
        });
    }
    ctx.flush()
}

/// Copy `from` into `to` until either side fails or `from` closes.
/// Timeouts only re-check the stop flag.
fn pump(mut from: &TcpStream, mut to: &TcpStream, stop: &AtomicBool) {
    let mut chunk = [0u8; 8192];
    loop {
        match from.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if to.write_all(&chunk[..n]).is_err() {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    let _ = to.shutdown(Shutdown::Write);
}

/// Answer `CONNECT host:port` and shovel bytes both ways until either side closes.
pub(crate) fn tunnel(ctx: &mut RequestContext<'_>) -> io::Result<()> {
    let Some(authority) = connect_authority(&ctx.request.uri) else {
        return ctx.send_error(Status::BadRequest, format!("bad CONNECT target {}", ctx.request.uri));
    };
    if ctx.is_tls() {
        return ctx.send_error(Status::NotImplemented, "CONNECT over a TLS listener");
    }
    let upstream = match connect(&authority) {
        Ok(stream) => stream,
        Err(e) => return ctx.send_error(Status::BadGateway, format!("connect({authority}): {e}")),
    };
    upstream.set_read_timeout(Some(READ_SLICE))?;

    ctx.close_after_response();
    ctx.send_raw_head(200, b"HTTP/1.1 200 OK\r\n\r\n")?;
    ctx.flush()?;
    let early = ctx.take_buffered();
    (&upstream).write_all(&early)?;

    let client = ctx.session.stream.tcp();
    let stop = &ctx.server().stop;
    tracing::debug!(remote = %ctx.remote_addr(), %authority, "tunnel open");
    thread::scope(|scope| {
        scope.spawn(|| pump(client, &upstream, stop));
        pump(&upstream, client, stop);
    });
    tracing::debug!(remote = %ctx.remote_addr(), %authority, "tunnel closed");
    Ok(())
}
