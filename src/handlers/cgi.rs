//! CGI/1.1 program execution.
//!
//! The request body is piped to the program's stdin. Its stdout is framed like
//! a client request to split the CGI header block from the body; the header
//! block becomes the response head and everything after it is relayed as-is.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use crate::http::framer::read_head;
use crate::http::parser::parse_header_block;
use crate::http::response::SERVER_NAME;
use crate::http::{Headers, Method, RequestContext, Status};

const DEFAULT_PATH: &str = "/sbin:/bin:/usr/sbin:/usr/bin";

/// A running CGI program. Dropping it kills the program if still running and
/// reaps it; its pipes close with it.
pub(crate) struct CgiProcess {
    child: Child,
}

impl CgiProcess {
    pub(crate) fn spawn(mut command: Command) -> io::Result<Self> {
        let child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        Ok(Self { child })
    }

    pub(crate) fn stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub(crate) fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Request facts a CGI environment is built from.
#[derive(Debug)]
pub(crate) struct CgiRequest<'a> {
    pub method: Method,
    pub uri: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a Headers,
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub tls: bool,
    pub user: Option<&'a str>,
    pub server_name: &'a str,
    pub root: &'a Path,
    pub script: &'a Path,
}

/// CGI/1.1 variables, then `HTTP_*` per request header, then operator extras.
pub(crate) fn environment(req: &CgiRequest<'_>, extra: &[(String, String)]) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::with_capacity(24 + req.headers.len() + extra.len());
    let mut set = |name: &str, value: String| env.push((name.to_string(), value));

    let script = req.script.display().to_string();
    let request_uri = match req.query {
        Some(q) => format!("{}?{q}", req.uri),
        None => req.uri.to_string(),
    };

    set("SERVER_NAME", req.server_name.to_string());
    set("SERVER_SOFTWARE", SERVER_NAME.to_string());
    set("DOCUMENT_ROOT", req.root.display().to_string());
    set("GATEWAY_INTERFACE", "CGI/1.1".to_string());
    set("SERVER_PROTOCOL", "HTTP/1.1".to_string());
    set("REDIRECT_STATUS", "200".to_string());
    set("SERVER_PORT", req.local.port().to_string());
    set("REQUEST_METHOD", req.method.as_str().to_string());
    set("REMOTE_ADDR", req.remote.ip().to_string());
    set("REMOTE_PORT", req.remote.port().to_string());
    set("REQUEST_URI", request_uri);
    set("SCRIPT_NAME", req.uri.to_string());
    set("SCRIPT_FILENAME", script.clone());
    set("PATH_TRANSLATED", script);
    set("HTTPS", if req.tls { "on" } else { "off" }.to_string());
    set(
        "PATH",
        std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
    );
    if let Some(v) = req.headers.get("Content-Type") {
        set("CONTENT_TYPE", v.to_string());
    }
    if let Some(v) = req.headers.get("Content-Length") {
        set("CONTENT_LENGTH", v.to_string());
    }
    if let Some(q) = req.query {
        set("QUERY_STRING", q.to_string());
    }
    if let Some(user) = req.user {
        set("REMOTE_USER", user.to_string());
        set("AUTH_TYPE", "Digest".to_string());
    }

    for (name, value) in req.headers.iter() {
        let name: String = name
            .chars()
            .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        set(&format!("HTTP_{name}"), value.to_string());
    }
    for (name, value) in extra {
        set(name.as_str(), value.clone());
    }
    env
}

/// Program and leading arguments that run `script`.
///
/// The configured interpreter wins; otherwise a `#!` first line names one.
fn interpreter(configured: Option<&Path>, script: &Path) -> Option<(PathBuf, Vec<String>)> {
    if let Some(program) = configured {
        return Some((program.to_path_buf(), Vec::new()));
    }
    let mut first = String::new();
    BufReader::new(File::open(script).ok()?)
        .take(1024)
        .read_line(&mut first)
        .ok()?;
    let line = first.strip_prefix("#!")?.trim();
    let mut parts = line.split_whitespace();
    let program = PathBuf::from(parts.next()?);
    Some((program, parts.map(str::to_string).collect()))
}

/// Status code and reason phrase from a CGI header block.
///
/// `Status: 404 Not Found` is forwarded; a bare `Location` means `302`.
pub(crate) fn response_status(headers: &Headers) -> (u16, String) {
    if let Some(status) = headers.get("Status") {
        let (code, reason) = status.trim().split_once(' ').unwrap_or((status.trim(), ""));
        if let Ok(code) = code.parse::<u16>() {
            let reason = match reason.trim() {
                "" => Status::reason_for(code).to_string(),
                r => r.to_string(),
            };
            return (code, reason);
        }
    }
    if headers.get("Location").is_some() {
        return (302, Status::Found.text().to_string());
    }
    (200, Status::Ok.text().to_string())
}

/// Status line plus forwarded CGI headers, ending with the blank line.
pub(crate) fn response_head(code: u16, reason: &str, headers: &Headers, keep_alive: bool) -> String {
    let mut head = format!("HTTP/1.1 {code} {reason}\r\n");
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("Status") || name.eq_ignore_ascii_case("Connection") {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(if keep_alive {
        "Connection: keep-alive\r\n\r\n"
    } else {
        "Connection: close\r\n\r\n"
    });
    head
}

fn command_for(ctx: &RequestContext<'_>, script: &Path, root: &Path) -> Command {
    let settings = &ctx.server().settings;
    let request = CgiRequest {
        method: ctx.request.method,
        uri: &ctx.request.uri,
        query: ctx.request.query_string.as_deref(),
        headers: &ctx.request.headers,
        remote: ctx.remote_addr(),
        local: ctx.local_addr(),
        tls: ctx.is_tls(),
        user: ctx.remote_user(),
        server_name: &settings.auth_domain,
        root,
        script,
    };

    let mut command = match interpreter(settings.cgi_interpreter.as_deref(), script) {
        Some((program, args)) => {
            let mut command = Command::new(program);
            command.args(args).arg(script);
            command
        }
        None => Command::new(script),
    };
    if let Some(dir) = script.parent() {
        command.current_dir(dir);
    }
    command
        .env_clear()
        .envs(environment(&request, &settings.cgi_environment));
    command
}

/// Copy the request body into the program. A program that stops reading early
/// is not an error; the rest of the body is discarded later.
fn feed_body(ctx: &mut RequestContext<'_>, stdin: Option<ChildStdin>) -> io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    let mut chunk = [0u8; 8192];
    while ctx.remaining_body() > 0 {
        let n = ctx.read(&mut chunk)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if stdin.write_all(&chunk[..n]).is_err() {
            break;
        }
    }
    Ok(())
}

/// Run the CGI program at `script` and relay its output.
pub(crate) fn run(ctx: &mut RequestContext<'_>, script: &Path) -> io::Result<()> {
    let (root, _) = ctx.server().settings.roots.resolve(&ctx.request.uri);
    let (script, root) = match (std::path::absolute(script), std::path::absolute(root)) {
        (Ok(script), Ok(root)) => (script, root),
        (Err(e), _) | (_, Err(e)) => {
            return ctx.send_error(Status::InternalServerError, format!("{}: {e}", script.display()));
        }
    };

    let mut process = match CgiProcess::spawn(command_for(ctx, &script, &root)) {
        Ok(process) => process,
        Err(e) => {
            return ctx.send_error(Status::InternalServerError, format!("cannot run {}: {e}", script.display()));
        }
    };

    ctx.continue_if_expected()?;
    feed_body(ctx, process.stdin())?;

    let Some(mut stdout) = process.stdout() else {
        return ctx.send_error(Status::InternalServerError, "CGI stdout unavailable");
    };
    let mut buf = vec![0u8; ctx.server().settings.max_request_size];
    let mut filled = 0;
    let head_len = match read_head(&mut stdout, &mut buf, &mut filled) {
        Ok(len) => len,
        Err(e) => {
            return ctx.send_error(
                Status::InternalServerError,
                format!("{} sent no valid header block: {e}", script.display()),
            );
        }
    };
    let headers = match parse_header_block(&buf[..head_len]) {
        Ok(headers) => headers,
        Err(e) => {
            return ctx.send_error(Status::InternalServerError, format!("{}: {e}", script.display()));
        }
    };

    let (code, reason) = response_status(&headers);
    if headers.get("Content-Length").is_none() {
        ctx.close_after_response();
    }
    let head = response_head(code, &reason, &headers, ctx.keep_alive());
    ctx.send_raw_head(code, head.as_bytes())?;

    if ctx.request.method != Method::HEAD {
        ctx.write_all(&buf[head_len..filled])?;
        io::copy(&mut stdout, ctx)?;
    }
    ctx.flush()
}
