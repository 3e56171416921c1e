//! HTTP digest authentication against `user:realm:HA1` credential files.
//!
//! Nonces are not remembered, so a captured response can be replayed for the
//! same URI. Credential files are re-read on every check.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};

use crate::config::Settings;
use crate::http::{RequestContext, Response, Status};

/// Per-directory credentials file.
pub const PASSWORDS_FILE_NAME: &str = ".htpasswd";

/// Lower-case hex MD5 of `parts` joined with `:`.
pub fn md5_hex(parts: &[&str]) -> String {
    let mut hasher = Md5::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b":");
        }
        hasher.update(part.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Fields of an `Authorization: Digest ...` header.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct DigestCredentials {
    /// `username`.
    pub user: String,
    pub uri: String,
    pub nonce: String,
    pub nc: String,
    pub cnonce: String,
    pub qop: String,
    /// Client's hash, 32 hex digits.
    pub response: String,
}

fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim_start();
    while !rest.is_empty() {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_ascii_whitespace());
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let mut value = String::new();
            let mut chars = quoted.char_indices();
            let mut end = quoted.len();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        end = i + 1;
                        break;
                    }
                    c => value.push(c),
                }
            }
            rest = &quoted[end.min(quoted.len())..];
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };
        params.insert(key, value);
    }
    params
}

impl DigestCredentials {
    /// Parse the header value. Every field used in the response hash must be present.
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }
        let mut params = parse_params(params);
        let mut take = |name: &str| params.remove(name).filter(|v| !v.is_empty());
        Some(Self {
            user: take("username")?,
            uri: take("uri")?,
            nonce: take("nonce")?,
            nc: take("nc")?,
            cnonce: take("cnonce")?,
            qop: take("qop")?,
            response: take("response")?,
        })
    }

    /// Compare the client's response with the one expected for `ha1`.
    pub fn check(&self, method: &str, ha1: &str) -> bool {
        if self.response.len() != 32 {
            return false;
        }
        let ha2 = md5_hex(&[method, &self.uri]);
        let expected = md5_hex(&[ha1, &self.nonce, &self.nc, &self.cnonce, &self.qop, &ha2]);
        expected.eq_ignore_ascii_case(&self.response)
    }
}

/// Look `creds.user` up in `file` under `realm` and verify the response.
pub fn authorize(file: &Path, realm: &str, method: &str, creds: &DigestCredentials) -> io::Result<bool> {
    let text = fs::read_to_string(file)?;
    Ok(text.lines().any(|line| {
        let mut fields = line.trim().splitn(3, ':');
        match (fields.next(), fields.next(), fields.next()) {
            (Some(user), Some(domain), Some(ha1)) => {
                user == creds.user && domain == realm && creds.check(method, ha1)
            }
            _ => false,
        }
    }))
}

/// Add, replace or (with an empty password) remove `user` in `file`.
pub fn set_password(file: &Path, realm: &str, user: &str, password: &str) -> io::Result<()> {
    let existing = match fs::read_to_string(file) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let prefix = format!("{user}:{realm}:");
    let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| !line.starts_with(&prefix))
        .map(str::to_string)
        .collect();
    if !password.is_empty() {
        lines.push(format!("{prefix}{}", md5_hex(&[user, realm, password])));
    }

    let mut tmp = file.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut out = fs::File::create(&tmp)?;
        for line in &lines {
            writeln!(out, "{line}")?;
        }
        out.sync_all()?;
    }
    fs::rename(&tmp, file)
}

/// Credentials file guarding `uri` (mapped to `path`), if any.
///
/// A `protect` rule for the URI wins, then the global file, then the nearest
/// `.htpasswd` between the target's directory and its document root.
pub(crate) fn passwords_file(settings: &Settings, uri: &str, path: &Path) -> Option<PathBuf> {
    if let Some((_, file)) = settings
        .protect
        .iter()
        .filter(|(prefix, _)| uri.starts_with(prefix.as_str()))
        .max_by_key(|(prefix, _)| prefix.len())
    {
        return Some(file.clone());
    }
    if let Some(global) = &settings.global_passwords_file {
        return Some(global.clone());
    }

    let (root, _) = settings.roots.resolve(uri);
    let mut dir = if path.is_dir() { Some(path) } else { path.parent() };
    while let Some(current) = dir {
        let candidate = current.join(PASSWORDS_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if current == root || !current.starts_with(root) {
            break;
        }
        dir = current.parent();
    }
    None
}

/// Whether the request carries valid credentials for `file`. Records the user on success.
pub(crate) fn check(ctx: &mut RequestContext<'_>, file: &Path) -> bool {
    let Some(creds) = ctx.header("Authorization").and_then(DigestCredentials::parse) else {
        return false;
    };
    let realm = &ctx.server().settings.auth_domain;
    match authorize(file, realm, ctx.request.method.as_str(), &creds) {
        Ok(true) => {
            ctx.remote_user = Some(creds.user);
            true
        }
        Ok(false) => false,
        Err(e) => {
            ctx.log_error(&format!("cannot read {}: {e}", file.display()));
            false
        }
    }
}

/// Send `401` with a fresh digest challenge.
pub(crate) fn challenge(ctx: &mut RequestContext<'_>) -> io::Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_string();
    let remote = ctx.remote_addr().to_string();
    let nonce = md5_hex(&[&now, &remote, &ctx.request.uri]);
    let realm = &ctx.server().settings.auth_domain;
    let response = Response::error(Status::Unauthorized).header(
        "WWW-Authenticate",
        format!("Digest qop=\"auth\", realm=\"{realm}\", nonce=\"{nonce}\""),
    );
    ctx.send_response(&response)
}
