//! Access and error log files.
//!
//! Both files are optional and opened in append mode at start. Writes are
//! best-effort: a failed write is dropped, never reported to the client.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Local};

/// One served request, as recorded in the access log.
#[derive(Debug)]
pub(crate) struct AccessEntry<'a> {
    pub remote: IpAddr,
    pub user: Option<&'a str>,
    pub method: &'a str,
    pub uri: &'a str,
    pub query: Option<&'a str>,
    pub version: &'a str,
    pub status: u16,
    pub bytes: u64,
    pub referer: Option<&'a str>,
    pub agent: Option<&'a str>,
}

/// Request the error happened on, when there is one.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ErrorSource<'a> {
    pub remote: IpAddr,
    pub method: &'a str,
    pub uri: &'a str,
}

#[derive(Debug, Default)]
pub(crate) struct Logs {
    access: Option<Mutex<File>>,
    error: Option<Mutex<File>>,
}

fn open_append(path: &Path) -> io::Result<Mutex<File>> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Mutex::new)
}

fn append(file: &Option<Mutex<File>>, line: &str) {
    if let Some(file) = file {
        let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
        let _ = file.write_all(line.as_bytes());
    }
}

impl Logs {
    pub fn open(access: Option<&Path>, error: Option<&Path>) -> io::Result<Self> {
        Ok(Self {
            access: access.map(open_append).transpose()?,
            error: error.map(open_append).transpose()?,
        })
    }

    pub fn access(&self, entry: &AccessEntry<'_>) {
        tracing::debug!(
            remote = %entry.remote,
            method = entry.method,
            uri = entry.uri,
            status = entry.status,
            bytes = entry.bytes,
            "request served"
        );
        if self.access.is_some() {
            append(&self.access, &access_line(entry, Local::now()));
        }
    }

    pub fn error(&self, source: Option<ErrorSource<'_>>, message: &str) {
        match source {
            Some(s) => tracing::warn!(remote = %s.remote, method = s.method, uri = s.uri, "{message}"),
            None => tracing::warn!("{message}"),
        }
        if self.error.is_some() {
            append(&self.error, &error_line(source, message, Local::now()));
        }
    }
}

fn quoted(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("-")
}

/// Common Log Format plus referer and user agent.
fn access_line(entry: &AccessEntry<'_>, now: DateTime<Local>) -> String {
    let query = entry.query.map(|q| format!("?{q}")).unwrap_or_default();
    format!(
        "{} - {} [{}] \"{} {}{} HTTP/{}\" {} {} \"{}\" \"{}\"\n",
        entry.remote,
        quoted(entry.user),
        now.format("%d/%b/%Y:%H:%M:%S %z"),
        entry.method,
        entry.uri,
        query,
        entry.version,
        entry.status,
        entry.bytes,
        quoted(entry.referer),
        quoted(entry.agent),
    )
}

fn error_line(source: Option<ErrorSource<'_>>, message: &str, now: DateTime<Local>) -> String {
    let stamp = now.format("%a %b %d %H:%M:%S %Y");
    match source {
        Some(s) => format!("[{stamp}] [error] [client {}] {} {}: {message}\n", s.remote, s.method, s.uri),
        None => format!("[{stamp}] [error] {message}\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::net::Ipv4Addr;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn access_line_is_common_log_format() {
        let entry = AccessEntry {
            remote: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
            user: Some("joe"),
            method: "GET",
            uri: "/a b.html",
            query: Some("x=1"),
            version: "1.1",
            status: 200,
            bytes: 512,
            referer: None,
            agent: Some("curl/8"),
        };
        let line = access_line(&entry, fixed_time());
        assert!(line.starts_with("10.0.0.7 - joe [09/Mar/2024:14:05:07 "), "{line}");
        assert!(line.ends_with("\"GET /a b.html?x=1 HTTP/1.1\" 200 512 \"-\" \"curl/8\"\n"), "{line}");
    }

    #[test]
    fn error_line_names_client_and_request() {
        let source = ErrorSource {
            remote: IpAddr::V4(Ipv4Addr::LOCALHOST),
            method: "PUT",
            uri: "/up.txt",
        };
        let line = error_line(Some(source), "open: permission denied", fixed_time());
        assert_eq!(
            line,
            "[Sat Mar 09 14:05:07 2024] [error] [client 127.0.0.1] PUT /up.txt: open: permission denied\n"
        );
    }

    #[test]
    fn lines_are_appended_to_files() {
        let dir = tempfile::tempdir().unwrap();
        let error_path = dir.path().join("error.log");
        let logs = Logs::open(None, Some(&error_path)).unwrap();
        logs.error(None, "first");
        logs.error(None, "second");
        let text = std::fs::read_to_string(&error_path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("[error] second"));
    }
}
