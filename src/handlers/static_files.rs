//! Static file delivery with validators and single byte ranges.

use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::range::{self, ByteRange};
use crate::http::{Method, RequestContext, Response, Status};

fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

fn mtime_secs(meta: &Metadata) -> u64 {
    meta.modified().map_or(0, epoch_secs)
}

/// Entity tag built from modification time and size.
pub fn etag(meta: &Metadata) -> String {
    format!("\"{:x}.{:x}\"", mtime_secs(meta), meta.len())
}

/// `Last-Modified` value, at whole-second precision.
pub fn last_modified(meta: &Metadata) -> String {
    httpdate::fmt_http_date(UNIX_EPOCH + std::time::Duration::from_secs(mtime_secs(meta)))
}

/// Whether the client's cached copy is still current.
pub(crate) fn is_not_modified(ctx: &RequestContext<'_>, meta: &Metadata) -> bool {
    if let Some(tags) = ctx.header("If-None-Match") {
        let current = etag(meta);
        return tags.split(',').any(|t| t.trim() == current || t.trim() == "*");
    }
    ctx.header("If-Modified-Since")
        .and_then(|v| httpdate::parse_http_date(v).ok())
        .is_some_and(|since| mtime_secs(meta) <= epoch_secs(since))
}

/// Send `304` with the validators and no body.
pub(crate) fn send_not_modified(ctx: &mut RequestContext<'_>, meta: &Metadata) -> io::Result<()> {
    let response = Response::new(Status::NotModified)
        .header("ETag", etag(meta))
        .header("Last-Modified", last_modified(meta));
    ctx.send_response(&response)
}

/// Stream `path` (whose metadata is `meta`), honouring `Range`.
pub(crate) fn serve(ctx: &mut RequestContext<'_>, path: &Path, meta: &Metadata) -> io::Result<()> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            let status = if e.kind() == io::ErrorKind::PermissionDenied {
                Status::Forbidden
            } else {
                Status::InternalServerError
            };
            return ctx.send_error(status, format!("open({}): {e}", path.display()));
        }
    };

    let size = meta.len();
    let mime = ctx.server().settings.mime.lookup(path);
    let base = Response::ok()
        .header("Content-Type", mime)
        .header("Last-Modified", last_modified(meta))
        .header("ETag", etag(meta))
        .header("Accept-Ranges", "bytes");

    let requested = match ctx.header("Range").map(|h| range::parse(h, size)) {
        Some(Err(unsatisfiable)) => {
            ctx.log_error(&format!("{unsatisfiable}: {}", ctx.header("Range").unwrap_or_default()));
            let response = Response::error(Status::RangeNotSatisfiable)
                .header("Content-Range", format!("bytes */{size}"));
            return ctx.send_response(&response);
        }
        Some(Ok(range)) => range,
        None => None,
    };

    let (response, start, len) = match requested {
        Some(r @ ByteRange { start, .. }) => {
            let mut response = base.header("Content-Range", r.content_range(size));
            response.status = Status::PartialContent;
            (response, start, r.len())
        }
        None => (base, 0, size),
    };

    ctx.send_head(&response.content_length(len))?;
    if ctx.request.method == Method::HEAD {
        return Ok(());
    }
    if start > 0 {
        file.seek(SeekFrom::Start(start))?;
    }
    let copied = io::copy(&mut file.take(len), ctx)?;
    if copied < len {
        ctx.log_error(&format!("{} shrank while being sent", path.display()));
        ctx.close_after_response();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn etag_tracks_size_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "hello").unwrap();
        let meta = fs::metadata(&path).unwrap();
        let tag = etag(&meta);
        assert!(tag.starts_with('"') && tag.ends_with(".5\""), "{tag}");
        assert_eq!(tag, format!("\"{:x}.5\"", epoch_secs(meta.modified().unwrap())));
    }

    #[test]
    fn last_modified_round_trips_through_httpdate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "x").unwrap();
        let meta = fs::metadata(&path).unwrap();
        let parsed = httpdate::parse_http_date(&last_modified(&meta)).unwrap();
        assert_eq!(epoch_secs(parsed), epoch_secs(meta.modified().unwrap()));
    }
}
