//! WebDAV subset: `PROPFIND` for discovery, `PUT` and `DELETE` for writes.

use std::fmt::Write as _;
use std::fs::{self, Metadata, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use super::auth::PASSWORDS_FILE_NAME;
use super::static_files::last_modified;
use crate::http::uri::url_encode;
use crate::http::{RequestContext, Response, Status};

fn push_entry(out: &mut String, href: &str, meta: &Metadata) {
    let collection = if meta.is_dir() { "<d:collection/>" } else { "" };
    let _ = write!(
        out,
        "<d:response><d:href>{}</d:href><d:propstat><d:prop>\
         <d:resourcetype>{collection}</d:resourcetype>\
         <d:getcontentlength>{}</d:getcontentlength>\
         <d:getlastmodified>{}</d:getlastmodified>\
         </d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>\n",
        url_encode(href),
        meta.len(),
        last_modified(meta),
    );
}

/// Multi-status body for `uri`; a collection's children are included unless `Depth: 0`.
pub fn multistatus(uri: &str, path: &Path, meta: &Metadata, depth: &str) -> String {
    let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><d:multistatus xmlns:d='DAV:'>\n");
    push_entry(&mut body, uri, meta);

    if meta.is_dir() && depth.trim() != "0" {
        if let Ok(children) = fs::read_dir(path) {
            let base = if uri.ends_with('/') { uri.to_string() } else { format!("{uri}/") };
            for child in children.flatten() {
                let name = child.file_name().to_string_lossy().into_owned();
                if name == PASSWORDS_FILE_NAME {
                    continue;
                }
                let Ok(child_meta) = child.metadata() else {
                    continue;
                };
                let slash = if child_meta.is_dir() { "/" } else { "" };
                push_entry(&mut body, &format!("{base}{name}{slash}"), &child_meta);
            }
        }
    }

    body.push_str("</d:multistatus>\n");
    body
}

pub(crate) fn propfind(ctx: &mut RequestContext<'_>, path: &Path, meta: &Metadata) -> io::Result<()> {
    let depth = ctx.header("Depth").unwrap_or("1");
    let body = multistatus(&ctx.request.uri, path, meta, depth);
    let response = Response::new(Status::MultiStatus)
        .header("Content-Type", "text/xml; charset=utf-8")
        .body(body);
    ctx.send_response(&response)
}

/// Start offset from `Content-Range: bytes N-...`, 0 when absent or unparsable.
fn put_offset(content_range: Option<&str>) -> u64 {
    content_range
        .and_then(|v| v.trim().strip_prefix("bytes"))
        .map(|v| v.trim_start_matches([' ', '=']))
        .and_then(|v| v.split('-').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// Store the request body at `path`, creating missing directories.
pub(crate) fn put(ctx: &mut RequestContext<'_>, path: &Path) -> io::Result<()> {
    let existed = path.exists();
    let created = if existed { Status::Ok } else { Status::Created };

    if ctx.request.uri.ends_with('/') {
        return match fs::create_dir_all(path) {
            Ok(()) => ctx.send_response(&Response::new(created)),
            Err(e) => ctx.send_error(Status::InternalServerError, format!("mkdir({}): {e}", path.display())),
        };
    }
    if path.is_dir() {
        return ctx.send_error(Status::Forbidden, format!("{} is a directory", path.display()));
    }
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            return ctx.send_error(Status::InternalServerError, format!("mkdir({}): {e}", parent.display()));
        }
    }

    let offset = put_offset(ctx.header("Content-Range"));
    let opened = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(offset == 0)
        .open(path)
        .and_then(|mut file| file.seek(SeekFrom::Start(offset)).map(|_| file));
    let mut file = match opened {
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

    ctx.continue_if_expected()?;
    let expected = ctx.remaining_body();
    let written = io::copy(&mut (&mut *ctx).take(expected), &mut file)?;
    if written < expected {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    ctx.send_response(&Response::new(created))
}

pub(crate) fn delete(ctx: &mut RequestContext<'_>, path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => ctx.send_response(&Response::ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            ctx.send_error(Status::NotFound, format!("{}: {e}", path.display()))
        }
        Err(e) => ctx.send_error(Status::InternalServerError, format!("remove({}): {e}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_offset() {
        assert_eq!(put_offset(Some("bytes 100-199/200")), 100);
        assert_eq!(put_offset(Some("bytes=5-")), 5);
        assert_eq!(put_offset(Some("items 1-2")), 0);
        assert_eq!(put_offset(None), 0);
    }

    #[test]
    fn depth_limits_children() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "abc").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join(PASSWORDS_FILE_NAME), "x").unwrap();
        let meta = fs::metadata(dir.path()).unwrap();

        let shallow = multistatus("/dav/", dir.path(), &meta, "0");
        assert_eq!(shallow.matches("<d:response>").count(), 1);
        assert!(shallow.contains("<d:collection/>"));

        let deep = multistatus("/dav/", dir.path(), &meta, "1");
        assert_eq!(deep.matches("<d:response>").count(), 3);
        assert!(deep.contains("<d:href>/dav/a.txt</d:href>"));
        assert!(deep.contains("<d:href>/dav/sub/</d:href>"));
        assert!(deep.contains("<d:getcontentlength>3</d:getcontentlength>"));
        assert!(!deep.contains(PASSWORDS_FILE_NAME));
    }
}
