//! Request dispatch: URI cleanup, authentication, middleware, then a
//! decision table that picks exactly one handler.

use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};

use super::uri::{normalize_path, split_query, strip_origin, url_decode};
use super::{ALLOWED_METHODS, Method, RequestContext, Response, Status};
use crate::config::Settings;
use crate::handlers::auth::{self, PASSWORDS_FILE_NAME};
use crate::handlers::{cgi, dav, has_extension, listing, proxy, ssi, static_files};
use crate::middleware::Flow;

/// What to do with a request once its URI is mapped onto the filesystem.
#[derive(Debug)]
pub(crate) enum Route {
    Options,
    Forbidden,
    Unauthorized,
    Put,
    Delete,
    NotFound,
    /// Directory requested without the trailing slash.
    AddSlash,
    Propfind(Metadata),
    Listing,
    Cgi(PathBuf),
    /// CGI target hit with a method scripts are not run for.
    CgiMethod,
    Ssi(PathBuf),
    File(PathBuf, Metadata),
}

/// First index file present in `dir`.
fn find_index(dir: &Path, index_files: &[String]) -> Option<(PathBuf, Metadata)> {
    index_files.iter().find_map(|name| {
        let candidate = dir.join(name);
        let meta = fs::metadata(&candidate).ok()?;
        meta.is_file().then_some((candidate, meta))
    })
}

/// Pick the handler for `method uri`, where `uri` is normalised and maps to `path`.
///
/// `write_authorized` is whether the request passed the PUT/DELETE credentials check.
pub(crate) fn decide(settings: &Settings, method: Method, uri: &str, path: &Path, write_authorized: bool) -> Route {
    if method == Method::OPTIONS {
        return Route::Options;
    }
    if path.file_name().is_some_and(|name| name == PASSWORDS_FILE_NAME) {
        return Route::Forbidden;
    }
    match method {
        Method::PUT | Method::DELETE if !write_authorized => return Route::Unauthorized,
        Method::PUT => return Route::Put,
        Method::DELETE => return Route::Delete,
        _ => {}
    }

    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => return Route::Forbidden,
        Err(_) => return Route::NotFound,
    };
    if meta.is_dir() && !uri.ends_with('/') {
        return Route::AddSlash;
    }
    if method == Method::PROPFIND {
        return Route::Propfind(meta);
    }

    let (path, meta) = if meta.is_dir() {
        match find_index(path, &settings.index_files) {
            Some(found) => found,
            None if settings.directory_listing => return Route::Listing,
            None => return Route::Forbidden,
        }
    } else {
        (path.to_path_buf(), meta)
    };

    if has_extension(&path, &settings.cgi_extensions) {
        return match method {
            Method::GET | Method::POST | Method::HEAD => Route::Cgi(path),
            _ => Route::CgiMethod,
        };
    }
    if has_extension(&path, &settings.ssi_extensions) {
        return Route::Ssi(path);
    }
    Route::File(path, meta)
}

/// Decode, normalise and map the request URI. Returns `false` when it is unusable.
fn clean_uri(ctx: &mut RequestContext<'_>) -> bool {
    let raw = ctx.request.uri.clone();
    let (path, query) = split_query(strip_origin(&raw));
    ctx.request.query_string = query.map(str::to_string);
    let Some(decoded) = url_decode(path, false) else {
        return false;
    };
    if !decoded.starts_with('/') {
        return false;
    }
    ctx.request.uri = normalize_path(&decoded);
    ctx.path = ctx.server().settings.roots.map(&ctx.request.uri);
    true
}

/// An index file was substituted for a directory: point the request at it.
fn adopt_index(ctx: &mut RequestContext<'_>, path: &Path) {
    if path != ctx.path {
        if let Some(name) = path.file_name() {
            ctx.request.uri.push_str(&name.to_string_lossy());
        }
        ctx.path = path.to_path_buf();
    }
}

/// Serve one parsed request.
pub(crate) fn dispatch(ctx: &mut RequestContext<'_>) -> io::Result<()> {
    let server = ctx.server();
    let settings = &server.settings;
    let method = ctx.request.method;

    if ctx.session.proxy && (method == Method::CONNECT || !ctx.request.uri.starts_with('/')) {
        return match method {
            Method::CONNECT => proxy::tunnel(ctx),
            _ => proxy::forward(ctx),
        };
    }

    if !clean_uri(ctx) {
        return ctx.send_error(Status::BadRequest, "malformed URI");
    }
    tracing::debug!(remote = %ctx.remote_addr(), %method, uri = %ctx.request.uri, "dispatch");

    if let Some(file) = auth::passwords_file(settings, &ctx.request.uri, &ctx.path) {
        if !auth::check(ctx, &file) {
            return auth::challenge(ctx);
        }
    }

    if server.middleware.run(ctx)? == Flow::Handled {
        return Ok(());
    }

    let write_authorized = match (method, &settings.put_delete_passwords_file) {
        (Method::PUT | Method::DELETE, Some(file)) => auth::check(ctx, file),
        _ => false,
    };

    let path = ctx.path.clone();
    match decide(settings, method, &ctx.request.uri, &path, write_authorized) {
        Route::Options => ctx.send_response(&Response::ok().header("Allow", ALLOWED_METHODS)),
        Route::Forbidden => ctx.send_error(Status::Forbidden, format!("{}: access denied", path.display())),
        Route::Unauthorized => auth::challenge(ctx),
        Route::Put => dav::put(ctx, &path),
        Route::Delete => dav::delete(ctx, &path),
        Route::NotFound => ctx.send_error(Status::NotFound, format!("{}: not found", path.display())),
        Route::AddSlash => {
            let location = match &ctx.request.query_string {
                Some(query) => format!("{}/?{query}", ctx.request.uri),
                None => format!("{}/", ctx.request.uri),
            };
            let response = Response::new(Status::MovedPermanently)
                .header("Location", location)
                .header("Content-Type", "text/plain; charset=utf-8");
            ctx.send_response(&response)
        }
        Route::Propfind(meta) => dav::propfind(ctx, &path, &meta),
        Route::Listing => listing::serve(ctx, &path),
        Route::Cgi(script) => {
            adopt_index(ctx, &script);
            cgi::run(ctx, &script)
        }
        Route::CgiMethod => ctx.send_error(Status::NotImplemented, format!("{method} on a CGI script")),
        Route::Ssi(page) => {
            adopt_index(ctx, &page);
            ssi::serve(ctx, &page)
        }
        Route::File(file, meta) => {
            adopt_index(ctx, &file);
            if static_files::is_not_modified(ctx, &meta) {
                static_files::send_not_modified(ctx, &meta)
            } else {
                static_files::serve(ctx, &file, &meta)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    fn settings(root: &Path, listing: bool) -> Settings {
        Config::new()
            .with("document_root", root.display().to_string())
            .and_then(|c| c.with("enable_directory_listing", if listing { "yes" } else { "no" }))
            .and_then(|c| c.resolve())
            .unwrap()
    }

    fn route(settings: &Settings, method: Method, uri: &str) -> Route {
        let path = settings.roots.map(uri);
        decide(settings, method, uri, &path, false)
    }

    #[test]
    fn decision_table() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::create_dir(dir.path().join("site")).unwrap();
        fs::write(dir.path().join("site/index.shtml"), "x").unwrap();
        fs::write(dir.path().join("run.cgi"), "#!/bin/sh\n").unwrap();
        fs::write(dir.path().join("page.html"), "x").unwrap();
        fs::write(dir.path().join(PASSWORDS_FILE_NAME), "x").unwrap();
        let s = settings(dir.path(), true);

        assert!(matches!(route(&s, Method::OPTIONS, "/missing"), Route::Options));
        assert!(matches!(route(&s, Method::GET, "/.htpasswd"), Route::Forbidden));
        assert!(matches!(route(&s, Method::PUT, "/page.html"), Route::Unauthorized));
        assert!(matches!(route(&s, Method::DELETE, "/page.html"), Route::Unauthorized));
        assert!(matches!(route(&s, Method::GET, "/nope"), Route::NotFound));
        assert!(matches!(route(&s, Method::GET, "/docs"), Route::AddSlash));
        assert!(matches!(route(&s, Method::PROPFIND, "/docs/"), Route::Propfind(_)));
        assert!(matches!(route(&s, Method::GET, "/docs/"), Route::Listing));
        assert!(matches!(route(&s, Method::GET, "/site/"), Route::Ssi(p) if p.ends_with("index.shtml")));
        assert!(matches!(route(&s, Method::POST, "/run.cgi"), Route::Cgi(_)));
        assert!(matches!(route(&s, Method::PROPFIND, "/run.cgi"), Route::Propfind(_)));
        assert!(matches!(route(&s, Method::GET, "/page.html"), Route::File(..)));

        let path = s.roots.map("/page.html");
        assert!(matches!(decide(&s, Method::PUT, "/page.html", &path, true), Route::Put));
        assert!(matches!(decide(&s, Method::DELETE, "/page.html", &path, true), Route::Delete));
    }

    #[test]
    fn listing_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        let s = settings(dir.path(), false);
        assert!(matches!(route(&s, Method::GET, "/docs/"), Route::Forbidden));
    }

    #[test]
    fn index_files_are_tried_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.htm"), "b").unwrap();
        fs::write(dir.path().join("index.html"), "a").unwrap();
        let names = vec!["index.html".to_string(), "index.htm".to_string()];
        let (path, _) = find_index(dir.path(), &names).unwrap();
        assert!(path.ends_with("index.html"));
        assert!(find_index(dir.path(), &["nope.html".to_string()]).is_none());
    }
}
