//! Server-side includes: `<!--#include ... -->` and `<!--#exec "..." -->`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use super::cgi::CgiProcess;
use super::has_extension;
use crate::http::uri::{DocumentRoots, normalize_path};
use crate::http::{Method, RequestContext, Response, Status};

/// Deepest chain of nested includes that is still expanded.
pub const MAX_INCLUDE_DEPTH: usize = 10;

const TAG_OPEN: &[u8] = b"<!--#";
const TAG_CLOSE: &[u8] = b"-->";

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Expands SSI directives while copying a file to a writer.
///
/// Problems (missing files, bad directives, runaway nesting) do not stop the
/// page; they are collected in `errors` and the directive produces no output.
pub struct Includer<'s> {
    roots: &'s DocumentRoots,
    ssi_extensions: &'s [String],
    /// Problems met so far, in order.
    pub errors: Vec<String>,
}

impl<'s> Includer<'s> {
    /// `virtual` targets map through `roots`; targets ending in one of
    /// `ssi_extensions` are expanded in turn.
    pub fn new(roots: &'s DocumentRoots, ssi_extensions: &'s [String]) -> Self {
        Self {
            roots,
            ssi_extensions,
            errors: Vec::new(),
        }
    }

    /// Copy `path` to `out`, expanding directives. `depth` counts enclosing includes.
    pub fn send_file<W: Write>(&mut self, out: &mut W, path: &Path, depth: usize) -> io::Result<()> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                self.errors.push(format!("cannot open {}: {e}", path.display()));
                return Ok(());
            }
        };

        let mut rest = &data[..];
        while let Some(start) = find(rest, TAG_OPEN) {
            out.write_all(&rest[..start])?;
            let after = &rest[start + TAG_OPEN.len()..];
            let Some(end) = find(after, TAG_CLOSE) else {
                out.write_all(&rest[start..])?;
                return Ok(());
            };
            let directive = String::from_utf8_lossy(&after[..end]);
            self.directive(out, directive.trim(), path, depth)?;
            rest = &after[end + TAG_CLOSE.len()..];
        }
        out.write_all(rest)
    }

    fn directive<W: Write>(&mut self, out: &mut W, text: &str, current: &Path, depth: usize) -> io::Result<()> {
        let (keyword, args) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
        match keyword {
            "include" => self.include(out, args.trim(), current, depth),
            "exec" => self.exec(out, args.trim()),
            _ => {
                self.errors.push(format!("{}: unknown SSI directive: {text}", current.display()));
                Ok(())
            }
        }
    }

    /// Target of an include: `virtual="/uri"` under the document root,
    /// `file="path"` as given, or a bare `"name"` next to the including file.
    fn include_target(&self, args: &str, current: &Path) -> Option<PathBuf> {
        let (kind, quoted) = match args.split_once('=') {
            Some((kind, value)) => (kind.trim(), value.trim()),
            None => ("", args),
        };
        let value = quoted.strip_prefix('"')?.split('"').next()?;
        match kind {
            "virtual" => Some(self.roots.map(&normalize_path(value))),
            "file" => Some(PathBuf::from(value)),
            "" => Some(current.parent().unwrap_or(Path::new(".")).join(value)),
            _ => None,
        }
    }

    fn include<W: Write>(&mut self, out: &mut W, args: &str, current: &Path, depth: usize) -> io::Result<()> {
        let Some(target) = self.include_target(args, current) else {
            self.errors.push(format!("{}: bad SSI #include: {args}", current.display()));
            return Ok(());
        };
        if depth >= MAX_INCLUDE_DEPTH {
            self.errors
                .push(format!("SSI #include level is too deep ({})", target.display()));
            return Ok(());
        }
        if has_extension(&target, self.ssi_extensions) {
            return self.send_file(out, &target, depth + 1);
        }
        match fs::read(&target) {
            Ok(data) => out.write_all(&data),
            Err(e) => {
                self.errors.push(format!("cannot open {}: {e}", target.display()));
                Ok(())
            }
        }
    }

    fn exec<W: Write>(&mut self, out: &mut W, args: &str) -> io::Result<()> {
        let Some(cmd) = args.strip_prefix('"').and_then(|a| a.split('"').next()) else {
            self.errors.push(format!("bad SSI #exec: {args}"));
            return Ok(());
        };
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(cmd);
        let mut process = match CgiProcess::spawn(command) {
            Ok(process) => process,
            Err(e) => {
                self.errors.push(format!("cannot run {cmd}: {e}"));
                return Ok(());
            }
        };
        drop(process.stdin());
        if let Some(mut stdout) = process.stdout() {
            io::copy(&mut stdout, out)?;
        }
        Ok(())
    }
}

/// Serve `path` with directives expanded. The length is unknown up front, so
/// the connection closes after the page.
pub(crate) fn serve(ctx: &mut RequestContext<'_>, path: &Path) -> io::Result<()> {
    if let Err(e) = fs::metadata(path) {
        return ctx.send_error(Status::InternalServerError, format!("{}: {e}", path.display()));
    }
    ctx.close_after_response();
    let response = Response::ok()
        .header("Content-Type", "text/html; charset=utf-8")
        .until_close();
    ctx.send_head(&response)?;
    if ctx.request.method == Method::HEAD {
        return Ok(());
    }

    let settings = &ctx.server().settings;
    let mut includer = Includer::new(&settings.roots, &settings.ssi_extensions);
    includer.send_file(ctx, path, 0)?;
    for error in &includer.errors {
        ctx.log_error(error);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        dir: tempfile::TempDir,
        roots: DocumentRoots,
        exts: Vec<String>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let roots = DocumentRoots::parse(&dir.path().display().to_string()).unwrap();
            Self {
                dir,
                roots,
                exts: vec![".shtml".to_string()],
            }
        }

        fn write(&self, name: &str, text: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, text).unwrap();
            path
        }

        fn expand(&self, path: &Path) -> (String, Vec<String>) {
            let mut includer = Includer::new(&self.roots, &self.exts);
            let mut out = Vec::new();
            includer.send_file(&mut out, path, 0).unwrap();
            (String::from_utf8(out).unwrap(), includer.errors)
        }
    }

    #[test]
    fn include_forms() {
        let fx = Fixture::new();
        fx.write("parts/header.html", "HEAD");
        fx.write("sub/near.txt", "NEAR");
        let literal = fx.write("literal.txt", "LIT");
        let page = fx.write(
            "sub/page.shtml",
            &format!(
                "<!--#include virtual=\"/parts/header.html\" -->|\
                 <!--#include \"near.txt\" -->|\
                 <!--#include file=\"{}\" -->",
                literal.display()
            ),
        );
        let (out, errors) = fx.expand(&page);
        assert_eq!(out, "HEAD|NEAR|LIT");
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn nested_includes_expand() {
        let fx = Fixture::new();
        fx.write("inner.shtml", "[<!--#include \"leaf.txt\" -->]");
        fx.write("leaf.txt", "leaf");
        let outer = fx.write("outer.shtml", "<<!--#include \"inner.shtml\" -->>");
        assert_eq!(fx.expand(&outer).0, "<[leaf]>");
    }

    #[test]
    fn self_include_stops_at_the_depth_limit() {
        let fx = Fixture::new();
        let page = fx.write("loop.shtml", "x<!--#include \"loop.shtml\" -->");
        let (out, errors) = fx.expand(&page);
        assert_eq!(out, "x".repeat(MAX_INCLUDE_DEPTH + 1));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("too deep"));
    }

    #[test]
    fn exec_runs_a_shell_command() {
        let fx = Fixture::new();
        let page = fx.write("e.shtml", "a<!--#exec \"echo hello\" -->b");
        assert_eq!(fx.expand(&page).0, "ahello\nb");
    }

    #[test]
    fn unknown_directive_and_missing_file_are_reported() {
        let fx = Fixture::new();
        let page = fx.write("u.shtml", "1<!--#echo var=\"DATE_LOCAL\" -->2<!--#include \"gone.txt\" -->3");
        let (out, errors) = fx.expand(&page);
        assert_eq!(out, "123");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn keyword_must_match_whole_word() {
        let fx = Fixture::new();
        fx.write("leaf.txt", "leaf");
        let page = fx.write(
            "k.shtml",
            "1<!--#includex \"leaf.txt\" -->2<!--#execute \"echo no\" -->3",
        );
        let (out, errors) = fx.expand(&page);
        assert_eq!(out, "123");
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.contains("unknown SSI directive")), "{errors:?}");
    }

    #[test]
    fn unterminated_tag_is_copied_verbatim() {
        let fx = Fixture::new();
        let page = fx.write("t.shtml", "a<!--#include \"x\"");
        assert_eq!(fx.expand(&page).0, "a<!--#include \"x\"");
    }
}
