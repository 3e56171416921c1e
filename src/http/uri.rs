//! URI decoding, normalisation and mapping onto the filesystem.

use std::path::{Path, PathBuf};

/// Split `path?query` at the first `?`.
pub fn split_query(uri: &str) -> (&str, Option<&str>) {
    match uri.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (uri, None),
    }
}

/// Path part of an absolute-form request target (`http://host/path` → `/path`).
/// Origin-form targets are returned unchanged.
pub fn strip_origin(uri: &str) -> &str {
    let scheme_len = ["http://", "https://"]
        .iter()
        .find(|scheme| uri.get(..scheme.len()).is_some_and(|s| s.eq_ignore_ascii_case(scheme)))
        .map(|scheme| scheme.len());
    match scheme_len {
        Some(len) => match uri[len..].find(['/', '?']) {
            Some(i) if uri.as_bytes()[len + i] == b'/' => &uri[len + i..],
            _ => "/",
        },
        None => uri,
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Percent-decode a URI path (or, with `form`, a form value where `+` is a space).
///
/// Malformed escapes, decoded control bytes and invalid UTF-8 are rejected.
pub fn url_decode(src: &str, form: bool) -> Option<String> {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = match bytes[i] {
            b'%' => {
                let hi = bytes.get(i + 1).copied().and_then(hex_value)?;
                let lo = bytes.get(i + 2).copied().and_then(hex_value)?;
                i += 2;
                hi << 4 | lo
            }
            b'+' if form => b' ',
            b => b,
        };
        if b < 0x20 || b == 0x7f {
            return None;
        }
        out.push(b);
        i += 1;
    }
    String::from_utf8(out).ok()
}

/// Percent-encode everything outside the unreserved set, keeping `/`.
pub fn url_encode(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for &b in src.as_bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'/') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Collapse `//`, `/./` and `/../` so the result can never climb above `/`.
///
/// A trailing slash is preserved.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    let mut out = String::with_capacity(path.len() + 1);
    for segment in &segments {
        out.push('/');
        out.push_str(segment);
    }
    let trailing = path.ends_with('/') || path.ends_with("/.") || path.ends_with("/..");
    if out.is_empty() || trailing {
        out.push('/');
    }
    out
}

/// Default document root plus `uri_prefix=dir` aliases.
#[derive(Debug, Clone)]
pub struct DocumentRoots {
    default: PathBuf,
    aliases: Vec<(String, PathBuf)>,
}

impl DocumentRoots {
    /// Parse `root[,/prefix=dir]...`.
    pub fn parse(value: &str) -> Result<Self, String> {
        let mut entries = crate::config::split_list(value);
        let default = entries
            .next()
            .filter(|first| !first.contains('='))
            .ok_or("first entry must be the default root directory")?;
        let mut aliases = Vec::new();
        for entry in entries {
            let (prefix, dir) = entry
                .split_once('=')
                .ok_or_else(|| format!("{entry}: expected /prefix=dir"))?;
            if !prefix.starts_with('/') {
                return Err(format!("{prefix}: prefix must start with /"));
            }
            aliases.push((prefix.trim_end_matches('/').to_string(), PathBuf::from(dir)));
        }
        Ok(Self {
            default: PathBuf::from(default),
            aliases,
        })
    }

    /// Root directory and remaining URI for the longest matching prefix.
    pub fn resolve<'u>(&self, uri: &'u str) -> (&Path, &'u str) {
        self.aliases
            .iter()
            .filter(|(prefix, _)| {
                uri.strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or((self.default.as_path(), uri), |(prefix, dir)| {
                (dir.as_path(), &uri[prefix.len()..])
            })
    }

    /// Map a normalised URI path to a filesystem path.
    pub fn map(&self, uri: &str) -> PathBuf {
        let (root, rest) = self.resolve(uri);
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            root.to_path_buf()
        } else {
            root.join(rest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_form_targets() {
        assert_eq!(strip_origin("http://example.org:8080/a/b?x"), "/a/b?x");
        assert_eq!(strip_origin("HTTPS://example.org"), "/");
        assert_eq!(strip_origin("http://example.org?q"), "/");
        assert_eq!(strip_origin("/plain"), "/plain");
        assert_eq!(strip_origin("example.org:443"), "example.org:443");
    }

    #[test]
    fn query_split() {
        assert_eq!(split_query("/a/b?x=1?y"), ("/a/b", Some("x=1?y")));
        assert_eq!(split_query("/a"), ("/a", None));
    }

    #[test]
    fn decode_rejects_bad_sequences() {
        assert_eq!(url_decode("/a%20b", false).as_deref(), Some("/a b"));
        assert_eq!(url_decode("a+b", true).as_deref(), Some("a b"));
        assert_eq!(url_decode("a+b", false).as_deref(), Some("a+b"));
        assert_eq!(url_decode("/a%2", false), None);
        assert_eq!(url_decode("/a%zz", false), None);
        assert_eq!(url_decode("/a%00b", false), None);
        assert_eq!(url_decode("/%ff", false), None);
    }

    #[test]
    fn traversal_never_escapes_root() {
        assert_eq!(normalize_path("/../../etc/passwd"), "/etc/passwd");
        assert_eq!(normalize_path("/a/../../b"), "/b");
        assert_eq!(normalize_path("//a///b/./c/"), "/a/b/c/");
        assert_eq!(normalize_path("/a/b/.."), "/a/");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn traversal_stays_under_mapped_root() {
        let roots = DocumentRoots::parse("/srv/www").unwrap();
        for uri in ["/../../etc/passwd", "/a/../../b", "/./../x"] {
            let mapped = roots.map(&normalize_path(uri));
            assert!(mapped.starts_with("/srv/www"), "{uri} -> {}", mapped.display());
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let roots = DocumentRoots::parse("/srv/www,/img=/data/img,/img/big=/data/big").unwrap();
        assert_eq!(roots.map("/index.html"), PathBuf::from("/srv/www/index.html"));
        assert_eq!(roots.map("/img/a.png"), PathBuf::from("/data/img/a.png"));
        assert_eq!(roots.map("/img/big/b.png"), PathBuf::from("/data/big/b.png"));
        assert_eq!(roots.map("/imgx"), PathBuf::from("/srv/www/imgx"));
        assert_eq!(roots.map("/img"), PathBuf::from("/data/img"));
    }

    #[test]
    fn encode_keeps_slashes() {
        assert_eq!(url_encode("/a b/c&d"), "/a%20b/c%26d");
    }
}
