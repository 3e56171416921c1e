//! Extension → content type mapping.

use std::path::Path;

const BUILTIN: &[(&str, &str)] = &[
    ("html", "text/html; charset=utf-8"),
    ("htm", "text/html; charset=utf-8"),
    ("shtml", "text/html; charset=utf-8"),
    ("shtm", "text/html; charset=utf-8"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("xml", "text/xml"),
    ("txt", "text/plain; charset=utf-8"),
    ("csv", "text/csv"),
    ("ico", "image/x-icon"),
    ("gif", "image/gif"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("svg", "image/svg+xml"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("wav", "audio/x-wav"),
    ("mp3", "audio/mpeg"),
    ("ogg", "application/ogg"),
    ("mid", "audio/mid"),
    ("mp4", "video/mp4"),
    ("m4v", "video/x-m4v"),
    ("mpg", "video/mpeg"),
    ("mpeg", "video/mpeg"),
    ("mov", "video/quicktime"),
    ("avi", "video/x-msvideo"),
    ("webm", "video/webm"),
    ("pdf", "application/pdf"),
    ("doc", "application/msword"),
    ("rtf", "application/rtf"),
    ("ps", "application/postscript"),
    ("swf", "application/x-shockwave-flash"),
    ("exe", "application/octet-stream"),
    ("bin", "application/octet-stream"),
    ("zip", "application/zip"),
    ("gz", "application/x-gunzip"),
    ("tgz", "application/x-tar-gz"),
    ("tar", "application/x-tar"),
    ("rar", "application/x-arj-compressed"),
    ("arj", "application/x-arj-compressed"),
    ("torrent", "application/x-bittorrent"),
    ("wasm", "application/wasm"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
];

const DEFAULT_TYPE: &str = "text/plain; charset=utf-8";

/// Content type lookup with operator overrides taking precedence.
#[derive(Debug, Clone, Default)]
pub struct MimeTypes {
    extra: Vec<(String, String)>,
}

impl MimeTypes {
    /// Build from `(".ext", "type")` pairs; the leading dot is optional.
    pub fn with_overrides(pairs: &[(String, String)]) -> Self {
        Self {
            extra: pairs
                .iter()
                .map(|(ext, ty)| (ext.trim_start_matches('.').to_ascii_lowercase(), ty.clone()))
                .collect(),
        }
    }

    /// Content type for a file path.
    pub fn lookup(&self, path: &Path) -> &str {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return DEFAULT_TYPE;
        };
        let ext = ext.to_ascii_lowercase();
        if let Some((_, ty)) = self.extra.iter().find(|(e, _)| *e == ext) {
            return ty;
        }
        BUILTIN
            .iter()
            .find(|(e, _)| *e == ext)
            .map_or(DEFAULT_TYPE, |(_, ty)| ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lookup_is_case_insensitive() {
        let mime = MimeTypes::default();
        assert_eq!(mime.lookup(Path::new("a/B.PNG")), "image/png");
        assert_eq!(mime.lookup(Path::new("noext")), DEFAULT_TYPE);
    }

    #[test]
    fn overrides_win() {
        let mime = MimeTypes::with_overrides(&[(".png".into(), "x/custom".into()), ("foo".into(), "x/foo".into())]);
        assert_eq!(mime.lookup(Path::new("a.png")), "x/custom");
        assert_eq!(mime.lookup(Path::new("a.foo")), "x/foo");
    }
}
