//! Built-in request handlers the router dispatches to.

use std::path::Path;

pub mod auth;
pub mod cgi;
pub mod dav;
pub mod listing;
pub mod proxy;
pub mod range;
pub mod ssi;
pub mod static_files;

/// Whether the file name of `path` ends with one of `extensions` (ASCII case-insensitive).
pub(crate) fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    extensions.iter().any(|ext| {
        name.len() > ext.len()
            && name.is_char_boundary(name.len() - ext.len())
            && name[name.len() - ext.len()..].eq_ignore_ascii_case(ext)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_match_ignores_case() {
        let exts = vec![".cgi".to_string(), ".pl".to_string()];
        assert!(has_extension(Path::new("/srv/a.CGI"), &exts));
        assert!(has_extension(Path::new("run.pl"), &exts));
        assert!(!has_extension(Path::new("/srv/.cgi"), &exts));
        assert!(!has_extension(Path::new("/srv/a.cgi.txt"), &exts));
        assert!(!has_extension(Path::new("/"), &exts));
    }
}
