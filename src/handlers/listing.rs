//! HTML directory listings with sortable columns.

use std::fmt::{self, Write as _};
use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Local};

use super::auth::PASSWORDS_FILE_NAME;
use crate::http::uri::url_encode;
use crate::http::{RequestContext, Response, Status};

/// Column a listing is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Size,
    Date,
}

impl SortKey {
    fn flag(self) -> char {
        match self {
            Self::Name => 'n',
            Self::Size => 's',
            Self::Date => 'd',
        }
    }
}

/// Sort column and direction, encoded in the query string as `n`, `s` or `d`
/// with a second `d` for descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortOrder {
    pub key: SortKey,
    pub descending: bool,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self {
            key: SortKey::Name,
            descending: false,
        }
    }
}

impl SortOrder {
    /// Read the order from a raw query string; anything unknown sorts by name.
    pub fn from_query(query: Option<&str>) -> Self {
        let flags = query.unwrap_or_default().as_bytes();
        let key = match flags.first() {
            Some(b's') => SortKey::Size,
            Some(b'd') => SortKey::Date,
            _ => SortKey::Name,
        };
        Self {
            key,
            descending: flags.get(1) == Some(&b'd'),
        }
    }

    /// Query string for a column header link: clicking the active column flips it.
    fn link_for(self, key: SortKey) -> String {
        let flip = self.key == key && !self.descending;
        if flip {
            format!("{}d", key.flag())
        } else {
            key.flag().to_string()
        }
    }
}

/// One row of a listing.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: SystemTime,
}

/// Sort rows: directories always come first, then by the chosen column.
pub fn sort_entries(entries: &mut [Entry], order: SortOrder) {
    entries.sort_by(|a, b| {
        b.is_dir.cmp(&a.is_dir).then_with(|| {
            let by_key = match order.key {
                SortKey::Name => a.name.cmp(&b.name),
                SortKey::Size => a.size.cmp(&b.size).then_with(|| a.name.cmp(&b.name)),
                SortKey::Date => a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)),
            };
            if order.descending { by_key.reverse() } else { by_key }
        })
    });
}

fn read_entries(dir: &Path) -> io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for item in fs::read_dir(dir)? {
        let item = item?;
        let name = item.file_name().to_string_lossy().into_owned();
        if name == PASSWORDS_FILE_NAME {
            continue;
        }
        let Ok(meta) = item.metadata() else {
            continue;
        };
        entries.push(Entry {
            name,
            is_dir: meta.is_dir(),
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    Ok(entries)
}

/// Escape < > & ' " into HTML entities.
struct HtmlEscaped<'a>(&'a str);

impl fmt::Display for HtmlEscaped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '\'' => f.write_str("&#39;")?,
                '"' => f.write_str("&quot;")?,
                c => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

fn human_size(size: u64) -> String {
    const KB: f64 = 1024.0;
    let s = size as f64;
    if size < 1024 {
        size.to_string()
    } else if s < KB * KB {
        format!("{:.1}k", s / KB)
    } else if s < KB * KB * KB {
        format!("{:.1}M", s / (KB * KB))
    } else {
        format!("{:.1}G", s / (KB * KB * KB))
    }
}

/// Render the page for `uri` (which ends with `/`).
pub fn render(uri: &str, entries: &[Entry], order: SortOrder) -> String {
    let mut page = String::with_capacity(512 + entries.len() * 160);
    let title = HtmlEscaped(uri);
    let _ = write!(
        page,
        "<html><head><title>Index of {title}</title>\
         <style>th {{text-align: left;}}</style></head>\
         <body><h1>Index of {title}</h1><pre><table cellpadding=\"0\">\
         <tr><th><a href=\"?{}\">Name</a></th><th><a href=\"?{}\">Modified</a></th>\
         <th><a href=\"?{}\">Size</a></th></tr>\
         <tr><td colspan=\"3\"><hr></td></tr>\
         <tr><td><a href=\"{}\">Parent directory</a></td><td>&nbsp;-</td><td>&nbsp;&nbsp;-</td></tr>\n",
        order.link_for(SortKey::Name),
        order.link_for(SortKey::Date),
        order.link_for(SortKey::Size),
        url_encode(&parent_of(uri)),
    );

    for entry in entries {
        let modified: DateTime<Local> = entry.modified.into();
        let slash = if entry.is_dir { "/" } else { "" };
        let size = if entry.is_dir {
            "[DIRECTORY]".to_string()
        } else {
            human_size(entry.size)
        };
        let _ = writeln!(
            page,
            "<tr><td><a href=\"{}{}{slash}\">{}{slash}</a></td><td>&nbsp;{}</td><td>&nbsp;&nbsp;{size}</td></tr>",
            url_encode(uri),
            url_encode(&entry.name),
            HtmlEscaped(&entry.name),
            modified.format("%d-%b-%Y %H:%M"),
        );
    }
    page.push_str("</table></pre></body></html>");
    page
}

fn parent_of(uri: &str) -> String {
    let trimmed = uri.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) => trimmed[..=i].to_string(),
        None => "/".to_string(),
    }
}

/// Serve a listing of `dir`.
pub(crate) fn serve(ctx: &mut RequestContext<'_>, dir: &Path) -> io::Result<()> {
    let mut entries = match read_entries(dir) {
        Ok(entries) => entries,
        Err(e) => return ctx.send_error(Status::InternalServerError, format!("read_dir({}): {e}", dir.display())),
    };
    let order = SortOrder::from_query(ctx.request.query_string.as_deref());
    sort_entries(&mut entries, order);

    let page = render(&ctx.request.uri, &entries, order);
    let response = Response::ok()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(page);
    ctx.send_response(&response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(name: &str, is_dir: bool, size: u64, age_secs: u64) -> Entry {
        Entry {
            name: name.to_string(),
            is_dir,
            size,
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 - age_secs),
        }
    }

    fn names(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    fn sample() -> Vec<Entry> {
        vec![entry("b.txt", false, 100, 500), entry("a.txt", false, 50, 10)]
    }

    #[test]
    fn sorts_by_each_column() {
        let mut entries = sample();
        sort_entries(&mut entries, SortOrder::from_query(Some("n")));
        assert_eq!(names(&entries), ["a.txt", "b.txt"]);

        sort_entries(&mut entries, SortOrder::from_query(Some("s")));
        assert_eq!(names(&entries), ["a.txt", "b.txt"]);

        sort_entries(&mut entries, SortOrder::from_query(Some("d")));
        assert_eq!(names(&entries), ["b.txt", "a.txt"]);

        sort_entries(&mut entries, SortOrder::from_query(Some("nd")));
        assert_eq!(names(&entries), ["b.txt", "a.txt"]);
    }

    #[test]
    fn directories_always_first() {
        let mut entries = sample();
        entries.push(entry("zdir", true, 4096, 0));
        for query in ["n", "nd", "s", "sd", "d", "dd"] {
            sort_entries(&mut entries, SortOrder::from_query(Some(query)));
            assert_eq!(entries[0].name, "zdir", "query {query}");
        }
    }

    #[test]
    fn active_column_link_toggles() {
        let order = SortOrder::from_query(Some("s"));
        assert_eq!(order.link_for(SortKey::Size), "sd");
        assert_eq!(order.link_for(SortKey::Name), "n");
        let order = SortOrder::from_query(Some("sd"));
        assert_eq!(order.link_for(SortKey::Size), "s");
        assert_eq!(SortOrder::from_query(None), SortOrder::default());
    }

    #[test]
    fn names_are_escaped_and_encoded() {
        let page = render("/docs/", &[entry("<a&b>.txt", false, 3, 0)], SortOrder::default());
        assert!(page.contains("&lt;a&amp;b&gt;.txt"));
        assert!(page.contains("href=\"/docs/%3Ca%26b%3E.txt\""));
        assert!(page.contains("href=\"/\">Parent directory"));
    }

    #[test]
    fn credentials_file_is_hidden() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PASSWORDS_FILE_NAME), "u:r:x\n").unwrap();
        fs::write(dir.path().join("visible.txt"), "x").unwrap();
        let entries = read_entries(dir.path()).unwrap();
        assert_eq!(names(&entries), ["visible.txt"]);
    }
}
