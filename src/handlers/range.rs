//! Single byte-range requests (`Range: bytes=...`).

use std::fmt;

/// Inclusive byte range inside a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte.
    pub start: u64,
    /// Last byte, inclusive.
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false: a range covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// `Content-Range` value for a resource of `size` bytes.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{size}", self.start, self.end)
    }
}

/// The requested range lies entirely past the end of the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsatisfiable;

impl fmt::Display for Unsatisfiable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("requested range not satisfiable")
    }
}

/// Interpret a `Range` header against a resource of `size` bytes.
///
/// `Ok(None)` means serve the whole resource: the header is malformed, uses
/// another unit, or asks for several ranges. Ends past the resource are clamped.
pub fn parse(header: &str, size: u64) -> Result<Option<ByteRange>, Unsatisfiable> {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((first, last)) = spec.trim().split_once('-') else {
        return Ok(None);
    };
    let (first, last) = (first.trim(), last.trim());

    let (start, end) = match (first.is_empty(), last.is_empty()) {
        // bytes=-N: the last N bytes
        (true, false) => {
            let Ok(suffix) = last.parse::<u64>() else {
                return Ok(None);
            };
            if suffix == 0 || size == 0 {
                return Err(Unsatisfiable);
            }
            (size.saturating_sub(suffix), size - 1)
        }
        // bytes=N-
        (false, true) => {
            let Ok(start) = first.parse::<u64>() else {
                return Ok(None);
            };
            (start, u64::MAX)
        }
        (false, false) => match (first.parse::<u64>(), last.parse::<u64>()) {
            (Ok(start), Ok(end)) if start <= end => (start, end),
            _ => return Ok(None),
        },
        (true, true) => return Ok(None),
    };

    if start >= size {
        return Err(Unsatisfiable);
    }
    Ok(Some(ByteRange {
        start,
        end: end.min(size - 1),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_open_and_suffix_forms() {
        assert_eq!(parse("bytes=10-19", 100), Ok(Some(ByteRange { start: 10, end: 19 })));
        assert_eq!(parse("bytes=90-", 100), Ok(Some(ByteRange { start: 90, end: 99 })));
        assert_eq!(parse("bytes=-5", 100), Ok(Some(ByteRange { start: 95, end: 99 })));
        assert_eq!(parse("bytes=-500", 100), Ok(Some(ByteRange { start: 0, end: 99 })));
    }

    #[test]
    fn end_is_clamped() {
        let range = parse("bytes=50-1000", 100).unwrap().unwrap();
        assert_eq!(range.len(), 50);
        assert_eq!(range.content_range(100), "bytes 50-99/100");
    }

    #[test]
    fn past_the_end_is_unsatisfiable() {
        assert_eq!(parse("bytes=100-", 100), Err(Unsatisfiable));
        assert_eq!(parse("bytes=0-0", 0), Err(Unsatisfiable));
        assert_eq!(parse("bytes=-0", 10), Err(Unsatisfiable));
    }

    #[test]
    fn malformed_headers_are_ignored() {
        for header in ["items=0-1", "bytes=abc", "bytes=5-2", "bytes=0-1,4-5", "bytes=-"] {
            assert_eq!(parse(header, 100), Ok(None), "{header}");
        }
    }
}
