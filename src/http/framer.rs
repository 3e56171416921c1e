//! Locates the end of an HTTP header block in a growing buffer.
//!
//! The same scanner frames client requests, CGI output and upstream proxy
//! responses. It remembers how far it has looked so a request trickled in
//! one byte at a time is still scanned once in total.

use std::io::{self, Read};

use thiserror::Error;

/// Why a header block could not be framed.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Buffer filled up before the terminator arrived.
    #[error("header block exceeds {0} bytes")]
    TooLarge(usize),
    /// Illegal control byte in the header block.
    #[error("illegal character in header block")]
    Illegal,
    /// Peer closed before a complete header block arrived.
    #[error("connection closed")]
    Closed,
    /// Read failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result of scanning the bytes received so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// No terminator yet; read more.
    Incomplete,
    /// An illegal control byte precedes the terminator.
    Invalid,
    /// Header block length including the blank-line terminator.
    Complete(usize),
}

fn is_illegal(b: u8) -> bool {
    b < 0x20 && b != b'\r' && b != b'\n'
}

/// Resumable header-block scanner.
#[derive(Debug, Default, Clone)]
pub struct Framer {
    scanned: usize,
}

impl Framer {
    /// Fresh scanner positioned at the start of the buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget progress; the buffer now holds a new message.
    pub fn reset(&mut self) {
        self.scanned = 0;
    }

    /// Scan `buf`, which must extend the bytes passed on earlier calls.
    pub fn scan(&mut self, buf: &[u8]) -> Frame {
        for i in self.scanned..buf.len() {
            let b = buf[i];
            if is_illegal(b) {
                self.scanned = i;
                return Frame::Invalid;
            }
            if b == b'\n' && i >= 1 {
                let end_lf = buf[i - 1] == b'\n';
                let end_crlf = i >= 2 && buf[i - 1] == b'\r' && buf[i - 2] == b'\n';
                if end_lf || end_crlf {
                    self.scanned = i;
                    return Frame::Complete(i + 1);
                }
            }
        }
        self.scanned = buf.len();
        Frame::Incomplete
    }
}

/// One-shot scan of a complete buffer.
pub fn request_len(buf: &[u8]) -> Frame {
    Framer::new().scan(buf)
}

/// Read from `reader` until `buf` holds a complete header block.
///
/// `buf[..*filled]` are bytes already received; more are appended after them and
/// `*filled` is advanced. Returns the header block length. Bytes past it (body,
/// pipelined requests) stay in `buf[len..*filled]`.
pub fn read_head<R: Read>(reader: &mut R, buf: &mut [u8], filled: &mut usize) -> Result<usize, FrameError> {
    let mut framer = Framer::new();
    loop {
        match framer.scan(&buf[..*filled]) {
            Frame::Complete(len) => return Ok(len),
            Frame::Invalid => return Err(FrameError::Illegal),
            Frame::Incomplete => {}
        }
        if *filled == buf.len() {
            return Err(FrameError::TooLarge(buf.len()));
        }
        let n = match reader.read(&mut buf[*filled..]) {
            Ok(0) => return Err(FrameError::Closed),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        *filled += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: a\r\nX-Long: 0123456789\r\n\r\nBODY";

    #[test]
    fn finds_crlf_and_lf_terminators() {
        assert_eq!(request_len(REQUEST), Frame::Complete(REQUEST.len() - 4));
        assert_eq!(request_len(b"GET / HTTP/1.0\n\nrest"), Frame::Complete(16));
        assert_eq!(request_len(b"GET / HTTP/1.0\n\r\n"), Frame::Complete(17));
    }

    #[test]
    fn incomplete_until_blank_line() {
        assert_eq!(request_len(b"GET / HTTP/1.1\r\nHost: a\r\n"), Frame::Incomplete);
        assert_eq!(request_len(b""), Frame::Incomplete);
    }

    #[test]
    fn control_bytes_are_invalid() {
        assert_eq!(request_len(b"GET /\x01 HTTP/1.1\r\n\r\n"), Frame::Invalid);
        assert_eq!(request_len(b"GET / HTTP/1.1\r\nA:\x00\r\n"), Frame::Invalid);
    }

    #[test]
    fn high_bytes_are_allowed() {
        assert_eq!(request_len("GET /caf\u{e9} HTTP/1.1\r\n\r\n".as_bytes()), Frame::Complete(23));
    }

    #[test]
    fn chunk_size_does_not_change_result() {
        let expected = request_len(REQUEST);
        for chunk in 1..=REQUEST.len() {
            let mut framer = Framer::new();
            let mut end = 0;
            let mut got = Frame::Incomplete;
            while end < REQUEST.len() {
                end = (end + chunk).min(REQUEST.len());
                got = framer.scan(&REQUEST[..end]);
                if got != Frame::Incomplete {
                    break;
                }
            }
            assert_eq!(got, expected, "chunk size {chunk}");
        }
    }

    #[test]
    fn reset_starts_over() {
        let mut framer = Framer::new();
        assert_eq!(framer.scan(b"GET / HTTP/1.1\r\n"), Frame::Incomplete);
        framer.reset();
        assert_eq!(framer.scan(b"\n\n"), Frame::Complete(2));
    }

    /// Hands out its input a few bytes per read.
    struct Trickle<'a>(&'a [u8], usize);

    impl Read for Trickle<'_> {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let n = self.0.len().min(self.1).min(out.len());
            out[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    #[test]
    fn read_head_keeps_trailing_bytes() {
        let mut buf = [0u8; 128];
        let mut filled = 0;
        let len = read_head(&mut Trickle(REQUEST, 3), &mut buf, &mut filled).unwrap();
        assert_eq!(len, REQUEST.len() - 4);
        assert!(filled >= len);
        assert_eq!(&buf[..len], &REQUEST[..len]);
    }

    #[test]
    fn read_head_reports_overflow_and_eof() {
        let mut small = [0u8; 16];
        let mut filled = 0;
        assert!(matches!(
            read_head(&mut Trickle(REQUEST, 64), &mut small, &mut filled),
            Err(FrameError::TooLarge(16))
        ));

        let mut buf = [0u8; 64];
        let mut filled = 0;
        assert!(matches!(
            read_head(&mut Trickle(b"GET / HTTP/1.1\r\n", 64), &mut buf, &mut filled),
            Err(FrameError::Closed)
        ));
    }
}
