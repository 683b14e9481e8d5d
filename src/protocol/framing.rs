// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Line-oriented reader shared by SMTP/IMAP/POP3 sessions, plus IMAP
//! literal handling and quoted-string parsing (`spec.md` §4.4).

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Lines longer than this outside a literal are rejected, matching the
/// 8 KiB ceiling most IMAP/SMTP implementations enforce to bound buffering.
pub const MAX_LINE_LEN: usize = 8 * 1024;

#[derive(Debug)]
pub enum ReadOutcome {
    Line(String),
    Eof,
}

/// Wraps any `AsyncRead` half in a buffered, CRLF-delimited line reader that
/// can also switch to reading a fixed-size IMAP literal on demand.
pub struct LineReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner: BufReader::new(inner) }
    }

    /// Reads one CRLF-terminated line, rejecting embedded bare `CR`/`LF`
    /// and lines exceeding [`MAX_LINE_LEN`]. Returns `Eof` on a clean
    /// connection close with no partial data pending.
    pub async fn read_line(&mut self) -> io::Result<ReadOutcome> {
        let mut buf = Vec::new();
        let n = self.inner.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(ReadOutcome::Eof);
        }
        if buf.len() > MAX_LINE_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
        }
        if buf.last() != Some(&b'\n') {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "line not CRLF-terminated"));
        }
        buf.pop();
        if buf.last() != Some(&b'\r') {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bare LF without preceding CR"));
        }
        buf.pop();
        if buf.iter().any(|&b| b == b'\r' || b == b'\n') {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "embedded bare CR or LF"));
        }

        let line = String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(ReadOutcome::Line(line))
    }

    /// Reads exactly `n` bytes verbatim, for an IMAP `{n}`/`{n+}` literal
    /// argument. Byte content is unrestricted — literals are how IMAP
    /// carries CR/LF-containing payloads.
    pub async fn read_literal(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.inner.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub fn get_mut(&mut self) -> &mut R {
        self.inner.get_mut()
    }
}

/// Parses a trailing `{n}` or `{n+}` literal marker at the end of a command
/// line, per `spec.md` §4.4. Returns `(byte_count, non_synchronizing)`.
pub fn parse_literal_marker(line: &str) -> Option<(usize, bool)> {
    let line = line.trim_end();
    if !line.ends_with('}') {
        return None;
    }
    let start = line.rfind('{')?;
    let inner = &line[start + 1..line.len() - 1];
    let (digits, non_sync) = match inner.strip_suffix('+') {
        Some(d) => (d, true),
        None => (inner, false),
    };
    let n = digits.parse::<usize>().ok()?;
    Some((n, non_sync))
}

/// Unescapes an IMAP/SMTP double-quoted string body (`\"` and `\\`
/// escapes, per `spec.md` §4.4). `input` excludes the surrounding quotes.
pub fn unescape_quoted(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Escapes a string for use as an IMAP/SMTP quoted string body.
pub fn escape_quoted(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 2);
    for c in input.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_a_simple_crlf_line() {
        let mut reader = LineReader::new(Cursor::new(b"HELO there\r\n".to_vec()));
        match reader.read_line().await.unwrap() {
            ReadOutcome::Line(line) => assert_eq!(line, "HELO there"),
            ReadOutcome::Eof => panic!("expected a line"),
        }
    }

    #[tokio::test]
    async fn eof_on_empty_stream() {
        let mut reader = LineReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(matches!(reader.read_line().await.unwrap(), ReadOutcome::Eof));
    }

    #[tokio::test]
    async fn rejects_bare_lf() {
        let mut reader = LineReader::new(Cursor::new(b"a\nb\r\n".to_vec()));
        assert!(reader.read_line().await.is_err());
    }

    #[tokio::test]
    async fn reads_literal_then_resumes_line_mode() {
        let mut reader = LineReader::new(Cursor::new(b"hello\r\nrest\r\n".to_vec()));
        let literal = reader.read_literal(5).await.unwrap();
        assert_eq!(literal, b"hello");
        // the CRLF after the literal and "rest\r\n" remain for the next read
        match reader.read_line().await.unwrap() {
            ReadOutcome::Line(line) => assert_eq!(line, ""),
            ReadOutcome::Eof => panic!("expected a line"),
        }
    }

    #[test]
    fn parses_synchronizing_and_non_synchronizing_literals() {
        assert_eq!(parse_literal_marker("a001 APPEND INBOX {10}"), Some((10, false)));
        assert_eq!(parse_literal_marker("a001 APPEND INBOX {10+}"), Some((10, true)));
        assert_eq!(parse_literal_marker("a001 NOOP"), None);
    }

    #[test]
    fn quoted_string_round_trips_escapes() {
        let escaped = escape_quoted(r#"say "hi" \ bye"#);
        assert_eq!(unescape_quoted(&escaped), r#"say "hi" \ bye"#);
    }
}
