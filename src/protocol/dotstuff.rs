// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SMTP `DATA` dot-stuffing and POP3 `RETR`/`TOP` byte-stuffing
//! (`spec.md` §4.4), both the same transformation in opposite directions.

use std::io;

use super::framing::{LineReader, ReadOutcome};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Reads lines after an SMTP `DATA` command until a line consisting of a
/// single `.`, stripping one leading dot from lines that begin with `..`.
/// Returns the raw message with `CRLF` line endings preserved.
pub async fn read_dot_stuffed_body<R: AsyncRead + Unpin>(reader: &mut LineReader<R>) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        match reader.read_line().await? {
            ReadOutcome::Eof => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-DATA")),
            ReadOutcome::Line(line) => {
                if line == "." {
                    return Ok(body);
                }
                let line = line.strip_prefix('.').unwrap_or(&line);
                body.extend_from_slice(line.as_bytes());
                body.extend_from_slice(b"\r\n");
            }
        }
    }
}

/// Writes `message` to `writer` as a POP3 `RETR`/`TOP` byte-stuffed
/// response body: each line beginning with `.` gets a second `.`
/// prepended, terminated by the bare `.` line.
pub async fn write_byte_stuffed<W: AsyncWrite + Unpin>(writer: &mut W, message: &[u8]) -> io::Result<()> {
    for line in split_crlf_lines(message) {
        if line.starts_with(b".") {
            writer.write_all(b".").await?;
        }
        writer.write_all(line).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b".\r\n").await?;
    Ok(())
}

/// Splits `message` on `CRLF` boundaries, tolerating a trailing partial
/// line with no terminator (treated as its own line).
fn split_crlf_lines(message: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 1 < message.len() {
        if message[i] == b'\r' && message[i + 1] == b'\n' {
            lines.push(&message[start..i]);
            i += 2;
            start = i;
        } else {
            i += 1;
        }
    }
    if start < message.len() {
        lines.push(&message[start..]);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn dot_stuffed_input_is_unstuffed_and_terminator_consumed() {
        let raw = b"Subject: hi\r\n..dot line\r\nbody\r\n.\r\nnext command\r\n".to_vec();
        let mut reader = LineReader::new(Cursor::new(raw));
        let body = read_dot_stuffed_body(&mut reader).await.unwrap();
        assert_eq!(body, b"Subject: hi\r\n.dot line\r\nbody\r\n");
    }

    #[tokio::test]
    async fn byte_stuffing_escapes_leading_dots_and_terminates() {
        let mut out = Vec::new();
        write_byte_stuffed(&mut out, b"Subject: x\r\n.leading\r\nbody").await.unwrap();
        assert_eq!(out, b"Subject: x\r\n..leading\r\nbody\r\n.\r\n");
    }
}
