/*
 * dot_stuffer.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Postino, a mail transport engine.
 *
 * Postino is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Postino is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Postino.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Dot stuffing for SMTP DATA (RFC 5321: lines starting with . get an extra .).
//!
//! Works a line at a time: every line leaves with CRLF whatever it arrived
//! with, and `Bcc:` header fields (with their folded continuation lines) are
//! dropped before the blank line that ends the header.

/// Encodes message lines for the DATA phase.
#[derive(Debug)]
pub struct DotStuffer {
    in_header: bool,
    skipping: bool,
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self {
            in_header: true,
            skipping: false,
        }
    }
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn is_bcc(line: &[u8]) -> bool {
    line.len() >= 4 && line[..4].eq_ignore_ascii_case(b"bcc:")
}

impl DotStuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the wire form of one source line to `out`. Returns false when the line is suppressed.
    pub fn encode_line(&mut self, line: &[u8], out: &mut Vec<u8>) -> bool {
        let line = strip_terminator(line);
        if self.in_header {
            if line.is_empty() {
                self.in_header = false;
                self.skipping = false;
            } else if line[0] == b' ' || line[0] == b'\t' {
                if self.skipping {
                    return false;
                }
            } else {
                self.skipping = is_bcc(line);
                if self.skipping {
                    return false;
                }
            }
        }
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
        true
    }

    /// Terminator line; every encoded line already ends in CRLF.
    pub fn end_message(&mut self, out: &mut Vec<u8>) {
        out.extend_from_slice(b".\r\n");
        self.reset();
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Undo DATA encoding: split on CRLF, stop at the lone `.`, drop one leading dot per line.
pub fn unstuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for line in data.split_inclusive(|&b| b == b'\n') {
        let text = strip_terminator(line);
        if text == b"." {
            break;
        }
        out.extend_from_slice(text.strip_prefix(b".").unwrap_or(text));
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(message: &[u8]) -> Vec<u8> {
        let mut s = DotStuffer::new();
        let mut out = Vec::new();
        for line in message.split_inclusive(|&b| b == b'\n') {
            s.encode_line(line, &mut out);
        }
        s.end_message(&mut out);
        out
    }

    #[test]
    fn dot_at_line_start_is_doubled() {
        assert_eq!(encode(b"Subject: x\n\n.\n..x\nmid.dle\n"), b"Subject: x\r\n\r\n..\r\n...x\r\nmid.dle\r\n.\r\n");
    }

    #[test]
    fn bare_lf_becomes_crlf() {
        assert_eq!(encode(b"A: 1\r\n\nbody\nlast"), b"A: 1\r\n\r\nbody\r\nlast\r\n.\r\n");
    }

    #[test]
    fn bcc_and_its_folds_are_dropped() {
        let msg = b"To: a@x\nBCC: secret@x,\n\tother@x\nSubject: s\n\nBcc: stays in body\n";
        assert_eq!(
            encode(msg),
            b"To: a@x\r\nSubject: s\r\n\r\nBcc: stays in body\r\n.\r\n".to_vec()
        );
    }

    #[test]
    fn folded_lines_of_other_headers_survive() {
        assert_eq!(encode(b"Subject: a\n b\n\n"), b"Subject: a\r\n b\r\n\r\n.\r\n");
    }

    #[test]
    fn unstuff_reverses_encoding() {
        let original = b"From: me\r\nSubject: dots\r\n\r\n.\r\n..two\r\n.leading\r\nplain\r\n";
        assert_eq!(unstuff(&encode(original)), original.to_vec());
    }

    #[test]
    fn reset_restores_header_state() {
        let mut s = DotStuffer::new();
        let mut out = Vec::new();
        s.encode_line(b"\n", &mut out);
        s.end_message(&mut out);
        out.clear();
        assert!(!s.encode_line(b"Bcc: x\n", &mut out));
    }
}
