/*
 * message.rs
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

//! Turns a POP3 multi-line response into an mbox-ready message.

/// Accumulates the lines of one RETR/TOP response.
///
/// Each line loses its byte-stuffed leading dot and its CRLF, gains an LF, and
/// is `>`-quoted when it would read as an mbox `From ` separator (mboxrd:
/// `From `, `>From `, `>>From ` and so on all gain one more `>`).
#[derive(Debug, Default)]
pub struct MessageCopy {
    out: Vec<u8>,
    lines: usize,
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn is_from_line(line: &[u8]) -> bool {
    let unquoted = &line[line.iter().take_while(|&&b| b == b'>').count()..];
    unquoted.starts_with(b"From ")
}

impl MessageCopy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one raw line as read from the wire. Returns false for the terminating `.`.
    pub fn push(&mut self, raw: &[u8]) -> bool {
        let mut line = strip_terminator(raw);
        if line == b"." {
            return false;
        }
        if line.first() == Some(&b'.') {
            line = &line[1..];
        }
        if is_from_line(line) {
            self.out.push(b'>');
        }
        self.out.extend_from_slice(line);
        self.out.push(b'\n');
        self.lines += 1;
        true
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    /// The message, ending in a blank line.
    pub fn finish(mut self) -> Vec<u8> {
        if !self.out.ends_with(b"\n\n") {
            self.out.push(b'\n');
        }
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy(lines: &[&[u8]]) -> Vec<u8> {
        let mut c = MessageCopy::new();
        for l in lines {
            if !c.push(l) {
                break;
            }
        }
        c.finish()
    }

    #[test]
    fn from_lines_are_quoted() {
        let out = copy(&[b"Subject: hi\r\n", b"\r\n", b"From here\r\n", b">From there\r\n", b".\r\n"]);
        assert_eq!(out, b"Subject: hi\n\n>From here\n>>From there\n\n");
    }

    #[test]
    fn leading_dot_is_unstuffed() {
        let out = copy(&[b"..hidden\r\n", b". \r\n", b".\r\n"]);
        assert_eq!(out, b".hidden\n \n\n");
    }

    #[test]
    fn existing_blank_line_is_not_doubled() {
        let out = copy(&[b"body\r\n", b"\r\n", b".\r\n"]);
        assert_eq!(out, b"body\n\n");
    }

    #[test]
    fn terminator_stops_copy() {
        let mut c = MessageCopy::new();
        assert!(c.push(b"one\n"));
        assert!(!c.push(b".\r\n"));
        assert_eq!(c.lines(), 1);
    }

    #[test]
    fn not_a_from_line() {
        assert!(!is_from_line(b"From: someone"));
        assert!(!is_from_line(b"Fromage"));
        assert!(is_from_line(b">>>From x"));
    }
}
