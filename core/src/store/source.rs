/*
 * source.rs
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

//! Outgoing message lines and envelope recipients.

use std::io::BufRead;

use crate::error::Result;

/// Yields the header and body lines of a message for SMTP DATA.
///
/// Lines may end in LF or CRLF; the engine normalizes them. Any `BufRead`
/// (a byte slice, a `BufReader<File>`) is a source.
pub trait MessageSource {
    /// Append the next line, terminator included, to `line`. Returns 0 at end of message.
    fn next_line(&mut self, line: &mut Vec<u8>) -> Result<usize>;
}

impl<R: BufRead> MessageSource for R {
    fn next_line(&mut self, line: &mut Vec<u8>) -> Result<usize> {
        Ok(self.read_until(b'\n', line)?)
    }
}

/// One envelope recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Mailbox; a bare local part gets `@hostname` appended.
    pub address: String,
    /// Already handled elsewhere (duplicate, local delivery); no RCPT is sent.
    pub skip: bool,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            skip: false,
        }
    }

    /// Address for `RCPT TO`, qualified with `hostname` when it has no domain.
    pub fn qualified(&self, hostname: &str) -> String {
        if self.address.contains('@') {
            self.address.clone()
        } else {
            format!("{}@{}", self.address, hostname)
        }
    }
}

impl From<&str> for Recipient {
    fn from(address: &str) -> Self {
        Recipient::new(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_slice_yields_lines() {
        let mut src: &[u8] = b"Subject: x\r\n\nbody";
        let mut line = Vec::new();
        assert_eq!(src.next_line(&mut line).unwrap(), 12);
        line.clear();
        assert_eq!(src.next_line(&mut line).unwrap(), 1);
        line.clear();
        assert_eq!(src.next_line(&mut line).unwrap(), 4);
        assert_eq!(line, b"body");
        line.clear();
        assert_eq!(src.next_line(&mut line).unwrap(), 0);
    }

    #[test]
    fn bare_names_are_qualified() {
        assert_eq!(Recipient::new("jo").qualified("example.org"), "jo@example.org");
        assert_eq!(Recipient::new("jo@x.net").qualified("example.org"), "jo@x.net");
    }
}
