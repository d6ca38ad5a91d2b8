/*
 * mailbox.rs
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

//! Where fetched POP3 messages go, and what happens to them on the server.
//!
//! Messages reach the sink already in mbox form: LF line endings, `From `
//! lines quoted with `>`, and a trailing blank line.

use std::io::Write;

use chrono::Local;

use crate::config::Config;
use crate::error::Result;

/// Receives each fetched message.
pub trait MailboxSink {
    fn deliver(&mut self, number: u32, message: &[u8]) -> Result<()>;
}

/// What to fetch and whether fetched messages are removed from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchPolicy {
    /// `TOP n 0` instead of `RETR n`.
    pub headers_only: bool,
    /// Mark each delivered message for deletion.
    pub delete_after_fetch: bool,
    /// Never send DELE, whatever else is set.
    pub read_only: bool,
}

impl FetchPolicy {
    /// True when delivered messages get a DELE at session end.
    pub fn deletes(&self) -> bool {
        self.delete_after_fetch && !self.read_only
    }
}

impl From<&Config> for FetchPolicy {
    fn from(config: &Config) -> Self {
        Self {
            headers_only: !config.bulk_load,
            delete_after_fetch: config.delete_after_fetch,
            read_only: config.read_only,
        }
    }
}

/// Collects messages in memory, in delivery order.
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    pub messages: Vec<(u32, Vec<u8>)>,
}

impl MailboxSink for MemoryMailbox {
    fn deliver(&mut self, number: u32, message: &[u8]) -> Result<()> {
        self.messages.push((number, message.to_vec()));
        Ok(())
    }
}

/// Appends messages to an mbox stream, each behind a `From ` separator line.
pub struct MboxWriter<W: Write> {
    out: W,
    sender: String,
}

impl<W: Write> MboxWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            sender: "MAILER-DAEMON".to_string(),
        }
    }

    /// Envelope sender written on separator lines.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> MailboxSink for MboxWriter<W> {
    fn deliver(&mut self, _number: u32, message: &[u8]) -> Result<()> {
        let stamp = Local::now().format("%a %b %e %H:%M:%S %Y");
        writeln!(self.out, "From {} {}", self.sender, stamp)?;
        self.out.write_all(message)?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_wins_over_delete() {
        let policy = FetchPolicy {
            delete_after_fetch: true,
            read_only: true,
            ..Default::default()
        };
        assert!(!policy.deletes());
        let policy = FetchPolicy {
            read_only: false,
            ..policy
        };
        assert!(policy.deletes());
    }

    #[test]
    fn policy_from_config() {
        let config = Config {
            bulk_load: false,
            delete_after_fetch: true,
            ..Default::default()
        };
        let policy = FetchPolicy::from(&config);
        assert!(policy.headers_only);
        assert!(policy.deletes());
    }

    #[test]
    fn mbox_writer_adds_separator() {
        let mut w = MboxWriter::new(Vec::new()).with_sender("pop@example.org");
        w.deliver(1, b"Subject: hi\n\nbody\n\n").unwrap();
        let out = String::from_utf8(w.into_inner()).unwrap();
        assert!(out.starts_with("From pop@example.org "));
        assert!(out.ends_with("\nSubject: hi\n\nbody\n\n"));
    }
}
