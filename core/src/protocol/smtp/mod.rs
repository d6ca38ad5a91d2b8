/*
 * mod.rs
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

//! SMTP client (RFC 5321): greeting, EHLO/HELO, STARTTLS, AUTH, one mail
//! transaction with dot-stuffed DATA, QUIT.

mod client;
pub mod dot_stuffer;

use std::fmt;

pub use client::{send_message, SendReport, SmtpSession};

use crate::sasl::SaslMechanism;

/// Default SMTP port.
pub const SMTP_PORT: u16 = 25;
/// Default submission port.
pub const SUBMISSION_PORT: u16 = 587;
/// Default SMTP-over-TLS port.
pub const SMTPS_PORT: u16 = 465;

/// Where an SMTP session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    Disconnected,
    Connected,
    Greeted,
    SecureUpgrade,
    Auth(SaslMechanism),
    /// Authenticated, or greeted without authentication; ready for MAIL.
    Authenticated,
    MailFrom,
    RcptTo,
    Data,
    DotTerm,
    Closing,
}

/// Parsed SMTP response (code + lines).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    /// Text of each line after the code and separator.
    pub lines: Vec<String>,
}

impl SmtpReply {
    /// Leading digit: 2 success, 3 continue, 4 transient, 5 permanent.
    pub fn class(&self) -> u16 {
        self.code / 100
    }

    pub fn message(&self) -> &str {
        self.lines.last().map(|s| s.as_str()).unwrap_or("")
    }

    /// Parse one reply line into (code, is_continuation, text).
    pub fn parse_line(line: &str) -> Option<(u16, bool, &str)> {
        let digits = line.get(..3)?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let code = digits.parse().ok()?;
        match line.as_bytes().get(3) {
            None => Some((code, false, "")),
            Some(b'-') => Some((code, true, line[4..].trim())),
            Some(b' ') => Some((code, false, line[4..].trim())),
            Some(_) => None,
        }
    }
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.lines.len();
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i + 1 < n { '-' } else { ' ' };
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}{}{}", self.code, sep, line)?;
        }
        if n == 0 {
            write!(f, "{}", self.code)?;
        }
        Ok(())
    }
}

/// EHLO keywords this client cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub starttls: bool,
    /// Mechanism names from `AUTH` (or the old `AUTH=`) lines, uppercased.
    pub auth: Vec<String>,
    pub pipelining: bool,
    pub size: Option<u64>,
}

impl Capabilities {
    /// From the lines of a 250 EHLO reply (the first line is the server's name).
    pub fn from_ehlo(reply: &SmtpReply) -> Self {
        let mut caps = Capabilities::default();
        for line in reply.lines.iter().skip(1) {
            let upper = line.to_ascii_uppercase();
            let mut words = upper.split(|c: char| c == ' ' || c == '=').filter(|w| !w.is_empty());
            match words.next() {
                Some("STARTTLS") => caps.starttls = true,
                Some("PIPELINING") => caps.pipelining = true,
                Some("SIZE") => caps.size = words.next().and_then(|s| s.parse().ok()),
                Some("AUTH") => {
                    for word in words {
                        if !caps.auth.iter().any(|m| m == word) {
                            caps.auth.push(word.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
        caps
    }

    pub fn supports(&self, mechanism: SaslMechanism) -> bool {
        self.auth.iter().any(|m| m == mechanism.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reply_lines() {
        assert_eq!(SmtpReply::parse_line("250-STARTTLS"), Some((250, true, "STARTTLS")));
        assert_eq!(SmtpReply::parse_line("354 go ahead"), Some((354, false, "go ahead")));
        assert_eq!(SmtpReply::parse_line("221"), Some((221, false, "")));
        assert_eq!(SmtpReply::parse_line("hello"), None);
        assert_eq!(SmtpReply::parse_line("25"), None);
        assert_eq!(SmtpReply::parse_line("250x"), None);
    }

    #[test]
    fn ehlo_capabilities() {
        let reply = SmtpReply {
            code: 250,
            lines: vec![
                "mx.example.org greets you".into(),
                "PIPELINING".into(),
                "SIZE 35882577".into(),
                "auth plain login".into(),
                "AUTH=LOGIN CRAM-MD5".into(),
                "STARTTLS".into(),
            ],
        };
        let caps = Capabilities::from_ehlo(&reply);
        assert!(caps.starttls && caps.pipelining);
        assert_eq!(caps.size, Some(35882577));
        assert_eq!(caps.auth, vec!["PLAIN", "LOGIN", "CRAM-MD5"]);
        assert!(caps.supports(SaslMechanism::CramMd5));
        assert!(!caps.supports(SaslMechanism::Gssapi));
    }

    #[test]
    fn multiline_reply_displays_with_separators() {
        let reply = SmtpReply {
            code: 550,
            lines: vec!["no such user".into(), "try again".into()],
        };
        assert_eq!(reply.to_string(), "550-no such user\n550 try again");
        assert_eq!(reply.message(), "try again");
        assert_eq!(reply.class(), 5);
    }
}
