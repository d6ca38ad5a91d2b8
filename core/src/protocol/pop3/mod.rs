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

//! POP3 client (RFC 1939): greeting, STLS, APOP or USER/PASS, STAT, LIST, UIDL,
//! TOP/RETR into a mailbox sink, DELE, NOOP keepalive, QUIT.

mod client;
mod keepalive;
mod message;

pub use client::{apop_token, FetchSummary, FetchedInfo, ListEntry, Pop3Session, StatResponse, UidlEntry};
pub use keepalive::{Keepalive, KeepaliveOutcome};
pub use message::MessageCopy;

/// Where a POP3 session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop3State {
    Disconnected,
    /// Greeting read.
    Greeted,
    /// STLS accepted, handshake in progress.
    SecureUpgrade,
    Authenticated,
    /// STAT answered; message numbers are valid.
    Ready,
    Listing,
    Fetching,
    Deleting,
    Closing,
}

/// One status line: `+OK text` or `-ERR text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pop3Reply {
    pub ok: bool,
    /// Text after the status indicator.
    pub text: String,
}

impl Pop3Reply {
    /// Any line starting with `+` counts as success; some servers send a bare `+`.
    pub fn parse(line: &str) -> Self {
        let ok = line.starts_with('+');
        let indicator = if ok { "+OK" } else { "-ERR" };
        let text = match line.get(..indicator.len()) {
            Some(head) if head.eq_ignore_ascii_case(indicator) => &line[indicator.len()..],
            _ => line.get(1..).unwrap_or(""),
        };
        Self {
            ok,
            text: text.trim().to_string(),
        }
    }
}

/// Default POP3 port.
pub const POP3_PORT: u16 = 110;
/// Default POP3-over-TLS port.
pub const POP3S_PORT: u16 = 995;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines() {
        assert_eq!(
            Pop3Reply::parse("+OK 2 320"),
            Pop3Reply {
                ok: true,
                text: "2 320".into()
            }
        );
        assert_eq!(Pop3Reply::parse("+ go ahead").text, "go ahead");
        let err = Pop3Reply::parse("-ERR no such message");
        assert!(!err.ok);
        assert_eq!(err.text, "no such message");
        assert!(!Pop3Reply::parse("garbage").ok);
    }
}
