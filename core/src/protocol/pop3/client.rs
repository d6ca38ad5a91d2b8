/*
 * client.rs
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

//! POP3 session over a blocking `Connection`.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::keepalive::{Keepalive, KeepaliveOutcome};
use super::message::MessageCopy;
use super::{Pop3Reply, Pop3State};
use crate::config::{Config, StartTls};
use crate::error::{Error, Result};
use crate::net::cancel::CancellationContext;
use crate::net::tls::TlsOptions;
use crate::net::{self, ConnectOptions, Connection, Endpoint, LineBuffer};
use crate::sasl::md5_hex;
use crate::store::{Credentials, FetchPolicy, MailboxSink};

const APOP_HINT: &str = "try disabling APOP";

/// STAT response: message count and total size in octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatResponse {
    pub count: u32,
    pub total_size: u64,
}

/// UIDL list entry: message number and unique-id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidlEntry {
    pub msg_no: u32,
    pub uidl: String,
}

/// LIST entry: message number and size in octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListEntry {
    pub msg_no: u32,
    pub size: u64,
}

/// One message handed to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchedInfo {
    pub msg_no: u32,
    /// Octets delivered, after LF normalization and quoting.
    pub bytes: usize,
    pub lines: usize,
    /// TOP was used (RETR fallback clears this).
    pub headers_only: bool,
}

/// Totals for a `fetch_all` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub retrieved: usize,
    pub deleted: usize,
    pub kept: usize,
}

/// APOP challenge from a greeting: first `<` through the next `>`, if it contains `@`.
pub fn apop_token(greeting: &str) -> Option<&str> {
    let start = greeting.find('<')?;
    let len = greeting[start..].find('>')?;
    let token = &greeting[start..=start + len];
    token.contains('@').then_some(token)
}

fn open(conn: &mut Option<Connection>) -> Result<&mut Connection> {
    match conn.as_mut() {
        Some(c) if c.is_open() => Ok(c),
        _ => Err(Error::Closed),
    }
}

/// Protocol refusals during login become authentication failures.
fn auth_error(e: Error, hint: Option<&'static str>) -> Error {
    match e {
        Error::Protocol { reply, .. } => Error::Auth { message: reply, hint },
        other => other,
    }
}

/// POP3 session. Connect, `login`, then STAT/LIST/UIDL/fetch, then `quit`.
pub struct Pop3Session {
    conn: Option<Connection>,
    host: String,
    config: Config,
    state: Pop3State,
    line: LineBuffer,
    greeting: String,
    keepalive: Keepalive,
    marked: Vec<u32>,
}

impl Pop3Session {
    /// Connect, read the greeting and apply the STLS policy.
    ///
    /// `pop3s` endpoints get TLS before the greeting. SIGTERM aborts the session.
    pub fn connect(endpoint: &Endpoint, config: &Config, cancel: CancellationContext) -> Result<Self> {
        let options = ConnectOptions::from(config);
        let conn = net::connect(endpoint, None, &options, cancel.abort_on_sigterm())?;
        let mut session = Self::from_connection(conn, &endpoint.host, config);
        if endpoint.scheme.eq_ignore_ascii_case("pop3s") {
            session.upgrade()?;
        }
        session.read_greeting()?;
        session.negotiate_tls()?;
        Ok(session)
    }

    /// Wrap an established connection; nothing has been read yet.
    pub fn from_connection(mut conn: Connection, host: &str, config: &Config) -> Self {
        conn.set_on_close(|description| debug!("{}: connection closed", description));
        Self {
            conn: Some(conn),
            host: host.to_string(),
            config: config.clone(),
            state: Pop3State::Disconnected,
            line: LineBuffer::new(),
            greeting: String::new(),
            keepalive: Keepalive::new(config.keepalive_interval()),
            marked: Vec::new(),
        }
    }

    pub fn state(&self) -> Pop3State {
        self.state
    }

    /// Greeting text after `+OK`.
    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    pub fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_open)
    }

    pub fn is_tls(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_tls)
    }

    fn disconnected(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
        self.state = Pop3State::Disconnected;
    }

    /// Best-effort QUIT after a terminal failure.
    fn abandon(&mut self) {
        if let Err(e) = self.quit() {
            debug!("QUIT after failure: {}", e);
        }
    }

    fn upgrade(&mut self) -> Result<()> {
        let options = TlsOptions {
            accept_invalid_certs: self.config.accept_invalid_certs,
        };
        self.state = Pop3State::SecureUpgrade;
        let result = open(&mut self.conn).and_then(|conn| conn.start_tls(&self.host, &options));
        if let Err(e) = result {
            error!("TLS negotiation with {} failed: {}", self.host, e);
            self.disconnected();
            return Err(e);
        }
        Ok(())
    }

    fn send(&mut self, line: &str, shown: &str) -> Result<()> {
        debug!("> {}", shown);
        let result = open(&mut self.conn).and_then(|conn| conn.write_line(line.as_bytes()));
        if result.is_err() {
            self.disconnected();
        }
        result
    }

    /// Read one raw line; EOF or an unterminated line ends the session.
    fn read_raw(&mut self, command: &str) -> Result<()> {
        let result = open(&mut self.conn).and_then(|conn| conn.read_line(&mut self.line));
        match result {
            Ok(n) if n > 0 && self.line.ends_with_newline() => Ok(()),
            Ok(_) => {
                error!("{}: connection closed by server", command);
                self.disconnected();
                Err(Error::Closed)
            }
            Err(e) => {
                if matches!(e, Error::Cancelled) {
                    warn!("{}: interrupted", command);
                } else {
                    error!("{}: {}", command, e);
                }
                self.disconnected();
                Err(e)
            }
        }
    }

    /// Status line: text after `+OK`, or `Error::Protocol` for anything not starting with `+`.
    fn read_reply(&mut self, command: &str) -> Result<String> {
        self.read_raw(command)?;
        let line = self.line.text().into_owned();
        debug!("< {}", line);
        let reply = Pop3Reply::parse(&line);
        if reply.ok {
            Ok(reply.text)
        } else {
            error!("{} failed: {}", command, line);
            Err(Error::protocol(command, line))
        }
    }

    /// Lines of a multi-line response up to (not including) the lone `.`.
    fn read_body(&mut self, command: &str, mut on_line: impl FnMut(&[u8])) -> Result<()> {
        loop {
            self.read_raw(command)?;
            if self.line.trimmed() == b"." {
                return Ok(());
            }
            on_line(self.line.as_bytes());
        }
    }

    /// Send a command and read its status line; the keepalive sees it as busy meanwhile.
    fn exchange(&mut self, line: &str, shown: &str, command: &str) -> Result<String> {
        self.keepalive.enter();
        let result = self.send(line, shown).and_then(|_| self.read_reply(command));
        self.keepalive.leave();
        result
    }

    fn read_greeting(&mut self) -> Result<()> {
        self.keepalive.enter();
        let result = self.read_reply("greeting");
        self.keepalive.leave();
        match result {
            Ok(text) => {
                info!("{}: {}", self.host, text);
                self.greeting = text;
                self.state = Pop3State::Greeted;
                Ok(())
            }
            Err(e) => {
                self.disconnected();
                Err(e)
            }
        }
    }

    fn negotiate_tls(&mut self) -> Result<()> {
        if open(&mut self.conn)?.is_tls() || self.config.starttls == StartTls::Never {
            return Ok(());
        }
        match self.exchange("STLS", "STLS", "STLS") {
            Ok(_) => {
                self.upgrade()?;
                self.state = Pop3State::Greeted;
                info!("{}: STLS negotiated", self.host);
                Ok(())
            }
            Err(Error::Protocol { reply, .. }) if self.config.starttls == StartTls::Opportunistic => {
                warn!("{} refused STLS ({}); continuing without TLS", self.host, reply);
                Ok(())
            }
            Err(e) => {
                self.abandon();
                Err(e)
            }
        }
    }

    /// New top-level operation: interrupts from earlier ones no longer count.
    fn begin(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.cancellation().rearm();
        }
    }

    /// APOP when the greeting carries a challenge and policy allows it, else USER/PASS.
    pub fn login(&mut self, credentials: &Credentials) -> Result<()> {
        self.begin();
        let token = if self.config.disable_apop {
            None
        } else {
            apop_token(&self.greeting).map(str::to_string)
        };
        let result = match token {
            Some(token) => {
                let digest = md5_hex(token.as_bytes(), credentials.password.as_bytes());
                let line = format!("APOP {} {}", credentials.user, digest);
                self.exchange(&line, &line, "APOP")
                    .map_err(|e| auth_error(e, Some(APOP_HINT)))
            }
            None => self.user_pass(credentials),
        };
        match result {
            Ok(_) => {
                self.state = Pop3State::Authenticated;
                info!("logged in to {} as {}", self.host, credentials.user);
                Ok(())
            }
            Err(e) => {
                error!("login to {} as {} failed: {}", self.host, credentials.user, e);
                if matches!(e, Error::Auth { .. }) {
                    self.abandon();
                }
                Err(e)
            }
        }
    }

    fn user_pass(&mut self, credentials: &Credentials) -> Result<String> {
        let user = format!("USER {}", credentials.user);
        self.exchange(&user, &user, "USER").map_err(|e| auth_error(e, None))?;
        let pass = format!("PASS {}", credentials.password);
        self.exchange(&pass, "PASS ********", "PASS")
            .map_err(|e| auth_error(e, None))
    }

    /// STAT -> count and total size.
    pub fn stat(&mut self) -> Result<StatResponse> {
        self.begin();
        let text = self.exchange("STAT", "STAT", "STAT")?;
        let mut parts = text.split_whitespace();
        let count = parts.next().and_then(|s| s.parse().ok());
        let total_size = parts.next().and_then(|s| s.parse().ok());
        match (count, total_size) {
            (Some(count), Some(total_size)) => {
                self.state = Pop3State::Ready;
                Ok(StatResponse { count, total_size })
            }
            _ => {
                error!("malformed STAT reply: {}", text);
                Err(Error::malformed("STAT", text))
            }
        }
    }

    /// LIST n -> size of message n.
    pub fn list(&mut self, msg_no: u32) -> Result<u64> {
        let cmd = format!("LIST {}", msg_no);
        let text = self.exchange(&cmd, &cmd, "LIST")?;
        text.split_whitespace()
            .last()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::malformed("LIST", text.clone()))
    }

    /// LIST -> every message's size.
    pub fn list_all(&mut self) -> Result<Vec<ListEntry>> {
        self.state = Pop3State::Listing;
        self.keepalive.enter();
        let mut entries = Vec::new();
        let result = self
            .send("LIST", "LIST")
            .and_then(|_| self.read_reply("LIST"))
            .and_then(|_| {
                self.read_body("LIST", |line| {
                    let text = String::from_utf8_lossy(line);
                    let mut sp = text.split_whitespace();
                    let msg_no = sp.next().and_then(|s| s.parse().ok());
                    let size = sp.next().and_then(|s| s.parse().ok());
                    if let (Some(msg_no), Some(size)) = (msg_no, size) {
                        entries.push(ListEntry { msg_no, size });
                    }
                })
            });
        self.keepalive.leave();
        self.state = Pop3State::Ready;
        result.map(|_| entries)
    }

    /// UIDL [msg] -> (msg_no, unique-id) pairs; one entry when `msg` is given.
    pub fn uidl(&mut self, msg: Option<u32>) -> Result<Vec<UidlEntry>> {
        fn entry(text: &str) -> Option<UidlEntry> {
            let mut sp = text.split_whitespace();
            let msg_no = sp.next()?.parse().ok()?;
            let uidl = sp.next()?.to_string();
            Some(UidlEntry { msg_no, uidl })
        }

        if let Some(n) = msg {
            let cmd = format!("UIDL {}", n);
            let text = self.exchange(&cmd, &cmd, "UIDL")?;
            return entry(&text)
                .map(|e| vec![e])
                .ok_or_else(|| Error::malformed("UIDL", text));
        }
        self.state = Pop3State::Listing;
        self.keepalive.enter();
        let mut entries = Vec::new();
        let result = self
            .send("UIDL", "UIDL")
            .and_then(|_| self.read_reply("UIDL"))
            .and_then(|_| {
                self.read_body("UIDL", |line| {
                    if let Some(e) = entry(&String::from_utf8_lossy(line)) {
                        entries.push(e);
                    }
                })
            });
        self.keepalive.leave();
        self.state = Pop3State::Ready;
        result.map(|_| entries)
    }

    /// Fetch message `msg_no` into `sink`. Headers only uses `TOP n 0`, falling back to RETR.
    pub fn fetch(&mut self, msg_no: u32, headers_only: bool, sink: &mut dyn MailboxSink) -> Result<FetchedInfo> {
        self.state = Pop3State::Fetching;
        self.keepalive.enter();
        let result = self.retrieve(msg_no, headers_only);
        self.keepalive.leave();
        let (message, info) = result?;
        sink.deliver(msg_no, &message)?;
        self.state = Pop3State::Ready;
        debug!(msg_no, bytes = info.bytes, lines = info.lines, "message delivered");
        Ok(info)
    }

    fn retrieve(&mut self, msg_no: u32, headers_only: bool) -> Result<(Vec<u8>, FetchedInfo)> {
        let mut headers_only = headers_only;
        if headers_only {
            let top = format!("TOP {} 0", msg_no);
            match self.send(&top, &top).and_then(|_| self.read_reply("TOP")) {
                Ok(_) => {}
                Err(Error::Protocol { reply, .. }) => {
                    warn!("TOP refused ({}); retrieving whole message {}", reply, msg_no);
                    headers_only = false;
                }
                Err(e) => return Err(e),
            }
        }
        if !headers_only {
            let retr = format!("RETR {}", msg_no);
            self.send(&retr, &retr)?;
            self.read_reply("RETR")?;
        }
        let mut copy = MessageCopy::new();
        self.read_body("RETR", |line| {
            copy.push(line);
        })?;
        let lines = copy.lines();
        let message = copy.finish();
        let info = FetchedInfo {
            msg_no,
            bytes: message.len(),
            lines,
            headers_only,
        };
        Ok((message, info))
    }

    /// Queue `msg_no` for DELE at `delete_marked`.
    pub fn mark_deleted(&mut self, msg_no: u32) {
        if !self.marked.contains(&msg_no) {
            self.marked.push(msg_no);
        }
    }

    /// DELE every marked message. Read-only sessions send nothing. Returns the count deleted.
    pub fn delete_marked(&mut self) -> Result<usize> {
        self.dele_marked().map(|deleted| deleted.len())
    }

    /// DELE the marked messages, returning their numbers.
    fn dele_marked(&mut self) -> Result<Vec<u32>> {
        let marked = std::mem::take(&mut self.marked);
        if self.config.read_only {
            if !marked.is_empty() {
                info!("read-only: keeping {} messages on {}", marked.len(), self.host);
            }
            return Ok(Vec::new());
        }
        self.state = Pop3State::Deleting;
        for (i, msg_no) in marked.iter().enumerate() {
            let cmd = format!("DELE {}", msg_no);
            if let Err(e) = self.exchange(&cmd, &cmd, "DELE") {
                self.marked.extend_from_slice(&marked[i..]);
                return Err(e);
            }
        }
        self.state = Pop3State::Ready;
        Ok(marked)
    }

    /// STAT, fetch every message into `sink`, mark per `policy`, DELE the marked ones.
    /// Messages marked before the run are deleted too but only retrieved ones are tallied.
    pub fn fetch_all(&mut self, policy: &FetchPolicy, sink: &mut dyn MailboxSink) -> Result<FetchSummary> {
        self.begin();
        let stat = self.stat()?;
        info!("{}: {} messages ({} octets)", self.host, stat.count, stat.total_size);
        let mut summary = FetchSummary::default();
        for msg_no in 1..=stat.count {
            let check = open(&mut self.conn).and_then(|conn| conn.cancellation().check());
            if let Err(e) = check {
                warn!("fetch interrupted after {} messages", summary.retrieved);
                self.disconnected();
                return Err(e);
            }
            match self.list(msg_no) {
                Ok(size) => debug!(msg_no, size, "fetching"),
                Err(Error::Protocol { reply, .. }) => warn!("LIST {}: {}", msg_no, reply),
                Err(e) => return Err(e),
            }
            self.fetch(msg_no, policy.headers_only, sink)?;
            summary.retrieved += 1;
            if policy.deletes() {
                self.mark_deleted(msg_no);
            }
        }
        let deleted = self.dele_marked()?;
        summary.deleted = deleted.iter().filter(|n| (1..=stat.count).contains(*n)).count();
        summary.kept = summary.retrieved.saturating_sub(summary.deleted);
        Ok(summary)
    }

    pub fn noop(&mut self) -> Result<()> {
        self.exchange("NOOP", "NOOP", "NOOP").map(|_| ())
    }

    /// RSET: server unmarks deletions; local marks are dropped too.
    pub fn rset(&mut self) -> Result<()> {
        self.marked.clear();
        self.exchange("RSET", "RSET", "RSET").map(|_| ())
    }

    /// NOOP if the keepalive interval has passed since the last exchange.
    ///
    /// The session never ticks on its own: the host calls this from its own
    /// timer between operations. Holding `&mut self` means no command is in
    /// flight, so the result is either `NotDue` or `Sent`.
    pub fn keepalive(&mut self) -> Result<KeepaliveOutcome> {
        if self.keepalive.tick(Instant::now()) != KeepaliveOutcome::Sent {
            return Ok(KeepaliveOutcome::NotDue);
        }
        self.noop()?;
        Ok(KeepaliveOutcome::Sent)
    }

    /// QUIT and close. `Error::AlreadyClosed` when the session is not connected.
    pub fn quit(&mut self) -> Result<()> {
        if !self.is_connected() {
            self.disconnected();
            return Err(Error::AlreadyClosed);
        }
        self.state = Pop3State::Closing;
        let result = self.exchange("QUIT", "QUIT", "QUIT");
        self.disconnected();
        match result {
            Ok(_) | Err(Error::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apop_token_spans_first_angle_pair() {
        assert_eq!(
            apop_token("POP3 server ready <1896.697170952@dbc.mtview.ca.us>"),
            Some("<1896.697170952@dbc.mtview.ca.us>")
        );
        assert_eq!(apop_token("ready <a@b> <c@d>"), Some("<a@b>"));
    }

    #[test]
    fn apop_token_needs_at_sign_and_close() {
        assert_eq!(apop_token("ready <1896.697170952>"), None);
        assert_eq!(apop_token("ready <x@y"), None);
        assert_eq!(apop_token("ready"), None);
        assert_eq!(apop_token("> ready <x@y>"), Some("<x@y>"));
    }

    #[test]
    fn refusals_during_login_are_auth_errors() {
        let e = auth_error(Error::protocol("APOP", "-ERR denied"), Some(APOP_HINT));
        assert_eq!(e.to_string(), "authentication failed: -ERR denied (try disabling APOP)");
        assert!(matches!(auth_error(Error::Closed, None), Error::Closed));
    }
}
