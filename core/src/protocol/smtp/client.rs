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

//! Blocking SMTP client: connect, EHLO/HELO, STARTTLS, AUTH, MAIL FROM, RCPT TO, DATA, QUIT.

use tracing::{debug, error, info, warn};

use super::dot_stuffer::DotStuffer;
use super::{Capabilities, SmtpReply, SmtpState};
use crate::config::{Config, StartTls};
use crate::error::{Error, Result};
use crate::net::cancel::CancellationContext;
use crate::net::tls::TlsOptions;
use crate::net::{self, ConnectOptions, Connection, Endpoint, LineBuffer};
use crate::sasl::{self, AuthChannel, AuthOptions, AuthReply, CramVariant, SaslMechanism};
use crate::store::{Credentials, MessageSource, Recipient};

/// Outcome of one mail transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Recipients the server accepted.
    pub accepted: Vec<String>,
    /// Refused recipients with the server's reply.
    pub rejected: Vec<(String, String)>,
    /// Lines and octets sent after DATA, terminator excluded.
    pub lines: usize,
    pub bytes: usize,
    /// Final reply to the terminating dot.
    pub reply: String,
}

fn open(conn: &mut Option<Connection>) -> Result<&mut Connection> {
    match conn.as_mut() {
        Some(c) if c.is_open() => Ok(c),
        _ => Err(Error::Closed),
    }
}

/// SMTP session. Connect, `hello`, `send` (repeatable), `quit`.
pub struct SmtpSession {
    conn: Option<Connection>,
    host: String,
    hostname: String,
    config: Config,
    state: SmtpState,
    line: LineBuffer,
    /// EHLO sent on the current transport (reset by STARTTLS).
    ehlo_sent: bool,
    capabilities: Capabilities,
}

impl SmtpSession {
    /// Connect and read the greeting. `smtps`/`submissions` endpoints get TLS first.
    ///
    /// SIGTERM is a hard interrupt for the whole session.
    pub fn connect(endpoint: &Endpoint, config: &Config, cancel: CancellationContext) -> Result<Self> {
        let options = ConnectOptions::from(config);
        let conn = net::connect(endpoint, None, &options, cancel.abort_on_sigterm())?;
        let mut session = Self::from_connection(conn, &endpoint.host, config);
        let scheme = endpoint.scheme.to_ascii_lowercase();
        if scheme == "smtps" || scheme == "submissions" {
            session.upgrade()?;
        }
        session.read_greeting()?;
        Ok(session)
    }

    /// Wrap an established connection; nothing has been read yet.
    pub fn from_connection(mut conn: Connection, host: &str, config: &Config) -> Self {
        conn.set_on_close(|description| debug!("{}: connection closed", description));
        Self {
            conn: Some(conn),
            host: host.to_string(),
            hostname: config.local_hostname(),
            config: config.clone(),
            state: SmtpState::Connected,
            line: LineBuffer::new(),
            ehlo_sent: false,
            capabilities: Capabilities::default(),
        }
    }

    pub fn state(&self) -> SmtpState {
        self.state
    }

    /// Capabilities from the latest EHLO on the current transport.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
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
        self.state = SmtpState::Disconnected;
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
        self.state = SmtpState::SecureUpgrade;
        let result = open(&mut self.conn).and_then(|conn| conn.start_tls(&self.host, &options));
        if let Err(e) = result {
            error!("TLS negotiation with {} failed: {}", self.host, e);
            self.disconnected();
            return Err(e);
        }
        self.ehlo_sent = false;
        self.capabilities = Capabilities::default();
        Ok(())
    }

    fn send_line(&mut self, line: &str, sensitive: bool) -> Result<()> {
        if sensitive {
            debug!("> ********");
        } else {
            debug!("> {}", line);
        }
        let result = open(&mut self.conn).and_then(|conn| conn.write_line(line.as_bytes()));
        if result.is_err() {
            self.disconnected();
        }
        result
    }

    /// Read a complete (possibly multi-line) reply.
    fn read_reply(&mut self, command: &str) -> Result<SmtpReply> {
        let mut lines = Vec::new();
        loop {
            let result = open(&mut self.conn).and_then(|conn| conn.read_line(&mut self.line));
            match result {
                Ok(n) if n > 0 && self.line.ends_with_newline() => {}
                Ok(_) => {
                    debug!("{}: connection closed by server", command);
                    self.disconnected();
                    return Err(Error::Closed);
                }
                Err(e) => {
                    if matches!(e, Error::Cancelled) {
                        warn!("{}: interrupted", command);
                    } else {
                        error!("{}: {}", command, e);
                    }
                    self.disconnected();
                    return Err(e);
                }
            }
            let text = self.line.text();
            debug!("< {}", text);
            let Some((code, more, rest)) = SmtpReply::parse_line(&text) else {
                error!("malformed reply to {}: {}", command, text);
                let e = Error::malformed(command, text.into_owned());
                // the rest of the reply is unknowable
                self.disconnected();
                return Err(e);
            };
            lines.push(rest.to_string());
            if !more {
                return Ok(SmtpReply { code, lines });
            }
        }
    }

    /// Read a reply and require status class `class`.
    fn expect(&mut self, command: &str, class: u16) -> Result<SmtpReply> {
        let reply = self.read_reply(command)?;
        if reply.class() == class {
            Ok(reply)
        } else {
            error!("{} failed: {}", command, reply);
            Err(Error::protocol(command, reply.to_string()))
        }
    }

    fn command(&mut self, line: &str, command: &str, class: u16) -> Result<SmtpReply> {
        self.send_line(line, false)?;
        self.expect(command, class)
    }

    fn read_greeting(&mut self) -> Result<()> {
        match self.expect("greeting", 2) {
            Ok(reply) => {
                info!("{}: {}", self.host, reply.lines.first().map(String::as_str).unwrap_or(""));
                self.state = SmtpState::Greeted;
                Ok(())
            }
            Err(e) => {
                self.abandon();
                Err(e)
            }
        }
    }

    fn ehlo(&mut self) -> Result<()> {
        let line = format!("EHLO {}", self.hostname);
        let reply = self.command(&line, "EHLO", 2)?;
        self.capabilities = Capabilities::from_ehlo(&reply);
        self.ehlo_sent = true;
        Ok(())
    }

    fn helo(&mut self) -> Result<()> {
        let line = format!("HELO {}", self.hostname);
        self.command(&line, "HELO", 2)?;
        Ok(())
    }

    /// EHLO then STARTTLS per policy, on a plaintext connection.
    fn negotiate_tls(&mut self) -> Result<()> {
        let policy = self.config.starttls;
        if self.is_tls() || policy == StartTls::Never {
            return Ok(());
        }
        match self.ehlo() {
            Ok(()) => {}
            Err(Error::Protocol { reply, .. }) if policy == StartTls::Opportunistic => {
                warn!("{} refused EHLO ({}); continuing without TLS", self.host, reply);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        if !self.capabilities.starttls && policy == StartTls::Opportunistic {
            debug!("{} does not offer STARTTLS", self.host);
            return Ok(());
        }
        match self.command("STARTTLS", "STARTTLS", 2) {
            Ok(_) => {
                self.upgrade()?;
                self.state = SmtpState::Greeted;
                info!("{}: STARTTLS negotiated", self.host);
                Ok(())
            }
            Err(Error::Protocol { reply, .. }) if policy == StartTls::Opportunistic => {
                warn!("{} refused STARTTLS ({}); continuing without TLS", self.host, reply);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// New top-level operation: interrupts from earlier ones no longer count.
    fn begin(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.cancellation().rearm();
        }
    }

    /// TLS per policy, then HELO (no credentials or no mechanism) or EHLO + AUTH.
    ///
    /// A failure here sends QUIT and closes the session.
    pub fn hello(&mut self, credentials: Option<&Credentials>) -> Result<()> {
        self.begin();
        let result = self.hello_inner(credentials);
        if result.is_err() {
            self.abandon();
        }
        result
    }

    fn hello_inner(&mut self, credentials: Option<&Credentials>) -> Result<()> {
        self.negotiate_tls()?;
        let auth = credentials.and_then(|c| c.mechanism.map(|m| (c, m)));
        match auth {
            None => {
                if !self.ehlo_sent {
                    self.helo()?;
                }
            }
            Some((credentials, mechanism)) => {
                if !self.ehlo_sent {
                    self.ehlo()?;
                }
                if !self.capabilities.supports(mechanism) {
                    warn!(
                        "{} does not advertise AUTH {} (offers: {}); trying anyway",
                        self.host,
                        mechanism,
                        self.capabilities.auth.join(" ")
                    );
                }
                self.authenticate(credentials, mechanism)?;
            }
        }
        self.state = SmtpState::Authenticated;
        Ok(())
    }

    fn authenticate(&mut self, credentials: &Credentials, mechanism: SaslMechanism) -> Result<()> {
        if mechanism.requires_tls() && !self.is_tls() {
            warn!("sending {} credentials to {} without TLS", mechanism, self.host);
        }
        self.state = SmtpState::Auth(mechanism);
        let host = self.host.clone();
        let provider = sasl::default_provider();
        let options = AuthOptions {
            host: &host,
            cram: if self.config.cram_md5_hmac {
                CramVariant::Hmac
            } else {
                CramVariant::Legacy
            },
            gss: provider.as_deref(),
        };
        match sasl::negotiate(self, credentials, mechanism, &options) {
            Ok(()) => {
                info!("authenticated to {} as {} with {}", self.host, credentials.user, mechanism);
                Ok(())
            }
            Err(e) => {
                error!("AUTH {} as {} failed: {}", mechanism, credentials.user, e);
                Err(e)
            }
        }
    }

    /// One mail transaction: MAIL FROM, RCPT TO per recipient, DATA with the source's lines.
    ///
    /// Refused recipients are reported and skipped; with none accepted the
    /// transaction is reset and `Error::Protocol` returned.
    pub fn send(
        &mut self,
        from: &str,
        recipients: &[Recipient],
        source: &mut dyn MessageSource,
    ) -> Result<SendReport> {
        self.begin();
        let mut report = SendReport::default();

        self.state = SmtpState::MailFrom;
        self.command(&format!("MAIL FROM:<{}>", from), "MAIL FROM", 2)?;

        self.state = SmtpState::RcptTo;
        let mut last_refusal = None;
        for recipient in recipients.iter().filter(|r| !r.skip) {
            let address = recipient.qualified(&self.hostname);
            match self.command(&format!("RCPT TO:<{}>", address), "RCPT TO", 2) {
                Ok(_) => report.accepted.push(address),
                Err(Error::Protocol { reply, .. }) => {
                    warn!("recipient {} refused: {}", address, reply);
                    last_refusal = Some(reply.clone());
                    report.rejected.push((address, reply));
                }
                Err(e) => return Err(e),
            }
        }
        if report.accepted.is_empty() {
            if let Err(e) = self.command("RSET", "RSET", 2) {
                debug!("RSET: {}", e);
            }
            self.state = SmtpState::Authenticated;
            let reply = last_refusal.unwrap_or_else(|| "no recipients".to_string());
            return Err(Error::protocol("RCPT TO", reply));
        }

        self.state = SmtpState::Data;
        self.command("DATA", "DATA", 3)?;
        if let Err(e) = self.write_data(source, &mut report) {
            // Server is mid-DATA; the transaction cannot be resumed.
            self.disconnected();
            return Err(e);
        }

        self.state = SmtpState::DotTerm;
        let reply = self.expect("DATA", 2)?;
        report.reply = reply.to_string();
        info!(
            "{}: message accepted for {} recipients ({} octets)",
            self.host,
            report.accepted.len(),
            report.bytes
        );
        self.state = SmtpState::Authenticated;
        Ok(report)
    }

    fn write_data(&mut self, source: &mut dyn MessageSource, report: &mut SendReport) -> Result<()> {
        let conn = open(&mut self.conn)?;
        let mut stuffer = DotStuffer::new();
        let mut line = Vec::with_capacity(1024);
        let mut out = Vec::with_capacity(1024);
        loop {
            line.clear();
            if source.next_line(&mut line)? == 0 {
                break;
            }
            conn.cancellation().check()?;
            out.clear();
            if stuffer.encode_line(&line, &mut out) {
                conn.write_buffered(&out)?;
                report.lines += 1;
                report.bytes += out.len();
            }
        }
        out.clear();
        stuffer.end_message(&mut out);
        conn.write_buffered(&out)?;
        conn.flush()?;
        debug!("> [{} lines, {} octets]", report.lines, report.bytes);
        Ok(())
    }

    /// RSET the current transaction.
    pub fn rset(&mut self) -> Result<()> {
        self.command("RSET", "RSET", 2)?;
        self.state = SmtpState::Authenticated;
        Ok(())
    }

    pub fn noop(&mut self) -> Result<()> {
        self.command("NOOP", "NOOP", 2).map(|_| ())
    }

    /// QUIT and close; EOF instead of the final reply is fine.
    /// `Error::AlreadyClosed` when the session is not connected.
    pub fn quit(&mut self) -> Result<()> {
        if !self.is_connected() {
            self.disconnected();
            return Err(Error::AlreadyClosed);
        }
        self.state = SmtpState::Closing;
        let result = self.send_line("QUIT", false).and_then(|_| self.read_reply("QUIT"));
        self.disconnected();
        match result {
            Ok(reply) if reply.class() != 2 => warn!("QUIT: {}", reply),
            Ok(_) | Err(Error::Closed) => {}
            Err(e) => debug!("QUIT: {}", e),
        }
        Ok(())
    }
}

impl AuthChannel for SmtpSession {
    fn send(&mut self, line: &str, sensitive: bool) -> Result<AuthReply> {
        self.send_line(line, sensitive)?;
        let reply = self.read_reply("AUTH")?;
        Ok(match reply.class() {
            2 => AuthReply::Done,
            3 => AuthReply::Continue(reply.message().to_string()),
            _ => AuthReply::Failed(reply.to_string()),
        })
    }
}

/// Connect, greet, authenticate, send one message, QUIT.
///
/// QUIT is sent after a refused transaction as well.
pub fn send_message(
    endpoint: &Endpoint,
    config: &Config,
    credentials: Option<&Credentials>,
    from: &str,
    recipients: &[Recipient],
    source: &mut dyn MessageSource,
    cancel: CancellationContext,
) -> Result<SendReport> {
    let mut session = SmtpSession::connect(endpoint, config, cancel)?;
    session.hello(credentials)?;
    let result = session.send(from, recipients, source);
    match session.quit() {
        Ok(()) | Err(Error::AlreadyClosed) => {}
        Err(e) => debug!("QUIT: {}", e),
    }
    result
}
