/*
 * error.rs
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

//! Transport, protocol and authentication errors.

use std::io;

use thiserror::Error;

use crate::net::socks::SocksReply;

/// Errors from connecting, the line transport, or a POP3/SMTP exchange.
#[derive(Error, Debug)]
pub enum Error {
    /// Host or service could not be resolved.
    #[error("could not resolve {host}: {message}")]
    Resolve { host: String, message: String },

    /// Every resolved address refused or failed the connect.
    #[error("could not connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Non-blocking connect did not complete in time.
    #[error("connection to {0} timed out")]
    Timeout(String),

    /// SOCKS5 negotiation or a non-zero reply code from the proxy.
    #[error("SOCKS5 proxy: {0}")]
    Socks(String),

    /// SOCKS5 proxy answered CONNECT with a failure code.
    #[error("SOCKS5 proxy: {0}")]
    SocksReply(SocksReply),

    /// TLS configuration or handshake failure. The connection has been closed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Read or write failure on the socket. The connection has been closed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection is closed or in the failed state; no I/O was attempted.
    #[error("connection closed")]
    Closed,

    /// QUIT (or close) requested on a session that is already disconnected.
    #[error("connection already closed")]
    AlreadyClosed,

    /// The server answered with the wrong status class.
    #[error("{command} failed: {reply}")]
    Protocol { command: String, reply: String },

    /// A reply could not be parsed.
    #[error("malformed reply to {command}: {reply}")]
    Malformed { command: String, reply: String },

    /// Authentication was refused or the mechanism failed locally.
    #[error("authentication failed: {message}{}", hint.map(|h| format!(" ({h})")).unwrap_or_default())]
    Auth {
        message: String,
        hint: Option<&'static str>,
    },

    /// A hard interrupt aborted the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn protocol(command: impl Into<String>, reply: impl Into<String>) -> Self {
        Self::Protocol {
            command: command.into(),
            reply: reply.into(),
        }
    }

    pub fn malformed(command: impl Into<String>, reply: impl Into<String>) -> Self {
        Self::Malformed {
            command: command.into(),
            reply: reply.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
            hint: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
