/*
 * mechanism.rs
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

//! SASL mechanism names and metadata.

use serde::Deserialize;

/// Supported SASL mechanisms (client-side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum SaslMechanism {
    /// PLAIN (RFC 4616) – sends the password; wants TLS.
    Plain,
    /// Legacy LOGIN – sends the password; wants TLS.
    Login,
    /// CRAM-MD5 – challenge-response.
    CramMd5,
    /// GSSAPI (RFC 4752) – Kerberos ticket, no password on the wire.
    Gssapi,
}

impl SaslMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::Login => "LOGIN",
            SaslMechanism::CramMd5 => "CRAM-MD5",
            SaslMechanism::Gssapi => "GSSAPI",
        }
    }

    pub fn requires_tls(&self) -> bool {
        matches!(self, SaslMechanism::Plain | SaslMechanism::Login)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_uppercase().as_str() {
            "PLAIN" => Some(SaslMechanism::Plain),
            "LOGIN" => Some(SaslMechanism::Login),
            "CRAM-MD5" => Some(SaslMechanism::CramMd5),
            "GSSAPI" => Some(SaslMechanism::Gssapi),
            _ => None,
        }
    }
}

impl TryFrom<String> for SaslMechanism {
    type Error = String;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::from_name(&name).ok_or_else(|| format!("unknown SASL mechanism {name}"))
    }
}

impl std::fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for m in [
            SaslMechanism::Plain,
            SaslMechanism::Login,
            SaslMechanism::CramMd5,
            SaslMechanism::Gssapi,
        ] {
            assert_eq!(SaslMechanism::from_name(m.name()), Some(m));
        }
        assert_eq!(SaslMechanism::from_name(" cram-md5 "), Some(SaslMechanism::CramMd5));
        assert_eq!(SaslMechanism::from_name("XOAUTH2"), None);
    }
}
