/*
 * socks.rs
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

//! SOCKS5 CONNECT (RFC 1928), "no authentication" method only.
//! The destination is always sent as a domain name so the proxy resolves it.

use std::fmt;
use std::io::{Read, Write};

use tracing::debug;

use crate::error::{Error, Result};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Failure code in a CONNECT reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksReply {
    GeneralFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unknown(u8),
}

impl SocksReply {
    /// `None` for 0 (succeeded).
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => return None,
            0x01 => SocksReply::GeneralFailure,
            0x02 => SocksReply::NotAllowed,
            0x03 => SocksReply::NetworkUnreachable,
            0x04 => SocksReply::HostUnreachable,
            0x05 => SocksReply::ConnectionRefused,
            0x06 => SocksReply::TtlExpired,
            0x07 => SocksReply::CommandNotSupported,
            0x08 => SocksReply::AddressTypeNotSupported,
            other => SocksReply::Unknown(other),
        })
    }

    pub fn message(&self) -> &'static str {
        match self {
            SocksReply::GeneralFailure => "general SOCKS server failure",
            SocksReply::NotAllowed => "connection not allowed by ruleset",
            SocksReply::NetworkUnreachable => "network unreachable",
            SocksReply::HostUnreachable => "host unreachable",
            SocksReply::ConnectionRefused => "connection refused",
            SocksReply::TtlExpired => "TTL expired",
            SocksReply::CommandNotSupported => "command not supported",
            SocksReply::AddressTypeNotSupported => "address type not supported",
            SocksReply::Unknown(_) => "unknown error",
        }
    }
}

impl fmt::Display for SocksReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksReply::Unknown(code) => write!(f, "{} (code {})", self.message(), code),
            _ => f.write_str(self.message()),
        }
    }
}

/// Negotiate no-auth and CONNECT to `host:port` over a stream already connected to the proxy.
pub fn connect_through<S: Read + Write>(stream: &mut S, host: &str, port: u16) -> Result<()> {
    let host_len = u8::try_from(host.len())
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| Error::Socks(format!("destination name length {} not supported", host.len())))?;

    stream.write_all(&[VERSION, 1, METHOD_NO_AUTH])?;
    stream.flush()?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice)?;
    if choice[0] != VERSION {
        return Err(Error::Socks(format!("unexpected protocol version {}", choice[0])));
    }
    if choice[1] != METHOD_NO_AUTH {
        return Err(Error::Socks("proxy requires authentication".to_string()));
    }

    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host_len]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request)?;
    stream.flush()?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head)?;
    if head[0] != VERSION {
        return Err(Error::Socks(format!("unexpected protocol version {}", head[0])));
    }
    if let Some(reply) = SocksReply::from_code(head[1]) {
        return Err(Error::SocksReply(reply));
    }
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            len[0] as usize
        }
        other => return Err(Error::Socks(format!("unknown address type {other} in reply"))),
    };
    // bound address + port, unused
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest)?;
    debug!("SOCKS5 tunnel to {}:{} established", host, port);
    Ok(())
}
