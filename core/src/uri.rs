/*
 * uri.rs
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

//! Session URLs used in diagnostics (pop3://user@host:port, smtps://host:port)
//! and the SOCKS proxy URL parser (socks5://host[:port]).

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::error::{Error, Result};

/// Userinfo in authority: encode @ and other reserved so one @ separates userinfo from host.
const USERINFO: &AsciiSet = &CONTROLS.add(b'@').add(b':').add(b'%').add(b'/').add(b'?').add(b'#').add(b'[').add(b']');

/// Default SOCKS port.
pub const SOCKS_PORT: u16 = 1080;

/// Session URL: scheme://user@host:port, or scheme://host:port without a user.
pub fn session_uri(scheme: &str, user: Option<&str>, host: &str, port: u16) -> String {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    match user.filter(|u| !u.is_empty()) {
        Some(user) => {
            let userinfo = utf8_percent_encode(user, USERINFO).to_string();
            format!("{}://{}@{}:{}", scheme, userinfo, host, port)
        }
        None => format!("{}://{}:{}", scheme, host, port),
    }
}

/// Parsed `socks5://host[:port]` proxy location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyUrl {
    pub host: String,
    pub port: u16,
}

/// Parse a SOCKS proxy URL. Accepts `socks5://`, `socks5h://` or a bare `host[:port]`.
pub fn parse_socks_url(url: &str) -> Result<ProxyUrl> {
    let url = url.trim();
    let rest = match url.split_once("://") {
        Some((scheme, rest)) => {
            if !scheme.eq_ignore_ascii_case("socks5") && !scheme.eq_ignore_ascii_case("socks5h") {
                return Err(Error::Config(format!("unsupported proxy scheme {scheme}")));
            }
            rest
        }
        None => url,
    };
    let authority = rest.split('/').next().unwrap_or("");
    if authority.contains('@') {
        return Err(Error::Config("SOCKS5 proxy authentication is not supported".to_string()));
    }
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| Error::Config(format!("invalid proxy URL {url}")))?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (authority, None),
        }
    };
    let host = percent_decode_str(host)
        .decode_utf8()
        .map_err(|_| Error::Config(format!("invalid proxy host in {url}")))?
        .to_string();
    if host.is_empty() {
        return Err(Error::Config(format!("missing proxy host in {url}")));
    }
    let port = match port {
        Some(p) if !p.is_empty() => p
            .parse()
            .map_err(|_| Error::Config(format!("invalid proxy port in {url}")))?,
        _ => SOCKS_PORT,
    };
    Ok(ProxyUrl { host, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_uri_encodes_user() {
        assert_eq!(
            session_uri("pop3", Some("jo@example.org"), "pop.example.org", 110),
            "pop3://jo%40example.org@pop.example.org:110"
        );
        assert_eq!(session_uri("smtps", None, "::1", 465), "smtps://[::1]:465");
    }

    #[test]
    fn parses_socks_urls() {
        assert_eq!(
            parse_socks_url("socks5://proxy.lan:9050").unwrap(),
            ProxyUrl { host: "proxy.lan".into(), port: 9050 }
        );
        assert_eq!(parse_socks_url("socks5h://proxy.lan/").unwrap().port, SOCKS_PORT);
        assert_eq!(parse_socks_url("127.0.0.1:1081").unwrap().host, "127.0.0.1");
        assert_eq!(parse_socks_url("socks5://[::1]:1080").unwrap().host, "::1");
    }

    #[test]
    fn rejects_other_schemes_and_userinfo() {
        assert!(parse_socks_url("http://proxy:8080").is_err());
        assert!(parse_socks_url("socks5://u:p@proxy:1080").is_err());
        assert!(parse_socks_url("socks5://:1080").is_err());
    }
}
