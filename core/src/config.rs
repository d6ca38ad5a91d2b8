/*
 * config.rs
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

//! Session policy: STARTTLS requirement, APOP, bulk loading, proxy, timeouts.
//!
//! `Config` deserializes with serde (every field optional, see `Default`) so a host
//! application can embed it in its own settings file. `Config::from_env` reads
//! `POSTINO_*` variables, loading `.env` first when present.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// When to upgrade a plaintext session with STLS / STARTTLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartTls {
    /// Stay in plaintext.
    Never,
    /// Upgrade when the server agrees; continue in plaintext otherwise.
    #[default]
    Opportunistic,
    /// Upgrade or fail the session.
    Required,
}

impl FromStr for StartTls {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" | "no" | "off" => Ok(StartTls::Never),
            "opportunistic" | "try" => Ok(StartTls::Opportunistic),
            "required" | "yes" | "on" => Ok(StartTls::Required),
            other => Err(Error::Config(format!("invalid STARTTLS policy: {other}"))),
        }
    }
}

/// Policy booleans and timeouts consulted by the connector and both engines.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub starttls: StartTls,
    /// Never use APOP even if the greeting carries a challenge.
    pub disable_apop: bool,
    /// Fetch whole messages with RETR; when false only headers are fetched with TOP n 0.
    pub bulk_load: bool,
    /// Never send DELE.
    pub read_only: bool,
    /// Mark every fetched message deleted.
    pub delete_after_fetch: bool,
    /// `socks5://host[:port]`.
    pub socks_proxy: Option<String>,
    /// Total connect timeout in seconds; 0 means a blocking connect.
    pub connect_timeout_secs: u64,
    /// Give up on a silent server after this many seconds; 0 waits forever.
    pub read_timeout_secs: u64,
    /// POP3 NOOP interval in seconds; 0 disables keepalive.
    pub keepalive_secs: u64,
    /// Skip certificate verification (self-signed servers).
    pub accept_invalid_certs: bool,
    /// Use RFC 2195 HMAC-MD5 for CRAM-MD5 instead of MD5(challenge + password).
    pub cram_md5_hmac: bool,
    /// Print connect progress and interrupt warnings on stderr.
    pub interactive: bool,
    /// Name sent with EHLO/HELO and appended to bare recipient names.
    pub hostname: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            starttls: StartTls::Opportunistic,
            disable_apop: false,
            bulk_load: true,
            read_only: false,
            delete_after_fetch: false,
            socks_proxy: None,
            connect_timeout_secs: 30,
            read_timeout_secs: 0,
            keepalive_secs: 0,
            accept_invalid_certs: false,
            cram_md5_hmac: false,
            interactive: false,
            hostname: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Reads from `.env` file if present. All variables are optional:
    /// - `POSTINO_STARTTLS` (`never`, `opportunistic`, `required`)
    /// - `POSTINO_DISABLE_APOP`, `POSTINO_BULK_LOAD`, `POSTINO_READ_ONLY`,
    ///   `POSTINO_DELETE`, `POSTINO_ACCEPT_INVALID_CERTS`, `POSTINO_CRAM_MD5_HMAC`,
    ///   `POSTINO_INTERACTIVE` (booleans)
    /// - `POSTINO_SOCKS_PROXY`
    /// - `POSTINO_CONNECT_TIMEOUT`, `POSTINO_READ_TIMEOUT`, `POSTINO_KEEPALIVE` (seconds)
    /// - `POSTINO_HOSTNAME`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Config::default();
        if let Ok(v) = env::var("POSTINO_STARTTLS") {
            config.starttls = v.parse()?;
        }
        config.disable_apop = env_bool("POSTINO_DISABLE_APOP", config.disable_apop)?;
        config.bulk_load = env_bool("POSTINO_BULK_LOAD", config.bulk_load)?;
        config.read_only = env_bool("POSTINO_READ_ONLY", config.read_only)?;
        config.delete_after_fetch = env_bool("POSTINO_DELETE", config.delete_after_fetch)?;
        config.accept_invalid_certs =
            env_bool("POSTINO_ACCEPT_INVALID_CERTS", config.accept_invalid_certs)?;
        config.cram_md5_hmac = env_bool("POSTINO_CRAM_MD5_HMAC", config.cram_md5_hmac)?;
        config.interactive = env_bool("POSTINO_INTERACTIVE", config.interactive)?;
        config.socks_proxy = env::var("POSTINO_SOCKS_PROXY").ok().filter(|s| !s.is_empty());
        config.connect_timeout_secs = env_secs("POSTINO_CONNECT_TIMEOUT", config.connect_timeout_secs)?;
        config.read_timeout_secs = env_secs("POSTINO_READ_TIMEOUT", config.read_timeout_secs)?;
        config.keepalive_secs = env_secs("POSTINO_KEEPALIVE", config.keepalive_secs)?;
        config.hostname = env::var("POSTINO_HOSTNAME").ok().filter(|s| !s.is_empty());
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.read_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        non_zero_secs(self.keepalive_secs)
    }

    /// Configured hostname, else the system host name, else `localhost`.
    pub fn local_hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(system_hostname)
            .unwrap_or_else(|| "localhost".to_string())
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::Config(format!("invalid {name}: {v}"))),
        },
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn system_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes; gethostname NUL-terminates on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.starttls, StartTls::Opportunistic);
        assert!(c.bulk_load);
        assert_eq!(c.connect_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(c.read_timeout(), None);
        assert_eq!(c.keepalive_interval(), None);
    }

    #[test]
    fn starttls_policy_parses() {
        assert_eq!("required".parse::<StartTls>().unwrap(), StartTls::Required);
        assert_eq!("Never".parse::<StartTls>().unwrap(), StartTls::Never);
        assert!("sometimes".parse::<StartTls>().is_err());
    }

    #[test]
    fn local_hostname_prefers_configured() {
        let c = Config {
            hostname: Some("mx.example.org".to_string()),
            ..Config::default()
        };
        assert_eq!(c.local_hostname(), "mx.example.org");
        assert!(!Config::default().local_hostname().is_empty());
    }
}
