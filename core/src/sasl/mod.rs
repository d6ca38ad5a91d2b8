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

//! SASL client: PLAIN, LOGIN, CRAM-MD5, GSSAPI.
//!
//! `negotiate` drives one mechanism over an `AuthChannel`, which sends a line
//! and classifies the server's answer. SMTP implements the channel on top of
//! its reply parser (334 continue, 235 done).

mod cram;
mod gssapi;
mod mechanism;
mod plain;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::Credentials;

pub use cram::{bytes_to_hex, cram_md5_response, md5_hex, CramVariant};
pub use gssapi::{default_provider, security_layer_reply, GssContext, GssProvider, GssStep, GssapiExchange};
pub use mechanism::SaslMechanism;
pub use plain::encode_plain;

/// Server answer to one line of an AUTH exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthReply {
    /// Continuation; carries the (base64) challenge text.
    Continue(String),
    /// Authentication succeeded.
    Done,
    /// Refused; carries the server text.
    Failed(String),
}

/// Line-level transport for an AUTH exchange.
pub trait AuthChannel {
    /// Send `line`; `sensitive` lines are redacted in logs.
    fn send(&mut self, line: &str, sensitive: bool) -> Result<AuthReply>;
}

/// Knobs for `negotiate`.
pub struct AuthOptions<'a> {
    /// Server host, for the GSSAPI service name.
    pub host: &'a str,
    pub cram: CramVariant,
    pub gss: Option<&'a dyn GssProvider>,
}

fn encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

fn decode(challenge: &str, mechanism: SaslMechanism) -> Result<Vec<u8>> {
    BASE64
        .decode(challenge.trim())
        .map_err(|_| Error::auth(format!("{} challenge is not valid base64", mechanism)))
}

fn refused(mechanism: SaslMechanism, text: &str) -> Error {
    Error::auth(format!("{} rejected: {}", mechanism, text))
}

fn expect_continue(reply: AuthReply, mechanism: SaslMechanism) -> Result<String> {
    match reply {
        AuthReply::Continue(challenge) => Ok(challenge),
        AuthReply::Done => Err(Error::auth(format!("{} ended early", mechanism))),
        AuthReply::Failed(text) => Err(refused(mechanism, &text)),
    }
}

/// Abort the exchange with `*` after a local failure; the server's answer is not interesting.
fn cancel<C: AuthChannel + ?Sized>(channel: &mut C, e: Error) -> Error {
    if let Err(send) = channel.send("*", false) {
        debug!("AUTH cancel: {}", send);
    }
    e
}

fn expect_done(reply: AuthReply, mechanism: SaslMechanism) -> Result<()> {
    match reply {
        AuthReply::Done => Ok(()),
        AuthReply::Continue(_) => Err(Error::auth(format!("{}: unexpected continuation", mechanism))),
        AuthReply::Failed(text) => Err(refused(mechanism, &text)),
    }
}

/// Authenticate with the credentials' mechanism.
pub fn negotiate<C: AuthChannel + ?Sized>(
    channel: &mut C,
    credentials: &Credentials,
    mechanism: SaslMechanism,
    options: &AuthOptions<'_>,
) -> Result<()> {
    debug!("authenticating as {} with {}", credentials.user, mechanism);
    match mechanism {
        SaslMechanism::Plain => {
            let reply = channel.send("AUTH PLAIN", false)?;
            expect_continue(reply, mechanism)?;
            let payload = encode(&encode_plain(&credentials.user, &credentials.password));
            expect_done(channel.send(&payload, true)?, mechanism)
        }
        SaslMechanism::Login => {
            expect_continue(channel.send("AUTH LOGIN", false)?, mechanism)?;
            let reply = channel.send(&encode(credentials.user.as_bytes()), false)?;
            expect_continue(reply, mechanism)?;
            match channel.send(&encode(credentials.password.as_bytes()), true)? {
                AuthReply::Done | AuthReply::Continue(_) => Ok(()),
                AuthReply::Failed(text) => Err(refused(mechanism, &text)),
            }
        }
        SaslMechanism::CramMd5 => {
            let challenge = expect_continue(channel.send("AUTH CRAM-MD5", false)?, mechanism)?;
            let challenge = decode(&challenge, mechanism).map_err(|e| cancel(channel, e))?;
            let response = cram_md5_response(
                &credentials.user,
                &credentials.password,
                &challenge,
                options.cram,
            )
            .map_err(|e| cancel(channel, e))?;
            expect_done(channel.send(&encode(response.as_bytes()), true)?, mechanism)
        }
        SaslMechanism::Gssapi => {
            let provider = options
                .gss
                .ok_or_else(|| Error::auth("GSSAPI support is not available"))?;
            let host = credentials.realm.as_deref().unwrap_or(options.host);
            let ctx = provider.client_context(&format!("smtp@{}", host))?;
            let (mut exchange, first) = GssapiExchange::start(ctx, &credentials.user)?;
            let mut reply = channel.send(&format!("AUTH GSSAPI {}", encode(&first)), false)?;
            loop {
                match reply {
                    AuthReply::Done if exchange.is_done() => return Ok(()),
                    AuthReply::Done => {
                        return Err(Error::auth("GSSAPI: server finished before security layer"))
                    }
                    AuthReply::Failed(text) => return Err(refused(mechanism, &text)),
                    AuthReply::Continue(challenge) => {
                        let token = decode(&challenge, mechanism)
                            .and_then(|c| exchange.respond(&c))
                            .map_err(|e| cancel(channel, e))?;
                        reply = channel.send(&encode(&token), false)?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted server: pops one reply per line sent and records the lines.
    struct Script {
        replies: VecDeque<AuthReply>,
        sent: Vec<String>,
    }

    impl Script {
        fn new(replies: Vec<AuthReply>) -> Self {
            Self {
                replies: replies.into(),
                sent: Vec::new(),
            }
        }
    }

    impl AuthChannel for Script {
        fn send(&mut self, line: &str, _sensitive: bool) -> Result<AuthReply> {
            self.sent.push(line.to_string());
            Ok(self.replies.pop_front().expect("script exhausted"))
        }
    }

    fn creds() -> Credentials {
        Credentials::new("tim", "tanstaaftanstaaf")
    }

    fn options() -> AuthOptions<'static> {
        AuthOptions {
            host: "mail.example.org",
            cram: CramVariant::Legacy,
            gss: None,
        }
    }

    #[test]
    fn plain_sends_one_payload_after_continue() {
        let mut s = Script::new(vec![AuthReply::Continue(String::new()), AuthReply::Done]);
        negotiate(&mut s, &creds(), SaslMechanism::Plain, &options()).unwrap();
        assert_eq!(s.sent[0], "AUTH PLAIN");
        assert_eq!(BASE64.decode(&s.sent[1]).unwrap(), b"\0tim\0tanstaaftanstaaf");
    }

    #[test]
    fn login_sends_user_then_password() {
        let mut s = Script::new(vec![
            AuthReply::Continue("VXNlcm5hbWU6".into()),
            AuthReply::Continue("UGFzc3dvcmQ6".into()),
            AuthReply::Done,
        ]);
        negotiate(&mut s, &creds(), SaslMechanism::Login, &options()).unwrap();
        assert_eq!(s.sent, vec!["AUTH LOGIN", "dGlt", "dGFuc3RhYWZ0YW5zdGFhZg=="]);
    }

    #[test]
    fn cram_md5_hmac_matches_rfc2195() {
        let challenge = BASE64.encode("<1896.697170952@postoffice.reston.mci.net>");
        let mut s = Script::new(vec![AuthReply::Continue(challenge), AuthReply::Done]);
        let opts = AuthOptions {
            cram: CramVariant::Hmac,
            ..options()
        };
        negotiate(&mut s, &creds(), SaslMechanism::CramMd5, &opts).unwrap();
        assert_eq!(
            String::from_utf8(BASE64.decode(&s.sent[1]).unwrap()).unwrap(),
            "tim b913a602c7eda7a495b4e6e7334d3890"
        );
    }

    #[test]
    fn cram_md5_bad_base64_cancels_with_star() {
        let mut s = Script::new(vec![
            AuthReply::Continue("!!!".into()),
            AuthReply::Failed("501 5.7.0 authentication cancelled".into()),
        ]);
        let err = negotiate(&mut s, &creds(), SaslMechanism::CramMd5, &options()).unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
        assert_eq!(s.sent, vec!["AUTH CRAM-MD5", "*"]);
    }

    #[test]
    fn refusal_carries_server_text() {
        let mut s = Script::new(vec![
            AuthReply::Continue(String::new()),
            AuthReply::Failed("535 5.7.8 bad credentials".into()),
        ]);
        let err = negotiate(&mut s, &creds(), SaslMechanism::Plain, &options()).unwrap_err();
        assert!(err.to_string().contains("bad credentials"));
    }

    #[test]
    fn gssapi_without_provider_fails() {
        let mut s = Script::new(vec![]);
        assert!(negotiate(&mut s, &creds(), SaslMechanism::Gssapi, &options()).is_err());
        assert!(s.sent.is_empty());
    }

    struct FakeProvider;

    impl GssProvider for FakeProvider {
        fn client_context(&self, target: &str) -> Result<Box<dyn GssContext>> {
            assert_eq!(target, "smtp@mail.example.org");
            Ok(Box::new(gssapi::tests::FakeContext { rounds: 0, seen: Vec::new() }))
        }
    }

    #[test]
    fn gssapi_walks_tokens_and_security_layer() {
        let mut s = Script::new(vec![
            AuthReply::Continue(BASE64.encode("srv1")),
            AuthReply::Continue(BASE64.encode(b"W\x01\x00\x10\x00")),
            AuthReply::Done,
        ]);
        let provider = FakeProvider;
        let opts = AuthOptions {
            gss: Some(&provider),
            ..options()
        };
        negotiate(&mut s, &creds(), SaslMechanism::Gssapi, &opts).unwrap();
        assert_eq!(s.sent[0], format!("AUTH GSSAPI {}", BASE64.encode("tok1")));
        assert_eq!(s.sent[1], BASE64.encode("tok2"));
        assert_eq!(BASE64.decode(&s.sent[2]).unwrap(), b"W\x01\xff\xff\xfftim");
    }
}
