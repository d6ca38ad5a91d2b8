/*
 * gssapi.rs
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

//! GSSAPI SASL client (RFC 4752).
//!
//! `GssapiExchange` walks the token exchange one server challenge at a time:
//! context-establishment tokens until the context is complete, then the
//! security-layer negotiation. The GSS library sits behind `GssContext`; the
//! system binding is compiled in with the `gssapi` feature.

use crate::error::{Error, Result};

/// No security layer, in the first octet of the client's final message.
const LAYER_NONE: u8 = 0x01;

/// Output of one `init_sec_context` call.
#[derive(Debug, Clone, Default)]
pub struct GssStep {
    pub token: Vec<u8>,
    pub complete: bool,
}

/// A client security context.
pub trait GssContext {
    /// Next context token; `input` is the server's last token (None on the first call).
    fn step(&mut self, input: Option<&[u8]>) -> Result<GssStep>;
    fn wrap(&mut self, data: &[u8]) -> Result<Vec<u8>>;
    fn unwrap(&mut self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Creates contexts for a host-based service name such as `smtp@mail.example.org`.
pub trait GssProvider {
    fn client_context(&self, target: &str) -> Result<Box<dyn GssContext>>;
}

/// Final client message: no protection, max size ignored, authorization id.
pub fn security_layer_reply(user: &str) -> Vec<u8> {
    let mut reply = Vec::with_capacity(4 + user.len());
    reply.extend_from_slice(&[LAYER_NONE, 0xff, 0xff, 0xff]);
    reply.extend_from_slice(user.as_bytes());
    reply
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Context,
    SecurityLayer,
    Done,
}

/// Client side of the GSSAPI exchange.
pub struct GssapiExchange {
    ctx: Box<dyn GssContext>,
    user: String,
    phase: Phase,
}

impl GssapiExchange {
    /// Create the context and produce the initial token (sent with `AUTH GSSAPI`).
    pub fn start(mut ctx: Box<dyn GssContext>, user: &str) -> Result<(Self, Vec<u8>)> {
        let step = ctx.step(None)?;
        let phase = if step.complete {
            Phase::SecurityLayer
        } else {
            Phase::Context
        };
        let exchange = Self {
            ctx,
            user: user.to_string(),
            phase,
        };
        Ok((exchange, step.token))
    }

    /// Answer one decoded server challenge.
    pub fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        match self.phase {
            Phase::Context => {
                let step = self.ctx.step(Some(challenge))?;
                if step.complete {
                    self.phase = Phase::SecurityLayer;
                }
                Ok(step.token)
            }
            Phase::SecurityLayer => {
                let offer = self.ctx.unwrap(challenge)?;
                if offer.len() != 4 {
                    return Err(Error::auth(format!(
                        "GSSAPI security layer offer has {} bytes, expected 4",
                        offer.len()
                    )));
                }
                if offer[0] & LAYER_NONE == 0 {
                    return Err(Error::auth("GSSAPI server requires a security layer"));
                }
                let wrapped = self.ctx.wrap(&security_layer_reply(&self.user))?;
                self.phase = Phase::Done;
                Ok(wrapped)
            }
            Phase::Done => Err(Error::auth("unexpected challenge after GSSAPI completed")),
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }
}

/// The system GSSAPI library, if compiled in.
pub fn default_provider() -> Option<Box<dyn GssProvider>> {
    #[cfg(feature = "gssapi")]
    {
        Some(Box::new(system::SystemGss))
    }
    #[cfg(not(feature = "gssapi"))]
    {
        None
    }
}

#[cfg(feature = "gssapi")]
mod system {
    use libgssapi::context::{ClientCtx, CtxFlags, SecurityContext};
    use libgssapi::name::Name;
    use libgssapi::oid::{GSS_MECH_KRB5, GSS_NT_HOSTBASED_SERVICE};

    use super::{GssContext, GssProvider, GssStep};
    use crate::error::{Error, Result};

    // libgssapi's Display walks gss_display_status for both major and minor codes.
    fn gss_error(e: libgssapi::error::Error) -> Error {
        Error::auth(format!("GSSAPI: {e}"))
    }

    pub struct SystemGss;

    impl GssProvider for SystemGss {
        fn client_context(&self, target: &str) -> Result<Box<dyn GssContext>> {
            let name = Name::new(target.as_bytes(), Some(&GSS_NT_HOSTBASED_SERVICE)).map_err(gss_error)?;
            let ctx = ClientCtx::new(
                None,
                name,
                CtxFlags::GSS_C_MUTUAL_FLAG | CtxFlags::GSS_C_SEQUENCE_FLAG,
                Some(&GSS_MECH_KRB5),
            );
            Ok(Box::new(SystemContext(ctx)))
        }
    }

    struct SystemContext(ClientCtx);

    impl GssContext for SystemContext {
        fn step(&mut self, input: Option<&[u8]>) -> Result<GssStep> {
            let token = self.0.step(input, None).map_err(gss_error)?;
            Ok(GssStep {
                token: token.map(|b| b.to_vec()).unwrap_or_default(),
                complete: self.0.is_complete(),
            })
        }

        fn wrap(&mut self, data: &[u8]) -> Result<Vec<u8>> {
            self.0.wrap(false, data).map(|b| b.to_vec()).map_err(gss_error)
        }

        fn unwrap(&mut self, data: &[u8]) -> Result<Vec<u8>> {
            self.0.unwrap(data).map(|b| b.to_vec()).map_err(gss_error)
        }
    }
}
