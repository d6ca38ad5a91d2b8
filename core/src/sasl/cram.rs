/*
 * cram.rs
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

//! MD5 digests for CRAM-MD5 and APOP.
//!
//! CRAM-MD5 defaults to `hex(MD5(challenge ‖ password))`, which is what the
//! servers this client has always talked to accept. RFC 2195 HMAC-MD5 is
//! available as `CramVariant::Hmac`.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};

use crate::error::{Error, Result};

type HmacMd5 = Hmac<Md5>;

/// Which digest CRAM-MD5 sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CramVariant {
    /// MD5 over challenge followed by password.
    #[default]
    Legacy,
    /// HMAC-MD5 keyed with the password (RFC 2195).
    Hmac,
}

pub fn bytes_to_hex(b: &[u8]) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut s = String::with_capacity(b.len() * 2);
    for &x in b {
        s.push(HEX[(x >> 4) as usize] as char);
        s.push(HEX[(x & 15) as usize] as char);
    }
    s
}

/// Lowercase hex MD5 of `prefix ‖ secret`.
pub fn md5_hex(prefix: &[u8], secret: &[u8]) -> String {
    let mut md5 = Md5::new();
    md5.update(prefix);
    md5.update(secret);
    bytes_to_hex(&md5.finalize())
}

fn hmac_md5_hex(key: &[u8], data: &[u8]) -> Result<String> {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key)
        .map_err(|e| Error::auth(format!("CRAM-MD5 key: {e}")))?;
    mac.update(data);
    Ok(bytes_to_hex(&mac.finalize().into_bytes()))
}

/// `user SP hexdigest` for a decoded challenge.
pub fn cram_md5_response(user: &str, password: &str, challenge: &[u8], variant: CramVariant) -> Result<String> {
    let digest = match variant {
        CramVariant::Legacy => md5_hex(challenge, password.as_bytes()),
        CramVariant::Hmac => hmac_md5_hex(password.as_bytes(), challenge)?,
    };
    Ok(format!("{} {}", user, digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: &[u8] = b"<1896.697170952@postoffice.reston.mci.net>";

    #[test]
    fn hmac_variant_matches_rfc2195() {
        assert_eq!(
            cram_md5_response("tim", "tanstaaftanstaaf", CHALLENGE, CramVariant::Hmac).unwrap(),
            "tim b913a602c7eda7a495b4e6e7334d3890"
        );
    }

    #[test]
    fn legacy_variant_is_plain_md5() {
        // RFC 1939 APOP example: MD5 of the same concatenation.
        let challenge = b"<1896.697170952@dbc.mtview.ca.us>";
        assert_eq!(
            cram_md5_response("mrose", "tanstaaf", challenge, CramVariant::Legacy).unwrap(),
            "mrose c4c9334bac560ecc979e58001b3e22fb"
        );
    }

    #[test]
    fn hex_is_lowercase() {
        assert_eq!(bytes_to_hex(&[0x00, 0xab, 0xff]), "00abff");
    }
}
