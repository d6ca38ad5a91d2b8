/*
 * tls.rs
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

//! TLS client configuration for implicit TLS and STARTTLS upgrades.
//!
//! The handshake itself is driven by `Connection::start_tls` over the
//! connection's own socket; this module only builds rustls sessions.

use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::debug;

use crate::error::{Error, Result};

/// Options for the TLS upgrader.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsOptions {
    /// Skip certificate verification (self-signed servers).
    pub accept_invalid_certs: bool,
}

/// Build a root certificate store: platform native certs first, then webpki-roots as fallback.
fn build_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            debug!(added, ignored, "loaded native root certificates");
        }
        Err(e) => debug!("native root certificates unavailable: {}", e),
    }
    if root_store.is_empty() {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    root_store
}

static VERIFIED_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
static INSECURE_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

/// Shared client config (native + Mozilla roots, no client auth), or one that
/// accepts any certificate.
pub fn client_config(options: &TlsOptions) -> Arc<ClientConfig> {
    if options.accept_invalid_certs {
        INSECURE_CONFIG
            .get_or_init(|| {
                let config = ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
                    .with_no_client_auth();
                Arc::new(config)
            })
            .clone()
    } else {
        VERIFIED_CONFIG
            .get_or_init(|| {
                let config = ClientConfig::builder()
                    .with_root_certificates(build_root_store())
                    .with_no_client_auth();
                Arc::new(config)
            })
            .clone()
    }
}

/// New client session for `host`, not yet handshaken.
pub fn client_session(host: &str, options: &TlsOptions) -> Result<ClientConnection> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::Tls(format!("invalid server name {host}: {e}")))?;
    ClientConnection::new(client_config(options), server_name).map_err(|e| Error::Tls(e.to_string()))
}

/// Certificate verifier that accepts everything.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_for_dns_name() {
        let session = client_session("mail.example.org", &TlsOptions::default()).unwrap();
        assert!(session.is_handshaking());
    }

    #[test]
    fn rejects_invalid_server_name() {
        let err = client_session("not a host", &TlsOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }

    #[test]
    fn insecure_config_is_cached() {
        let options = TlsOptions { accept_invalid_certs: true };
        assert!(Arc::ptr_eq(&client_config(&options), &client_config(&options)));
    }
}
