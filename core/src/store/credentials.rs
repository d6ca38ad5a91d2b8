/*
 * credentials.rs
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

//! Login credentials and where they come from.

use std::env;
use std::fmt;

use crate::error::{Error, Result};
use crate::sasl::SaslMechanism;

/// User, password and SASL selector for one session.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    /// SMTP AUTH mechanism; None sends HELO and skips authentication.
    pub mechanism: Option<SaslMechanism>,
    /// Host used for the GSSAPI service name when it differs from the server name.
    pub realm: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            mechanism: None,
            realm: None,
        }
    }

    pub fn with_mechanism(mut self, mechanism: SaslMechanism) -> Self {
        self.mechanism = Some(mechanism);
        self
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    /// `POSTINO_USER`, `POSTINO_PASSWORD` and optional `POSTINO_AUTH` (mechanism name).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let user = env::var("POSTINO_USER")
            .map_err(|_| Error::Config("POSTINO_USER environment variable not set".to_string()))?;
        let password = env::var("POSTINO_PASSWORD").unwrap_or_default();
        let mut credentials = Credentials::new(user, password);
        if let Ok(name) = env::var("POSTINO_AUTH") {
            let mechanism = SaslMechanism::from_name(&name)
                .ok_or_else(|| Error::Config(format!("unknown SASL mechanism {name}")))?;
            credentials.mechanism = Some(mechanism);
        }
        if let Ok(realm) = env::var("POSTINO_REALM") {
            credentials.realm = Some(realm);
        }
        Ok(credentials)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("mechanism", &self.mechanism)
            .field("realm", &self.realm)
            .finish()
    }
}

/// Supplies credentials when a session is about to authenticate.
pub trait CredentialsProvider {
    fn credentials(&self) -> Result<Credentials>;
}

impl CredentialsProvider for Credentials {
    fn credentials(&self) -> Result<Credentials> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_password() {
        let c = Credentials::new("jo", "s3cret").with_mechanism(SaslMechanism::Plain);
        let shown = format!("{:?}", c);
        assert!(shown.contains("jo"));
        assert!(!shown.contains("s3cret"));
    }

    #[test]
    fn static_provider_returns_copy() {
        let c = Credentials::new("jo", "pw").with_realm("kdc.example.org");
        let got = c.credentials().unwrap();
        assert_eq!(got.user, "jo");
        assert_eq!(got.realm.as_deref(), Some("kdc.example.org"));
    }
}
