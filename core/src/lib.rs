/*
 * lib.rs
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

//! Postino core: blocking POP3 and SMTP client sessions over a buffered line
//! transport with TLS upgrade, SOCKS5 and interrupt-aware I/O.
//!
//! ```no_run
//! use postino_core::config::Config;
//! use postino_core::net::{CancelHandle, Endpoint};
//! use postino_core::net::cancel::CancellationContext;
//! use postino_core::protocol::pop3::Pop3Session;
//! use postino_core::store::{Credentials, FetchPolicy, MemoryMailbox};
//!
//! # fn main() -> postino_core::error::Result<()> {
//! let config = Config::default();
//! let endpoint = Endpoint::new("pop.example.org", "pop3", 110, "pop3");
//! let cancel = CancellationContext::new(CancelHandle::new(), false);
//! let mut session = Pop3Session::connect(&endpoint, &config, cancel)?;
//! session.login(&Credentials::new("jo", "secret"))?;
//! let mut mailbox = MemoryMailbox::default();
//! let summary = session.fetch_all(&FetchPolicy::from(&config), &mut mailbox)?;
//! session.quit()?;
//! println!("{} retrieved", summary.retrieved);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod net;
pub mod protocol;
pub mod sasl;
pub mod store;
pub mod uri;

pub use error::{Error, Result};
