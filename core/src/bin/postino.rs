/*
 * postino.rs
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

//! CLI: fetch POP3 mail into an mbox, or send a message over SMTP.
//!
//! Credentials come from `POSTINO_USER` / `POSTINO_PASSWORD` / `POSTINO_AUTH`
//! and policy from the other `POSTINO_*` variables (see `Config::from_env`);
//! command-line flags override them.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, IsTerminal};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use postino_core::config::{Config, StartTls};
use postino_core::net::cancel::CancellationContext;
use postino_core::net::{CancelHandle, Endpoint, SignalGuard};
use postino_core::protocol::pop3::{Pop3Session, POP3S_PORT, POP3_PORT};
use postino_core::protocol::smtp::{send_message, SMTPS_PORT, SMTP_PORT};
use postino_core::sasl::SaslMechanism;
use postino_core::store::{Credentials, FetchPolicy, MailboxSink, MboxWriter, MessageSource, Recipient};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "postino")]
#[command(about = "Fetch mail over POP3 and send it over SMTP")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// STARTTLS policy: never, opportunistic, required
    #[arg(long, global = true)]
    starttls: Option<StartTls>,

    /// SOCKS5 proxy, e.g. socks5://127.0.0.1:1080
    #[arg(long, global = true)]
    proxy: Option<String>,

    /// Accept any server certificate
    #[arg(long, global = true)]
    insecure: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Retrieve messages from a POP3 server
    Fetch {
        /// Server host
        host: String,

        /// Port number or service name
        #[arg(long, default_value = "pop3")]
        service: String,

        /// Implicit TLS (pop3s)
        #[arg(long)]
        tls: bool,

        /// Append to this mbox file instead of writing to stdout
        #[arg(long)]
        mbox: Option<PathBuf>,

        /// Headers only (TOP n 0)
        #[arg(long)]
        headers_only: bool,

        /// Delete fetched messages from the server
        #[arg(long)]
        delete: bool,

        /// Never delete anything
        #[arg(long)]
        read_only: bool,

        /// Never use APOP
        #[arg(long)]
        no_apop: bool,
    },

    /// Send a message read from a file or stdin
    Send {
        /// Server host
        host: String,

        /// Port number or service name
        #[arg(long, default_value = "smtp")]
        service: String,

        /// Implicit TLS (smtps)
        #[arg(long)]
        tls: bool,

        /// Envelope sender
        #[arg(long)]
        from: String,

        /// Message file (header and body); stdin when absent
        #[arg(long)]
        file: Option<PathBuf>,

        /// SASL mechanism (PLAIN, LOGIN, CRAM-MD5, GSSAPI); overrides POSTINO_AUTH
        #[arg(long)]
        auth: Option<String>,

        /// Envelope recipients
        #[arg(required = true)]
        recipients: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    // Only ring is compiled in; an already-installed provider is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(policy) = args.starttls {
        config.starttls = policy;
    }
    if args.proxy.is_some() {
        config.socks_proxy = args.proxy.clone();
    }
    config.accept_invalid_certs |= args.insecure;
    config.interactive |= io::stderr().is_terminal();

    let _signals = SignalGuard::install_default().context("installing signal handlers")?;
    let cancel = CancellationContext::new(CancelHandle::new(), config.interactive);

    match args.command {
        Command::Fetch {
            host,
            service,
            tls,
            mbox,
            headers_only,
            delete,
            read_only,
            no_apop,
        } => {
            config.bulk_load &= !headers_only;
            config.delete_after_fetch |= delete;
            config.read_only |= read_only;
            config.disable_apop |= no_apop;
            let endpoint = if tls {
                Endpoint::new(host, service_or(&service, "pop3s"), POP3S_PORT, "pop3s")
            } else {
                Endpoint::new(host, service, POP3_PORT, "pop3")
            };
            cmd_fetch(&endpoint, &config, mbox, cancel)
        }
        Command::Send {
            host,
            service,
            tls,
            from,
            file,
            auth,
            recipients,
        } => {
            let endpoint = if tls {
                Endpoint::new(host, service_or(&service, "smtps"), SMTPS_PORT, "smtps")
            } else {
                Endpoint::new(host, service, SMTP_PORT, "smtp")
            };
            cmd_send(&endpoint, &config, &from, file, auth, &recipients, cancel)
        }
    }
}

/// The TLS service name replaces the plaintext default.
fn service_or(service: &str, tls_service: &str) -> String {
    if service == "pop3" || service == "smtp" {
        tls_service.to_string()
    } else {
        service.to_string()
    }
}

fn cmd_fetch(
    endpoint: &Endpoint,
    config: &Config,
    mbox: Option<PathBuf>,
    cancel: CancellationContext,
) -> anyhow::Result<()> {
    let credentials = Credentials::from_env()?;
    let mut sink: Box<dyn MailboxSink> = match mbox {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening {}", path.display()))?;
            Box::new(MboxWriter::new(file))
        }
        None => Box::new(MboxWriter::new(io::stdout())),
    };

    let mut session = Pop3Session::connect(endpoint, config, cancel)?;
    session.login(&credentials)?;
    let summary = session.fetch_all(&FetchPolicy::from(config), sink.as_mut())?;
    session.quit()?;
    eprintln!(
        "{} retrieved, {} deleted, {} kept",
        summary.retrieved, summary.deleted, summary.kept
    );
    Ok(())
}

fn cmd_send(
    endpoint: &Endpoint,
    config: &Config,
    from: &str,
    file: Option<PathBuf>,
    auth: Option<String>,
    recipients: &[String],
    cancel: CancellationContext,
) -> anyhow::Result<()> {
    let mut credentials = Credentials::from_env().ok();
    if let Some(name) = auth {
        let mechanism = SaslMechanism::from_name(&name)
            .with_context(|| format!("unknown SASL mechanism {name}"))?;
        let c = credentials
            .take()
            .context("--auth needs POSTINO_USER and POSTINO_PASSWORD")?;
        credentials = Some(c.with_mechanism(mechanism));
    }
    let recipients: Vec<Recipient> = recipients.iter().map(|r| Recipient::new(r.as_str())).collect();
    let mut source: Box<dyn MessageSource> = match file {
        Some(path) => {
            let f = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
            Box::new(BufReader::new(f))
        }
        None => Box::new(io::stdin().lock()),
    };

    let report = send_message(
        endpoint,
        config,
        credentials.as_ref(),
        from,
        &recipients,
        source.as_mut(),
        cancel,
    )?;
    for (address, reply) in &report.rejected {
        eprintln!("rejected {}: {}", address, reply);
    }
    eprintln!("sent to {} recipients: {}", report.accepted.len(), report.reply);
    Ok(())
}
