/*
 * connector.rs
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

//! host:service to connected `Connection`, directly or through a SOCKS5 proxy.
//!
//! Every resolved address is tried in turn. Connects are non-blocking and
//! polled with a total timeout so interrupts and the deadline are noticed.
//! Lookups run on a helper thread; the caller waits in short slices and may
//! walk away from a lookup that cannot itself be cancelled.

use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use super::cancel::{CancellationContext, Interrupt};
use super::socks;
use super::Connection;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::uri;

/// Upper bound on one poll() wait while connecting.
const CONNECT_SLICE: Duration = Duration::from_secs(1);
/// Progress dot interval for interactive connects.
const DOT_INTERVAL: Duration = Duration::from_secs(2);
/// How often the resolver wait looks at the cancellation context.
const RESOLVER_SLICE: Duration = Duration::from_millis(100);

/// Well-known mail service names.
pub fn service_port(service: &str) -> Option<u16> {
    match service.to_ascii_lowercase().as_str() {
        "pop3" | "pop" => Some(110),
        "pop3s" => Some(995),
        "smtp" => Some(25),
        "submission" => Some(587),
        "smtps" | "submissions" => Some(465),
        "socks" => Some(uri::SOCKS_PORT),
        _ => None,
    }
}

/// Where to connect: host plus a port number or service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub service: String,
    /// Used when `service` cannot be resolved.
    pub default_port: u16,
    /// URL scheme for diagnostics (pop3, pop3s, smtp, smtps).
    pub scheme: String,
}

impl Endpoint {
    pub fn new(
        host: impl Into<String>,
        service: impl Into<String>,
        default_port: u16,
        scheme: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            service: service.into(),
            default_port,
            scheme: scheme.into(),
        }
    }

    /// Port for `service`: numeric, well-known name, or None.
    pub fn port(&self) -> Option<u16> {
        let service = self.service.trim();
        if service.is_empty() {
            return Some(self.default_port);
        }
        service.parse().ok().or_else(|| service_port(service))
    }

    /// Port actually used for diagnostics.
    pub fn effective_port(&self) -> u16 {
        self.port().unwrap_or(self.default_port)
    }
}

/// Connector settings, usually derived from `Config`.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Total connect timeout per address; None blocks.
    pub timeout: Option<Duration>,
    pub socks_proxy: Option<String>,
    /// Print progress dots while waiting.
    pub interactive: bool,
    pub read_timeout: Option<Duration>,
}

impl From<&Config> for ConnectOptions {
    fn from(config: &Config) -> Self {
        Self {
            timeout: config.connect_timeout(),
            socks_proxy: config.socks_proxy.clone(),
            interactive: config.interactive,
            read_timeout: config.read_timeout(),
        }
    }
}

/// Connect to `endpoint`, through the configured SOCKS5 proxy if any.
pub fn connect(
    endpoint: &Endpoint,
    user: Option<&str>,
    options: &ConnectOptions,
    mut cancel: CancellationContext,
) -> Result<Connection> {
    let description = uri::session_uri(&endpoint.scheme, user, &endpoint.host, endpoint.effective_port());
    let tcp = match &options.socks_proxy {
        Some(url) => {
            let proxy = uri::parse_socks_url(url)?;
            let proxy_endpoint = Endpoint::new(proxy.host, proxy.port.to_string(), uri::SOCKS_PORT, "socks5");
            let mut tcp = open_tcp(&proxy_endpoint, options, &mut cancel)?;
            tcp.set_read_timeout(options.timeout)?;
            tcp.set_write_timeout(options.timeout)?;
            let port = endpoint.effective_port();
            socks::connect_through(&mut tcp, &endpoint.host, port)?;
            tcp.set_write_timeout(None)?;
            info!("connected to {} via SOCKS5 proxy {}", description, url);
            tcp
        }
        None => {
            let tcp = open_tcp(endpoint, options, &mut cancel)?;
            info!("connected to {}", description);
            tcp
        }
    };
    let mut conn = Connection::new(tcp, description, cancel);
    conn.set_read_timeout(options.read_timeout);
    Ok(conn)
}

/// Resolve and connect, trying each address in turn.
fn open_tcp(endpoint: &Endpoint, options: &ConnectOptions, cancel: &mut CancellationContext) -> Result<TcpStream> {
    let addrs = resolve_endpoint(endpoint, cancel)?;
    let mut last_error = None;
    for addr in addrs {
        cancel.check()?;
        debug!("trying {} for {}", addr, endpoint.host);
        match connect_addr(addr, options.timeout, options.interactive, cancel) {
            Ok(tcp) => return Ok(tcp),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!("{}: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| Error::Resolve {
        host: endpoint.host.clone(),
        message: "no addresses".to_string(),
    }))
}

/// Lookup with one retry on the protocol's standard port.
fn resolve_endpoint(endpoint: &Endpoint, cancel: &mut CancellationContext) -> Result<Vec<SocketAddr>> {
    let first = match endpoint.port() {
        Some(port) => resolve(&endpoint.host, port, cancel),
        None => Err(Error::Resolve {
            host: endpoint.host.clone(),
            message: format!("unknown service {}", endpoint.service),
        }),
    };
    match first {
        Ok(addrs) => Ok(addrs),
        Err(Error::Resolve { message, .. }) if endpoint.port() != Some(endpoint.default_port) => {
            warn!(
                "{}:{}: {}; retrying with standard port {} (set {}-use-standard-port)",
                endpoint.host, endpoint.service, message, endpoint.default_port, endpoint.scheme
            );
            resolve(&endpoint.host, endpoint.default_port, cancel)
        }
        Err(e) => Err(e),
    }
}

/// Resolve `host` on a helper thread. Interrupts: first one warns, the next abandons the lookup.
pub fn resolve(host: &str, port: u16, cancel: &mut CancellationContext) -> Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let (tx, rx) = mpsc::channel();
    let target = host.to_string();
    thread::Builder::new()
        .name("postino-resolver".to_string())
        .spawn(move || {
            let result = (target.as_str(), port)
                .to_socket_addrs()
                .map(|addrs| addrs.collect::<Vec<_>>());
            let _ = tx.send(result);
        })?;
    let failed = |message: String| Error::Resolve {
        host: host.to_string(),
        message,
    };
    loop {
        match rx.recv_timeout(RESOLVER_SLICE) {
            Ok(Ok(addrs)) if addrs.is_empty() => return Err(failed("no addresses".to_string())),
            Ok(Ok(addrs)) => return Ok(addrs),
            Ok(Err(e)) => return Err(failed(e.to_string())),
            Err(RecvTimeoutError::Timeout) => {
                if cancel.poll_resolver() == Interrupt::Hard {
                    warn!("lookup of {} abandoned", host);
                    return Err(Error::Cancelled);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(failed("resolver thread exited".to_string()))
            }
        }
    }
}

/// Non-blocking connect bounded by `timeout`, then back to blocking mode.
fn connect_addr(
    addr: SocketAddr,
    timeout: Option<Duration>,
    interactive: bool,
    cancel: &mut CancellationContext,
) -> Result<TcpStream> {
    let connect_error = |source: io::Error| Error::Connect {
        target: addr.to_string(),
        source,
    };
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(connect_error)?;
    socket.set_nonblocking(true).map_err(connect_error)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock => {
            wait_connected(&socket, addr, timeout, interactive, cancel)?;
        }
        Err(e) => return Err(connect_error(e)),
    }
    socket.set_nonblocking(false).map_err(connect_error)?;
    Ok(socket.into())
}

/// poll() for writability, then SO_ERROR for the outcome. The socket is closed by the caller dropping it.
fn wait_connected(
    socket: &Socket,
    addr: SocketAddr,
    timeout: Option<Duration>,
    interactive: bool,
    cancel: &mut CancellationContext,
) -> Result<()> {
    let started = Instant::now();
    let mut last_dot = started;
    loop {
        let remaining = timeout.map(|t| t.saturating_sub(started.elapsed()));
        if remaining == Some(Duration::ZERO) {
            if interactive && last_dot != started {
                eprintln!();
            }
            warn!("connect to {} timed out", addr);
            return Err(Error::Timeout(addr.to_string()));
        }
        let wait = remaining.map_or(CONNECT_SLICE, |r| r.min(CONNECT_SLICE));
        let mut pfd = libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        // SAFETY: one valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, wait.as_millis() as libc::c_int) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                cancel.check()?;
                continue;
            }
            return Err(Error::Connect {
                target: addr.to_string(),
                source: e,
            });
        }
        cancel.check()?;
        if rc == 0 {
            if interactive && last_dot.elapsed() >= DOT_INTERVAL {
                eprint!(".");
                let _ = io::stderr().flush();
                last_dot = Instant::now();
            }
            continue;
        }
        return match socket.take_error() {
            Ok(None) => Ok(()),
            Ok(Some(e)) | Err(e) => Err(Error::Connect {
                target: addr.to_string(),
                source: e,
            }),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn endpoint_ports() {
        assert_eq!(Endpoint::new("h", "2525", 25, "smtp").port(), Some(2525));
        assert_eq!(Endpoint::new("h", "pop3s", 110, "pop3").port(), Some(995));
        assert_eq!(Endpoint::new("h", "", 110, "pop3").port(), Some(110));
        assert_eq!(Endpoint::new("h", "nonsense", 110, "pop3").port(), None);
        assert_eq!(Endpoint::new("h", "nonsense", 110, "pop3").effective_port(), 110);
    }

    #[test]
    fn connects_to_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::new("127.0.0.1", port.to_string(), 110, "pop3");
        let options = ConnectOptions {
            timeout: Some(Duration::from_secs(5)),
            ..ConnectOptions::default()
        };
        let conn = connect(&endpoint, Some("jo"), &options, CancellationContext::default()).unwrap();
        assert_eq!(conn.description(), format!("pop3://jo@127.0.0.1:{port}"));
        assert!(conn.is_open());
    }

    #[test]
    fn unknown_service_falls_back_to_standard_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::new("127.0.0.1", "no-such-service", port, "pop3");
        let addrs = resolve_endpoint(&endpoint, &mut CancellationContext::default()).unwrap();
        assert_eq!(addrs, vec![SocketAddr::from(([127, 0, 0, 1], port))]);
    }

    #[test]
    fn refused_connection_is_a_connect_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = Endpoint::new("127.0.0.1", port.to_string(), 110, "pop3");
        let options = ConnectOptions {
            timeout: Some(Duration::from_secs(2)),
            ..ConnectOptions::default()
        };
        let err = connect(&endpoint, None, &options, CancellationContext::default()).unwrap_err();
        assert!(matches!(err, Error::Connect { .. }), "{err:?}");
    }

    #[test]
    fn connect_timeout_is_bounded() {
        // TEST-NET-1 is never routed; without any route the connect fails fast instead.
        let endpoint = Endpoint::new("192.0.2.1", "110", 110, "pop3");
        let options = ConnectOptions {
            timeout: Some(Duration::from_secs(1)),
            ..ConnectOptions::default()
        };
        let started = Instant::now();
        let result = connect(&endpoint, None, &options, CancellationContext::default());
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
        match result {
            Err(Error::Timeout(_)) => assert!(elapsed >= Duration::from_secs(1)),
            Err(Error::Connect { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn resolver_literal_addresses_skip_lookup() {
        let addrs = resolve("[::1]", 25, &mut CancellationContext::default()).unwrap();
        assert_eq!(addrs, vec!["[::1]:25".parse().unwrap()]);
    }

    #[test]
    fn socks_tunnel_to_destination() {
        use std::io::{Read, Write};
        let proxy = TcpListener::bind("127.0.0.1:0").unwrap();
        let proxy_port = proxy.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut s, _) = proxy.accept().unwrap();
            let mut greeting = [0u8; 3];
            s.read_exact(&mut greeting).unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            s.write_all(&[5, 0]).unwrap();
            let mut head = [0u8; 5];
            s.read_exact(&mut head).unwrap();
            let mut name = vec![0u8; head[4] as usize + 2];
            s.read_exact(&mut name).unwrap();
            s.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 110]).unwrap();
            s.write_all(b"+OK via proxy\r\n").unwrap();
            name
        });
        let endpoint = Endpoint::new("pop.example.org", "110", 110, "pop3");
        let options = ConnectOptions {
            timeout: Some(Duration::from_secs(5)),
            socks_proxy: Some(format!("socks5://127.0.0.1:{proxy_port}")),
            ..ConnectOptions::default()
        };
        let mut conn = connect(&endpoint, None, &options, CancellationContext::default()).unwrap();
        let mut line = super::super::LineBuffer::new();
        conn.read_line(&mut line).unwrap();
        assert_eq!(line.text(), "+OK via proxy");
        let name = server.join().unwrap();
        assert_eq!(&name[..name.len() - 2], b"pop.example.org");
        assert_eq!(&name[name.len() - 2..], &110u16.to_be_bytes());
    }
}
