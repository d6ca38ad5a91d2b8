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

//! In-process fake mail server for integration testing.
//!
//! Each test spawns one thread that accepts a single connection and runs a
//! script against it: read a command, check it, write a reply. Every line the
//! client sends is recorded, so the test can assert on the exact order of
//! commands after the session ends. `Peer::start_tls` switches the connection
//! to a rustls server session using the self-signed localhost certificate in
//! `tests/data`.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use postino_core::config::{Config, StartTls};
use postino_core::net::Endpoint;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};

enum PeerStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
    Gone,
}

impl Read for PeerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PeerStream::Plain(s) => s.read(buf),
            PeerStream::Tls(s) => s.read(buf),
            PeerStream::Gone => Ok(0),
        }
    }
}

impl Write for PeerStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            PeerStream::Plain(s) => s.write(buf),
            PeerStream::Tls(s) => s.write(buf),
            PeerStream::Gone => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PeerStream::Plain(s) => s.flush(),
            PeerStream::Tls(s) => s.flush(),
            PeerStream::Gone => Ok(()),
        }
    }
}

/// Server end of one test connection.
pub struct Peer {
    stream: PeerStream,
    /// Every line received, terminator stripped.
    pub transcript: Vec<String>,
}

impl Peer {
    /// Write `reply` followed by CRLF.
    pub fn send(&mut self, reply: &str) {
        self.stream.write_all(reply.as_bytes()).unwrap();
        self.stream.write_all(b"\r\n").unwrap();
        self.stream.flush().unwrap();
    }

    /// Next raw line including its terminator; None at EOF.
    pub fn recv_raw(&mut self) -> Option<Vec<u8>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => return (!line.is_empty()).then_some(line),
                Ok(_) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        return Some(line);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return None,
                Err(e) => panic!("fake server read failed: {e}"),
            }
        }
    }

    /// Next line, recorded in the transcript; None at EOF.
    pub fn recv(&mut self) -> Option<String> {
        let raw = self.recv_raw()?;
        let text = String::from_utf8_lossy(&raw)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.transcript.push(text.clone());
        Some(text)
    }

    /// Receive one line and check it equals `expected`.
    pub fn expect(&mut self, expected: &str) {
        let got = self.recv();
        assert_eq!(got.as_deref(), Some(expected));
    }

    /// Receive one line and check it starts with `prefix`; returns the line.
    pub fn expect_prefix(&mut self, prefix: &str) -> String {
        let got = self.recv().unwrap_or_default();
        assert!(got.starts_with(prefix), "expected {prefix:?}, got {got:?}");
        got
    }

    /// `expect` then `send`.
    pub fn reply(&mut self, expected: &str, reply: &str) {
        self.expect(expected);
        self.send(reply);
    }

    /// Raw DATA lines up to and including the terminating `.` line.
    pub fn recv_data(&mut self) -> Vec<u8> {
        let mut data = Vec::new();
        while let Some(line) = self.recv_raw() {
            data.extend_from_slice(&line);
            if line == b".\r\n" {
                break;
            }
        }
        data
    }

    /// Switch to TLS; the handshake runs on the next read.
    pub fn start_tls(&mut self) {
        let tcp = match std::mem::replace(&mut self.stream, PeerStream::Gone) {
            PeerStream::Plain(tcp) => tcp,
            _ => panic!("TLS already active"),
        };
        let conn = ServerConnection::new(server_config()).unwrap();
        self.stream = PeerStream::Tls(Box::new(StreamOwned::new(conn, tcp)));
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, PeerStream::Tls(_))
    }

    /// Close the connection now.
    pub fn hang_up(&mut self) {
        if let PeerStream::Plain(tcp) = &self.stream {
            let _ = tcp.shutdown(std::net::Shutdown::Both);
        }
        self.stream = PeerStream::Gone;
    }
}

fn server_config() -> Arc<ServerConfig> {
    let cert = CertificateDer::from(include_bytes!("../data/localhost.cert.der").to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        include_bytes!("../data/localhost.key.der").to_vec(),
    ));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    Arc::new(config)
}

/// Running fake server: its port and the thread returning the transcript.
pub struct FakeServer {
    pub port: u16,
    handle: JoinHandle<Vec<String>>,
}

impl FakeServer {
    /// Accept one connection and run `script` on it.
    pub fn spawn<F>(script: F) -> Self
    where
        F: FnOnce(&mut Peer) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            tcp.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            let mut peer = Peer {
                stream: PeerStream::Plain(tcp),
                transcript: Vec::new(),
            };
            script(&mut peer);
            peer.transcript
        });
        FakeServer { port, handle }
    }

    pub fn endpoint(&self, scheme: &str, default_port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1", self.port.to_string(), default_port, scheme)
    }

    /// Wait for the script to finish; panics in the script fail the test here.
    pub fn finish(self) -> Vec<String> {
        self.handle.join().expect("fake server script panicked")
    }
}

/// Plaintext, deterministic hostname, short timeouts.
pub fn test_config() -> Config {
    Config {
        starttls: StartTls::Never,
        hostname: Some("client.test".to_string()),
        connect_timeout_secs: 5,
        read_timeout_secs: 10,
        accept_invalid_certs: true,
        ..Config::default()
    }
}
