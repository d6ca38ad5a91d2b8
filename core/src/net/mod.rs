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

//! Buffered line transport over plain TCP or TLS.
//!
//! A `Connection` carries either a plain TCP stream or a TLS session over
//! it: implicit TLS upgrades right after connect, STARTTLS upgrades the same
//! socket after protocol negotiation. Reads go
//! through a fixed raw buffer that is refilled with one read call at a time
//! and scanned into a caller-owned `LineBuffer`. Writes can be coalesced.
//! Any I/O error puts the connection into a sticky failed state.

pub mod cancel;
pub mod connector;
pub mod socks;
pub mod tls;

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use rustls::{ClientConnection, StreamOwned};
use tracing::{debug, error};

use crate::error::{Error, Result};
use cancel::CancellationContext;
use tls::TlsOptions;

pub use cancel::{CancelHandle, Interrupt, SignalGuard};
pub use connector::{connect, ConnectOptions, Endpoint};

/// Size of the raw read buffer filled by one read call.
pub const READ_CHUNK: usize = 4096;
/// Buffered writes are flushed once this many bytes are pending.
pub const WRITE_CHUNK: usize = 4096;
/// Line buffers grow in steps of this many bytes.
const LINE_GROWTH: usize = 1024;
/// Socket read timeout; blocked reads wake up this often to look at the cancellation context.
const POLL_SLICE: Duration = Duration::from_secs(1);

/// Growable, length-tracked line buffer. Holds one line including its terminator.
#[derive(Debug, Default, Clone)]
pub struct LineBuffer {
    buf: Vec<u8>,
    len: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated size; always a multiple of the growth step.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The whole line, terminator included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The line without its trailing CRLF or LF.
    pub fn trimmed(&self) -> &[u8] {
        let line = self.as_bytes();
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        line.strip_suffix(b"\r").unwrap_or(line)
    }

    /// Trimmed line as text (lossy).
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.trimmed())
    }

    pub fn ends_with_newline(&self) -> bool {
        self.as_bytes().last() == Some(&b'\n')
    }

    fn append(&mut self, bytes: &[u8]) {
        let needed = self.len + bytes.len();
        if needed > self.buf.len() {
            let steps = needed.div_ceil(LINE_GROWTH);
            self.buf.resize(steps * LINE_GROWTH, 0);
        }
        self.buf[self.len..needed].copy_from_slice(bytes);
        self.len = needed;
    }
}

/// Socket for a connection: plain TCP or TLS.
enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
    Closed,
}

impl Stream {
    fn tcp(&self) -> Option<&TcpStream> {
        match self {
            Stream::Plain(s) => Some(s),
            Stream::Tls(s) => Some(s.get_ref()),
            Stream::Closed => None,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => match s.read(buf) {
                // Peers that drop the socket without close_notify.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
                other => other,
            },
            Stream::Closed => Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed")),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
            Stream::Closed => Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
            Stream::Closed => Ok(()),
        }
    }
}

type OnClose = Box<dyn FnOnce(&str) + Send>;

/// One connection to a mail server (or through a proxy to one).
pub struct Connection {
    stream: Stream,
    raw: Box<[u8; READ_CHUNK]>,
    raw_pos: usize,
    raw_len: usize,
    write_buf: Vec<u8>,
    description: String,
    on_close: Option<OnClose>,
    failed: bool,
    eof: bool,
    read_timeout: Option<Duration>,
    cancel: CancellationContext,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("description", &self.description)
            .field("tls", &self.is_tls())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    /// Wrap a connected socket. `description` names the peer in diagnostics.
    pub fn new(tcp: TcpStream, description: impl Into<String>, cancel: CancellationContext) -> Self {
        if let Err(e) = tcp.set_read_timeout(Some(POLL_SLICE)) {
            debug!("could not set socket read timeout: {}", e);
        }
        let _ = tcp.set_nodelay(true);
        Self {
            stream: Stream::Plain(tcp),
            raw: Box::new([0u8; READ_CHUNK]),
            raw_pos: 0,
            raw_len: 0,
            write_buf: Vec::with_capacity(WRITE_CHUNK),
            description: description.into(),
            on_close: None,
            failed: false,
            eof: false,
            read_timeout: None,
            cancel,
        }
    }

    /// Give up on a silent peer after `timeout` (None waits forever).
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Called once with the description when the connection closes.
    pub fn set_on_close(&mut self, f: impl FnOnce(&str) + Send + 'static) {
        self.on_close = Some(Box::new(f));
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, Stream::Tls(_))
    }

    /// Open and not failed.
    pub fn is_open(&self) -> bool {
        !self.failed && !matches!(self.stream, Stream::Closed)
    }

    /// Peer closed its side; reads return 0 once buffered data is used up.
    pub fn at_eof(&self) -> bool {
        self.eof && self.raw_pos == self.raw_len
    }

    pub fn cancellation(&mut self) -> &mut CancellationContext {
        &mut self.cancel
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    /// Flush pending buffered bytes, then write `buf` directly.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.flush()?;
        self.write_raw(buf)?;
        self.flush_stream()
    }

    /// Coalesce `buf` into the write buffer, flushing whenever a chunk fills up.
    pub fn write_buffered(&mut self, buf: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        if self.write_buf.len() + buf.len() > WRITE_CHUNK {
            self.flush_pending()?;
        }
        if buf.len() >= WRITE_CHUNK {
            self.write_raw(buf)
        } else {
            self.write_buf.extend_from_slice(buf);
            Ok(())
        }
    }

    /// Send everything buffered so far.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_pending()?;
        self.flush_stream()
    }

    /// `line` + CRLF, flushed.
    pub fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.write_buffered(line)?;
        self.write_buffered(b"\r\n")?;
        self.flush()
    }

    fn flush_pending(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let pending = mem::take(&mut self.write_buf);
        let result = self.write_raw(&pending);
        self.write_buf = pending;
        self.write_buf.clear();
        result
    }

    fn flush_stream(&mut self) -> Result<()> {
        self.ensure_usable()?;
        loop {
            match self.stream.flush() {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => self.checkpoint()?,
                Err(e) => return Err(self.write_failed(e)),
            }
        }
    }

    fn write_raw(&mut self, mut buf: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => {
                    let e = io::Error::new(io::ErrorKind::WriteZero, "short write");
                    return Err(self.write_failed(e));
                }
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => self.checkpoint()?,
                Err(e) => return Err(self.write_failed(e)),
            }
        }
        Ok(())
    }

    fn write_failed(&mut self, e: io::Error) -> Error {
        error!("write to {} failed: {}", self.description, e);
        self.fail();
        Error::Io(e)
    }

    /// Hard interrupt closes the connection.
    fn checkpoint(&mut self) -> Result<()> {
        if let Err(e) = self.cancel.check() {
            debug!("{}: aborted by interrupt", self.description);
            self.fail();
            return Err(e);
        }
        Ok(())
    }

    /// One read call into the raw buffer. Returns 0 on EOF.
    fn fill(&mut self) -> Result<usize> {
        let deadline = self.read_timeout.map(|t| Instant::now() + t);
        loop {
            match self.stream.read(&mut self.raw[..]) {
                Ok(n) => {
                    self.raw_pos = 0;
                    self.raw_len = n;
                    if n == 0 {
                        self.eof = true;
                    }
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => self.checkpoint()?,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    self.checkpoint()?;
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        error!("{}: no response from server", self.description);
                        self.fail();
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "no response from server",
                        )));
                    }
                }
                Err(e) => {
                    error!("read from {} failed: {}", self.description, e);
                    self.fail();
                    return Err(Error::Io(e));
                }
            }
        }
    }

    /// Read one line (terminator included) into `line`.
    ///
    /// Returns the line length, or 0 at end of stream. A final unterminated
    /// line is returned as is.
    pub fn read_line(&mut self, line: &mut LineBuffer) -> Result<usize> {
        self.ensure_usable()?;
        line.clear();
        loop {
            if self.raw_pos == self.raw_len {
                if self.eof || self.fill()? == 0 {
                    return Ok(line.len());
                }
            }
            let available = &self.raw[self.raw_pos..self.raw_len];
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    line.append(&available[..=i]);
                    self.raw_pos += i + 1;
                    return Ok(line.len());
                }
                None => {
                    line.append(available);
                    self.raw_pos = self.raw_len;
                }
            }
        }
    }

    /// Upgrade this connection to TLS in place.
    ///
    /// On failure the socket is closed and the connection stays failed.
    pub fn start_tls(&mut self, host: &str, options: &TlsOptions) -> Result<()> {
        self.ensure_usable()?;
        if self.raw_pos != self.raw_len {
            error!("{}: plaintext received before TLS handshake", self.description);
            self.fail();
            return Err(Error::Tls("unexpected plaintext before TLS handshake".to_string()));
        }
        self.flush()?;
        let mut tcp = match mem::replace(&mut self.stream, Stream::Closed) {
            Stream::Plain(tcp) => tcp,
            other => {
                self.stream = other;
                return Err(Error::Tls("TLS already active".to_string()));
            }
        };
        let mut session = match tls::client_session(host, options) {
            Ok(s) => s,
            Err(e) => {
                let _ = tcp.shutdown(Shutdown::Both);
                self.fail();
                return Err(e);
            }
        };
        let deadline = self.read_timeout.map(|t| Instant::now() + t);
        while session.is_handshaking() {
            match session.complete_io(&mut tcp) {
                Ok(_) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                    ) =>
                {
                    let timed_out = deadline.is_some_and(|d| Instant::now() >= d);
                    if self.cancel.check().is_err() || timed_out {
                        let _ = tcp.shutdown(Shutdown::Both);
                        self.fail();
                        return Err(if timed_out {
                            Error::Tls("handshake timed out".to_string())
                        } else {
                            Error::Cancelled
                        });
                    }
                }
                Err(e) => {
                    error!("TLS handshake with {} failed: {}", self.description, e);
                    let _ = tcp.shutdown(Shutdown::Both);
                    self.fail();
                    return Err(Error::Tls(e.to_string()));
                }
            }
        }
        debug!(
            "{}: TLS established ({:?})",
            self.description,
            session.negotiated_cipher_suite().map(|s| s.suite())
        );
        self.stream = Stream::Tls(Box::new(StreamOwned::new(session, tcp)));
        self.eof = false;
        Ok(())
    }

    /// Mark failed and drop the socket without a TLS goodbye.
    fn fail(&mut self) {
        self.failed = true;
        if let Some(tcp) = self.stream.tcp() {
            let _ = tcp.shutdown(Shutdown::Both);
        }
        self.stream = Stream::Closed;
        self.write_buf.clear();
        self.notify_closed();
    }

    fn notify_closed(&mut self) {
        if let Some(f) = self.on_close.take() {
            f(&self.description);
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&mut self) {
        match mem::replace(&mut self.stream, Stream::Closed) {
            Stream::Closed => {}
            Stream::Plain(tcp) => {
                let _ = tcp.shutdown(Shutdown::Both);
            }
            Stream::Tls(mut tls) => {
                tls.conn.send_close_notify();
                let _ = tls.conn.complete_io(&mut tls.sock);
                let _ = tls.sock.shutdown(Shutdown::Both);
            }
        }
        self.write_buf.clear();
        self.raw_pos = 0;
        self.raw_len = 0;
        self.notify_closed();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Connection::new(client, "test", CancellationContext::default()), server)
    }

    #[test]
    fn line_buffer_grows_in_steps() {
        let mut line = LineBuffer::new();
        line.append(&[b'x'; 10]);
        assert_eq!(line.capacity(), LINE_GROWTH);
        line.append(&[b'y'; LINE_GROWTH]);
        assert_eq!(line.capacity(), 2 * LINE_GROWTH);
        assert_eq!(line.len(), LINE_GROWTH + 10);
    }

    #[test]
    fn trimmed_strips_crlf_and_lf() {
        let mut line = LineBuffer::new();
        line.append(b"+OK hi\r\n");
        assert_eq!(line.trimmed(), b"+OK hi");
        line.clear();
        line.append(b"bare\n");
        assert_eq!(line.text(), "bare");
    }

    #[test]
    fn reads_lines_across_refills() {
        let (mut conn, mut server) = pair();
        let long = vec![b'a'; READ_CHUNK * 2 + 17];
        let writer = thread::spawn(move || {
            server.write_all(b"first\r\n").unwrap();
            server.write_all(&long).unwrap();
            server.write_all(b"\r\nlast").unwrap();
        });
        let mut line = LineBuffer::new();
        assert_eq!(conn.read_line(&mut line).unwrap(), 7);
        assert_eq!(line.trimmed(), b"first");
        let n = conn.read_line(&mut line).unwrap();
        assert_eq!(n, READ_CHUNK * 2 + 17 + 2);
        assert!(line.trimmed().iter().all(|&b| b == b'a'));
        writer.join().unwrap();
        assert_eq!(conn.read_line(&mut line).unwrap(), 4);
        assert!(!line.ends_with_newline());
        assert_eq!(conn.read_line(&mut line).unwrap(), 0);
        assert!(conn.at_eof());
    }

    #[test]
    fn buffered_writes_coalesce_until_flush() {
        let (mut conn, mut server) = pair();
        conn.write_buffered(b"NOOP").unwrap();
        conn.write_buffered(b"\r\n").unwrap();
        conn.flush().unwrap();
        conn.write_line(b"QUIT").unwrap();
        conn.close();
        let mut got = Vec::new();
        server.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"NOOP\r\nQUIT\r\n");
    }

    #[test]
    fn large_buffered_write_is_sent_whole() {
        let (mut conn, mut server) = pair();
        let big = vec![b'z'; WRITE_CHUNK * 3];
        let reader = thread::spawn(move || {
            let mut got = Vec::new();
            server.read_to_end(&mut got).unwrap();
            got
        });
        conn.write_buffered(b"head").unwrap();
        conn.write_buffered(&big).unwrap();
        conn.flush().unwrap();
        conn.close();
        let got = reader.join().unwrap();
        assert_eq!(got.len(), 4 + WRITE_CHUNK * 3);
        assert!(got.starts_with(b"headzzz"));
    }

    #[test]
    fn failure_is_sticky_and_close_notifies_once() {
        let (mut conn, server) = pair();
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        conn.set_on_close(move |_| {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });
        drop(server);
        conn.read_timeout = Some(Duration::from_millis(10));
        let mut line = LineBuffer::new();
        assert_eq!(conn.read_line(&mut line).unwrap(), 0);
        conn.fail();
        assert!(closed.load(Ordering::SeqCst));
        assert!(matches!(conn.read_line(&mut line), Err(Error::Closed)));
        assert!(matches!(conn.write_line(b"NOOP"), Err(Error::Closed)));
        conn.close();
    }

    #[test]
    fn silent_peer_times_out() {
        let (mut conn, _server) = pair();
        conn.set_read_timeout(Some(Duration::from_millis(200)));
        let mut line = LineBuffer::new();
        let err = conn.read_line(&mut line).unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::TimedOut));
        assert!(!conn.is_open());
    }

    #[test]
    fn hard_interrupt_aborts_blocked_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();
        let handle = CancelHandle::new();
        let mut conn = Connection::new(client, "test", CancellationContext::new(handle.clone(), false));
        handle.cancel();
        let mut line = LineBuffer::new();
        assert!(matches!(conn.read_line(&mut line), Err(Error::Cancelled)));
        assert!(!conn.is_open());
    }

    #[test]
    fn start_tls_refuses_pending_plaintext() {
        let (mut conn, mut server) = pair();
        server.write_all(b"+OK\r\ninjected\r\n").unwrap();
        let mut line = LineBuffer::new();
        conn.read_line(&mut line).unwrap();
        let err = conn.start_tls("localhost", &TlsOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
        assert!(!conn.is_open());
    }

    #[test]
    fn failed_handshake_leaves_connection_closed() {
        let (mut conn, mut server) = pair();
        let peer = thread::spawn(move || {
            let mut hello = [0u8; 5];
            let _ = server.read_exact(&mut hello);
            let _ = server.write_all(b"-ERR not a TLS server\r\n");
        });
        let err = conn.start_tls("localhost", &TlsOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
        assert!(!conn.is_open());
        assert!(!conn.is_tls());
        assert!(matches!(conn.write_line(b"QUIT"), Err(Error::Closed)));
        peer.join().unwrap();
    }
}
