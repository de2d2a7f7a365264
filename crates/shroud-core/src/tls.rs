//! TLS engine — a thin contract over `rustls` presenting the stream-style
//! interface the transfer loop is written against.
//!
//! `rustls` is sans-IO: it never touches the sockets itself. The engine
//! owns the descriptor pair, pumps TLS records between the sockets and the
//! `rustls::Connection`, and translates the outcomes into the code set the
//! state machine dispatches on: bytes moved, want-read, want-write, clean
//! close (`close_notify`), transport EOF without `close_notify`, transport
//! error, or protocol fault.
//!
//! One consequence of sans-IO is that a successful `write` can leave
//! encrypted records queued when the transport is full; [`Tls::wants_flush`]
//! reports that residue so the loop can keep write interest registered and
//! drain it with [`Tls::flush`].

use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::sync::Mutex;

use rustls::client::{ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, Connection, HandshakeKind, NamedGroup, ProtocolVersion, ServerConnection};

use crate::config::TlsContext;
use crate::error::EngineResult;
use crate::fd::FdIo;

/// Version string for the SSLv2 special case in the half-close logic.
/// `rustls` can never negotiate it; the branch is kept because the close
/// semantics differ and the constant documents why.
pub const SSLV2: &str = "SSLv2";

/// Outcome of a TLS operation, mirroring the error classes the transfer
/// loop distinguishes.
#[derive(Debug)]
pub enum TlsIo {
    /// The operation moved this many bytes of plaintext (or completed,
    /// for handshake/shutdown).
    Done(usize),
    /// Progress requires the TLS-side descriptor to become readable.
    WantRead,
    /// Progress requires the TLS-side descriptor to become writable.
    WantWrite,
    /// The peer closed the TLS session cleanly with `close_notify`.
    ZeroReturn,
    /// Transport EOF without `close_notify` (buggy peer or truncation).
    Eof,
    /// Transport-level I/O error; `EINTR`/`EAGAIN` are retried by the
    /// caller, anything else unwinds.
    Syscall(io::Error),
    /// TLS protocol fault; always unwinds.
    Fault(rustls::Error),
}

/// The contract the transfer loop requires from a TLS implementation.
/// The production implementation is [`TlsEngine`]; tests substitute stubs
/// to exercise pathological library behavior.
pub trait Tls {
    fn read(&mut self, buf: &mut [u8]) -> TlsIo;
    fn write(&mut self, buf: &[u8]) -> TlsIo;
    /// Drain queued TLS records without submitting new plaintext.
    fn flush(&mut self) -> TlsIo;
    /// Initiate or continue the `close_notify` exchange.
    fn shutdown(&mut self) -> TlsIo;
    /// Decrypted bytes are buffered and readable without socket I/O.
    fn pending(&self) -> bool;
    /// Encrypted records are queued and waiting for a writable socket.
    fn wants_flush(&self) -> bool;
    fn version(&self) -> &'static str;
    /// Record that both directions are finished so teardown stays quiet.
    fn mark_closed(&mut self);
}

enum Pull {
    Progress,
    WouldBlock,
    Err(io::Error),
    Fault(rustls::Error),
}

/// Production TLS engine bound to a read/write descriptor pair. The two
/// descriptors are equal for sockets and may differ for stdio piping.
pub struct TlsEngine {
    conn: Connection,
    rfd: RawFd,
    wfd: RawFd,
    /// Decrypted-but-undelivered byte count after the last record pump.
    plaintext: usize,
    /// Transport EOF observed on the read side.
    eof: bool,
    shutdown_sent: bool,
    closed: bool,
}

impl TlsEngine {
    /// Create an engine for the service's configured context, bound to the
    /// TLS-side descriptors.
    pub fn new(ctx: &TlsContext, rfd: RawFd, wfd: RawFd) -> EngineResult<Self> {
        let conn: Connection = match ctx {
            TlsContext::Client {
                config,
                server_name,
            } => ClientConnection::new(config.clone(), server_name.clone())?.into(),
            TlsContext::Server { config } => ServerConnection::new(config.clone())?.into(),
        };
        Ok(Self {
            conn,
            rfd,
            wfd,
            plaintext: 0,
            eof: false,
            shutdown_sent: false,
            closed: false,
        })
    }

    /// Drive one step of the handshake. `WantRead`/`WantWrite` ask the
    /// caller to park on the corresponding readiness and call again.
    pub fn handshake(&mut self) -> TlsIo {
        loop {
            if self.conn.wants_write() {
                match self.flush_records() {
                    TlsIo::Done(_) => {}
                    other => return other,
                }
            }
            if !self.conn.is_handshaking() {
                return TlsIo::Done(0);
            }
            match self.pull_records() {
                Pull::Progress => {
                    if self.eof {
                        return TlsIo::Eof;
                    }
                }
                Pull::WouldBlock => return TlsIo::WantRead,
                Pull::Err(e) => return TlsIo::Syscall(e),
                Pull::Fault(e) => return TlsIo::Fault(e),
            }
        }
    }

    /// Whether the completed handshake resumed a previous session.
    pub fn resumed(&self) -> bool {
        self.conn.handshake_kind() == Some(HandshakeKind::Resumed)
    }

    /// Negotiated ciphersuite, for the post-handshake log line.
    pub fn cipher(&self) -> Option<String> {
        self.conn
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
    }

    /// DER of the peer's end-entity certificate, when one was presented.
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|c| c.as_ref().to_vec())
    }

    /// Pump received records into the connection and process them.
    fn pull_records(&mut self) -> Pull {
        match self.conn.read_tls(&mut FdIo(self.rfd)) {
            Ok(0) => self.eof = true,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Pull::WouldBlock,
            Err(e) => return Pull::Err(e),
        }
        match self.conn.process_new_packets() {
            Ok(state) => {
                self.plaintext = state.plaintext_bytes_to_read();
                Pull::Progress
            }
            Err(e) => {
                // Push out the alert rustls queued for the fault.
                let _ = self.conn.write_tls(&mut FdIo(self.wfd));
                Pull::Fault(e)
            }
        }
    }

    fn flush_records(&mut self) -> TlsIo {
        let mut total = 0;
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut FdIo(self.wfd)) {
                Ok(0) => return TlsIo::WantWrite,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return TlsIo::WantWrite,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return TlsIo::Syscall(e),
            }
        }
        TlsIo::Done(total)
    }
}

impl Tls for TlsEngine {
    fn read(&mut self, buf: &mut [u8]) -> TlsIo {
        // Handshake traffic (key updates, renegotiation answers) may be
        // queued; it must reach the wire for the peer to send more data.
        if self.conn.wants_write() {
            match self.flush_records() {
                TlsIo::Done(_) => {}
                TlsIo::WantWrite if self.plaintext > 0 => {} // deliver what we have
                other => return other,
            }
        }
        if self.plaintext == 0 && !self.eof {
            match self.pull_records() {
                Pull::Progress => {}
                Pull::WouldBlock => return TlsIo::WantRead,
                Pull::Err(e) => return TlsIo::Syscall(e),
                Pull::Fault(e) => return TlsIo::Fault(e),
            }
        }
        match self.conn.reader().read(buf) {
            Ok(0) => TlsIo::ZeroReturn,
            Ok(n) => {
                self.plaintext = self.plaintext.saturating_sub(n);
                TlsIo::Done(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if self.eof {
                    TlsIo::Eof
                } else {
                    TlsIo::WantRead
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => TlsIo::Eof,
            Err(e) => TlsIo::Syscall(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> TlsIo {
        // Refuse new plaintext while previously queued records cannot
        // reach the transport, so the caller's buffer accounting holds.
        if self.conn.wants_write() {
            match self.flush_records() {
                TlsIo::Done(_) => {}
                other => return other,
            }
        }
        let n = match self.conn.writer().write(buf) {
            Ok(0) if !buf.is_empty() => return TlsIo::WantWrite,
            Ok(n) => n,
            Err(e) => return TlsIo::Syscall(e),
        };
        match self.flush_records() {
            // Residue stays queued; wants_flush() keeps write interest on.
            TlsIo::Done(_) | TlsIo::WantWrite => TlsIo::Done(n),
            other => other,
        }
    }

    fn flush(&mut self) -> TlsIo {
        self.flush_records()
    }

    fn shutdown(&mut self) -> TlsIo {
        if self.closed {
            // The close already happened at the socket level.
            return TlsIo::Done(0);
        }
        if !self.shutdown_sent {
            self.conn.send_close_notify();
            self.shutdown_sent = true;
        }
        match self.flush_records() {
            TlsIo::Done(_) => TlsIo::Done(0),
            other => other,
        }
    }

    fn pending(&self) -> bool {
        self.plaintext > 0
    }

    fn wants_flush(&self) -> bool {
        self.conn.wants_write()
    }

    fn version(&self) -> &'static str {
        match self.conn.protocol_version() {
            Some(ProtocolVersion::SSLv2) => SSLV2,
            Some(ProtocolVersion::SSLv3) => "SSLv3",
            Some(ProtocolVersion::TLSv1_0) => "TLSv1",
            Some(ProtocolVersion::TLSv1_1) => "TLSv1.1",
            Some(ProtocolVersion::TLSv1_2) => "TLSv1.2",
            Some(ProtocolVersion::TLSv1_3) => "TLSv1.3",
            _ => "unknown",
        }
    }

    fn mark_closed(&mut self) {
        // rustls sends nothing on drop, so this is bookkeeping only: it
        // records that the close was already handled at the socket level.
        self.closed = true;
        self.shutdown_sent = true;
    }
}

// ── single-slot session store ────────────────────────────────────────

/// Client session storage holding at most one resumption handle per
/// service, the way the engine's session cache policy demands. Installing
/// a new session releases the previous one; TLS 1.3 tickets are single
/// use and are consumed by `take`.
#[derive(Default)]
pub struct SessionSlot {
    kx_hint: Mutex<Option<NamedGroup>>,
    tls12: Mutex<Option<Tls12ClientSessionValue>>,
    tls13: Mutex<Option<Tls13ClientSessionValue>>,
}

impl std::fmt::Debug for SessionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSlot").finish_non_exhaustive()
    }
}

impl ClientSessionStore for SessionSlot {
    fn set_kx_hint(&self, _server_name: ServerName<'static>, group: NamedGroup) {
        *self.kx_hint.lock().expect("session slot lock") = Some(group);
    }

    fn kx_hint(&self, _server_name: &ServerName<'_>) -> Option<NamedGroup> {
        *self.kx_hint.lock().expect("session slot lock")
    }

    fn set_tls12_session(&self, _server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        *self.tls12.lock().expect("session slot lock") = Some(value);
    }

    fn tls12_session(&self, _server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        self.tls12.lock().expect("session slot lock").clone()
    }

    fn remove_tls12_session(&self, _server_name: &ServerName<'_>) {
        self.tls12.lock().expect("session slot lock").take();
    }

    fn insert_tls13_ticket(&self, _server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        *self.tls13.lock().expect("session slot lock") = Some(value);
    }

    fn take_tls13_ticket(&self, _server_name: &ServerName<'_>) -> Option<Tls13ClientSessionValue> {
        self.tls13.lock().expect("session slot lock").take()
    }
}
