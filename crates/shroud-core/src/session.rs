//! Per-connection session lifecycle: setup → transfer → teardown.
//!
//! A session owns its descriptors, TLS engine, and child pid. Setup and
//! transfer propagate every failure to [`Session::run`], the single frame
//! that logs the outcome and performs ordered teardown — with linger-reset
//! on the sockets when the session ended in an error, so the peer sees RST
//! rather than a clean FIN.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use tracing::{debug, info};

use crate::addr::AddrList;
use crate::config::{Mode, RemoteTarget, ServiceOptions};
use crate::error::{EngineError, EngineResult};
use crate::fd::FdSlot;
use crate::headers::HeaderInjector;
use crate::ident;
use crate::net;
use crate::poll::{Poller, Wait};
use crate::spawn::{self, SpawnEnv};
use crate::tls::{Tls, TlsEngine, TlsIo};
use crate::transfer::{self, Channels, TransferParams, TransferStats};

pub struct Session {
    opt: Arc<ServiceOptions>,
    local_rfd: FdSlot,
    /// Distinct write descriptor for the stdio case; `None` means the
    /// plaintext side is one bidirectional descriptor.
    local_wfd: Option<FdSlot>,
    remote_fd: Option<FdSlot>,
    tls: Option<TlsEngine>,
    peer: Option<SocketAddr>,
    accepted: String,
    pid: Option<libc::pid_t>,
}

impl Session {
    /// Session over an accepted bidirectional stream.
    pub fn from_stream(opt: Arc<ServiceOptions>, stream: TcpStream) -> Self {
        Self::from_fds(opt, FdSlot::from_stream(stream), None)
    }

    /// Session over explicit read/write descriptors (stdio, spawned
    /// program, tests).
    pub fn from_fds(opt: Arc<ServiceOptions>, rfd: FdSlot, wfd: Option<FdSlot>) -> Self {
        Self {
            opt,
            local_rfd: rfd,
            local_wfd: wfd,
            remote_fd: None,
            tls: None,
            peer: None,
            accepted: String::new(),
            pid: None,
        }
    }

    /// Drive the whole connection. Always tears down; the result reports
    /// how the connection ended.
    pub fn run(mut self) -> EngineResult<TransferStats> {
        let result = self.do_client();
        match &result {
            Ok(stats) => info!(
                service = %self.opt.name,
                ssl_bytes = stats.ssl_bytes,
                sock_bytes = stats.sock_bytes,
                "connection closed"
            ),
            Err(err) => info!(service = %self.opt.name, %err, "connection reset"),
        }
        self.teardown(result.is_err());
        result
    }

    fn do_client(&mut self) -> EngineResult<TransferStats> {
        self.init_local()?;
        if self.opt.mode() == Mode::Server && self.opt.protocol.is_none() {
            // Handshake before touching the backend, so bad clients are
            // rejected without consuming backend resources.
            self.init_tls()?;
            self.init_remote()?;
        } else {
            self.init_remote()?;
            if let Some(hook) = self.opt.protocol.clone() {
                let remote = self
                    .remote_fd
                    .as_ref()
                    .ok_or(EngineError::Internal("negotiation without a remote"))?;
                hook.negotiate(remote.raw(), self.opt.mode(), self.opt.timeout_busy)?;
            }
            self.init_tls()?;
        }
        self.transfer()
    }

    /// Identify the accepted peer and apply socket options. A plaintext
    /// side that is not a socket (stdio piping) is tolerated unless
    /// transparent mode needs the peer's address.
    fn init_local(&mut self) -> EngineResult<()> {
        match net::peer_addr(self.local_rfd.raw()) {
            Ok(peer) => {
                self.peer = Some(peer);
                self.accepted = peer.to_string();
                net::set_socket_options(self.local_rfd.raw(), self.opt.nodelay, self.opt.keepalive)
                    .map_err(|e| EngineError::io("setsockopt (local)", e))?;
                self.local_rfd
                    .set_nonblocking()
                    .map_err(|e| EngineError::io("fcntl (local)", e))?;
                if let Some(user) = self.opt.username.clone() {
                    let local = net::local_addr(self.local_rfd.raw())
                        .map_err(|e| EngineError::io("getsockname", e))?;
                    ident::verify(peer, local, &user, self.opt.ident_port, self.opt.timeout_busy)?;
                }
                info!(service = %self.opt.name, peer = %self.accepted, "accepted connection");
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOTSOCK) && !self.opt.transparent => {
                self.accepted = "NOT A SOCKET".into();
                self.local_rfd.mark_not_socket();
                self.local_rfd
                    .set_nonblocking()
                    .map_err(|e| EngineError::io("fcntl (local)", e))?;
            }
            Err(e) => return Err(EngineError::io("getpeername", e)),
        }
        // The write descriptor, when distinct, gets its own socket check:
        // a socket read side does not imply a socket write side.
        if let Some(wfd) = &mut self.local_wfd {
            if net::peer_addr(wfd.raw())
                .err()
                .and_then(|e| e.raw_os_error())
                == Some(libc::ENOTSOCK)
            {
                wfd.mark_not_socket();
            }
            wfd.set_nonblocking()
                .map_err(|e| EngineError::io("fcntl (local write)", e))?;
        }
        Ok(())
    }

    /// Open the other side of the relay: an outbound connection, or a
    /// spawned program piped through a socket pair.
    fn init_remote(&mut self) -> EngineResult<()> {
        let bind = if let Some(src) = self.opt.source {
            Some(src)
        } else if self.opt.transparent {
            self.peer
        } else {
            None
        };

        let slot = match &self.opt.remote {
            Some(RemoteTarget::Resolved(list)) => net::connect_remote(
                &self.opt.name,
                list,
                self.opt.failover,
                bind,
                self.opt.transparent,
                self.opt.timeout_busy,
            )?,
            Some(RemoteTarget::Delayed(host)) => {
                let list = AddrList::resolve(host)
                    .map_err(|e| EngineError::io("resolve (delayed)", e))?;
                net::connect_remote(
                    &self.opt.name,
                    &list,
                    self.opt.failover,
                    bind,
                    self.opt.transparent,
                    self.opt.timeout_busy,
                )?
            }
            None => self.connect_local()?,
        };
        if slot.is_socket() {
            net::set_socket_options(slot.raw(), self.opt.nodelay, self.opt.keepalive)
                .map_err(|e| EngineError::io("setsockopt (remote)", e))?;
        }
        slot.set_nonblocking()
            .map_err(|e| EngineError::io("fcntl (remote)", e))?;
        debug!(fd = slot.raw(), "remote descriptor initialized");
        self.remote_fd = Some(slot);
        Ok(())
    }

    /// Spawn the configured program and return the parent's end of its
    /// stdio channel.
    fn connect_local(&mut self) -> EngineResult<FdSlot> {
        let exec = self
            .opt
            .exec
            .as_ref()
            .ok_or(EngineError::Internal("service has neither remote nor exec"))?;

        let (client_dn, client_issuer_dn) = match self
            .tls
            .as_ref()
            .and_then(|tls| tls.peer_certificate())
            .as_deref()
            .and_then(spawn::certificate_names)
        {
            Some((subject, issuer)) => (Some(subject), Some(issuer)),
            None => (None, None),
        };

        let env = SpawnEnv {
            peer_host: self
                .peer
                .map(|p| p.ip().to_string())
                .unwrap_or_else(|| self.accepted.clone()),
            preload: if self.opt.transparent {
                self.opt.preload_library.clone()
            } else {
                None
            },
            client_dn,
            client_issuer_dn,
        };
        let child = spawn::spawn_program(exec, self.opt.pty, &env, !self.opt.foreground)?;
        self.pid = Some(child.pid);
        Ok(child.fd)
    }

    /// Create the TLS engine on the TLS-side descriptors and complete the
    /// handshake, parking on the poller between steps.
    fn init_tls(&mut self) -> EngineResult<()> {
        let (rfd, wfd) = match self.opt.mode() {
            Mode::Client => {
                let remote = self
                    .remote_fd
                    .as_ref()
                    .ok_or(EngineError::Internal("client handshake without a remote"))?;
                (remote.raw(), remote.raw())
            }
            Mode::Server => (
                self.local_rfd.raw(),
                self.local_wfd
                    .as_ref()
                    .map_or(self.local_rfd.raw(), |w| w.raw()),
            ),
        };

        let mut engine = TlsEngine::new(&self.opt.tls, rfd, wfd)?;
        loop {
            match engine.handshake() {
                TlsIo::Done(_) => break,
                TlsIo::WantRead => self.park(rfd, true)?,
                TlsIo::WantWrite => self.park(wfd, false)?,
                TlsIo::Eof | TlsIo::ZeroReturn => {
                    return Err(EngineError::io(
                        "TLS handshake",
                        std::io::ErrorKind::UnexpectedEof.into(),
                    ));
                }
                TlsIo::Syscall(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                    ) => {}
                TlsIo::Syscall(e) => return Err(EngineError::io("TLS handshake", e)),
                TlsIo::Fault(e) => return Err(EngineError::Tls(e)),
            }
        }

        if engine.resumed() {
            info!(service = %self.opt.name, "previous TLS session reused");
        } else {
            info!(service = %self.opt.name, "new TLS session negotiated");
            if let Some(cipher) = engine.cipher() {
                info!(service = %self.opt.name, %cipher, version = engine.version(), "negotiated parameters");
            }
        }
        self.tls = Some(engine);
        Ok(())
    }

    /// Park on one descriptor until it is ready for the handshake's next
    /// step, bounded by `timeout_busy`.
    fn park(&self, fd: std::os::fd::RawFd, want_read: bool) -> EngineResult<()> {
        let mut poller = Poller::new();
        poller.add(fd, want_read, !want_read);
        match poller
            .wait(self.opt.timeout_busy)
            .map_err(|e| EngineError::io("poll (handshake)", e))?
        {
            Wait::Timeout => Err(EngineError::Timeout { op: "TLS handshake" }),
            Wait::Ready(_) => {
                if let Some(err) = poller.error(fd) {
                    Err(EngineError::io("TLS handshake", err))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn transfer(&mut self) -> EngineResult<TransferStats> {
        let remote = self
            .remote_fd
            .as_ref()
            .ok_or(EngineError::Internal("transfer without a remote"))?;
        let local_wfd = self.local_wfd.as_ref().unwrap_or(&self.local_rfd);
        let ch = match self.opt.mode() {
            Mode::Client => Channels {
                sock_rfd: &self.local_rfd,
                sock_wfd: local_wfd,
                ssl_rfd: remote,
                ssl_wfd: remote,
            },
            Mode::Server => Channels {
                sock_rfd: remote,
                sock_wfd: remote,
                ssl_rfd: &self.local_rfd,
                ssl_wfd: local_wfd,
            },
        };

        let injector = if self.opt.xforwardedfor && self.opt.mode() == Mode::Server {
            self.peer.map(|p| HeaderInjector::new(p.ip()))
        } else {
            None
        };
        let params = TransferParams {
            timeout_idle: self.opt.timeout_idle,
            timeout_close: self.opt.timeout_close,
            injector,
        };
        let tls = self
            .tls
            .as_mut()
            .ok_or(EngineError::Internal("transfer without a TLS engine"))?;
        transfer::run(tls, &ch, params)
    }

    /// Ordered teardown: TLS engine, TLS-side socket, plaintext side.
    /// On a reset-class ending, sockets linger-reset so close sends RST.
    fn teardown(&mut self, reset: bool) {
        if let Some(mut tls) = self.tls.take() {
            // Suppress any further alert traffic from the engine.
            tls.mark_closed();
        }
        if let Some(remote) = self.remote_fd.take() {
            if reset && remote.is_socket() {
                net::linger_reset(remote.raw());
            }
        }
        if let Some(wfd) = self.local_wfd.take() {
            if reset && wfd.is_socket() {
                net::linger_reset(wfd.raw());
            }
        }
        if reset && self.local_rfd.is_socket() {
            net::linger_reset(self.local_rfd.raw());
        }
        if let Some(pid) = self.pid.take() {
            match spawn::reap_nonblocking(pid) {
                Some(status) => debug!(pid, status, "child exited"),
                None => debug!(pid, "child still running at session end"),
            }
        }
    }
}
