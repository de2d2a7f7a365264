//! The transfer state machine.
//!
//! Four logical channels — socket-read, socket-write, TLS-read, TLS-write —
//! are multiplexed over up to four descriptors (usually two: the TLS side
//! shares one socket for both directions). Each channel has its own
//! open/closed flag, and the TLS channels carry cross-wants: a TLS read may
//! require the socket to become writable (renegotiation sends data) and a
//! TLS write may require it to become readable. A naive read-here/write-
//! there loop deadlocks on those events; this loop registers interest from
//! the want flags alone, blocks in exactly one place, and propagates
//! half-closes in both directions until the `close_notify` exchange is
//! drained or a timeout/watchdog gives up.

use std::io;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::BUFFSIZE;
use crate::error::{EngineError, EngineResult};
use crate::fd::{self, FdSlot, Shut};
use crate::headers::HeaderInjector;
use crate::poll::{Poller, Wait};
use crate::tls::{SSLV2, Tls, TlsIo};

/// No-progress iterations tolerated before the loop assumes the TLS
/// library is misbehaving and dumps state.
const WATCHDOG_LIMIT: u32 = 100;

/// The four descriptors the loop drives. `sock_*` is the plaintext side,
/// `ssl_*` the TLS side; read and write descriptors are equal except when
/// piping stdio.
pub struct Channels<'a> {
    pub sock_rfd: &'a FdSlot,
    pub sock_wfd: &'a FdSlot,
    pub ssl_rfd: &'a FdSlot,
    pub ssl_wfd: &'a FdSlot,
}

/// Byte counters reported at session end.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Bytes delivered to the plaintext side.
    pub sock_bytes: u64,
    /// Bytes delivered to the TLS side.
    pub ssl_bytes: u64,
}

pub struct TransferParams {
    pub timeout_idle: Duration,
    pub timeout_close: Duration,
    /// X-Forwarded-For injection state (server mode with the option on).
    pub injector: Option<HeaderInjector>,
}

fn transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Relay until both write directions are closed and any pending
/// `close_notify` has been exchanged.
pub fn run(
    tls: &mut dyn Tls,
    ch: &Channels<'_>,
    params: TransferParams,
) -> EngineResult<TransferStats> {
    let mut injector = params.injector;
    let mut sock_buff = vec![0u8; BUFFSIZE];
    let mut ssl_buff = vec![0u8; BUFFSIZE];
    let mut sock_ptr = 0usize;
    let mut ssl_ptr = 0usize;
    let mut stats = TransferStats::default();

    // Logical channels (not descriptors) open for read or write.
    let mut sock_open_rd = true;
    let mut sock_open_wr = true;
    let mut ssl_open_rd = true;
    let mut ssl_open_wr = true;

    // Awaited conditions on the TLS-side descriptors.
    let mut shutdown_wants_read = false;
    let mut shutdown_wants_write = false;
    let mut read_wants_write = false;
    let mut write_wants_read = false;

    let mut watchdog = 0u32;
    let mut poller = Poller::new();

    loop {
        let buffsize = injector.as_ref().map_or(BUFFSIZE, |i| i.buffsize());

        let mut read_wants_read = ssl_open_rd && ssl_ptr < buffsize && !read_wants_write;
        let mut write_wants_write =
            ssl_open_wr && (sock_ptr > 0 || tls.wants_flush()) && !write_wants_read;

        // Register interest. Descriptors registered without read or write
        // interest are still watched for error conditions.
        poller.clear();
        if sock_open_rd {
            poller.add(ch.sock_rfd.raw(), sock_ptr < buffsize, false);
        }
        if sock_open_wr {
            poller.add(ch.sock_wfd.raw(), false, ssl_ptr > 0);
        }
        if read_wants_read || write_wants_read || shutdown_wants_read {
            poller.add(ch.ssl_rfd.raw(), true, false);
        }
        if read_wants_write || write_wants_write || shutdown_wants_write {
            poller.add(ch.ssl_wfd.raw(), false, true);
        }

        // Both peers still open for read, or anything buffered, means the
        // connection is active; otherwise we are only draining the close.
        let active = (sock_open_rd && ssl_open_rd) || ssl_ptr > 0 || sock_ptr > 0;
        let timeout = if active {
            params.timeout_idle
        } else {
            params.timeout_close
        };
        match poller
            .wait(timeout)
            .map_err(|e| EngineError::io("poll (transfer)", e))?
        {
            Wait::Timeout => {
                if active {
                    info!("transfer timeout with the connection active: resetting");
                    return Err(EngineError::Timeout { op: "transfer" });
                }
                info!("transfer timeout while draining close: done");
                return Ok(stats);
            }
            Wait::Ready(_) => {}
        }

        // Error scan on all registered descriptors.
        let mut scanned = [ch.sock_rfd.raw(), -1, -1, -1];
        let mut scan_idx = 1;
        for fd in [ch.sock_wfd.raw(), ch.ssl_rfd.raw(), ch.ssl_wfd.raw()] {
            if !scanned[..scan_idx].contains(&fd) {
                scanned[scan_idx] = fd;
                scan_idx += 1;
            }
        }
        for &fd in &scanned[..scan_idx] {
            if let Some(err) = poller.error(fd) {
                warn!(fd, %err, "error condition on descriptor");
                return Err(EngineError::io("descriptor error", err));
            }
        }

        let sock_can_rd = poller.can_read(ch.sock_rfd.raw());
        let sock_can_wr = poller.can_write(ch.sock_wfd.raw());
        let ssl_can_rd = poller.can_read(ch.ssl_rfd.raw());
        let ssl_can_wr = poller.can_write(ch.ssl_wfd.raw());

        if !(sock_can_rd || sock_can_wr || ssl_can_rd || ssl_can_wr) {
            return Err(EngineError::Internal(
                "poller reported ready but no descriptor is",
            ));
        }

        // Drive the close_notify exchange.
        if shutdown_wants_read || shutdown_wants_write {
            shutdown_wants_read = false;
            shutdown_wants_write = false;
            match tls.shutdown() {
                TlsIo::Done(_) => debug!("close_notify sent"),
                TlsIo::WantWrite => {
                    debug!("shutdown wants write: retrying");
                    shutdown_wants_write = true;
                }
                TlsIo::WantRead => {
                    debug!("shutdown wants read: retrying");
                    shutdown_wants_read = true;
                }
                TlsIo::ZeroReturn => debug!("close_notify exchange already complete"),
                TlsIo::Eof => {
                    return Err(EngineError::io(
                        "TLS shutdown",
                        io::ErrorKind::UnexpectedEof.into(),
                    ));
                }
                TlsIo::Syscall(e) if transient(&e) => shutdown_wants_write = true,
                TlsIo::Syscall(e) => return Err(EngineError::io("TLS shutdown", e)),
                TlsIo::Fault(e) => return Err(EngineError::Tls(e)),
            }
        }

        // Read from the plaintext socket.
        if sock_open_rd && sock_can_rd && sock_ptr < buffsize {
            match fd::read_fd(ch.sock_rfd.raw(), &mut sock_buff[sock_ptr..buffsize]) {
                Ok(0) => {
                    debug!("socket closed on read");
                    sock_open_rd = false;
                }
                Ok(n) => {
                    sock_ptr += n;
                    watchdog = 0;
                }
                Err(e) if transient(&e) => debug!(%e, "socket read: retrying"),
                Err(e) => return Err(EngineError::io("socket read", e)),
            }
        }

        // Write to the plaintext socket.
        if sock_open_wr && sock_can_wr {
            match fd::write_fd(ch.sock_wfd.raw(), &ssl_buff[..ssl_ptr]) {
                Ok(0) => debug!("no data written to the socket: retrying"),
                Ok(n) => {
                    ssl_buff.copy_within(n..ssl_ptr, 0);
                    ssl_ptr -= n;
                    stats.sock_bytes += n as u64;
                    watchdog = 0;
                }
                Err(e) if transient(&e) => debug!(%e, "socket write: retrying"),
                Err(e) => return Err(EngineError::io("socket write", e)),
            }
        }

        // Recompute the want flags with the updated pointers, so buffered
        // plaintext inside the engine can be consulted against the space
        // the socket write just freed.
        read_wants_read = ssl_open_rd && ssl_ptr < buffsize && !read_wants_write;
        write_wants_write =
            ssl_open_wr && (sock_ptr > 0 || tls.wants_flush()) && !write_wants_read;

        // Read from TLS.
        if (read_wants_read && (ssl_can_rd || tls.pending()))
            || (read_wants_write && ssl_can_wr)
        {
            read_wants_write = false;
            match tls.read(&mut ssl_buff[ssl_ptr..buffsize]) {
                TlsIo::Done(n) => {
                    let start = ssl_ptr;
                    let mut len = ssl_ptr + n;
                    if let Some(inj) = injector.as_mut() {
                        inj.absorb(&mut ssl_buff, start, &mut len);
                    }
                    ssl_ptr = len;
                    watchdog = 0;
                }
                TlsIo::WantWrite => {
                    debug!("TLS read wants write: retrying");
                    read_wants_write = true;
                }
                TlsIo::WantRead => {}
                TlsIo::ZeroReturn => {
                    debug!("TLS closed on read");
                    ssl_open_rd = false;
                    if tls.version() == SSLV2 {
                        ssl_open_wr = false;
                    }
                }
                TlsIo::Eof => {
                    if sock_ptr > 0 {
                        error!(
                            buffered = sock_ptr,
                            "TLS socket closed on read with data still owed"
                        );
                        return Err(EngineError::io(
                            "TLS read",
                            io::ErrorKind::UnexpectedEof.into(),
                        ));
                    }
                    // Buggy peer skipped close_notify; treat as clean.
                    debug!("TLS socket closed on read");
                    ssl_open_rd = false;
                    ssl_open_wr = false;
                }
                TlsIo::Syscall(e) if transient(&e) => debug!(%e, "TLS read: retrying"),
                TlsIo::Syscall(e) => return Err(EngineError::io("TLS read", e)),
                TlsIo::Fault(e) => return Err(EngineError::Tls(e)),
            }
        }

        // Write to TLS.
        if (write_wants_read && ssl_can_rd) || (write_wants_write && ssl_can_wr) {
            write_wants_read = false;
            if sock_ptr > 0 {
                match tls.write(&sock_buff[..sock_ptr]) {
                    TlsIo::Done(n) => {
                        sock_buff.copy_within(n..sock_ptr, 0);
                        sock_ptr -= n;
                        stats.ssl_bytes += n as u64;
                        watchdog = 0;
                    }
                    TlsIo::WantWrite => {}
                    TlsIo::WantRead => {
                        debug!("TLS write wants read: retrying");
                        write_wants_read = true;
                    }
                    TlsIo::ZeroReturn => {
                        debug!("TLS closed on write");
                        ssl_open_rd = false;
                        if tls.version() == SSLV2 {
                            ssl_open_wr = false;
                        }
                    }
                    TlsIo::Eof => {
                        if sock_ptr > 0 {
                            error!(
                                buffered = sock_ptr,
                                "TLS socket closed on write with data still owed"
                            );
                            return Err(EngineError::io(
                                "TLS write",
                                io::ErrorKind::UnexpectedEof.into(),
                            ));
                        }
                        debug!("TLS socket closed on write");
                        ssl_open_rd = false;
                        ssl_open_wr = false;
                    }
                    TlsIo::Syscall(e) if transient(&e) => debug!(%e, "TLS write: retrying"),
                    TlsIo::Syscall(e) => return Err(EngineError::io("TLS write", e)),
                    TlsIo::Fault(e) => return Err(EngineError::Tls(e)),
                }
            } else {
                // Nothing new to submit: drain the queued records that
                // made wants_flush() hold the write interest.
                match tls.flush() {
                    TlsIo::Done(n) => {
                        if n > 0 {
                            watchdog = 0;
                        }
                    }
                    TlsIo::WantWrite | TlsIo::WantRead => {}
                    TlsIo::Syscall(e) if transient(&e) => {}
                    TlsIo::Syscall(e) => return Err(EngineError::io("TLS flush", e)),
                    TlsIo::Fault(e) => return Err(EngineError::Tls(e)),
                    TlsIo::ZeroReturn | TlsIo::Eof => {}
                }
            }
        }

        // Propagate half-closes.
        if sock_open_wr && !ssl_open_rd && ssl_ptr == 0 {
            debug!("sending socket write shutdown");
            sock_open_wr = false;
            let _ = fd::shutdown_fd(ch.sock_wfd.raw(), Shut::Write);
        }
        if ssl_open_wr && !sock_open_rd && sock_ptr == 0 {
            debug!("initiating TLS write shutdown");
            ssl_open_wr = false;
            if tls.version() != SSLV2 {
                shutdown_wants_write = true;
            } else {
                // SSLv2 has no close alert: hard-close at the socket level
                // and tell the engine the shutdown already happened.
                let _ = fd::shutdown_fd(ch.sock_rfd.raw(), Shut::Read);
                let _ = fd::shutdown_fd(ch.sock_wfd.raw(), Shut::Write);
                tls.mark_closed();
                ssl_open_rd = false;
            }
        }

        watchdog += 1;
        if watchdog > WATCHDOG_LIMIT {
            error!("transfer loop is executing without moving any data");
            error!(
                protocol = tls.version(),
                pending = tls.pending(),
                "engine state"
            );
            error!(
                sock_open_rd,
                sock_open_wr,
                ssl_open_rd,
                ssl_open_wr,
                "channel state"
            );
            error!(
                sock_can_rd,
                sock_can_wr,
                ssl_can_rd,
                ssl_can_wr,
                "descriptor readiness"
            );
            error!(
                read_wants_read,
                read_wants_write,
                write_wants_read,
                write_wants_write,
                "transfer wants"
            );
            error!(shutdown_wants_read, shutdown_wants_write, "shutdown wants");
            error!(
                sock_buffered = sock_ptr,
                ssl_buffered = ssl_ptr,
                "buffer state"
            );
            return Err(EngineError::Watchdog(WATCHDOG_LIMIT));
        }

        if !(sock_open_wr || ssl_open_wr || shutdown_wants_read || shutdown_wants_write) {
            return Ok(stats);
        }
    }
}
