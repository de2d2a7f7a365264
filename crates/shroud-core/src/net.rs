//! Socket plumbing: non-blocking connect with timeout, outbound failover,
//! local/transparent binds, loopback socket pairs, socket options, and
//! timeout-bounded line I/O for the cleartext negotiation protocols.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpListener, TcpStream};
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::addr::{AddrList, Failover};
use crate::error::{EngineError, EngineResult};
use crate::fd::{self, FdSlot};
use crate::poll::{Poller, Wait};

// ── sockaddr conversion ──────────────────────────────────────────────

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write((&mut storage as *mut libc::sockaddr_storage).cast(), sin);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write((&mut storage as *mut libc::sockaddr_storage).cast(), sin6);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin: &libc::sockaddr_in =
                unsafe { &*(storage as *const libc::sockaddr_storage).cast() };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6: &libc::sockaddr_in6 =
                unsafe { &*(storage as *const libc::sockaddr_storage).cast() };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "not an inet socket address",
        )),
    }
}

/// `getpeername(2)`. Fails with `ENOTSOCK` when the descriptor is a pipe
/// or terminal, which the session setup treats as the stdio case.
pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getpeername(fd, (&mut storage as *mut libc::sockaddr_storage).cast(), &mut len)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_addr(&storage)
}

/// `getsockname(2)`.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, (&mut storage as *mut libc::sockaddr_storage).cast(), &mut len)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_addr(&storage)
}

// ── socket creation and options ──────────────────────────────────────

fn new_socket(family: libc::c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

fn setsockopt_int(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Apply the per-connection socket options from the service config.
pub fn set_socket_options(fd: RawFd, nodelay: bool, keepalive: bool) -> io::Result<()> {
    if nodelay {
        setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
    }
    if keepalive {
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    }
    Ok(())
}

/// Arrange for the next `close(2)` to send RST instead of FIN.
pub fn linger_reset(fd: RawFd) {
    let l = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            (&l as *const libc::linger).cast(),
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        debug!(fd, error = %io::Error::last_os_error(), "setting linger failed");
    }
}

// ── bind and connect ─────────────────────────────────────────────────

/// Bind the outbound socket to a source address. Ports below 1024 are
/// refused unless transparent mode asks for them, and `EADDRINUSE` (or any
/// bind failure in transparent mode) falls back to an ephemeral port.
pub fn local_bind(fd: RawFd, addr: SocketAddr, transparent: bool) -> EngineResult<()> {
    #[cfg(target_os = "linux")]
    if transparent {
        // Failure tolerated: bind() will report anything fatal.
        if setsockopt_int(fd, libc::SOL_IP, libc::IP_TRANSPARENT, 1).is_err() {
            debug!(fd, "setting IP_TRANSPARENT failed");
        }
    }

    if addr.port() >= 1024 {
        let (storage, len) = sockaddr_from(&addr);
        let rc = unsafe { libc::bind(fd, (&storage as *const libc::sockaddr_storage).cast(), len) };
        if rc == 0 {
            debug!(%addr, "bound outbound socket to the original port");
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EADDRINUSE) && !transparent {
            return Err(EngineError::io("bind (original port)", err));
        }
    }

    let mut ephemeral = addr;
    ephemeral.set_port(0);
    let (storage, len) = sockaddr_from(&ephemeral);
    let rc = unsafe { libc::bind(fd, (&storage as *const libc::sockaddr_storage).cast(), len) };
    if rc == 0 {
        debug!(ip = %addr.ip(), "bound outbound socket to an ephemeral port");
        Ok(())
    } else {
        Err(EngineError::last_os("bind (ephemeral port)"))
    }
}

/// Non-blocking `connect(2)` bounded by `timeout`. The returned descriptor
/// is left in non-blocking mode.
pub fn connect_nonblocking(
    addr: SocketAddr,
    bind: Option<SocketAddr>,
    transparent: bool,
    timeout: Duration,
) -> EngineResult<FdSlot> {
    let slot = FdSlot::socket(new_socket(match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }).map_err(|e| EngineError::io("socket", e))?);

    if let Some(bind_addr) = bind {
        local_bind(slot.raw(), bind_addr, transparent)?;
    }
    slot.set_nonblocking().map_err(|e| EngineError::io("fcntl", e))?;

    let (storage, len) = sockaddr_from(&addr);
    let rc = unsafe {
        libc::connect(slot.raw(), (&storage as *const libc::sockaddr_storage).cast(), len)
    };
    if rc == 0 {
        return Ok(slot);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EINTR) => {}
        _ => return Err(EngineError::io("connect", err)),
    }

    let mut poller = Poller::new();
    poller.add(slot.raw(), false, true);
    match poller.wait(timeout).map_err(|e| EngineError::io("poll (connect)", e))? {
        Wait::Timeout => return Err(EngineError::Timeout { op: "connect" }),
        Wait::Ready(_) => {}
    }
    if let Some(err) = poller.error(slot.raw()) {
        return Err(EngineError::io("connect", err));
    }
    // POLLOUT with no error means the handshake completed; verify anyway.
    let mut so_error: libc::c_int = 0;
    let mut optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            slot.raw(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut so_error as *mut libc::c_int).cast(),
            &mut optlen,
        )
    };
    if rc < 0 {
        return Err(EngineError::last_os("getsockopt SO_ERROR"));
    }
    if so_error != 0 {
        return Err(EngineError::io("connect", io::Error::from_raw_os_error(so_error)));
    }
    Ok(slot)
}

/// Open the TLS-side connection, walking the address list under the
/// service's failover policy.
pub fn connect_remote(
    service: &str,
    addrs: &AddrList,
    failover: Failover,
    bind: Option<SocketAddr>,
    transparent: bool,
    timeout: Duration,
) -> EngineResult<FdSlot> {
    for addr in addrs.candidates(failover) {
        match connect_nonblocking(addr, bind, transparent, timeout) {
            Ok(slot) => {
                if let Ok(bound) = local_addr(slot.raw()) {
                    info!(service, %addr, from = %bound, "connected remote server");
                }
                return Ok(slot);
            }
            Err(err) => {
                warn!(service, %addr, %err, "remote connect failed, trying next address");
            }
        }
    }
    Err(EngineError::Unreachable)
}

/// Create a pair of connected stream sockets for piping a child process.
/// Prefers a loopback TCP pair (some programs expect a real socket with
/// an address); falls back to `socketpair(AF_UNIX)`.
pub fn make_socket_pair() -> EngineResult<(FdSlot, FdSlot)> {
    match tcp_socket_pair() {
        Ok(pair) => Ok(pair),
        Err(err) => {
            debug!(%err, "loopback socket pair failed, falling back to socketpair");
            unix_socket_pair()
        }
    }
}

fn tcp_socket_pair() -> io::Result<(FdSlot, FdSlot)> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let addr = listener.local_addr()?;
    let child_end = TcpStream::connect(addr)?;
    let (parent_end, _) = listener.accept()?;
    Ok((FdSlot::from_stream(parent_end), FdSlot::from_stream(child_end)))
}

fn unix_socket_pair() -> EngineResult<(FdSlot, FdSlot)> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(EngineError::last_os("socketpair"));
    }
    Ok((FdSlot::socket(fds[0]), FdSlot::socket(fds[1])))
}

// ── timeout-bounded line I/O ─────────────────────────────────────────

/// Write the whole buffer, waiting up to `timeout` for writability before
/// each attempt.
pub fn write_all_timeout(fd: RawFd, mut buf: &[u8], timeout: Duration) -> EngineResult<()> {
    while !buf.is_empty() {
        let mut poller = Poller::new();
        poller.add(fd, false, true);
        match poller.wait(timeout).map_err(|e| EngineError::io("poll (write)", e))? {
            Wait::Timeout => return Err(EngineError::Timeout { op: "write" }),
            Wait::Ready(_) => {}
        }
        match fd::write_fd(fd, buf) {
            Ok(0) => return Err(EngineError::io("write", io::ErrorKind::WriteZero.into())),
            Ok(n) => buf = &buf[n..],
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => return Err(EngineError::io("write", e)),
        }
    }
    Ok(())
}

/// Read one LF-terminated line, stripping the terminator and a trailing CR.
/// Each readiness wait is bounded by `timeout`; the line is capped at `max`
/// bytes. EOF before the terminator yields whatever was collected.
pub fn read_line_timeout(fd: RawFd, timeout: Duration, max: usize) -> EngineResult<String> {
    let mut line = Vec::new();
    loop {
        let mut poller = Poller::new();
        poller.add(fd, true, false);
        match poller.wait(timeout).map_err(|e| EngineError::io("poll (read)", e))? {
            Wait::Timeout => return Err(EngineError::Timeout { op: "read" }),
            Wait::Ready(_) => {}
        }
        let mut byte = [0u8; 1];
        match fd::read_fd(fd, &mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                if line.len() >= max {
                    return Err(EngineError::io(
                        "read",
                        io::Error::new(io::ErrorKind::InvalidData, "line too long"),
                    ));
                }
                line.push(byte[0]);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => return Err(EngineError::io("read", e)),
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;

    #[test]
    fn socket_pair_roundtrip() {
        let (a, b) = make_socket_pair().unwrap();
        assert_eq!(fd::write_fd(a.raw(), b"over").unwrap(), 4);
        let mut buf = [0u8; 8];
        let n = fd::read_fd(b.raw(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"over");
    }

    #[test]
    fn connect_nonblocking_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let slot =
            connect_nonblocking(addr, None, false, Duration::from_secs(2)).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        fd::write_fd(slot.raw(), b"hi").unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn connect_nonblocking_refused() {
        // Bind then drop to get a port with no listener.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let err = connect_nonblocking(addr, None, false, Duration::from_secs(2));
        assert!(err.is_err());
    }

    #[test]
    fn connect_remote_fails_over_to_reachable_address() {
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let live = listener.local_addr().unwrap();

        let addrs = AddrList::new(vec![dead, live]);
        let slot = connect_remote(
            "test",
            &addrs,
            Failover::Priority,
            None,
            false,
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(peer_addr(slot.raw()).unwrap(), live);
    }

    #[test]
    fn connect_remote_exhaustion_is_unreachable() {
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let addrs = AddrList::new(vec![dead]);
        let err = connect_remote(
            "test",
            &addrs,
            Failover::Priority,
            None,
            false,
            Duration::from_millis(500),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Unreachable));
    }

    #[test]
    fn local_bind_ephemeral_port() {
        let fd = new_socket(libc::AF_INET).unwrap();
        let slot = FdSlot::socket(fd);
        local_bind(slot.raw(), "127.0.0.1:0".parse().unwrap(), false).unwrap();
        assert_eq!(local_addr(slot.raw()).unwrap().ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn peer_addr_on_pipe_is_enotsock() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let err = peer_addr(fds[0]).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTSOCK));
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn line_io_roundtrip() {
        let (a, b) = make_socket_pair().unwrap();
        a.set_nonblocking().unwrap();
        b.set_nonblocking().unwrap();

        write_all_timeout(a.raw(), b"42 , 113\r\n", Duration::from_secs(2)).unwrap();
        let line = read_line_timeout(b.raw(), Duration::from_secs(2), 1024).unwrap();
        assert_eq!(line, "42 , 113");
    }

    #[test]
    fn read_line_times_out_on_silent_peer() {
        let (a, _b) = make_socket_pair().unwrap();
        a.set_nonblocking().unwrap();
        let err = read_line_timeout(a.raw(), Duration::from_millis(100), 1024).unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
    }

    #[test]
    fn read_line_handles_split_arrival() {
        let (a, b) = make_socket_pair().unwrap();
        b.set_nonblocking().unwrap();
        let handle = thread::spawn(move || {
            let mut s = unsafe {
                use std::os::fd::FromRawFd;
                TcpStream::from_raw_fd(a.release())
            };
            s.write_all(b"par").unwrap();
            thread::sleep(Duration::from_millis(50));
            s.write_all(b"tial\r\n").unwrap();
        });
        let line = read_line_timeout(b.raw(), Duration::from_secs(2), 1024).unwrap();
        assert_eq!(line, "partial");
        handle.join().unwrap();
    }
}
