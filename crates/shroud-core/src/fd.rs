//! File-descriptor ownership and raw I/O helpers.
//!
//! The engine works on raw descriptors because the plaintext side is not
//! always a socket: with `exec` piping it may be a pty, and in inetd-style
//! operation it is stdin/stdout. [`FdSlot`] carries the descriptor together
//! with its `is_socket` bit so that linger and `shutdown(2)` are only ever
//! applied to sockets.

use std::io;
use std::net::TcpStream;
use std::os::fd::{IntoRawFd, RawFd};

/// An owned file descriptor plus the one piece of metadata the engine
/// needs: whether it is a socket.
#[derive(Debug)]
pub struct FdSlot {
    fd: RawFd,
    is_socket: bool,
}

impl FdSlot {
    /// Wrap a descriptor known to be a socket.
    pub fn socket(fd: RawFd) -> Self {
        Self {
            fd,
            is_socket: true,
        }
    }

    /// Wrap a descriptor that may be a pipe or terminal.
    pub fn new(fd: RawFd, is_socket: bool) -> Self {
        Self { fd, is_socket }
    }

    /// Take ownership of a connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self::socket(stream.into_raw_fd())
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// Downgrade to non-socket after a failed `getpeername` (stdio case).
    pub fn mark_not_socket(&mut self) {
        self.is_socket = false;
    }

    /// Put the descriptor in non-blocking mode.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        set_nonblocking(self.fd)
    }

    /// Set close-on-exec so spawned children do not inherit the fd.
    pub fn set_cloexec(&self) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(self.fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Give up ownership without closing.
    pub fn release(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Drop for FdSlot {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Put a raw descriptor in non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `read(2)` on a raw descriptor. `EINTR` and `EAGAIN` surface as
/// `ErrorKind::Interrupted` / `ErrorKind::WouldBlock` for the caller's
/// retry logic.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// `write(2)` on a raw descriptor.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Which direction of a descriptor to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shut {
    Read,
    Write,
}

/// `shutdown(2)`. Callers ignore the result on non-sockets (`ENOTSOCK`).
pub fn shutdown_fd(fd: RawFd, how: Shut) -> io::Result<()> {
    let how = match how {
        Shut::Read => libc::SHUT_RD,
        Shut::Write => libc::SHUT_WR,
    };
    if unsafe { libc::shutdown(fd, how) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// `io::Read`/`io::Write` adapter over a raw descriptor, used to feed the
/// TLS engine's record layer.
pub(crate) struct FdIo(pub RawFd);

impl io::Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_fd(self.0, buf)
    }
}

impl io::Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_fd(self.0, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
