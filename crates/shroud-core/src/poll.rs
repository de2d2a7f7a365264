//! Readiness multiplexer over `poll(2)`.
//!
//! One [`Poller`] per session, re-armed every loop iteration. Interest is
//! level-triggered; error conditions (`POLLERR`/`POLLNVAL`) are reported on
//! every registered descriptor whether or not read/write interest was
//! requested, which is exactly what the transfer loop relies on.

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Outcome of a [`Poller::wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// The timeout elapsed with no descriptor ready.
    Timeout,
    /// At least this many descriptors are ready.
    Ready(usize),
}

pub struct Poller {
    fds: Vec<libc::pollfd>,
}

impl Poller {
    pub fn new() -> Self {
        Self { fds: Vec::with_capacity(4) }
    }

    /// Drop all registered interest.
    pub fn clear(&mut self) {
        self.fds.clear();
    }

    /// Register interest on a descriptor. Registering the same descriptor
    /// twice merges the requested events. A descriptor registered with
    /// neither read nor write interest is still watched for errors.
    pub fn add(&mut self, fd: RawFd, read: bool, write: bool) {
        let mut events: libc::c_short = 0;
        if read {
            events |= libc::POLLIN;
        }
        if write {
            events |= libc::POLLOUT;
        }
        if let Some(entry) = self.fds.iter_mut().find(|e| e.fd == fd) {
            entry.events |= events;
        } else {
            self.fds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        }
    }

    /// Block until a registered descriptor is ready or the timeout elapses.
    /// `EINTR` is retried with the remaining time.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Wait> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;
            let n = unsafe {
                libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, millis)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if n == 0 {
                return Ok(Wait::Timeout);
            }
            return Ok(Wait::Ready(n as usize));
        }
    }

    fn revents(&self, fd: RawFd) -> libc::c_short {
        self.fds
            .iter()
            .find(|e| e.fd == fd)
            .map(|e| e.revents)
            .unwrap_or(0)
    }

    /// Readable, or at EOF (`POLLHUP` still delivers the final zero read).
    pub fn can_read(&self, fd: RawFd) -> bool {
        self.revents(fd) & (libc::POLLIN | libc::POLLHUP) != 0
    }

    pub fn can_write(&self, fd: RawFd) -> bool {
        self.revents(fd) & libc::POLLOUT != 0
    }

    /// Error condition on the descriptor, if any. Fetches `SO_ERROR` so the
    /// caller can log the underlying errno.
    pub fn error(&self, fd: RawFd) -> Option<io::Error> {
        let revents = self.revents(fd);
        if revents & (libc::POLLERR | libc::POLLNVAL) == 0 {
            return None;
        }
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&mut err as *mut libc::c_int).cast(),
                &mut len,
            )
        };
        if rc == 0 && err != 0 {
            Some(io::Error::from_raw_os_error(err))
        } else {
            Some(io::Error::other("descriptor in error state"))
        }
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::{read_fd, write_fd};

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn times_out_when_nothing_ready() {
        let (r, w) = pipe();
        let mut poller = Poller::new();
        poller.add(r, true, false);
        let started = Instant::now();
        assert_eq!(
            poller.wait(Duration::from_millis(50)).unwrap(),
            Wait::Timeout
        );
        assert!(started.elapsed() >= Duration::from_millis(40));
        close(r);
        close(w);
    }

    #[test]
    fn reports_read_readiness() {
        let (r, w) = pipe();
        write_fd(w, b"x").unwrap();

        let mut poller = Poller::new();
        poller.add(r, true, false);
        assert_eq!(
            poller.wait(Duration::from_secs(2)).unwrap(),
            Wait::Ready(1)
        );
        assert!(poller.can_read(r));
        assert!(!poller.can_write(r));
        close(r);
        close(w);
    }

    #[test]
    fn reports_write_readiness() {
        let (r, w) = pipe();
        let mut poller = Poller::new();
        poller.add(w, false, true);
        assert_eq!(
            poller.wait(Duration::from_secs(2)).unwrap(),
            Wait::Ready(1)
        );
        assert!(poller.can_write(w));
        close(r);
        close(w);
    }

    #[test]
    fn closed_write_end_shows_as_readable_eof() {
        let (r, w) = pipe();
        close(w);
        let mut poller = Poller::new();
        poller.add(r, true, false);
        assert_eq!(
            poller.wait(Duration::from_secs(2)).unwrap(),
            Wait::Ready(1)
        );
        // POLLHUP counts as readable so the loop performs the final read.
        assert!(poller.can_read(r));
        let mut buf = [0u8; 1];
        assert_eq!(read_fd(r, &mut buf).unwrap(), 0);
        close(r);
    }

    #[test]
    fn interest_merges_for_same_fd() {
        let (r, w) = pipe();
        write_fd(w, b"x").unwrap();
        let mut poller = Poller::new();
        poller.add(r, true, false);
        poller.add(r, false, false); // error-only registration must not erase interest
        assert_eq!(
            poller.wait(Duration::from_secs(2)).unwrap(),
            Wait::Ready(1)
        );
        assert!(poller.can_read(r));
        close(r);
        close(w);
    }

    #[test]
    fn clear_resets_registrations() {
        let (r, w) = pipe();
        write_fd(w, b"x").unwrap();
        let mut poller = Poller::new();
        poller.add(r, true, false);
        poller.clear();
        poller.add(w, false, true);
        poller.wait(Duration::from_secs(2)).unwrap();
        assert!(!poller.can_read(r));
        close(r);
        close(w);
    }
}
