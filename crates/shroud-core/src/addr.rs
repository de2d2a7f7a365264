//! Resolved peer address lists with failover.
//!
//! A service carries an ordered list of candidate addresses. Priority
//! failover always walks the list from the front; round-robin failover
//! starts each session at a shared rotating cursor and advances it once
//! per session. The cursor is a relaxed atomic — a race between sessions
//! merely makes two of them start at the same endpoint.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Failover policy across the address list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Failover {
    /// Always prefer the first reachable address, in list order.
    #[default]
    Priority,
    /// Rotate the starting address across sessions.
    RoundRobin,
}

/// An ordered list of resolved addresses plus the round-robin cursor.
#[derive(Debug, Default)]
pub struct AddrList {
    addrs: Vec<SocketAddr>,
    cursor: AtomicUsize,
}

impl AddrList {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self {
            addrs,
            cursor: AtomicUsize::new(0),
        }
    }

    /// A one-entry list, used for the accepted peer's address.
    pub fn single(addr: SocketAddr) -> Self {
        Self::new(vec![addr])
    }

    /// Resolve a `host:port` string. Used at config load and again per
    /// session when delayed lookup is enabled.
    pub fn resolve(target: &str) -> io::Result<Self> {
        let addrs: Vec<SocketAddr> = target.to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {target}"),
            ));
        }
        Ok(Self::new(addrs))
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn first(&self) -> Option<SocketAddr> {
        self.addrs.first().copied()
    }

    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Candidate addresses for one session, in the order they should be
    /// tried under the given policy. Round-robin advances the shared
    /// cursor exactly once per call.
    pub fn candidates(&self, failover: Failover) -> Vec<SocketAddr> {
        let n = self.addrs.len();
        if n == 0 {
            return Vec::new();
        }
        let start = match failover {
            Failover::Priority => 0,
            Failover::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed) % n,
        };
        (0..n).map(|i| self.addrs[(start + i) % n]).collect()
    }
}

impl Clone for AddrList {
    fn clone(&self) -> Self {
        // The cursor is per-list state; clones start back at zero.
        Self::new(self.addrs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> AddrList {
        AddrList::new(vec![
            "10.0.0.1:443".parse().unwrap(),
            "10.0.0.2:443".parse().unwrap(),
            "10.0.0.3:443".parse().unwrap(),
        ])
    }

    #[test]
    fn priority_always_starts_at_front() {
        let l = list();
        for _ in 0..3 {
            let c = l.candidates(Failover::Priority);
            assert_eq!(c[0], "10.0.0.1:443".parse().unwrap());
            assert_eq!(c.len(), 3);
        }
    }

    #[test]
    fn round_robin_rotates_start_per_session() {
        let l = list();
        let s1 = l.candidates(Failover::RoundRobin);
        let s2 = l.candidates(Failover::RoundRobin);
        let s3 = l.candidates(Failover::RoundRobin);
        let s4 = l.candidates(Failover::RoundRobin);

        assert_eq!(s1[0], "10.0.0.1:443".parse().unwrap());
        assert_eq!(s2[0], "10.0.0.2:443".parse().unwrap());
        assert_eq!(s3[0], "10.0.0.3:443".parse().unwrap());
        assert_eq!(s4[0], "10.0.0.1:443".parse().unwrap()); // wraps around
    }

    #[test]
    fn round_robin_covers_whole_list() {
        let l = list();
        let c = l.candidates(Failover::RoundRobin);
        let mut sorted: Vec<String> = c.iter().map(|a| a.to_string()).collect();
        sorted.sort();
        assert_eq!(
            sorted,
            vec!["10.0.0.1:443", "10.0.0.2:443", "10.0.0.3:443"]
        );
    }

    #[test]
    fn resolve_rejects_unresolvable() {
        assert!(AddrList::resolve("host.invalid.:1").is_err());
    }

    #[test]
    fn resolve_numeric() {
        let l = AddrList::resolve("127.0.0.1:8443").unwrap();
        assert_eq!(l.first(), Some("127.0.0.1:8443".parse().unwrap()));
    }

    #[test]
    fn empty_list_yields_no_candidates() {
        let l = AddrList::new(Vec::new());
        assert!(l.candidates(Failover::RoundRobin).is_empty());
    }
}
