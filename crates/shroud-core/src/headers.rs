//! HTTP header boundary detection and X-Forwarded-For insertion.
//!
//! In server mode the first decrypted bytes of a session are an HTTP
//! request. The injector scans the stream for the end of the headers (two
//! consecutive line terminators, each `\n` optionally preceded by `\r`)
//! and inserts one `X-Forwarded-For` line immediately before the blank
//! line. The terminator count carries across reads, and a `\r` at the end
//! of a read does not reset it — its `\n` may arrive in the next segment.
//!
//! Until the insertion happens the relay buffer is capped below its full
//! size so the in-place insertion always has room.

use std::net::IpAddr;

use crate::config::{BUFF_RESERVED, BUFFSIZE};

pub struct HeaderInjector {
    header: Vec<u8>,
    crlf_seen: u8,
    done: bool,
}

impl HeaderInjector {
    pub fn new(peer: IpAddr) -> Self {
        Self {
            header: format!("X-Forwarded-For: {peer}\r\n").into_bytes(),
            crlf_seen: 0,
            done: false,
        }
    }

    /// Usable buffer capacity: the reserve is held back until the header
    /// has been inserted.
    pub fn buffsize(&self) -> usize {
        if self.done {
            BUFFSIZE
        } else {
            BUFFSIZE - BUFF_RESERVED
        }
    }

    pub fn done(&self) -> bool {
        self.done
    }

    /// Scan the newly appended region `start..*len` of `buf`. When the
    /// header boundary is found the X-Forwarded-For line is inserted right
    /// before the blank line and `*len` grows by its length.
    pub fn absorb(&mut self, buf: &mut [u8], start: usize, len: &mut usize) {
        if self.done {
            return;
        }
        let mut last = start;
        while last < *len {
            if buf[last] == b'\n' {
                self.crlf_seen += 1;
                if self.crlf_seen == 2 {
                    break;
                }
            } else if last + 1 < *len && buf[last] == b'\r' && buf[last + 1] == b'\n' {
                self.crlf_seen += 1;
                if self.crlf_seen == 2 {
                    break;
                }
                last += 1;
            } else if buf[last] != b'\r' {
                // A trailing CR may still complete to CRLF on the next read.
                self.crlf_seen = 0;
            }
            last += 1;
        }
        if self.crlf_seen >= 2 {
            // `last` sits on the terminator of the blank line; insert there.
            self.done = true;
            let n = self.header.len();
            if n <= buf.len() - *len {
                buf.copy_within(last..*len, last + n);
                buf[last..last + n].copy_from_slice(&self.header);
                *len += n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inject_all(peer: &str, input: &[u8]) -> (Vec<u8>, bool) {
        let mut inj = HeaderInjector::new(peer.parse().unwrap());
        let mut buf = vec![0u8; BUFFSIZE];
        buf[..input.len()].copy_from_slice(input);
        let mut len = input.len();
        inj.absorb(&mut buf, 0, &mut len);
        (buf[..len].to_vec(), inj.done())
    }

    #[test]
    fn inserts_before_blank_line() {
        let (out, done) = inject_all("192.0.2.7", b"GET / HTTP/1.0\r\n\r\n");
        assert!(done);
        assert_eq!(
            out,
            b"GET / HTTP/1.0\r\nX-Forwarded-For: 192.0.2.7\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn preserves_all_original_bytes() {
        let request = b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\nbody";
        let (out, done) = inject_all("10.1.2.3", request);
        assert!(done);
        // Removing the injected line gives back the original request.
        let injected = b"X-Forwarded-For: 10.1.2.3\r\n";
        let pos = out
            .windows(injected.len())
            .position(|w| w == injected)
            .expect("header missing");
        let mut stripped = out.clone();
        stripped.drain(pos..pos + injected.len());
        assert_eq!(stripped, request.to_vec());
    }

    #[test]
    fn handles_bare_lf_terminators() {
        let (out, done) = inject_all("10.0.0.1", b"GET / HTTP/1.0\n\n");
        assert!(done);
        assert_eq!(out, b"GET / HTTP/1.0\nX-Forwarded-For: 10.0.0.1\r\n\n".to_vec());
    }

    #[test]
    fn boundary_split_across_reads() {
        let mut inj = HeaderInjector::new("10.0.0.1".parse().unwrap());
        let mut buf = vec![0u8; BUFFSIZE];
        // First segment ends with a lone CR.
        let part1 = b"GET / HTTP/1.0\r\n\r";
        buf[..part1.len()].copy_from_slice(part1);
        let mut len = part1.len();
        inj.absorb(&mut buf, 0, &mut len);
        assert!(!inj.done());

        // The LF arrives in the next segment. The insertion point is the
        // terminator byte that completed the blank line, so the header
        // lands between the orphaned CR and its LF.
        buf[len] = b'\n';
        let start = len;
        len += 1;
        inj.absorb(&mut buf, start, &mut len);
        assert!(inj.done());
        assert_eq!(
            &buf[..len],
            b"GET / HTTP/1.0\r\n\rX-Forwarded-For: 10.0.0.1\r\n\n"
        );
    }

    #[test]
    fn header_data_resets_the_counter() {
        let mut inj = HeaderInjector::new("10.0.0.1".parse().unwrap());
        let mut buf = vec![0u8; BUFFSIZE];
        let part1 = b"GET / HTTP/1.0\r\n";
        buf[..part1.len()].copy_from_slice(part1);
        let mut len = part1.len();
        inj.absorb(&mut buf, 0, &mut len);
        assert!(!inj.done());

        // Another header line: the counter must restart.
        let part2 = b"Host: example\r\n\r\n";
        buf[len..len + part2.len()].copy_from_slice(part2);
        let start = len;
        len += part2.len();
        inj.absorb(&mut buf, start, &mut len);
        assert!(inj.done());
        let out = &buf[..len];
        assert!(out.ends_with(b"Host: example\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n"));
    }

    #[test]
    fn reserve_released_after_injection() {
        let mut inj = HeaderInjector::new("10.0.0.1".parse().unwrap());
        assert_eq!(inj.buffsize(), BUFFSIZE - BUFF_RESERVED);
        let mut buf = vec![0u8; BUFFSIZE];
        let req = b"GET / HTTP/1.0\r\n\r\n";
        buf[..req.len()].copy_from_slice(req);
        let mut len = req.len();
        inj.absorb(&mut buf, 0, &mut len);
        assert_eq!(inj.buffsize(), BUFFSIZE);
    }

    #[test]
    fn non_http_stream_never_completes() {
        let mut inj = HeaderInjector::new("10.0.0.1".parse().unwrap());
        let mut buf = vec![0u8; BUFFSIZE];
        let data = vec![0x42u8; 4096];
        buf[..data.len()].copy_from_slice(&data);
        let mut len = data.len();
        inj.absorb(&mut buf, 0, &mut len);
        assert!(!inj.done());
        assert_eq!(len, 4096);
    }

    #[test]
    fn ipv6_peer_formats_numeric_host() {
        let (out, done) = inject_all("2001:db8::1", b"GET / HTTP/1.0\r\n\r\n");
        assert!(done);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("X-Forwarded-For: 2001:db8::1\r\n"));
    }
}
