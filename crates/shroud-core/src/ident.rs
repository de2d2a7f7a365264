//! IDENT (RFC 1413) user verification.
//!
//! When a service configures a required username, the engine connects back
//! to the ident service on the peer host, asks who owns the remote end of
//! the accepted connection, and refuses the session unless the reported
//! user matches byte for byte.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::net;

/// Per-call readiness timeout for the request/response exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest acceptable response line.
const MAX_RESPONSE: usize = 1023;

/// Query the peer's ident service and verify the reported username.
///
/// `peer` is the remote end of the accepted connection, `local` our end of
/// it; `ident_port` is the peer's "auth" service port (normally 113) and
/// `connect_timeout` bounds the TCP connect to it.
pub fn verify(
    peer: SocketAddr,
    local: SocketAddr,
    username: &str,
    ident_port: u16,
    connect_timeout: Duration,
) -> EngineResult<()> {
    let ident_addr = SocketAddr::new(peer.ip(), ident_port);
    let slot = net::connect_nonblocking(ident_addr, None, false, connect_timeout)?;
    debug!(peer = %ident_addr, "IDENT server connected");

    let request = format!("{} , {}\r\n", peer.port(), local.port());
    net::write_all_timeout(slot.raw(), request.as_bytes(), EXCHANGE_TIMEOUT)?;

    let line = net::read_line_timeout(slot.raw(), EXCHANGE_TIMEOUT, MAX_RESPONSE)?;
    let user = parse_userid(&line)
        .ok_or_else(|| EngineError::Ident(format!("malformed response {:?}", safe_string(&line))))?;

    if user != username {
        warn!(
            peer = %peer,
            user = %safe_string(user),
            "connection REFUSED by IDENT"
        );
        return Err(EngineError::IdentRejected(safe_string(user)));
    }
    info!(peer = %peer, "IDENT authentication passed");
    Ok(())
}

/// Extract the username from a `<ports> : USERID : <os> : <user>` reply.
/// The user is the first whitespace-delimited token after the third colon.
fn parse_userid(line: &str) -> Option<&str> {
    let mut fields = line.splitn(4, ':');
    let _ports = fields.next()?;
    if fields.next()?.trim() != "USERID" {
        return None;
    }
    let _os = fields.next()?;
    fields.next()?.split_whitespace().next()
}

/// Replace non-printable characters for safe log output.
pub(crate) fn safe_string(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '.' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Fake ident server answering one query with a fixed response line.
    fn spawn_ident_server(response: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request = String::new();
            reader.read_line(&mut request).unwrap();
            let mut stream = stream;
            stream.write_all(response.as_bytes()).unwrap();
        });
        addr
    }

    #[test]
    fn verify_accepts_matching_user() {
        let addr = spawn_ident_server("55555 , 443 : USERID : UNIX : alice\r\n");
        let peer = SocketAddr::new(addr.ip(), 55555);
        let local: SocketAddr = "127.0.0.1:443".parse().unwrap();
        verify(peer, local, "alice", addr.port(), Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn verify_refuses_mismatched_user() {
        let addr = spawn_ident_server("55555 , 443 : USERID : UNIX : bob\r\n");
        let peer = SocketAddr::new(addr.ip(), 55555);
        let local: SocketAddr = "127.0.0.1:443".parse().unwrap();
        let err = verify(peer, local, "alice", addr.port(), Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, EngineError::IdentRejected(user) if user == "bob"));
    }

    #[test]
    fn verify_rejects_malformed_response() {
        let addr = spawn_ident_server("55555 , 443 : ERROR : NO-USER\r\n");
        let peer = SocketAddr::new(addr.ip(), 55555);
        let local: SocketAddr = "127.0.0.1:443".parse().unwrap();
        let err = verify(peer, local, "alice", addr.port(), Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, EngineError::Ident(_)));
    }

    #[test]
    fn parses_wellformed_response() {
        assert_eq!(
            parse_userid("55555 , 443 : USERID : UNIX : bob\r"),
            Some("bob")
        );
    }

    #[test]
    fn parses_without_surrounding_spaces() {
        assert_eq!(parse_userid("6191,23:USERID:UNIX:alice"), Some("alice"));
    }

    #[test]
    fn rejects_error_response() {
        assert_eq!(parse_userid("6191 , 23 : ERROR : NO-USER"), None);
    }

    #[test]
    fn rejects_truncated_response() {
        assert_eq!(parse_userid("6191 , 23 : USERID : UNIX"), None);
        assert_eq!(parse_userid(""), None);
    }

    #[test]
    fn username_stops_at_whitespace() {
        assert_eq!(
            parse_userid("1 , 2 : USERID : UNIX : carol extra"),
            Some("carol")
        );
    }

    #[test]
    fn safe_string_masks_control_bytes() {
        assert_eq!(safe_string("bo\x1bb\x07"), "bo.b.");
        assert_eq!(safe_string("plain user"), "plain user");
    }

    #[test]
    fn exchange_against_fake_server() {
        let addr = spawn_ident_server("55555 , 443 : USERID : UNIX : bob\r\n");
        let slot =
            net::connect_nonblocking(addr, None, false, Duration::from_secs(2)).unwrap();
        net::write_all_timeout(slot.raw(), b"55555 , 443\r\n", Duration::from_secs(2)).unwrap();
        let line = net::read_line_timeout(slot.raw(), Duration::from_secs(2), MAX_RESPONSE).unwrap();
        assert_eq!(parse_userid(&line), Some("bob"));
    }
}
