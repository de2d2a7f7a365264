//! Pre-TLS protocol negotiation.
//!
//! Some protocols start in cleartext and upgrade to TLS mid-stream. A
//! [`ProtocolHook`] runs on the freshly connected remote socket after it
//! is opened and before the TLS handshake, so by the time the engine
//! starts encrypting the peer is ready for it.

use std::os::fd::RawFd;
use std::time::Duration;

use tracing::debug;

use crate::config::Mode;
use crate::error::{EngineError, EngineResult};
use crate::net;

/// Longest acceptable protocol response line.
const MAX_LINE: usize = 1023;

/// A pluggable cleartext negotiation run before the TLS handshake.
pub trait ProtocolHook: Send + Sync {
    fn name(&self) -> &'static str;

    /// Negotiate on the cleartext socket. `mode` tells the hook which side
    /// of the tunnel it is running on; `timeout` bounds each exchange.
    fn negotiate(&self, fd: RawFd, mode: Mode, timeout: Duration) -> EngineResult<()>;
}

/// SMTP STARTTLS (RFC 3207), client side: greet, EHLO, STARTTLS, then
/// hand the socket over for the TLS handshake.
pub struct SmtpStartTls;

impl SmtpStartTls {
    /// Read one SMTP reply, following continuation lines (`250-...`) to
    /// the final `NNN ` line, and check the reply code.
    fn expect_reply(fd: RawFd, code: &str, timeout: Duration) -> EngineResult<String> {
        loop {
            let line = net::read_line_timeout(fd, timeout, MAX_LINE)?;
            if line.len() < 3 || !line.starts_with(code) {
                return Err(EngineError::Negotiate(format!(
                    "expected {code}, got {line:?}"
                )));
            }
            if line.as_bytes().get(3) != Some(&b'-') {
                return Ok(line);
            }
            // continuation line, keep reading
        }
    }
}

impl ProtocolHook for SmtpStartTls {
    fn name(&self) -> &'static str {
        "smtp"
    }

    fn negotiate(&self, fd: RawFd, mode: Mode, timeout: Duration) -> EngineResult<()> {
        if mode == Mode::Server {
            return Err(EngineError::Negotiate(
                "server-side SMTP negotiation is not supported".into(),
            ));
        }
        let greeting = Self::expect_reply(fd, "220", timeout)?;
        debug!(%greeting, "SMTP server greeted");
        net::write_all_timeout(fd, b"EHLO localhost\r\n", timeout)?;
        Self::expect_reply(fd, "250", timeout)?;
        net::write_all_timeout(fd, b"STARTTLS\r\n", timeout)?;
        Self::expect_reply(fd, "220", timeout)?;
        debug!("SMTP STARTTLS accepted");
        Ok(())
    }
}
