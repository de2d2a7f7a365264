//! Per-service configuration.
//!
//! The enclosing accept/dispatch layer builds one [`ServiceOptions`] per
//! configured service and hands an `Arc` of it to every session. Everything
//! here is immutable for the lifetime of the service; the only shared
//! mutable state (the client session slot, the round-robin cursor) lives
//! behind its own synchronization inside the TLS config and [`AddrList`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;

use crate::addr::{AddrList, Failover};
use crate::protocol::ProtocolHook;

/// Relay buffer size per direction.
pub const BUFFSIZE: usize = 16384;

/// Bytes held back from the buffer until the X-Forwarded-For header has
/// been inserted, guaranteeing room for the in-place insertion.
pub const BUFF_RESERVED: usize = 256;

/// Which side of the relay speaks TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Plaintext accepted locally, TLS established outbound.
    Client,
    /// TLS accepted locally, plaintext forwarded to the backend.
    Server,
}

/// The configured TLS context for a service.
#[derive(Clone)]
pub enum TlsContext {
    Client {
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    },
    Server {
        config: Arc<rustls::ServerConfig>,
    },
}

impl TlsContext {
    pub fn mode(&self) -> Mode {
        match self {
            TlsContext::Client { .. } => Mode::Client,
            TlsContext::Server { .. } => Mode::Server,
        }
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsContext::Client { server_name, .. } => f
                .debug_struct("TlsContext::Client")
                .field("server_name", server_name)
                .finish_non_exhaustive(),
            TlsContext::Server { .. } => {
                f.debug_struct("TlsContext::Server").finish_non_exhaustive()
            }
        }
    }
}

/// Where the non-accepted side of the relay goes.
#[derive(Debug)]
pub enum RemoteTarget {
    /// Addresses resolved once at config load.
    Resolved(AddrList),
    /// Host string re-resolved for every session (`delay` option).
    Delayed(String),
}

/// A local program to spawn with its stdio piped through the relay.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// Program path, looked up via `PATH` semantics (`execvp`).
    pub path: String,
    /// Full argv including `argv[0]`.
    pub args: Vec<String>,
}

/// Immutable per-service options.
pub struct ServiceOptions {
    pub name: String,
    pub tls: TlsContext,
    /// Remote peer to connect to. `None` means the service pipes a spawned
    /// program instead (`exec` without `connect`).
    pub remote: Option<RemoteTarget>,
    pub exec: Option<ExecSpec>,
    /// Explicit source address for the outbound socket.
    pub source: Option<SocketAddr>,
    /// IDENT username requirement; `None` disables the lookup.
    pub username: Option<String>,
    /// Port of the peer's ident service (the "auth" service, normally 113).
    pub ident_port: u16,
    /// Pre-TLS negotiation (e.g. SMTP STARTTLS).
    pub protocol: Option<Arc<dyn ProtocolHook>>,
    pub failover: Failover,
    pub transparent: bool,
    pub xforwardedfor: bool,
    /// Respawn the program and reconnect after a session ends
    /// (exec+connect mode only).
    pub retry: bool,
    /// Allocate a pty instead of a socket pair for the spawned program.
    pub pty: bool,
    /// The enclosing daemon runs in the foreground; spawned children then
    /// keep their own stderr instead of the relay channel.
    pub foreground: bool,
    pub nodelay: bool,
    pub keepalive: bool,
    /// Helper library exported via `LD_PRELOAD` to spawned children in
    /// transparent mode.
    pub preload_library: Option<PathBuf>,
    /// Bounds each blocking step of connection setup and handshake.
    pub timeout_busy: Duration,
    /// Bounds silence during active transfer.
    pub timeout_idle: Duration,
    /// Bounds the close_notify tail once a side has closed.
    pub timeout_close: Duration,
}

impl ServiceOptions {
    /// Options with stunnel-compatible defaults; callers adjust fields.
    pub fn new(name: impl Into<String>, tls: TlsContext) -> Self {
        Self {
            name: name.into(),
            tls,
            remote: None,
            exec: None,
            source: None,
            username: None,
            ident_port: 113,
            protocol: None,
            failover: Failover::Priority,
            transparent: false,
            xforwardedfor: false,
            retry: false,
            pty: false,
            foreground: false,
            nodelay: true,
            keepalive: false,
            preload_library: None,
            timeout_busy: Duration::from_secs(300),
            timeout_idle: Duration::from_secs(43200),
            timeout_close: Duration::from_secs(60),
        }
    }

    pub fn mode(&self) -> Mode {
        self.tls.mode()
    }
}

impl std::fmt::Debug for ServiceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceOptions")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .field("failover", &self.failover)
            .field("xforwardedfor", &self.xforwardedfor)
            .finish_non_exhaustive()
    }
}
