//! Shroud — universal TLS tunneling proxy, per-connection engine.
//!
//! Each accepted connection gets one [`Session`]: it identifies the peer,
//! optionally verifies it via IDENT, opens the other side of the relay
//! (outbound TCP with failover, or a spawned program piped through a
//! socket pair), runs any cleartext protocol negotiation, completes the
//! TLS handshake, and then hands all four descriptors to the transfer
//! state machine until both directions are closed.
//!
//! # Components
//!
//! - **`session`** — per-connection lifecycle: setup, transfer, teardown
//! - **`transfer`** — the event-driven relay state machine
//! - **`tls`** — TLS engine over rustls, with want-read/want-write codes
//! - **`poll`** — readiness multiplexer over `poll(2)`
//! - **`net`** — non-blocking connect, failover, socket pairs, line I/O
//! - **`addr`** — resolved address lists with priority/round-robin failover
//! - **`ident`** — RFC 1413 user verification
//! - **`protocol`** — pre-TLS negotiation hooks (SMTP STARTTLS)
//! - **`spawn`** — local program execution with stdio piping
//! - **`headers`** — X-Forwarded-For injection into the decrypted stream

pub mod addr;
pub mod config;
pub mod error;
pub mod fd;
pub mod headers;
pub mod ident;
pub mod net;
pub mod poll;
pub mod protocol;
pub mod session;
pub mod spawn;
pub mod tls;
pub mod transfer;

pub use addr::{AddrList, Failover};
pub use config::{ExecSpec, Mode, RemoteTarget, ServiceOptions, TlsContext};
pub use error::{EngineError, EngineResult};
pub use session::Session;
pub use tls::{SessionSlot, TlsEngine};
pub use transfer::TransferStats;
