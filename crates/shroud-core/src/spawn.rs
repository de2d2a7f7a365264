//! Local program execution with its stdio piped through the relay.
//!
//! The child is wired to one end of a connected socket pair (or a pty
//! slave when the service asks for one); the parent keeps the other end
//! and relays it like any plaintext descriptor. The child environment
//! describes the peer and, when a client certificate was presented, its
//! subject and issuer names.

use std::ffi::CString;
use std::io;

use tracing::{debug, info};

use crate::config::ExecSpec;
use crate::error::{EngineError, EngineResult};
use crate::fd::FdSlot;
use crate::net;

/// Environment handed to the spawned program.
#[derive(Debug, Default)]
pub struct SpawnEnv {
    /// Peer host for `REMOTE_HOST` (IP only, no port).
    pub peer_host: String,
    /// Helper library for `LD_PRELOAD`/`_RLD_LIST` in transparent mode.
    pub preload: Option<std::path::PathBuf>,
    /// Sanitized client certificate subject for `SSL_CLIENT_DN`.
    pub client_dn: Option<String>,
    /// Sanitized client certificate issuer for `SSL_CLIENT_I_DN`.
    pub client_issuer_dn: Option<String>,
}

/// A running child with the parent's end of its stdio channel.
pub struct SpawnedChild {
    pub fd: FdSlot,
    pub pid: libc::pid_t,
}

/// Fork and exec the configured program, returning the parent's end of
/// the stdio channel. `redirect_stderr` also points the child's stderr at
/// the channel (off when the enclosing daemon runs in the foreground).
pub fn spawn_program(
    exec: &ExecSpec,
    use_pty: bool,
    env: &SpawnEnv,
    redirect_stderr: bool,
) -> EngineResult<SpawnedChild> {
    let (parent_fd, child_fd) = if use_pty {
        let pair = openpty_pair().map_err(EngineError::Spawn)?;
        debug!("pty allocated for child stdio");
        pair
    } else {
        make_stdio_pair()?
    };

    // Everything the child touches after fork() is prepared up front:
    // only async-signal-safe calls happen between fork and exec.
    let prog = cstring(&exec.path)?;
    let args: Vec<CString> = exec
        .args
        .iter()
        .map(|a| cstring(a))
        .collect::<EngineResult<_>>()?;
    let mut argv: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());
    let env_vars = build_env(env)?;

    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(EngineError::Spawn(io::Error::last_os_error())),
        0 => {
            // Child. No allocation, no locks, no return.
            unsafe {
                libc::close(parent_fd.raw());
                libc::dup2(child_fd.raw(), 0);
                libc::dup2(child_fd.raw(), 1);
                if redirect_stderr {
                    libc::dup2(child_fd.raw(), 2);
                }
                if child_fd.raw() > 2 {
                    libc::close(child_fd.raw());
                }
                for var in &env_vars {
                    libc::putenv(var.as_ptr() as *mut libc::c_char);
                }
                let mut mask: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut mask);
                libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
                libc::execvp(prog.as_ptr(), argv.as_ptr());
                libc::_exit(1)
            }
        }
        pid => {
            drop(child_fd);
            parent_fd
                .set_cloexec()
                .map_err(|e| EngineError::io("fcntl FD_CLOEXEC", e))?;
            info!(pid, program = %exec.path, "local mode child started");
            Ok(SpawnedChild { fd: parent_fd, pid })
        }
    }
}

/// Wait for a spawned child, returning its exit status if it has one.
pub fn reap(pid: libc::pid_t) -> Option<i32> {
    let mut status: libc::c_int = 0;
    let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
    if rc == pid && libc::WIFEXITED(status) {
        Some(libc::WEXITSTATUS(status))
    } else {
        None
    }
}

/// Non-blocking reap, used at session teardown; a child that outlives the
/// session is left for the process-wide reaper.
pub fn reap_nonblocking(pid: libc::pid_t) -> Option<i32> {
    let mut status: libc::c_int = 0;
    let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    if rc == pid && libc::WIFEXITED(status) {
        Some(libc::WEXITSTATUS(status))
    } else {
        None
    }
}

fn make_stdio_pair() -> EngineResult<(FdSlot, FdSlot)> {
    net::make_socket_pair()
}

fn openpty_pair() -> io::Result<(FdSlot, FdSlot)> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((FdSlot::new(master, false), FdSlot::new(slave, false)))
}

fn build_env(env: &SpawnEnv) -> EngineResult<Vec<CString>> {
    let mut vars = Vec::new();
    vars.push(cstring(&format!("REMOTE_HOST={}", env.peer_host))?);
    if let Some(preload) = &env.preload {
        let path = preload.display();
        vars.push(cstring(&format!("LD_PRELOAD={path}"))?);
        // Tru64 loaders read _RLD_LIST instead.
        vars.push(cstring(&format!("_RLD_LIST={path}:DEFAULT"))?);
    }
    if let Some(dn) = &env.client_dn {
        vars.push(cstring(&format!("SSL_CLIENT_DN={dn}"))?);
    }
    if let Some(dn) = &env.client_issuer_dn {
        vars.push(cstring(&format!("SSL_CLIENT_I_DN={dn}"))?);
    }
    Ok(vars)
}

fn cstring(s: &str) -> EngineResult<CString> {
    CString::new(s).map_err(|_| EngineError::Spawn(io::Error::new(
        io::ErrorKind::InvalidInput,
        "embedded NUL in exec argument",
    )))
}

/// Extract sanitized subject and issuer names from a DER certificate for
/// the child environment.
pub fn certificate_names(der: &[u8]) -> Option<(String, String)> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let subject = crate::ident::safe_string(&cert.subject().to_string());
    let issuer = crate::ident::safe_string(&cert.issuer().to_string());
    Some((subject, issuer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::{read_fd, write_fd, Shut, shutdown_fd};

    fn exec(path: &str, args: &[&str]) -> ExecSpec {
        ExecSpec {
            path: path.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn read_all(fd: &FdSlot) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match read_fd(fd.raw(), &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
            }
        }
        out
    }

    #[test]
    fn child_stdio_is_piped_through_the_pair() {
        let child = spawn_program(
            &exec("cat", &["cat"]),
            false,
            &SpawnEnv {
                peer_host: "127.0.0.1".into(),
                ..Default::default()
            },
            true,
        )
        .unwrap();

        write_fd(child.fd.raw(), b"echo through cat\n").unwrap();
        shutdown_fd(child.fd.raw(), Shut::Write).unwrap();
        let out = read_all(&child.fd);
        assert_eq!(out, b"echo through cat\n");
        assert_eq!(reap(child.pid), Some(0));
    }

    #[test]
    fn remote_host_is_exported() {
        let child = spawn_program(
            &exec("sh", &["sh", "-c", "printf '%s' \"$REMOTE_HOST\""]),
            false,
            &SpawnEnv {
                peer_host: "192.0.2.7".into(),
                ..Default::default()
            },
            true,
        )
        .unwrap();

        let out = read_all(&child.fd);
        assert_eq!(out, b"192.0.2.7");
        assert_eq!(reap(child.pid), Some(0));
    }

    #[test]
    fn client_dn_is_exported_when_present() {
        let child = spawn_program(
            &exec("sh", &["sh", "-c", "printf '%s' \"$SSL_CLIENT_DN\""]),
            false,
            &SpawnEnv {
                peer_host: "127.0.0.1".into(),
                client_dn: Some("CN=alice, O=Example".into()),
                ..Default::default()
            },
            true,
        )
        .unwrap();

        let out = read_all(&child.fd);
        assert_eq!(out, b"CN=alice, O=Example");
        assert_eq!(reap(child.pid), Some(0));
    }

    #[test]
    fn exec_failure_exits_one() {
        let child = spawn_program(
            &exec("/nonexistent/program", &["/nonexistent/program"]),
            false,
            &SpawnEnv {
                peer_host: "127.0.0.1".into(),
                ..Default::default()
            },
            true,
        )
        .unwrap();
        assert_eq!(reap(child.pid), Some(1));
    }

    #[test]
    fn certificate_names_from_der() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["client.example".to_string()]).unwrap();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, "alice");
        params.distinguished_name = dn;
        let cert = params.self_signed(&key_pair).unwrap();

        let (subject, issuer) = certificate_names(cert.der()).unwrap();
        assert!(subject.contains("alice"), "subject was {subject:?}");
        // Self-signed: issuer equals subject.
        assert_eq!(subject, issuer);
    }
}
