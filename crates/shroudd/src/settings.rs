//! Daemon configuration: a TOML file with one `[global]` table and one
//! `[[service]]` table per tunnel, translated into the engine's
//! [`ServiceOptions`].

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use rustls::pki_types::ServerName;
use serde::Deserialize;

use shroud_core::protocol::SmtpStartTls;
use shroud_core::{
    AddrList, ExecSpec, Failover, RemoteTarget, ServiceOptions, SessionSlot, TlsContext,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Stay attached to the terminal; children keep their own stderr.
    #[serde(default)]
    pub foreground: bool,
    /// Default log filter, overridable on the command line.
    pub log: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    /// Listening address. Omitted only for exec+connect services, which
    /// spawn their program instead of accepting connections.
    pub accept: Option<SocketAddr>,
    /// Client mode: plaintext in, TLS out. Server mode otherwise.
    #[serde(default)]
    pub client: bool,
    /// Remote targets as `host:port`, tried under the failover policy.
    #[serde(default)]
    pub connect: Vec<String>,
    /// Program to spawn with its stdio piped through the tunnel.
    pub exec: Option<String>,
    /// Full argv for the program; defaults to `[exec]`.
    #[serde(default)]
    pub exec_args: Vec<String>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Trust anchors: client-mode server verification, or server-mode
    /// client-certificate verification when `verify_peer` is set.
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub verify_peer: bool,
    /// TLS server name for client mode; defaults to the first connect host.
    pub sni: Option<String>,
    pub source: Option<SocketAddr>,
    pub username: Option<String>,
    #[serde(default = "default_ident_port")]
    pub ident_port: u16,
    /// Pre-TLS negotiation: currently `"smtp"`.
    pub protocol: Option<String>,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub transparent: bool,
    #[serde(default)]
    pub xforwardedfor: bool,
    #[serde(default)]
    pub retry: bool,
    #[serde(default)]
    pub pty: bool,
    /// Re-resolve the connect target for every session.
    #[serde(default)]
    pub delay: bool,
    #[serde(default = "default_timeout_busy")]
    pub timeout_busy: u64,
    #[serde(default = "default_timeout_idle")]
    pub timeout_idle: u64,
    #[serde(default = "default_timeout_close")]
    pub timeout_close: u64,
    pub preload_library: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailoverConfig {
    #[default]
    Prio,
    Rr,
}

fn default_ident_port() -> u16 {
    113
}

fn default_timeout_busy() -> u64 {
    300
}

fn default_timeout_idle() -> u64 {
    43200
}

fn default_timeout_close() -> u64 {
    60
}

pub fn load(path: &Path) -> anyhow::Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration {}", path.display()))?;
    let config: FileConfig = toml::from_str(&text)
        .with_context(|| format!("parsing configuration {}", path.display()))?;
    if config.services.is_empty() {
        bail!("no services configured");
    }
    Ok(config)
}

impl ServiceConfig {
    /// Translate into the engine's per-service options.
    pub fn build(&self, global: &GlobalConfig) -> anyhow::Result<Arc<ServiceOptions>> {
        if self.connect.is_empty() && self.exec.is_none() {
            bail!("service {}: needs connect targets or an exec program", self.name);
        }
        if self.accept.is_none() && (self.exec.is_none() || self.connect.is_empty()) {
            bail!(
                "service {}: omitting accept requires both exec and connect",
                self.name
            );
        }

        let tls = if self.client {
            self.client_context()?
        } else {
            self.server_context()?
        };

        let mut opt = ServiceOptions::new(self.name.clone(), tls);
        opt.remote = self.remote_target()?;
        opt.exec = self.exec.as_ref().map(|path| ExecSpec {
            path: path.clone(),
            args: if self.exec_args.is_empty() {
                vec![path.clone()]
            } else {
                self.exec_args.clone()
            },
        });
        opt.source = self.source;
        opt.username = self.username.clone();
        opt.ident_port = self.ident_port;
        opt.protocol = match self.protocol.as_deref() {
            None => None,
            Some("smtp") => Some(Arc::new(SmtpStartTls)),
            Some(other) => bail!("service {}: unknown protocol {other:?}", self.name),
        };
        opt.failover = match self.failover {
            FailoverConfig::Prio => Failover::Priority,
            FailoverConfig::Rr => Failover::RoundRobin,
        };
        opt.transparent = self.transparent;
        opt.xforwardedfor = self.xforwardedfor;
        opt.retry = self.retry;
        opt.pty = self.pty;
        opt.foreground = global.foreground;
        opt.preload_library = self.preload_library.clone();
        opt.timeout_busy = Duration::from_secs(self.timeout_busy);
        opt.timeout_idle = Duration::from_secs(self.timeout_idle);
        opt.timeout_close = Duration::from_secs(self.timeout_close);
        Ok(Arc::new(opt))
    }

    fn remote_target(&self) -> anyhow::Result<Option<RemoteTarget>> {
        if self.connect.is_empty() {
            return Ok(None);
        }
        if self.delay {
            // Delayed lookup supports a single host string.
            return Ok(Some(RemoteTarget::Delayed(self.connect[0].clone())));
        }
        let mut addrs = Vec::new();
        for target in &self.connect {
            let resolved = AddrList::resolve(target)
                .with_context(|| format!("service {}: resolving {target}", self.name))?;
            addrs.extend_from_slice(resolved.addrs());
        }
        Ok(Some(RemoteTarget::Resolved(AddrList::new(addrs))))
    }

    fn client_context(&self) -> anyhow::Result<TlsContext> {
        let mut roots = rustls::RootCertStore::empty();
        if let Some(ca) = &self.ca_file {
            for cert in read_certs(ca)? {
                roots
                    .add(cert)
                    .with_context(|| format!("service {}: bad CA certificate", self.name))?;
            }
        } else {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        let mut config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .context("TLS protocol versions")?
        .with_root_certificates(roots)
        .with_no_client_auth();

        // One stored session per service, replaced on renegotiation.
        config.resumption = rustls::client::Resumption::store(Arc::new(SessionSlot::default()));

        let sni = self
            .sni
            .clone()
            .or_else(|| {
                self.connect
                    .first()
                    .and_then(|t| t.rsplit_once(':').map(|(host, _)| host.to_string()))
            })
            .unwrap_or_else(|| "localhost".to_string());
        let server_name = ServerName::try_from(sni.clone())
            .with_context(|| format!("service {}: invalid SNI name {sni:?}", self.name))?;

        Ok(TlsContext::Client {
            config: Arc::new(config),
            server_name,
        })
    }

    fn server_context(&self) -> anyhow::Result<TlsContext> {
        let cert_path = self
            .cert
            .as_ref()
            .with_context(|| format!("service {}: server mode needs a cert", self.name))?;
        let key_path = self
            .key
            .as_ref()
            .with_context(|| format!("service {}: server mode needs a key", self.name))?;

        let certs = read_certs(cert_path)?;
        let key_file = File::open(key_path)
            .with_context(|| format!("service {}: opening {}", self.name, key_path.display()))?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .with_context(|| format!("service {}: reading private key", self.name))?
            .with_context(|| format!("service {}: no private key found", self.name))?;

        let builder = rustls::ServerConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .context("TLS protocol versions")?;

        let builder = if self.verify_peer {
            let ca = self
                .ca_file
                .as_ref()
                .with_context(|| format!("service {}: verify_peer needs ca_file", self.name))?;
            let mut roots = rustls::RootCertStore::empty();
            for cert in read_certs(ca)? {
                roots
                    .add(cert)
                    .with_context(|| format!("service {}: bad CA certificate", self.name))?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder_with_provider(
                Arc::new(roots),
                rustls::crypto::ring::default_provider().into(),
            )
            .build()
            .with_context(|| format!("service {}: client verifier", self.name))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let config = builder
            .with_single_cert(certs, key)
            .with_context(|| format!("service {}: certificate/key mismatch", self.name))?;
        Ok(TlsContext::Server {
            config: Arc::new(config),
        })
    }
}

fn read_certs(path: &Path) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file =
        File::open(path).with_context(|| format!("opening certificate {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificate {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> FileConfig {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn parses_minimal_client_service() {
        let config = parse(
            r#"
            [[service]]
            name = "smtp-out"
            accept = "127.0.0.1:2525"
            client = true
            connect = ["mail.example.com:465"]
            "#,
        );
        assert_eq!(config.services.len(), 1);
        let svc = &config.services[0];
        assert!(svc.client);
        assert_eq!(svc.timeout_busy, 300);
        assert_eq!(svc.timeout_idle, 43200);
        assert_eq!(svc.timeout_close, 60);
        assert_eq!(svc.failover, FailoverConfig::Prio);
    }

    #[test]
    fn parses_round_robin_and_flags() {
        let config = parse(
            r#"
            [global]
            foreground = true

            [[service]]
            name = "https"
            accept = "0.0.0.0:8443"
            connect = ["10.0.0.1:80", "10.0.0.2:80"]
            cert = "server.pem"
            key = "server.key"
            failover = "rr"
            xforwardedfor = true
            timeout_idle = 60
            "#,
        );
        assert!(config.global.foreground);
        let svc = &config.services[0];
        assert_eq!(svc.failover, FailoverConfig::Rr);
        assert!(svc.xforwardedfor);
        assert_eq!(svc.timeout_idle, 60);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<FileConfig>(
            r#"
            [[service]]
            name = "x"
            accept = "127.0.0.1:1"
            connect = ["127.0.0.1:2"]
            no_such_option = 1
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn build_requires_a_destination() {
        let config = parse(
            r#"
            [[service]]
            name = "empty"
            accept = "127.0.0.1:1"
            client = true
            "#,
        );
        let err = config.services[0].build(&config.global).unwrap_err();
        assert!(err.to_string().contains("connect targets"));
    }

    #[test]
    fn build_rejects_unknown_protocol() {
        let config = parse(
            r#"
            [[service]]
            name = "p"
            accept = "127.0.0.1:1"
            client = true
            connect = ["127.0.0.1:2"]
            protocol = "gopher"
            "#,
        );
        let err = config.services[0].build(&config.global).unwrap_err();
        assert!(err.to_string().contains("unknown protocol"));
    }

    #[test]
    fn build_client_options_with_numeric_connect() {
        let config = parse(
            r#"
            [[service]]
            name = "c"
            accept = "127.0.0.1:0"
            client = true
            connect = ["127.0.0.1:9999"]
            retry = true
            "#,
        );
        let opt = config.services[0].build(&config.global).unwrap();
        assert_eq!(opt.name, "c");
        assert!(opt.retry);
        assert_eq!(opt.mode(), shroud_core::Mode::Client);
        assert!(matches!(opt.remote, Some(RemoteTarget::Resolved(_))));
    }

    #[test]
    fn server_mode_without_cert_fails() {
        let config = parse(
            r#"
            [[service]]
            name = "s"
            accept = "127.0.0.1:0"
            connect = ["127.0.0.1:9999"]
            "#,
        );
        let err = config.services[0].build(&config.global).unwrap_err();
        assert!(err.to_string().contains("cert"));
    }
}
