//! shroudd — the tunnel daemon.
//!
//! Loads the TOML configuration, builds one [`ServiceOptions`] per
//! service, and runs each service in its own listener thread with one
//! thread per session. Services configured with both `exec` and `connect`
//! have no listener at all: the daemon spawns the program, tunnels its
//! stdio to the remote, and optionally respawns it when the session ends.

mod settings;

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use shroud_core::spawn::{spawn_program, SpawnEnv};
use shroud_core::{ServiceOptions, Session};

/// Live session count across all services.
static NUM_CLIENTS: AtomicUsize = AtomicUsize::new(0);

#[derive(Parser)]
#[command(name = "shroudd", about = "Universal TLS tunneling proxy")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "shroud.toml")]
    config: PathBuf,
    /// Log filter, e.g. "info" or "shroud_core=debug".
    #[arg(long)]
    log: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = settings::load(&cli.config)?;

    let filter = cli
        .log
        .or_else(|| config.global.log.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).context("log filter")?)
        .init();

    let mut handles = Vec::new();
    for service in &config.services {
        let opt = service.build(&config.global)?;
        let accept = service.accept;
        let name = service.name.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("svc-{name}"))
                .spawn(move || {
                    let outcome = match accept {
                        Some(addr) => serve(addr, opt),
                        None => exec_connect_loop(opt),
                    };
                    if let Err(err) = outcome {
                        error!(service = %name, %err, "service terminated");
                    }
                })
                .context("spawning service thread")?,
        );
    }
    info!(services = config.services.len(), "shroudd running");

    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

/// Accept loop: one thread per connection.
fn serve(accept: std::net::SocketAddr, opt: Arc<ServiceOptions>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(accept)
        .with_context(|| format!("service {}: binding {accept}", opt.name))?;
    info!(service = %opt.name, %accept, "listening");

    loop {
        let (stream, _) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(service = %opt.name, %err, "accept failed");
                continue;
            }
        };
        let thread_opt = Arc::clone(&opt);
        let spawned = thread::Builder::new()
            .name(format!("con-{}", opt.name))
            .spawn(move || {
                NUM_CLIENTS.fetch_add(1, Ordering::Relaxed);
                debug!(service = %thread_opt.name, "session started");
                let _ = Session::from_stream(Arc::clone(&thread_opt), stream).run();
                let left = NUM_CLIENTS.fetch_sub(1, Ordering::Relaxed) - 1;
                debug!(service = %thread_opt.name, left, "session finished");
            });
        if let Err(err) = spawned {
            error!(service = %opt.name, %err, "spawning session thread failed");
        }
    }
}

/// exec+connect mode: spawn the program, tunnel its stdio to the remote,
/// and respawn after the session ends when `retry` is on.
fn exec_connect_loop(opt: Arc<ServiceOptions>) -> anyhow::Result<()> {
    let exec = opt
        .exec
        .as_ref()
        .context("exec+connect service without a program")?
        .clone();
    loop {
        let env = SpawnEnv {
            peer_host: "localhost".to_string(),
            ..Default::default()
        };
        let child = spawn_program(&exec, opt.pty, &env, !opt.foreground)
            .context("spawning tunneled program")?;
        let _ = Session::from_fds(Arc::clone(&opt), child.fd, None).run();
        if !opt.retry {
            return Ok(());
        }
        thread::sleep(Duration::from_secs(1));
    }
}
