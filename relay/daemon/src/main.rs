//! Relay Daemon
//!
//! Bridges a local Unix datagram socket and an rpmsg endpoint exposed as a
//! character device. Local clients send framed datagrams to the relay
//! socket; the last message from the remote processor is also readable by
//! anyone connecting to the read socket.
//!
//! # Usage
//!
//! ```bash
//! # Relay /dev/rpmsg0 with the defaults
//! relay-daemon
//!
//! # Another endpoint and device
//! relay-daemon --endpoint kws-app --protocol-id 19 --device /dev/rpmsg1
//!
//! # Without hardware: the remote side echoes every message
//! RUST_LOG=debug relay-daemon --loopback
//! ```
//!
//! # Files
//!
//! - Relay socket: `<runtime_dir>/nl-<protocol_id>.sock`
//! - Read socket: `<runtime_dir>/<endpoint>.last`
//! - PID file: `<runtime_dir>/relay-daemon.pid`
//!
//! `runtime_dir` defaults to `$XDG_RUNTIME_DIR/rproc-relay` (or
//! `/tmp/rproc-relay-$UID`).
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (tears down the relay, removes the
//!   PID file and sockets)

mod server;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use relay_core::channel::{MemoryRemoteChannel, RpmsgCharChannel, UnixDatagramProvider};
use relay_core::{
    default_config_path, load_config_with_overrides, ConfigOverrides, RelayConfig,
    RelayRegistry, RemoteChannel,
};

use crate::server::{ReaderServer, ServerConfig};

/// Relay between a local datagram socket and a remote processor endpoint
#[derive(Debug, Parser)]
#[command(name = "relay-daemon", version, about)]
struct Args {
    /// Configuration file (default: $XDG_CONFIG_HOME/rproc-relay/relay.toml)
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Local channel protocol id
    #[arg(long)]
    protocol_id: Option<u32>,

    /// Remote endpoint name
    #[arg(long)]
    endpoint: Option<String>,

    /// rpmsg character device
    #[arg(long)]
    device: Option<PathBuf>,

    /// MTU of the rpmsg endpoint
    #[arg(long)]
    mtu: Option<usize>,

    /// Directory for sockets and the PID file
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Use an in-process remote side that echoes every message
    #[arg(long)]
    loopback: bool,

    /// Allow more than one active pairing
    #[arg(long)]
    multi_instance: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(id) = self.protocol_id {
            overrides = overrides.with_protocol_id(id);
        }
        if let Some(ref name) = self.endpoint {
            overrides = overrides.with_endpoint_name(name.clone());
        }
        if let Some(ref device) = self.device {
            overrides = overrides.with_remote_device(device.clone());
        }
        if let Some(mtu) = self.mtu {
            overrides = overrides.with_remote_mtu(mtu);
        }
        if let Some(ref dir) = self.runtime_dir {
            overrides = overrides.with_runtime_dir(dir.clone());
        }
        if self.multi_instance {
            overrides = overrides.with_single_instance(false);
        }
        overrides
    }
}

/// Resolve the final configuration: file, environment, then CLI
fn resolve_config(args: &Args) -> Result<RelayConfig> {
    let path = args.config.clone().or_else(default_config_path);
    load_config_with_overrides(path, &args.overrides()).context("Failed to load configuration")
}

/// Write the PID file, refusing to run next to a live daemon
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    if let Ok(existing) = fs::read_to_string(path) {
        if let Ok(pid) = existing.trim().parse::<i32>() {
            let ours = u32::try_from(pid).ok() == Some(std::process::id());
            let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
            if alive && !ours {
                anyhow::bail!("Another relay daemon is running (pid {pid})");
            }
        }
        warn!(path = ?path, "Replacing stale PID file");
    }

    let pid = std::process::id();
    let mut file = fs::File::create(path)?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove the PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Resolve when SIGINT or SIGTERM arrives
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = async move {
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to install Ctrl+C handler")?;
            info!("Received Ctrl+C, shutting down");
        }
        () = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }

    Ok(())
}

fn open_remote(config: &RelayConfig, loopback: bool) -> Result<Arc<dyn RemoteChannel>> {
    if loopback {
        info!(mtu = config.remote_mtu, "Using loopback remote channel");
        return Ok(Arc::new(MemoryRemoteChannel::loopback(config.remote_mtu)));
    }

    let channel = RpmsgCharChannel::open(&config.remote_device, config.remote_mtu)
        .with_context(|| format!("Failed to open {:?}", config.remote_device))?;
    Ok(Arc::new(channel))
}

/// Everything between PID file creation and its removal
async fn serve(config: &RelayConfig, loopback: bool) -> Result<()> {
    let runtime_dir = config.runtime_dir();
    let registry = RelayRegistry::from_config(config);
    let provider = UnixDatagramProvider::new(&runtime_dir);

    let remote = open_remote(config, loopback)?;
    let handle = registry
        .establish(config, remote, &provider)
        .await
        .with_context(|| format!("Failed to establish endpoint {}", config.endpoint_name))?;

    info!(
        endpoint = %config.endpoint_name,
        socket = ?provider.socket_path(config.protocol_id),
        "Relay established"
    );

    let reader_server = ReaderServer::new(
        config.reader_socket_path(),
        config.endpoint_name.clone(),
        registry.clone(),
        ServerConfig {
            read_chunk: config.read_chunk,
            ..ServerConfig::default()
        },
    );
    let listener = match reader_server.bind() {
        Ok(listener) => listener,
        Err(e) => {
            registry.teardown_all().await;
            return Err(e);
        }
    };

    info!(path = ?reader_server.socket_path(), "Passive read surface ready");

    let stop_readers = Arc::new(AtomicBool::new(false));
    let reader_task = {
        let stop = Arc::clone(&stop_readers);
        tokio::spawn(async move { reader_server.run(listener, stop).await })
    };

    let outcome = tokio::select! {
        result = shutdown_signal() => result,
        () = handle.closed() => {
            warn!(endpoint = %config.endpoint_name, "Remote endpoint went away");
            Ok(())
        }
    };

    info!("Performing graceful shutdown...");
    registry.teardown_all().await;

    stop_readers.store(true, Ordering::SeqCst);
    match reader_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Read server shutdown error"),
        Err(e) => warn!(error = %e, "Read server task failed"),
    }

    let stats = handle.stats();
    info!(
        local_received = stats.local_received,
        remote_received = stats.remote_received,
        dropped_oversize = stats.dropped_oversize,
        send_failures = stats.send_failures,
        "Relay statistics"
    );

    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_daemon=info".parse()?)
                .add_directive("relay_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    let config = resolve_config(&args)?;

    info!("Starting Relay Daemon");
    info!(
        source = %config.source,
        endpoint = %config.endpoint_name,
        protocol_id = config.protocol_id,
        "Configuration loaded"
    );

    let pid_path = config.runtime_dir().join("relay-daemon.pid");
    if let Err(e) = write_pid_file(&pid_path) {
        error!(error = %e, "Failed to write PID file");
        return Err(e.context(format!("Failed to write PID file at {pid_path:?}")));
    }

    let result = serve(&config, args.loopback).await;
    if let Err(ref e) = result {
        error!(error = %e, "Relay daemon failed");
    }

    remove_pid_file(&pid_path);
    info!("Relay daemon stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_args_map_to_overrides() {
        let args = Args::parse_from([
            "relay-daemon",
            "--protocol-id",
            "19",
            "--endpoint",
            "kws-app",
            "--mtu",
            "256",
            "--multi-instance",
        ]);
        let mut config = RelayConfig::default();
        args.overrides().apply(&mut config);

        assert_eq!(config.protocol_id, 19);
        assert_eq!(config.endpoint_name, "kws-app");
        assert_eq!(config.remote_mtu, 256);
        assert!(!config.single_instance);
        assert!(!args.loopback);
    }

    #[test]
    fn test_cli_mtu_replaces_invalid_env_mtu() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("relay.toml");
        let missing = missing.to_str().unwrap();

        std::env::set_var("RELAY_MTU", "0");
        let fixed = resolve_config(&Args::parse_from([
            "relay-daemon",
            "--config",
            missing,
            "--mtu",
            "496",
        ]));
        let broken = resolve_config(&Args::parse_from(["relay-daemon", "--config", missing]));
        std::env::remove_var("RELAY_MTU");

        assert_eq!(fixed.unwrap().remote_mtu, 496);
        assert!(broken.is_err());
    }

    #[test]
    fn test_no_args_no_overrides() {
        let args = Args::parse_from(["relay-daemon"]);
        assert!(args.overrides().is_empty());
    }

    #[test]
    fn test_pid_file_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run").join("relay-daemon.pid");

        write_pid_file(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());

        // Our own PID does not count as another daemon
        write_pid_file(&path).unwrap();

        remove_pid_file(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_pid_file_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("relay-daemon.pid");
        fs::write(&path, "not-a-pid\n").unwrap();

        write_pid_file(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());
    }
}
