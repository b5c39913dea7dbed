//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sensorhubd", about = "sensor hub daemon and client")]
pub struct Cli {
    /// Control socket path (default: $XDG_RUNTIME_DIR/sensorhub/control.sock)
    #[arg(long, short = 's', global = true, env = "SENSORHUB_CONTROL_SOCKET")]
    pub socket_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon (hardware channels + data and control sockets)
    Daemon(DaemonOpts),
    /// List channels and their engine state (JSON)
    Channels,
    /// Open a session on a channel and print its samples
    Listen(ListenOpts),
    /// Release all hardware (display blanked)
    Standby,
    /// Re-engage hardware released by `standby`
    Resume,
}

#[derive(clap::Args)]
pub struct DaemonOpts {
    /// Configuration file
    #[arg(long, short = 'c', default_value = "/etc/sensorhub/sensorhubd.toml")]
    pub config: PathBuf,

    /// Data socket path, overriding the configuration file
    #[arg(long)]
    pub data_socket: Option<PathBuf>,
}

#[derive(clap::Args)]
pub struct ListenOpts {
    /// Channel name as listed by `channels`
    pub channel: String,

    /// Requested sampling interval in milliseconds (0: hardware rate)
    #[arg(long)]
    pub interval_ms: Option<u32>,

    /// Exit after this many samples
    #[arg(long, short = 'n')]
    pub count: Option<usize>,

    /// Batch this many samples per socket write
    #[arg(long)]
    pub batch: Option<usize>,
}

/// Per-user runtime directory for the sockets.
pub fn default_runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("sensorhub");
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/sensorhub-{user}"))
}

pub fn default_control_socket_path() -> PathBuf {
    default_runtime_dir().join("control.sock")
}

pub fn default_data_socket_path() -> PathBuf {
    default_runtime_dir().join("data.sock")
}
