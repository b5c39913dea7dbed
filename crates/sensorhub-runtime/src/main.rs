//! sensorhubd: sensor hub daemon and its command-line client.
//! One binary: `daemon` runs the hub, the other subcommands talk to it over
//! the control socket.

use clap::Parser;

mod channel;
mod cli;
mod client;
mod config;
mod context;
mod control;
mod daemon;
mod dispatch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    match args.command {
        cli::Command::Daemon(opts) => {
            let filter = std::env::var("SENSORHUB_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                .init();

            tracing::info!("sensorhub daemon starting");

            daemon::run_daemon(opts, args.socket_path).await?;
        }
        cli::Command::Channels => {
            let socket_path = args.socket_path.unwrap_or_else(cli::default_control_socket_path);
            client::cmd_channels(&socket_path).await?;
        }
        cli::Command::Listen(opts) => {
            let socket_path = args.socket_path.unwrap_or_else(cli::default_control_socket_path);
            client::cmd_listen(&socket_path, &opts).await?;
        }
        cli::Command::Standby => {
            let socket_path = args.socket_path.unwrap_or_else(cli::default_control_socket_path);
            client::cmd_power(&socket_path, "standby").await?;
        }
        cli::Command::Resume => {
            let socket_path = args.socket_path.unwrap_or_else(cli::default_control_socket_path);
            client::cmd_power(&socket_path, "resume").await?;
        }
    }

    Ok(())
}
