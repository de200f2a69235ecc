mod config;
mod connection;
mod server;

use std::path::PathBuf;

use clap::Parser;
use libakrun::LogRedirect;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "akrun-server", about = "akrun scheduling daemon", version)]
struct Args {
    /// Config file (defaults to ~/.config/akrun/config.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the front-end socket path
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Task steps temporarily point this writer at the task's own log file.
    let redirect = LogRedirect::new();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("libakrun=info".parse()?)
                .add_directive("akrun_server=info".parse()?),
        )
        .with_writer(redirect.clone())
        .with_ansi(false)
        .init();

    let mut config = config::ServerConfig::load(args.config.as_deref())?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    server::run(config, redirect).await
}
