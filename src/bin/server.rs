use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use huddle::server::Server;

#[derive(Parser)]
#[command(name = "server", about = "huddle real-time hub server")]
struct Args {
    /// TCP address to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,

    /// Directory for persistent storage
    #[arg(long, default_value = "./data")]
    data: String,

    /// Number of message-persistence worker tasks
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let srv = Arc::new(Server::new(&args.data, args.workers)?);

    // Graceful shutdown on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down…");
        std::process::exit(0);
    });

    srv.listen_and_serve(&args.addr).await
}
