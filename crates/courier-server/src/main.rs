//! # Courier
//!
//! Entry point for the `courier` binary.

use clap::Parser;
use courier_server::{app, cli::Cli};
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = app::run(cli).await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
