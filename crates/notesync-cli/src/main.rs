//! notesync: command-line front end for the local-first notes engine.
//!
//! Local state lives in the data directory; a shared directory acts as the
//! remote mirror between devices.

use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use notesync_cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,notesync_core=debug,notesync_cli=debug"
    } else {
        "info,notesync_core=info,notesync_cli=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!("Data directory: {:?}", cli.data);
    notesync_cli::run(cli, &mut std::io::stdout()).await
}
