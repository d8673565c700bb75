//! ironscale - mesh vpn coordination server.

use clap::Parser;
use color_eyre::eyre::Result;

use ironscale::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    match cli.command {
        Command::Serve(cmd) => cmd.run().await,
    }
}
