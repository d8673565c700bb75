//! command line interface.
//!
//! the cli is a thin shell; everything interesting lives in the library.

mod serve;

use clap::{Parser, Subcommand};

pub use serve::ServeCommand;

/// ironscale - mesh vpn coordination server.
#[derive(Parser, Debug)]
#[command(name = "ironscale", version, about)]
pub struct Cli {
    /// subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// run the coordination server.
    Serve(ServeCommand),
}
