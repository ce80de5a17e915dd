use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "board-notify")]
#[command(
    version,
    about = "Batches board and card changes into digest notifications",
    disable_help_subcommand = true
)]
pub(crate) struct Args {
    #[command(subcommand)]
    pub(crate) command: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Subcommand {
    #[command(subcommand)]
    Server(Server),
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Server {
    /// Start the notifier and process hints until SIGINT is received
    Run {
        /// Path to the TOML configuration
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Read the configuration, open the database and exit
    Verify {
        /// Path to the TOML configuration
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Write the default configuration file
    GenerateConfig {
        /// Defaults to `board-notify.toml` in the current directory
        output: Option<PathBuf>,
        /// Replace the file if it exists
        #[arg(long)]
        overwrite: bool,
    },
}
