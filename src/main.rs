mod args;
mod command;
mod config;
mod delivery;
mod init;

use args::{Args, Server, Subcommand};
use clap::Parser;
use crate::config::config_holder::ConfigHolder;
use directories::{BaseDirs, ProjectDirs};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let project_dirs = ProjectDirs::from("", "", "board-notify");
    let base_dirs = BaseDirs::new();
    match Args::parse().command {
        Subcommand::Server(Server::Run { config }) => {
            command::server::run(project_dirs, base_dirs, config).await
        }
        Subcommand::Server(Server::Verify { config }) => {
            command::server::verify(project_dirs, base_dirs, config).await
        }
        Subcommand::Server(Server::GenerateConfig { output, overwrite }) => {
            ConfigHolder::generate_default_config(output, overwrite).await
        }
    }
}
