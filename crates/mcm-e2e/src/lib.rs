//! End-to-end harness for the machine-controller-manager AWS provider
//!
//! Drives a control cluster holding machine objects and a target cluster the
//! provisioned machines join, and checks that the cloud account is left as it
//! was found.

pub mod cluster;
pub mod commands;
pub mod config;
pub mod convergence;
pub mod deployment;
pub mod error;
pub mod machines;
pub mod orphan;
pub mod suite;
pub mod supervisor;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// mcm-e2e - machine lifecycle tests against a live cluster pair
#[derive(Parser, Debug)]
#[command(name = "mcm-e2e")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full machine lifecycle suite
    Run(config::RunArgs),

    /// Scan the cloud account for tagged leftovers
    Orphans(commands::orphans::OrphansArgs),

    /// Wait for the target cluster to reach a node count
    WaitNodes(commands::wait_nodes::WaitNodesArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Run(args) => commands::run::run(args).await,
            Commands::Orphans(args) => commands::orphans::run(args).await,
            Commands::WaitNodes(args) => commands::wait_nodes::run(args).await,
        }
    }
}
