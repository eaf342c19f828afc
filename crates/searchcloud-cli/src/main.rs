//! searchcloud: throwaway search clusters for integration tests.
//!
//! # Quick Start
//!
//! ```bash
//! # Start a 3-node cluster with the default config set and collection
//! searchcloud run --nodes 3
//!
//! # Write the default config set somewhere to customize it
//! searchcloud conf ./src/test/conf
//!
//! # Show the merged configuration
//! searchcloud config
//! ```

mod commands;
mod defaults;
mod style;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Ephemeral search clusters for integration tests.
#[derive(Parser)]
#[command(name = "searchcloud")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory holding searchcloud.toml.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    project: PathBuf,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a cluster, set it up, and tear it down on Ctrl+C.
    Run(commands::run::RunArgs),

    /// Write the default configuration set to a directory.
    Conf {
        /// Target directory. Left alone if it already has content.
        dir: PathBuf,
    },

    /// Print the resolved configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    style::set_no_color(cli.no_color);

    match cli.command {
        Commands::Run(args) => commands::run::run(&cli.project, &args).await,
        Commands::Conf { dir } => commands::conf::run(&cli.project.join(dir)),
        Commands::Config => commands::config::show(&cli.project),
    }
}
