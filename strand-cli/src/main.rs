//! # strand CLI
//!
//! Command-line interface for inspecting and exercising the strand runtime.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "strand")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file; defaults apply when it does not exist
    #[arg(long, default_value = "strand.yml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective runtime configuration
    Config {
        /// Emit JSON instead of YAML
        #[arg(long)]
        json: bool,
    },

    /// Increment a shared counter from many lthreads
    Stress {
        /// Number of lthreads
        #[arg(long, default_value_t = 4)]
        threads: usize,

        /// Increments per lthread, one write transaction each
        #[arg(long, default_value_t = 100)]
        increments: usize,

        /// Maximum length of the counter history
        #[arg(long)]
        history: Option<usize>,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::WARN.into()
            }),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = commands::load_config(&cli.config)?;

    match cli.command {
        Commands::Config { json } => commands::show_config(&config, json),
        Commands::Stress {
            threads,
            increments,
            history,
            json,
        } => {
            let opts = commands::StressOptions {
                threads,
                increments,
                history: history.unwrap_or(config.history.default_max_length),
                json,
            };
            config.install()?;
            commands::run_stress(opts)
        }
    }
}
