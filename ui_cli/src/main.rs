//! install-matrix: run an installer across a matrix of Linux distributions.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;
mod config;
mod error;
mod output;
mod report;

use commands::{definition::DefinitionArgs, list::ListArgs, run::RunArgs};
use observability::TracingConfig;

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Parser)]
#[command(name = "install-matrix")]
#[command(version)]
#[command(about = "Test an installer archive inside containers for many distributions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: $XDG_CONFIG_HOME/install-matrix/config.toml)
    #[arg(long, global = true, env = "INSTALL_MATRIX_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `install_orchestrator=debug`
    #[arg(long, global = true, default_value = "info", env = "INSTALL_MATRIX_LOG")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the matrix
    Run(RunArgs),

    /// List the cells a filter selects without running anything
    List(ListArgs),

    /// Print the generated container definition for one release
    Definition(DefinitionArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = observability::init_tracing(&TracingConfig::new(&cli.log_level, cli.log_json)) {
        output::error(&e.to_string());
        return ExitCode::from(error::EXIT_HARNESS);
    }

    let result = match config::load(cli.config.as_deref()) {
        Ok(file_config) => match cli.command {
            Commands::Run(args) => commands::run::execute(args, file_config).await,
            Commands::List(args) => commands::list::execute(args, file_config),
            Commands::Definition(args) => commands::definition::execute(args, file_config),
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            output::error(&e.to_string());
            ExitCode::from(error::EXIT_HARNESS)
        }
    }
}
