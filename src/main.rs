use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use flcs::{commands, config, telemetry};

#[derive(Parser)]
#[command(name = "flcsd")]
#[command(about = "Federated learning coordination server", long_about = None)]
struct Cli {
    /// Path to the server config file (default: ~/.flcs/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a fresh server: database tree, certificate authority, config
    Init {
        /// Overwrite an existing config at the target path
        #[arg(long)]
        force: bool,
    },

    /// Run the coordination server: enrollment, mTLS control, and admin REST listeners
    Run {
        /// Override the admin REST port from the config
        #[arg(long)]
        admin_port: Option<u16>,
    },

    /// Print a one-shot summary of server status from the admin REST surface
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    match cli.command {
        Commands::Init { force } => {
            telemetry::init_basic_tracing(cli.verbose);
            commands::init::run(&config_path, force)
        }
        Commands::Run { admin_port } => {
            let log_tail = telemetry::init_tracing(cli.verbose);
            commands::run::run(&config_path, admin_port, log_tail)
        }
        Commands::Status => {
            telemetry::init_basic_tracing(cli.verbose);
            commands::status::run(&config_path)
        }
    }
}
