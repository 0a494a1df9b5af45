//! loomi CLI, the main entry point.
//!
//! Commands:
//! - `serve`   Start the HTTP gateway
//! - `run`     Run one orchestration and print its events as JSON lines
//! - `config`  Print the starter configuration

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "loomi",
    about = "loomi: multi-agent orchestration and streaming runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run one orchestration
    Run {
        #[arg(short, long, env = "LOOMI_USER")]
        user: String,

        #[arg(short, long, env = "LOOMI_SESSION")]
        session: String,

        /// Previously selected artifacts (`@insight2`), repeatable
        #[arg(long = "select")]
        selections: Vec<String>,

        instruction: String,
    },

    /// Print the default configuration
    Config {
        /// Print the config file location instead
        #[arg(long)]
        path: bool,

        /// Load and validate the active configuration
        #[arg(long, conflicts_with = "path")]
        validate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so `run` output stays machine-readable.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Run {
            user,
            session,
            selections,
            instruction,
        } => commands::run::run(user, session, instruction, selections).await?,
        Commands::Config { path, validate } => {
            if path {
                commands::config_cmd::path();
            } else if validate {
                commands::config_cmd::validate()?;
            } else {
                commands::config_cmd::show_default();
            }
        }
    }

    Ok(())
}
