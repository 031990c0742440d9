//! wmux: remote terminal multiplexer client.
//!
//! Attaches the local terminal to persistent shell sessions on a wmux
//! worker, runs one-off commands, and manages sessions over the tagged
//! JSON WebSocket protocol.

mod commands;
mod config;
mod terminal;

use clap::{Parser, Subcommand};
use tracing::error;
use wmux_core::DEFAULT_SESSION_ID;

/// wmux: remote terminal client
#[derive(Parser)]
#[command(
    name = "wmux",
    version = "0.1.0",
    about = "Remote terminal multiplexer client: persistent worker sessions over WebSocket"
)]
struct Cli {
    /// Worker WebSocket URL (default ws://127.0.0.1:7703)
    #[arg(short, long, global = true)]
    url: Option<String>,

    /// Auth token (falls back to WMUX_AUTH_TOKEN, then the config file)
    #[arg(short, long, global = true)]
    token: Option<String>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Attach the terminal to a session, creating it if needed
    Attach {
        /// Session id
        #[arg(default_value = DEFAULT_SESSION_ID)]
        session: String,
    },

    /// Run a one-off command on the worker and print its output
    Run {
        /// Working directory for the command
        #[arg(long)]
        cwd: Option<String>,

        /// Command line to execute
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Close a session, terminating its shell
    Close {
        /// Session id
        session: String,
    },

    /// Print a fresh auth token for provisioning
    Token,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("wmux=debug,wmux_cli=debug,wmux_client=debug,wmux_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("wmux=warn,wmux_cli=warn,wmux_client=warn")
            .with_target(false)
            .init();
    }

    // Token minting needs no worker connection.
    if matches!(cli.command, Some(Command::Token)) {
        if let Err(e) = commands::token::run().await {
            eprintln!("wmux: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    // Load config file.
    let config_path = cli.config.clone().unwrap_or_else(|| {
        let home = dirs::home_dir().unwrap_or_default();
        home.join(".config")
            .join("wmux")
            .join("client.toml")
            .to_string_lossy()
            .to_string()
    });
    let cfg = config::Config::load(&config_path).unwrap_or_default();

    // Determine the effective worker URL and token (CLI overrides config).
    let url = config::resolve_url(cli.url.clone(), &cfg);
    let token = match config::resolve_token(cli.token.clone(), &cfg) {
        Ok(token) => token,
        Err(e) => {
            eprintln!("wmux: {e:#}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Some(Command::Attach { session }) => commands::attach::run(&url, &token, &session).await,
        Some(Command::Run { cwd, command }) => {
            commands::run::run(&url, &token, &command.join(" "), cwd.as_deref()).await
        }
        Some(Command::Close { session }) => commands::close::run(&url, &token, &session).await,
        Some(Command::Token) => Ok(()),
        // Bare `wmux` attaches to the default session.
        None => commands::attach::run(&url, &token, DEFAULT_SESSION_ID).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("wmux: {e:#}");
        std::process::exit(1);
    }
}
