//! revloop CLI, the main entry point.
//!
//! Commands:
//! - `agent`          Interactive chat or single-message mode
//! - `conversations`  List, show or delete saved conversations
//! - `config`         Show or initialize the configuration
//! - `models`         List the models the API key can use

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "revloop",
    about = "revloop: a tool-using agent for reverse engineering",
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
    /// Chat with the agent
    Agent {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Continue a saved conversation
        #[arg(short, long, env = "REVLOOP_RESUME")]
        resume: Option<String>,
    },

    /// Manage saved conversations
    Conversations {
        #[command(subcommand)]
        action: ConversationAction,
    },

    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List available models
    Models,
}

#[derive(Subcommand)]
enum ConversationAction {
    /// List saved conversations, newest first
    List,
    /// Print a conversation
    Show { id: String },
    /// Delete a conversation
    Delete { id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Agent { message, resume } => commands::agent::run(message, resume).await?,
        Commands::Conversations { action } => match action {
            ConversationAction::List => commands::conversations::list()?,
            ConversationAction::Show { id } => commands::conversations::show(&id)?,
            ConversationAction::Delete { id } => commands::conversations::delete(&id)?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show()?,
            ConfigAction::Init { force } => commands::config_cmd::init(force)?,
            ConfigAction::Path => commands::config_cmd::path(),
        },
        Commands::Models => commands::models::run().await?,
    }

    Ok(())
}
