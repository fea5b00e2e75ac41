//! Talenet: identity projection over a local event journal
//!
//! Main binary with subcommands:
//! - `watch`: Follow identities and print every update
//! - `set-name`, `set-image`: Publish `about` updates
//! - `assign`, `unassign`: Publish skill assignments for the local identity
//! - `show`: Replay the journal and print one folded identity

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use talenet_identity::{AdapterConfig, MemoryLog};

mod publish;
mod show;
mod watch;

#[derive(Parser)]
#[command(name = "talenet")]
#[command(about = "Identity projection over a local event journal", long_about = None)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every subcommand.
#[derive(Args)]
struct LogArgs {
    /// Path of the JSON-lines event journal
    #[arg(long, global = true, env = "TALENET_JOURNAL", default_value = "talenet.jsonl")]
    journal: PathBuf,

    /// Key of the local identity
    #[arg(long, global = true, env = "TALENET_IDENTITY", default_value = "@local")]
    identity: String,

    /// Namespace prefix for application event types
    #[arg(long, global = true, env = "TALENET_TYPE_PREFIX", default_value = "")]
    type_prefix: String,
}

impl LogArgs {
    async fn open(&self) -> Result<MemoryLog> {
        MemoryLog::open(self.identity.as_str(), &self.journal)
            .await
            .map_err(|e| miette::miette!("failed to open journal {}: {}", self.journal.display(), e))
    }

    fn config(&self) -> AdapterConfig {
        AdapterConfig::default().with_type_prefix(self.type_prefix.as_str())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the own key and the given identities until interrupted
    Watch {
        /// Identity keys to follow in addition to the local one
        #[arg(value_name = "KEYS")]
        keys: Vec<String>,
    },

    /// Publish a display name
    SetName {
        name: String,

        /// Identity the name is about (defaults to the local identity)
        #[arg(long)]
        about: Option<String>,
    },

    /// Store an image file and publish it as avatar
    SetImage {
        file: PathBuf,

        /// Identity the image is about (defaults to the local identity)
        #[arg(long)]
        about: Option<String>,

        /// MIME type (guessed from the file extension if omitted)
        #[arg(long)]
        mime: Option<String>,
    },

    /// Assign a skill to the local identity
    Assign {
        #[arg(value_name = "SKILL")]
        skill: String,
    },

    /// Unassign a skill from the local identity
    Unassign {
        #[arg(value_name = "SKILL")]
        skill: String,
    },

    /// Print the folded identity for a key
    Show {
        #[arg(value_name = "KEY")]
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "talenet=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.log.config();
    let log = cli.log.open().await?;

    match cli.command {
        Commands::Watch { keys } => watch::run(log, config, keys).await,

        Commands::SetName { name, about } => publish::set_name(log, config, about, &name).await,

        Commands::SetImage { file, about, mime } => {
            publish::set_image(log, config, about, &file, mime).await
        }

        Commands::Assign { skill } => publish::assign(log, config, &skill).await,

        Commands::Unassign { skill } => publish::unassign(log, config, &skill).await,

        Commands::Show { key } => show::run(&log, &config, &key),
    }
}
