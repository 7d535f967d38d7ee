//! Operator tool for the coordination core

use appscale_coord::cluster::{needed_for_quorum, NodeRoleModel};
use appscale_coord::common::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "appscale-coord")]
#[command(about = "AppScale controller coordination tool", version)]
struct Cli {
    /// Configuration file (TOML); APPSCALE_COORD__* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print how many nodes must be healthy for quorum
    Quorum {
        /// Nodes holding replicas
        #[arg(long)]
        nodes: usize,

        /// Replication factor (defaults to quorum.replication)
        #[arg(long)]
        replication: Option<usize>,
    },

    /// Normalize a role assignment and print the stored form
    RoleData {
        /// JSON file with the assignment (object or one-element array)
        #[arg(long)]
        file: PathBuf,

        /// Deployment key name (defaults to keyname)
        #[arg(long)]
        keyname: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Quorum { nodes, replication } => {
            let replication = replication.unwrap_or(config.quorum.replication);
            let needed = needed_for_quorum(nodes, replication)?;
            tracing::debug!(nodes, replication, needed, "Computed quorum");
            println!("{}", needed);
        }
        Commands::RoleData { file, keyname } => {
            let keyname = keyname.unwrap_or_else(|| config.keyname.clone());
            let raw = std::fs::read(&file)?;
            let assignment: serde_json::Value = serde_json::from_slice(&raw)?;
            let node = NodeRoleModel::from_assignment(assignment, &keyname)?;
            tracing::info!(node = %node, "Parsed role assignment");
            println!("{}", serde_json::to_string_pretty(&node.to_json())?);
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
