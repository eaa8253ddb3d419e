use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use shipyard::config::{DEFAULT_CONFIG_FILE, ShipyardConfig};
use shipyard::telemetry::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(version, about = "Build web projects in a sandbox and serve them per subdomain")]
pub struct Cli {
    /// Config file. Defaults to ./shipyard.toml when present.
    #[arg(short, long, global = true, env = "SHIPYARD_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the build worker loop until Ctrl-C
    Worker,
    /// Serve published deployments by subdomain
    Router {
        /// Listen port, overriding router.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Upload a local project directory and queue its build
    Submit { dir: PathBuf },
    /// Queue an existing deployment for rebuild
    Enqueue { id: String },
    /// Show a deployment's status and stage history
    Status {
        id: String,
        /// Print the record and history as JSON
        #[arg(long)]
        json: bool,
    },
}

fn load_config(explicit: Option<&PathBuf>) -> Result<ShipyardConfig> {
    match explicit {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file {} does not exist", path.display());
            }
            ShipyardConfig::load(path)
        }
        None => ShipyardConfig::load(std::path::Path::new(DEFAULT_CONFIG_FILE)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init(cli.log_format);

    let config = load_config(cli.config.as_ref()).context("Failed to load configuration")?;

    match &cli.command {
        Commands::Worker => cmd::cmd_worker(&config).await,
        Commands::Router { port } => cmd::cmd_router(&config, *port).await,
        Commands::Submit { dir } => cmd::cmd_submit(&config, dir).await,
        Commands::Enqueue { id } => cmd::cmd_enqueue(&config, id).await,
        Commands::Status { id, json } => cmd::cmd_status(&config, id, *json).await,
    }
}
