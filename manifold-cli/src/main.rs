//! The manifold binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use manifold_config::{ConfigLoader, ManifoldConfig};
use manifold_server::auth::generate_key;
use manifold_server::Gateway;
use manifold_storage::{ApiKeyRepository, Database, SqlApiKeyRepository};

#[derive(Parser)]
#[command(name = "manifold", version, about = "Multi-tenant MCP gateway")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway
    Serve,

    /// Validate the configuration and exit
    CheckConfig,

    /// Issue an API key; the secret is printed exactly once
    CreateApiKey {
        /// Human-readable key name
        #[arg(long)]
        name: String,

        /// Granted scopes; omit for an unrestricted key
        #[arg(long, value_delimiter = ',')]
        scopes: Vec<String>,
    },
}

fn init_tracing(config: &ManifoldConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.filter.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::new()
        .load(cli.config.as_deref())
        .context("failed to load configuration")?;
    init_tracing(&config);

    match cli.command {
        Command::Serve => {
            let listen_addr = config.server.listen_addr();
            let gateway = Gateway::build(config).await?;
            gateway.serve(&listen_addr).await
        }

        Command::CheckConfig => {
            // Loading already validated every domain
            println!("configuration ok");
            Ok(())
        }

        Command::CreateApiKey { name, scopes } => {
            let db = Database::connect(&config.database).await?;
            db.migrate().await?;
            let repo = SqlApiKeyRepository::new(db);

            let scopes = if scopes.is_empty() { None } else { Some(scopes) };
            let (key, secret) = generate_key(&name, scopes);
            repo.create(&key).await?;

            info!(api_key_id = %key.id, "issued API key");
            println!("id:     {}", key.id);
            println!("prefix: {}", key.prefix);
            println!("secret: {}   (shown once, store it now)", secret);
            Ok(())
        }
    }
}
