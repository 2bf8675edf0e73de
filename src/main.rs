mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use docsession_core::codec::KeyPair;
use docsession_core::config::{self, Config};
use docsession_core::db::memory::MemoryCluster;
use docsession_core::db::Cluster;
use docsession_core::SessionStore;

use server::AppState;

#[derive(Parser)]
#[command(
    name = "docsession",
    about = "docsession - document-database backed HTTP sessions",
    version = docsession_core::VERSION,
)]
struct Cli {
    /// Config file (default: ~/.docsession/config.json, overridden by env)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo HTTP server
    Serve {
        /// Bind host
        #[arg(long)]
        host: Option<String>,
        /// Bind port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print a fresh key pair in hex
    GenKeys {
        /// Omit the encryption key (authenticate only)
        #[arg(long)]
        no_block_key: bool,
    },
    /// Show the effective configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("docsession=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => config::load_config(Some(path.as_path())),
        None => config::load_config_from_env(),
    };

    match cli.command {
        Commands::Serve { host, port } => cmd_serve(cfg, host, port).await?,
        Commands::GenKeys { no_block_key } => cmd_gen_keys(no_block_key)?,
        Commands::Status => cmd_status(&cfg, cli.config.as_deref()),
    }

    Ok(())
}

// ====== Commands ======

async fn cmd_serve(mut cfg: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        cfg.server.host = host;
    }
    if let Some(port) = port {
        cfg.server.port = port;
    }

    if cfg.database.mongo_url.is_empty() {
        info!("No mongoUrl configured, using the in-memory cluster");
        return run_server(Arc::new(MemoryCluster::new()), &cfg).await;
    }

    #[cfg(feature = "mongodb-backend")]
    {
        let cluster = docsession_core::db::mongo::MongoCluster::connect(
            &cfg.database.mongo_url,
            cfg.database.database.clone(),
        )
        .await?;
        run_server(Arc::new(cluster), &cfg).await
    }
    #[cfg(not(feature = "mongodb-backend"))]
    {
        anyhow::bail!("mongoUrl is set but docsession was built without the mongodb-backend feature")
    }
}

async fn run_server<C: Cluster>(cluster: Arc<C>, cfg: &Config) -> Result<()> {
    let store = SessionStore::connect(cluster, &cfg.store).await?;
    let state = Arc::new(AppState {
        store,
        session_name: cfg.server.session_name.clone(),
    });
    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    server::serve(&addr, state).await
}

fn cmd_gen_keys(no_block_key: bool) -> Result<()> {
    let mut pair = KeyPair::generate();
    if no_block_key {
        pair.block_key = None;
    }
    let json = serde_json::json!({
        "hashKey": hex::encode(&pair.hash_key),
        "blockKey": pair.block_key.as_ref().map(hex::encode),
    });
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn cmd_status(cfg: &Config, config_path: Option<&std::path::Path>) {
    let config_path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(config::get_config_path);

    println!("docsession {}\n", docsession_core::VERSION);
    println!(
        "Config: {} {}",
        config_path.display(),
        if config_path.exists() { "✓" } else { "✗" }
    );
    println!(
        "Database: {}",
        if cfg.database.mongo_url.is_empty() {
            "in-memory"
        } else {
            "mongodb"
        }
    );
    println!("Collection: {}", cfg.store.collection);
    println!("Timestamp field: {}", cfg.store.timestamp_mode.field());
    println!("Max age: {}s", cfg.store.options.max_age);
    println!(
        "TTL index: {}",
        if cfg.store.ensure_ttl { "on" } else { "off" }
    );
    println!("Key pairs: {}", cfg.store.key_pairs.len());
    match cfg.store.validate() {
        Ok(()) => println!("Store config: ✓"),
        Err(e) => println!("Store config: ✗ {}", e),
    }
    println!(
        "Listen: {}:{} (cookie {})",
        cfg.server.host, cfg.server.port, cfg.server.session_name
    );
}
