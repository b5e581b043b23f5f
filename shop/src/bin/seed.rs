use clap::Parser;
use common::config::Config;
use sea_orm::{ConnectOptions, Database};
use shop::{create_schema, drop_schema, seed_database};
use std::error::Error;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Create the shop schema and load the fixed seed data", long_about = None)]
struct Args {
    /// Path to a YAML config file; the environment is used when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Drop existing shop tables before creating them
    #[arg(long)]
    reset: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    let mut options = ConnectOptions::new(config.database.url.clone());
    if let Some(max_connections) = config.database.max_connections {
        options.max_connections(max_connections);
    }
    let db = Database::connect(options).await?;
    info!("Connected to {}", config.database.url);

    if args.reset {
        drop_schema(&db).await?;
        info!("Dropped shop tables");
    }
    create_schema(&db).await?;
    let summary = seed_database(&db).await?;
    info!("Seeding finished: {:?}", summary);

    Ok(())
}
