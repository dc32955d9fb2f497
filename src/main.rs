use aip_replica::{
    config::{AppConfig, Command},
    content::MemoryRepository,
    db,
    services::{LocalObjectStore, Odometer, ReplicaManager},
};
use anyhow::{Context, Result};
use std::{path::Path, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + command ---
    let cfg = AppConfig::from_env_and_args()?;
    let replica = cfg.replica;
    tracing::debug!("Starting aip-replica with config: {:?}", replica);

    // --- Ensure storage directories exist ---
    for dir in [&replica.storage_dir, &replica.staging_dir] {
        if !Path::new(dir).exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
            tracing::info!("Created directory at {}", dir.display());
        }
    }

    // --- Initialize SQLite connection ---
    let pool = db::connect(&replica.database_url)
        .await
        .with_context(|| format!("opening database {}", replica.database_url))?;

    // --- Handle migration mode ---
    if cfg.migrate {
        db::run_migrations(&pool).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let command = cfg.command.unwrap_or(Command::Odometer);
    match command {
        Command::CanonicalId { storage_id } => {
            println!("{}", ReplicaManager::canonical_id(&storage_id));
        }
        Command::Odometer => {
            let reading = Odometer::snapshot(&pool).await?;
            println!("{}", serde_json::to_string_pretty(&reading)?);
        }
        Command::List { group, prefix } => {
            if replica.backend.as_deref() != Some("local") {
                anyhow::bail!("listing is only supported by the local backend");
            }
            let store = LocalObjectStore::new(pool.clone(), &replica.storage_dir);
            let objects = store.list_objects(&group, prefix.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&objects)?);
        }
        command => {
            // the CLI has no repository attached, so storage ids are resolved
            // by probing the store
            let repo = Arc::new(MemoryRepository::new());
            let manager = ReplicaManager::from_config(replica, pool, repo).await?;
            run(&manager, command).await?;
        }
    }

    Ok(())
}

async fn run(manager: &ReplicaManager, command: Command) -> Result<()> {
    match command {
        Command::Exists { group, id } => {
            println!("{}", manager.object_exists(&group, &id).await?);
        }
        Command::Attr { group, id, name } => match manager.object_attribute(&group, &id, &name).await? {
            Some(value) => println!("{value}"),
            None => anyhow::bail!("no attribute `{name}` for {group}/{id}"),
        },
        Command::Fetch { group, id, dest } => {
            let size = manager.fetch_object(&group, &id, &dest).await?;
            if size == 0 {
                anyhow::bail!("{group}/{id} not found");
            }
            println!("{size}");
        }
        Command::Remove { group, id } => {
            println!("{}", manager.remove_object(&group, &id).await?);
        }
        Command::Move { from, to, id } => {
            println!("{}", manager.move_object(&from, &to, &id).await?);
        }
        Command::StorageId { handle, ext } => {
            println!("{}", manager.storage_id(&handle, ext.as_deref()).await?);
        }
        other => anyhow::bail!("{other:?} does not use the replica manager"),
    }
    Ok(())
}
