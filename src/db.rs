//! SQLite pool setup and the embedded migration.

use crate::errors::ReplicaResult;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, sync::Arc};
use tracing::{debug, info};

const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Open (creating if needed) the database behind `database_url`.
pub async fn connect(database_url: &str) -> ReplicaResult<Arc<SqlitePool>> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if !db_path.starts_with(":memory:") {
        if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                info!("Created missing directory {:?}", parent);
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(Arc::new(pool))
}

/// Apply the embedded schema. Statements are idempotent, so this is safe to
/// run on every start.
pub async fn run_migrations(db: &SqlitePool) -> ReplicaResult<usize> {
    let statements = INIT_SQL
        .split(';')
        .map(strip_comments)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    info!("Running {} migration statements...", statements.len());

    for stmt in &statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(statements.len())
}

fn strip_comments(chunk: &str) -> String {
    chunk
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let url = format!("sqlite://{}", tmp.path().join("meta/replica.db").display());
        let db = connect(&url).await.unwrap();

        assert_eq!(run_migrations(&db).await.unwrap(), 5);
        run_migrations(&db).await.unwrap();

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM odometer")
            .fetch_one(&*db)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }
}
