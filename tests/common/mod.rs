#![allow(dead_code)]

use aip_replica::{
    config::ReplicaConfig,
    content::{ContentRepository, MemoryRepository, MetadataValue, NewBitstream, ObjectType},
    db,
    services::ReplicaManager,
};
use bytes::Bytes;
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::TempDir;

pub const COMMUNITY: &str = "123456789/1";
pub const COLLECTION: &str = "123456789/2";
pub const ITEM: &str = "123456789/42";

pub struct Harness {
    pub tmp: TempDir,
    pub db: Arc<SqlitePool>,
    pub repo: Arc<MemoryRepository>,
    pub manager: Arc<ReplicaManager>,
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub async fn harness_with(adjust: impl FnOnce(&mut ReplicaConfig)) -> Harness {
    let tmp = TempDir::new().unwrap();
    let mut config = ReplicaConfig {
        storage_dir: tmp.path().join("replicas"),
        staging_dir: tmp.path().join("staging"),
        database_url: format!("sqlite://{}", tmp.path().join("meta/replica.db").display()),
        ..ReplicaConfig::default()
    };
    adjust(&mut config);

    let db = db::connect(&config.database_url).await.unwrap();
    db::run_migrations(&db).await.unwrap();
    let repo = Arc::new(MemoryRepository::new());
    let manager = ReplicaManager::from_config(config, db.clone(), repo.clone())
        .await
        .unwrap();
    Harness {
        tmp,
        db,
        repo,
        manager: Arc::new(manager),
    }
}

pub fn title(text: &str) -> MetadataValue {
    MetadataValue::new("dc", "title", None, text)
}

pub fn bitstream(name: &str, sequence_id: u32, primary: bool, content: &[u8]) -> NewBitstream {
    NewBitstream {
        name: name.to_string(),
        source: Some(format!("/uploads/{name}")),
        description: Some(format!("{name} description")),
        sequence_id,
        primary,
        content: Bytes::copy_from_slice(content),
    }
}

/// Community 1 > Collection 2 > Item 42 with a 100-byte `paper.pdf` in
/// ORIGINAL and a license in LICENSE.
pub async fn seed(repo: &MemoryRepository) {
    repo.create(ObjectType::Community, COMMUNITY, None).await.unwrap();
    repo.replace_metadata(COMMUNITY, vec![title("Top community")])
        .await
        .unwrap();
    repo.set_logo(COMMUNITY, Some(Bytes::from_static(b"\x89PNG logo")))
        .await
        .unwrap();

    repo.create(ObjectType::Collection, COLLECTION, Some(COMMUNITY))
        .await
        .unwrap();
    repo.replace_metadata(COLLECTION, vec![title("Theses")])
        .await
        .unwrap();

    seed_item(repo, ITEM, COLLECTION).await;
}

pub async fn seed_item(repo: &MemoryRepository, handle: &str, collection: &str) {
    repo.create(ObjectType::Item, handle, Some(collection))
        .await
        .unwrap();
    repo.replace_metadata(
        handle,
        vec![
            title(&format!("Paper {handle}")),
            MetadataValue::new("dc", "contributor", Some("author"), "Doe, Jane"),
            MetadataValue::new("dc", "description", Some("abstract"), "Line one\nline <two> & more")
                .with_language("en"),
        ],
    )
    .await
    .unwrap();
    repo.add_bitstream(handle, "ORIGINAL", bitstream("paper.pdf", 1, true, &[7u8; 100]))
        .await
        .unwrap();
    repo.add_bitstream(handle, "LICENSE", bitstream("license.txt", 2, false, b"CC-BY 4.0"))
        .await
        .unwrap();
}
