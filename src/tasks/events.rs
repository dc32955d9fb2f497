//! Deletion catalogs written as objects leave the repository.

use super::{discard, extension, load, subtree};
use crate::content::ObjectType;
use crate::errors::ReplicaResult;
use crate::pack::{CatalogPacker, Packer};
use crate::services::ReplicaManager;
use std::sync::Arc;
use tracing::info;

/// A repository delete/remove notification, raised before the object is
/// gone. Nested deletions arrive after the deletion that contains them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeletionEvent {
    pub handle: String,
    pub kind: ObjectType,
    pub owner: Option<String>,
}

/// Coalesces a batch of deletion events into one catalog per top-level
/// deletion. Events whose owner is the deletion in progress (or one of its
/// members) become members; anything else closes the current catalog and
/// starts a new one.
pub struct DeletionRecorder {
    manager: Arc<ReplicaManager>,
    current: Option<CatalogPacker>,
    written: Vec<String>,
}

impl DeletionRecorder {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        Self {
            manager,
            current: None,
            written: Vec::new(),
        }
    }

    pub async fn record(&mut self, event: DeletionEvent) -> ReplicaResult<()> {
        if let Some(catalog) = self.current.as_mut() {
            let nested = event.owner.as_ref().is_some_and(|owner| {
                *owner == catalog.object_id || catalog.members.contains(owner)
            });
            if nested {
                catalog.members.push(event.handle);
                return Ok(());
            }
        }
        self.flush().await?;

        let mut catalog = CatalogPacker::new(&event.handle, self.manager.default_format());
        catalog.object_type = Some(event.kind);
        catalog.owner_id = event.owner;
        self.current = Some(catalog);
        Ok(())
    }

    /// Write the catalog in progress, if any. Returns the storage ids of
    /// every catalog written by this recorder.
    pub async fn finish(mut self) -> ReplicaResult<Vec<String>> {
        self.flush().await?;
        Ok(self.written)
    }

    async fn flush(&mut self) -> ReplicaResult<()> {
        if let Some(catalog) = self.current.take() {
            let id = write_catalog(&self.manager, &catalog).await?;
            self.written.push(id);
        }
        Ok(())
    }
}

/// Snapshot the subtree under `handle` into a deletion catalog and store
/// it. Call before the object is removed from the repository.
pub async fn catalog_deletion(manager: &ReplicaManager, handle: &str) -> ReplicaResult<String> {
    let object = load(manager, handle).await?;
    let mut catalog = CatalogPacker::new(handle, manager.default_format());
    catalog.object_type = Some(object.kind);
    catalog.owner_id = object.owner.clone();
    catalog.members = subtree(manager, object)
        .await?
        .into_iter()
        .skip(1)
        .map(|member| member.handle)
        .collect();
    write_catalog(manager, &catalog).await
}

async fn write_catalog(manager: &ReplicaManager, catalog: &CatalogPacker) -> ReplicaResult<String> {
    let group = manager.delete_group();
    let id = if manager.config().type_prefix {
        ReplicaManager::storage_id_for(catalog.object_type, &catalog.object_id, None)
    } else {
        ReplicaManager::storage_id_for(None, &catalog.object_id, None)
    };
    let staging = manager.stage(group, &id).await?;
    let archive = catalog.pack(&staging).await?;
    let sent = manager.transfer_object(group, &archive).await;
    discard(&archive).await;
    sent?;

    let key = format!("{id}.{}", extension(manager));
    info!(
        object = %catalog.object_id,
        members = catalog.members.len(),
        key = %key,
        "deletion catalog stored"
    );
    Ok(key)
}
