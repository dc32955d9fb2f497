use super::{CurationTask, discard, extension, settle, subtree};
use crate::errors::ReplicaResult;
use crate::models::task::TaskOutcome;
use crate::pack::{CatalogPacker, Packer};
use crate::services::ReplicaManager;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Remove stored packages.
///
/// For a live object this removes its package and those of everything below
/// it. For a deleted object the deletion catalog drives the removal: the
/// root package, each member package, and the catalog itself last, so an
/// interrupted run leaves the catalog behind as evidence.
pub struct RemoveAip {
    manager: Arc<ReplicaManager>,
}

impl RemoveAip {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        Self { manager }
    }

    async fn run(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let manager = &self.manager;
        let ext = extension(manager);

        let handles: Vec<String> = match manager.repository().find(handle).await? {
            Some(object) => subtree(manager, object)
                .await?
                .into_iter()
                .map(|o| o.handle)
                .collect(),
            None => return self.remove_deleted(handle).await,
        };

        let mut removed = 0;
        for member in &handles {
            let id = manager.storage_id(member, Some(ext)).await?;
            if manager.remove_object(manager.store_group(), &id).await? > 0 {
                removed += 1;
            }
        }
        Ok(TaskOutcome::success(format!(
            "{removed} AIPs removed for {handle}"
        )))
    }

    async fn remove_deleted(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let manager = &self.manager;
        let ext = extension(manager);
        let catalog_id = manager.storage_id(handle, Some(ext)).await?;
        let staged = manager.stage(manager.delete_group(), &catalog_id).await?;
        if manager
            .fetch_object(manager.delete_group(), &catalog_id, &staged)
            .await?
            == 0
        {
            return Ok(TaskOutcome::fail(format!(
                "{handle} is not in the repository and has no deletion catalog"
            )));
        }

        let mut catalog = CatalogPacker::default();
        let unpacked = catalog.unpack(&staged).await;
        discard(&staged).await;
        unpacked?;

        let mut removed = 0;
        for member in std::iter::once(&catalog.object_id).chain(catalog.members.iter()) {
            let id = manager.storage_id(member, Some(ext)).await?;
            if manager.remove_object(manager.store_group(), &id).await? > 0 {
                removed += 1;
            } else {
                debug!(member = %member, "no stored AIP to remove");
            }
        }
        manager
            .remove_object(manager.delete_group(), &catalog_id)
            .await?;
        Ok(TaskOutcome::success(format!(
            "{removed} AIPs and the deletion catalog removed for {handle}"
        )))
    }
}

#[async_trait]
impl CurationTask for RemoveAip {
    fn name(&self) -> &'static str {
        "removeaip"
    }

    async fn perform(&self, handle: &str) -> TaskOutcome {
        settle(self.name(), handle, self.run(handle).await)
    }
}
