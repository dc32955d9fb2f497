use super::{CurationTask, extension, settle};
use crate::errors::ReplicaResult;
use crate::models::task::TaskOutcome;
use crate::services::ReplicaManager;
use async_trait::async_trait;
use std::sync::Arc;

/// Copy an object's stored package into the staging area.
pub struct FetchAip {
    manager: Arc<ReplicaManager>,
}

impl FetchAip {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        Self { manager }
    }

    async fn run(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let manager = &self.manager;
        let id = manager.storage_id(handle, Some(extension(manager))).await?;
        let dest = manager.stage(manager.store_group(), &id).await?;
        let size = manager
            .fetch_object(manager.store_group(), &id, &dest)
            .await?;
        if size == 0 {
            return Ok(TaskOutcome::fail(format!("no AIP stored for {handle}")));
        }
        Ok(TaskOutcome::success(format!(
            "AIP for {handle} fetched to {} ({size} bytes)",
            dest.display()
        )))
    }
}

#[async_trait]
impl CurationTask for FetchAip {
    fn name(&self) -> &'static str {
        "fetchaip"
    }

    async fn perform(&self, handle: &str) -> TaskOutcome {
        settle(self.name(), handle, self.run(handle).await)
    }
}

/// Check that an object's package is present in the store group.
pub struct VerifyAip {
    manager: Arc<ReplicaManager>,
}

impl VerifyAip {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        Self { manager }
    }

    async fn run(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let manager = &self.manager;
        let id = manager.storage_id(handle, Some(extension(manager))).await?;
        if manager.object_exists(manager.store_group(), &id).await? {
            Ok(TaskOutcome::success(format!("AIP for {handle} ({id}) found")))
        } else {
            Ok(TaskOutcome::fail(format!("AIP for {handle} ({id}) not found")))
        }
    }
}

#[async_trait]
impl CurationTask for VerifyAip {
    fn name(&self) -> &'static str {
        "verifyaip"
    }

    async fn perform(&self, handle: &str) -> TaskOutcome {
        settle(self.name(), handle, self.run(handle).await)
    }
}
