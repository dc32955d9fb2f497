use super::{CurationTask, load, settle};
use crate::errors::ReplicaResult;
use crate::models::task::TaskOutcome;
use crate::pack::SizeMethod;
use crate::services::ReplicaManager;
use async_trait::async_trait;
use std::sync::Arc;

/// Report the payload bytes an object's package would carry, without
/// packing anything.
pub struct EstimateAipSize {
    manager: Arc<ReplicaManager>,
    method: SizeMethod,
}

impl EstimateAipSize {
    pub fn new(manager: Arc<ReplicaManager>, method: SizeMethod) -> Self {
        Self { manager, method }
    }

    pub async fn estimate(&self, handle: &str) -> ReplicaResult<u64> {
        let object = load(&self.manager, handle).await?;
        Ok(self.manager.packer_for(&object).size(self.method).await?)
    }

    async fn run(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let size = self.estimate(handle).await?;
        Ok(TaskOutcome::success(format!(
            "estimated AIP content size for {handle}: {size} bytes"
        )))
    }
}

#[async_trait]
impl CurationTask for EstimateAipSize {
    fn name(&self) -> &'static str {
        "estimateaipsize"
    }

    async fn perform(&self, handle: &str) -> TaskOutcome {
        settle(self.name(), handle, self.run(handle).await)
    }
}
