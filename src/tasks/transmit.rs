use super::{CurationTask, discard, load, pack_object, settle, subtree};
use crate::content::ContentObject;
use crate::errors::ReplicaResult;
use crate::models::task::TaskOutcome;
use crate::services::ReplicaManager;
use async_trait::async_trait;
use std::sync::Arc;

/// Pack an object and every object below it, sending each package to the
/// store group.
pub struct TransmitAip {
    manager: Arc<ReplicaManager>,
}

impl TransmitAip {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        Self { manager }
    }

    async fn run(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let root = load(&self.manager, handle).await?;
        let mut packages = 0;
        let mut bytes = 0;
        for object in subtree(&self.manager, root).await? {
            bytes += transmit(&self.manager, &object).await?;
            packages += 1;
        }
        Ok(TaskOutcome::success(format!(
            "{packages} AIPs transmitted for {handle} ({bytes} bytes)"
        )))
    }
}

#[async_trait]
impl CurationTask for TransmitAip {
    fn name(&self) -> &'static str {
        "transmitaip"
    }

    async fn perform(&self, handle: &str) -> TaskOutcome {
        settle(self.name(), handle, self.run(handle).await)
    }
}

/// Transmit one object's package without descending into its members.
pub struct TransmitSingleAip {
    manager: Arc<ReplicaManager>,
}

impl TransmitSingleAip {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        Self { manager }
    }

    async fn run(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let object = load(&self.manager, handle).await?;
        let bytes = transmit(&self.manager, &object).await?;
        Ok(TaskOutcome::success(format!(
            "AIP for {handle} transmitted ({bytes} bytes)"
        )))
    }
}

#[async_trait]
impl CurationTask for TransmitSingleAip {
    fn name(&self) -> &'static str {
        "transmitsingleaip"
    }

    async fn perform(&self, handle: &str) -> TaskOutcome {
        settle(self.name(), handle, self.run(handle).await)
    }
}

pub(crate) async fn transmit(manager: &ReplicaManager, object: &ContentObject) -> ReplicaResult<u64> {
    let archive = pack_object(manager, object).await?;
    let sent = manager.transfer_object(manager.store_group(), &archive).await;
    discard(&archive).await;
    sent
}
