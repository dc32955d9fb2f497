//! Curation tasks: short scripts over the packers and the replica manager.
//!
//! Each task runs against one handle and reports a [`TaskOutcome`]; errors
//! never escape `perform`, they become a failed outcome with the error text.

pub mod audit;
pub mod checkm;
pub mod estimate;
pub mod events;
pub mod fetch;
pub mod remove;
pub mod restore;
pub mod transmit;

use crate::content::ContentObject;
use crate::errors::{ReplicaError, ReplicaResult};
use crate::models::task::TaskOutcome;
use crate::services::ReplicaManager;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

pub use audit::{CompareWithAip, ExtentReport};
pub use checkm::{
    CompareWithManifest, FetchManifest, ManifestAudit, RemoveManifest, TransmitManifest,
    VerifyManifest,
};
pub use estimate::EstimateAipSize;
pub use events::{DeletionEvent, DeletionRecorder, catalog_deletion};
pub use fetch::{FetchAip, VerifyAip};
pub use remove::RemoveAip;
pub use restore::{BagItReplaceWithAip, BagItRestoreFromAip};
pub use transmit::{TransmitAip, TransmitSingleAip};

#[async_trait]
pub trait CurationTask: Send + Sync {
    fn name(&self) -> &'static str;

    async fn perform(&self, handle: &str) -> TaskOutcome;
}

/// Log and convert a task body's result.
pub(crate) fn settle(task: &str, handle: &str, result: ReplicaResult<TaskOutcome>) -> TaskOutcome {
    let outcome = result.unwrap_or_else(|err| TaskOutcome::fail(err.to_string()));
    info!(task, handle, status = %outcome.status, result = %outcome.result, "task finished");
    outcome
}

pub(crate) async fn load(manager: &ReplicaManager, handle: &str) -> ReplicaResult<ContentObject> {
    manager
        .repository()
        .find(handle)
        .await?
        .ok_or_else(|| ReplicaError::ObjectNotFound(handle.to_string()))
}

/// `object` and everything below it, owners before the objects they own.
pub(crate) async fn subtree(
    manager: &ReplicaManager,
    object: ContentObject,
) -> ReplicaResult<Vec<ContentObject>> {
    let repo = manager.repository();
    let mut ordered = Vec::new();
    let mut stack = vec![object];
    while let Some(current) = stack.pop() {
        let mut children = repo.children(&current).await?;
        children.reverse();
        stack.extend(children);
        ordered.push(current);
    }
    Ok(ordered)
}

/// Pack a live object into the store group's staging area.
pub(crate) async fn pack_object(
    manager: &ReplicaManager,
    object: &ContentObject,
) -> ReplicaResult<PathBuf> {
    let id = manager.storage_id(&object.handle, None).await?;
    let staging = manager.stage(manager.store_group(), &id).await?;
    let archive = manager.packer_for(object).pack(&staging).await?;
    Ok(archive)
}

/// Archive extension for new packages.
pub(crate) fn extension(manager: &ReplicaManager) -> &'static str {
    manager.default_format().extension()
}

/// Best-effort removal of a staged file.
pub(crate) async fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        warn!("could not remove staged file {}: {}", path.display(), err);
    }
}
