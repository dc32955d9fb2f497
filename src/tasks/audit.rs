//! Regeneration and extent audits.

use super::{CurationTask, discard, extension, load, pack_object, settle};
use crate::content::ContentObject;
use crate::errors::ReplicaResult;
use crate::models::task::{AuditOutcome, TaskOutcome};
use crate::pack::{PackError, bag::md5_file};
use crate::services::{ReplicaManager, object_store::ATTR_CHECKSUM};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Members of a container checked by an extent audit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtentReport {
    /// Every immediate member visited, in enumeration order.
    pub checked: Vec<String>,
    /// Members with no package in the store group.
    pub missing: Vec<String>,
}

impl ExtentReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Regenerate an object's package and compare it with the stored copy; for
/// containers, also check that every immediate member has a stored package.
pub struct CompareWithAip {
    manager: Arc<ReplicaManager>,
}

impl CompareWithAip {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        Self { manager }
    }

    /// Compare the MD5 of a freshly packed archive with the checksum the
    /// store recorded for the replica.
    pub async fn audit_checksum(&self, object: &ContentObject) -> ReplicaResult<AuditOutcome> {
        let manager = &self.manager;
        let id = manager
            .storage_id(&object.handle, Some(extension(manager)))
            .await?;
        let Some(stored) = manager
            .object_attribute(manager.store_group(), &id, ATTR_CHECKSUM)
            .await?
        else {
            return Ok(AuditOutcome::Missing);
        };

        let archive = pack_object(manager, object).await?;
        let path = archive.clone();
        let digest = tokio::task::spawn_blocking(move || md5_file(&path))
            .await
            .map_err(PackError::from)?;
        discard(&archive).await;
        let local = digest?;

        debug!(handle = %object.handle, %local, %stored, "checksum audit");
        Ok(if local.eq_ignore_ascii_case(&stored) {
            AuditOutcome::Match
        } else {
            AuditOutcome::Mismatch
        })
    }

    /// Existence-only check over the immediate members of a container.
    /// Every member is visited; a missing one does not stop the walk.
    pub async fn audit_extent(&self, object: &ContentObject) -> ReplicaResult<ExtentReport> {
        let manager = &self.manager;
        let mut report = ExtentReport::default();
        for child in manager.repository().children(object).await? {
            let id = manager
                .storage_id(&child.handle, Some(extension(manager)))
                .await?;
            if !manager.object_exists(manager.store_group(), &id).await? {
                warn!(container = %object.handle, member = %child.handle, "member has no replica");
                report.missing.push(child.handle.clone());
            }
            report.checked.push(child.handle);
        }
        Ok(report)
    }

    async fn run(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let object = load(&self.manager, handle).await?;
        let outcome = self.audit_checksum(&object).await?;
        let summary = match outcome {
            AuditOutcome::Match => format!("AIP for {handle} matches the stored copy"),
            AuditOutcome::Mismatch => format!("AIP for {handle} differs from the stored copy"),
            AuditOutcome::Missing => format!("no AIP stored for {handle}"),
        };
        if !object.kind.is_container() {
            return Ok(match outcome {
                AuditOutcome::Match => TaskOutcome::success(summary),
                _ => TaskOutcome::fail(summary),
            });
        }

        let extent = self.audit_extent(&object).await?;
        let extent_summary = if extent.is_complete() {
            format!("all {} members replicated", extent.checked.len())
        } else {
            format!(
                "{} of {} members missing: {}",
                extent.missing.len(),
                extent.checked.len(),
                extent.missing.join(", ")
            )
        };
        let result = format!("{summary}; {extent_summary}");
        Ok(if outcome == AuditOutcome::Match && extent.is_complete() {
            TaskOutcome::success(result)
        } else {
            TaskOutcome::fail(result)
        })
    }
}

#[async_trait]
impl CurationTask for CompareWithAip {
    fn name(&self) -> &'static str {
        "checkaip"
    }

    async fn perform(&self, handle: &str) -> TaskOutcome {
        settle(self.name(), handle, self.run(handle).await)
    }
}
