//! Rebuilding repository objects from stored packages.

use super::{CurationTask, discard, extension, load, settle, subtree};
use crate::content::ObjectType;
use crate::errors::{ReplicaError, ReplicaResult};
use crate::models::task::TaskOutcome;
use crate::pack::{Bag, CatalogPacker, PROP_OBJECT_TYPE, PROP_OWNER_ID, PackError, Packer};
use crate::services::ReplicaManager;
use async_trait::async_trait;
use std::{collections::HashSet, path::PathBuf, sync::Arc};
use tracing::{debug, info};

/// A package fetched into staging, with the header fields needed to
/// re-create its object.
#[derive(Debug)]
struct StagedPackage {
    handle: String,
    kind: ObjectType,
    owner: Option<String>,
    archive: PathBuf,
}

/// Restore a deleted object and its former members from the store group,
/// guided by the object's deletion catalog.
///
/// Members are recovered owners-first regardless of their order in the
/// catalog. The catalog is removed from the delete group once every object
/// has been restored.
pub struct BagItRestoreFromAip {
    manager: Arc<ReplicaManager>,
}

impl BagItRestoreFromAip {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        Self { manager }
    }

    async fn run(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let manager = &self.manager;
        if manager.repository().find(handle).await?.is_some() {
            return Ok(TaskOutcome::skip(format!("{handle} already exists")));
        }

        let catalog_id = manager.storage_id(handle, Some(extension(manager))).await?;
        let staged = manager.stage(manager.delete_group(), &catalog_id).await?;
        if manager
            .fetch_object(manager.delete_group(), &catalog_id, &staged)
            .await?
            == 0
        {
            return Err(ReplicaError::CatalogNotFound(handle.to_string()));
        }
        let mut catalog = CatalogPacker::default();
        let unpacked = catalog.unpack(&staged).await;
        discard(&staged).await;
        unpacked?;

        let mut root = self.fetch_package(&catalog.object_id).await?;
        if root.owner.is_none() {
            root.owner = catalog.owner_id.clone();
        }
        let mut packages = Vec::with_capacity(catalog.members.len());
        for member in &catalog.members {
            match self.fetch_package(member).await {
                Ok(package) => packages.push(package),
                Err(err) => {
                    cleanup(std::iter::once(&root).chain(&packages)).await;
                    return Err(err);
                }
            }
        }
        let ordered = match owner_first(&root.handle, packages) {
            Ok(ordered) => ordered,
            Err((err, packages)) => {
                cleanup(std::iter::once(&root).chain(&packages)).await;
                return Err(err);
            }
        };

        let total = ordered.len() + 1;
        let mut queue = std::iter::once(root).chain(ordered);
        while let Some(package) = queue.next() {
            if let Err(err) = self.recover(&package).await {
                cleanup(queue.collect::<Vec<_>>().iter()).await;
                return Err(err);
            }
        }

        manager
            .remove_object(manager.delete_group(), &catalog_id)
            .await?;
        Ok(TaskOutcome::success(format!(
            "{total} objects restored for {handle}"
        )))
    }

    async fn fetch_package(&self, handle: &str) -> ReplicaResult<StagedPackage> {
        let manager = &self.manager;
        let group = manager.store_group();
        let id = manager.storage_id(handle, Some(extension(manager))).await?;
        let archive = manager.stage(group, &id).await?;
        if manager.fetch_object(group, &id, &archive).await? == 0 {
            return Err(ReplicaError::ReplicaMissing {
                group: group.to_string(),
                id,
            });
        }

        let bag = Bag::open(&archive).await?;
        let kind = bag
            .property(PROP_OBJECT_TYPE)
            .ok_or(PackError::MissingProperty(PROP_OBJECT_TYPE))
            .and_then(|text| {
                ObjectType::from_type_text(text)
                    .ok_or_else(|| PackError::UnknownObjectType(text.to_string()))
            });
        let owner = bag.property(PROP_OWNER_ID).map(str::to_string);
        bag.clean().await;

        let kind = match kind {
            Ok(kind) => kind,
            Err(err) => {
                discard(&archive).await;
                return Err(err.into());
            }
        };
        Ok(StagedPackage {
            handle: handle.to_string(),
            kind,
            owner,
            archive,
        })
    }

    /// Re-create the object under its owner and apply the package.
    async fn recover(&self, package: &StagedPackage) -> ReplicaResult<()> {
        let repo = self.manager.repository();
        let applied = async {
            let object = repo
                .create(package.kind, &package.handle, package.owner.as_deref())
                .await?;
            self.manager
                .packer_for(&object)
                .unpack(&package.archive)
                .await?;
            Ok::<_, ReplicaError>(())
        }
        .await;
        discard(&package.archive).await;
        applied?;
        debug!(handle = %package.handle, kind = %package.kind, "object recovered");
        Ok(())
    }
}

#[async_trait]
impl CurationTask for BagItRestoreFromAip {
    fn name(&self) -> &'static str {
        "restorefromaip"
    }

    async fn perform(&self, handle: &str) -> TaskOutcome {
        settle(self.name(), handle, self.run(handle).await)
    }
}

/// Order packages so each comes after its owner when that owner is also
/// being restored. Owners outside the set must already exist. Catalog order
/// is kept wherever ownership allows it.
fn owner_first(
    root: &str,
    packages: Vec<StagedPackage>,
) -> Result<Vec<StagedPackage>, (ReplicaError, Vec<StagedPackage>)> {
    let pending: HashSet<String> = packages.iter().map(|p| p.handle.clone()).collect();
    let mut placed: HashSet<String> = HashSet::from([root.to_string()]);
    let mut ordered = Vec::with_capacity(packages.len());
    let mut remaining = packages;

    while !remaining.is_empty() {
        let before = remaining.len();
        let mut deferred = Vec::new();
        for package in remaining {
            let ready = package
                .owner
                .as_ref()
                .is_none_or(|owner| placed.contains(owner) || !pending.contains(owner));
            if ready {
                placed.insert(package.handle.clone());
                ordered.push(package);
            } else {
                deferred.push(package);
            }
        }
        if deferred.len() == before {
            deferred.extend(ordered);
            return Err((ReplicaError::OwnerCycle(root.to_string()), deferred));
        }
        remaining = deferred;
    }
    Ok(ordered)
}

async fn cleanup<'a>(packages: impl Iterator<Item = &'a StagedPackage>) {
    for package in packages {
        discard(&package.archive).await;
    }
}

/// Re-apply stored packages onto an existing object and everything below it.
pub struct BagItReplaceWithAip {
    manager: Arc<ReplicaManager>,
}

impl BagItReplaceWithAip {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        Self { manager }
    }

    async fn run(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let manager = &self.manager;
        let group = manager.store_group();
        let root = load(manager, handle).await?;
        let mut replaced = 0;
        for object in subtree(manager, root).await? {
            let id = manager
                .storage_id(&object.handle, Some(extension(manager)))
                .await?;
            let archive = manager.stage(group, &id).await?;
            if manager.fetch_object(group, &id, &archive).await? == 0 {
                return Err(ReplicaError::ReplicaMissing {
                    group: group.to_string(),
                    id,
                });
            }
            let applied = manager.packer_for(&object).unpack(&archive).await;
            discard(&archive).await;
            applied?;
            replaced += 1;
        }
        info!(handle, replaced, "objects replaced from stored AIPs");
        Ok(TaskOutcome::success(format!(
            "{replaced} objects replaced for {handle}"
        )))
    }
}

#[async_trait]
impl CurationTask for BagItReplaceWithAip {
    fn name(&self) -> &'static str {
        "replacewithaip"
    }

    async fn perform(&self, handle: &str) -> TaskOutcome {
        settle(self.name(), handle, self.run(handle).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(handle: &str, owner: Option<&str>) -> StagedPackage {
        StagedPackage {
            handle: handle.to_string(),
            kind: ObjectType::Collection,
            owner: owner.map(str::to_string),
            archive: PathBuf::from(format!("/tmp/{}", handle.replace('/', "-"))),
        }
    }

    fn handles(packages: &[StagedPackage]) -> Vec<&str> {
        packages.iter().map(|p| p.handle.as_str()).collect()
    }

    #[test]
    fn children_listed_before_owners_are_reordered() {
        let packages = vec![
            package("1/4", Some("1/3")),
            package("1/5", Some("1/4")),
            package("1/3", Some("1/2")),
            package("1/6", Some("1/2")),
        ];
        let ordered = owner_first("1/2", packages).unwrap();
        assert_eq!(handles(&ordered), vec!["1/3", "1/6", "1/4", "1/5"]);
    }

    #[test]
    fn owners_outside_the_catalog_are_assumed_present() {
        let packages = vec![package("1/9", Some("1/1")), package("1/10", None)];
        let ordered = owner_first("1/2", packages).unwrap();
        assert_eq!(handles(&ordered), vec!["1/9", "1/10"]);
    }

    #[test]
    fn circular_ownership_is_rejected() {
        let packages = vec![package("1/3", Some("1/4")), package("1/4", Some("1/3"))];
        let (err, leftover) = owner_first("1/2", packages).unwrap_err();
        assert!(matches!(err, ReplicaError::OwnerCycle(_)));
        assert_eq!(leftover.len(), 2);
    }
}
