//! Replica manager: storage identities, staging, and accounted access to the
//! object store.
//!
//! Construct one per process and share it by `Arc`. All byte accounting
//! flows through the transfer/fetch/remove wrappers here; the odometer is
//! only adjusted after the backend has confirmed the operation.

use crate::config::ReplicaConfig;
use crate::content::{ContentObject, ContentRepository, ObjectType};
use crate::errors::{ReplicaError, ReplicaResult};
use crate::models::odometer::{OdometerDelta, OdometerReading};
use crate::pack::{ArchiveFormat, Packer, PackerOptions, packer_for};
use crate::services::{
    object_store::{ATTR_SIZE, ObjectStore, StoreError},
    odometer::Odometer,
    storage_service::LocalObjectStore,
};
use crate::tasks::checkm::MANIFEST_EXT;
use sqlx::SqlitePool;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs;
use tracing::{debug, info, instrument};

/// Separates the type tag from the rest of a storage id.
pub const TYPE_SEPARATOR: char = '@';

/// Extensions written after a storage id; any other dotted suffix belongs
/// to the handle.
const STORED_EXTENSIONS: [&str; 3] = [
    ArchiveFormat::Zip.extension(),
    ArchiveFormat::Tgz.extension(),
    MANIFEST_EXT,
];

pub struct ReplicaManager {
    store: Arc<dyn ObjectStore>,
    repo: Arc<dyn ContentRepository>,
    odometer: Odometer,
    config: ReplicaConfig,
    options: PackerOptions,
}

impl ReplicaManager {
    /// Build the backend named in `config` and connect to it.
    pub async fn from_config(
        config: ReplicaConfig,
        db: Arc<SqlitePool>,
        repo: Arc<dyn ContentRepository>,
    ) -> ReplicaResult<Self> {
        let store: Arc<dyn ObjectStore> = match config.backend.as_deref() {
            None => return Err(ReplicaError::NoBackend),
            Some("local") => Arc::new(LocalObjectStore::new(db.clone(), &config.storage_dir)),
            Some(other) => return Err(ReplicaError::UnsupportedBackend(other.to_string())),
        };
        Self::new(store, repo, db, config).await
    }

    /// Use an already constructed backend.
    pub async fn new(
        store: Arc<dyn ObjectStore>,
        repo: Arc<dyn ContentRepository>,
        db: Arc<SqlitePool>,
        config: ReplicaConfig,
    ) -> ReplicaResult<Self> {
        let options = config
            .packer_options()
            .map_err(|err| ReplicaError::Config(format!("{err:#}")))?;
        store.init().await?;
        let odometer = Odometer::load(db).await?;
        info!(backend = store.backend_name(), "replica manager ready");
        Ok(Self {
            store,
            repo,
            odometer,
            config,
            options,
        })
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn repository(&self) -> &Arc<dyn ContentRepository> {
        &self.repo
    }

    pub fn store_group(&self) -> &str {
        &self.config.store_group
    }

    pub fn delete_group(&self) -> &str {
        &self.config.delete_group
    }

    pub fn manifest_group(&self) -> &str {
        &self.config.manifest_group
    }

    /// Archive format used when no object-specific rule applies.
    pub fn default_format(&self) -> ArchiveFormat {
        self.config.format
    }

    pub fn packer_options(&self) -> PackerOptions {
        self.options.clone()
    }

    /// Packer for a live object, configured with this manager's filters.
    pub fn packer_for(&self, object: &ContentObject) -> Box<dyn Packer> {
        packer_for(self.repo.clone(), object, self.packer_options())
    }

    /// Current counters.
    pub async fn odometer(&self) -> OdometerReading {
        self.odometer.reading().await
    }

    /// Storage id for `handle`. The type tag comes from the live object; once
    /// the object is gone it is discovered by probing the store and delete
    /// groups under each type in turn. When nothing is found the id carries
    /// no tag.
    #[instrument(skip(self))]
    pub async fn storage_id(&self, handle: &str, ext: Option<&str>) -> ReplicaResult<String> {
        if !self.config.type_prefix {
            return Ok(Self::storage_id_for(None, handle, ext));
        }
        if let Some(object) = self.repo.find(handle).await? {
            return Ok(Self::storage_id_for(Some(object.kind), handle, ext));
        }
        for kind in ObjectType::PROBE_ORDER {
            let candidate = Self::storage_id_for(Some(kind), handle, ext);
            for group in [self.store_group(), self.delete_group()] {
                if self.store.object_exists(group, &candidate).await? {
                    debug!(%candidate, group, "storage id found by probing");
                    return Ok(candidate);
                }
            }
        }
        Ok(Self::storage_id_for(None, handle, ext))
    }

    /// Pure form of [`Self::storage_id`] for a known (or absent) type.
    pub fn storage_id_for(kind: Option<ObjectType>, handle: &str, ext: Option<&str>) -> String {
        let mut id = String::new();
        if let Some(kind) = kind {
            id.push_str(kind.type_text());
            id.push(TYPE_SEPARATOR);
        }
        id.push_str(&handle.replace('/', "-"));
        if let Some(ext) = ext {
            id.push('.');
            id.push_str(ext);
        }
        id
    }

    /// Handle encoded in a storage id.
    ///
    /// Only the archive and manifest extensions are stripped. Handles must
    /// not contain dashes, nor end in one of those extensions.
    pub fn canonical_id(storage_id: &str) -> String {
        let rest = storage_id
            .split_once(TYPE_SEPARATOR)
            .map_or(storage_id, |(_, rest)| rest);
        let rest = rest
            .rsplit_once('.')
            .filter(|(_, ext)| STORED_EXTENSIONS.contains(ext))
            .map_or(rest, |(base, _)| base);
        rest.replace('-', "/")
    }

    /// `<staging>/<group>/<id>`, with the group directory created.
    pub async fn stage(&self, group: &str, id: &str) -> ReplicaResult<PathBuf> {
        let dir = self.config.staging_dir.join(group);
        fs::create_dir_all(&dir).await?;
        Ok(dir.join(id))
    }

    pub async fn object_exists(&self, group: &str, id: &str) -> ReplicaResult<bool> {
        Ok(self.store.object_exists(group, id).await?)
    }

    pub async fn object_attribute(
        &self,
        group: &str,
        id: &str,
        attr: &str,
    ) -> ReplicaResult<Option<String>> {
        Ok(self.store.object_attribute(group, id, attr).await?)
    }

    /// Upload `file` (keyed by its file name) and account for it. A
    /// re-upload only adds the size difference to the stored total.
    #[instrument(skip(self))]
    pub async fn transfer_object(&self, group: &str, file: &Path) -> ReplicaResult<u64> {
        let key = file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StoreError::InvalidObjectKey(file.display().to_string()))?;
        let previous = self
            .store
            .object_attribute(group, key, ATTR_SIZE)
            .await?
            .and_then(|size| size.parse::<i64>().ok());

        let size = self.store.transfer_object(group, file).await?;
        self.odometer
            .adjust(OdometerDelta {
                count: if previous.is_none() { 1 } else { 0 },
                storesize: size as i64 - previous.unwrap_or(0),
                uploaded: size as i64,
                downloaded: 0,
            })
            .await?;
        info!(group, key, size, "transferred replica");
        Ok(size)
    }

    /// Download a replica into `dest`. Returns 0 when it does not exist.
    #[instrument(skip(self))]
    pub async fn fetch_object(&self, group: &str, id: &str, dest: &Path) -> ReplicaResult<u64> {
        let size = self.store.fetch_object(group, id, dest).await?;
        if size > 0 {
            self.odometer
                .adjust(OdometerDelta {
                    downloaded: size as i64,
                    ..OdometerDelta::default()
                })
                .await?;
            info!(group, id, size, "fetched replica");
        }
        Ok(size)
    }

    /// Returns the bytes freed, 0 when nothing was there.
    #[instrument(skip(self))]
    pub async fn remove_object(&self, group: &str, id: &str) -> ReplicaResult<u64> {
        let size = self.store.remove_object(group, id).await?;
        if size > 0 {
            self.odometer
                .adjust(OdometerDelta {
                    count: -1,
                    storesize: -(size as i64),
                    ..OdometerDelta::default()
                })
                .await?;
            info!(group, id, size, "removed replica");
        }
        Ok(size)
    }

    /// Relocate a replica. The moved bytes are not counted again; a replica
    /// it replaces in `dest_group` is accounted as removed.
    #[instrument(skip(self))]
    pub async fn move_object(&self, src_group: &str, dest_group: &str, id: &str) -> ReplicaResult<u64> {
        let replaced = if src_group == dest_group {
            None
        } else {
            self.store
                .object_attribute(dest_group, id, ATTR_SIZE)
                .await?
                .and_then(|size| size.parse::<i64>().ok())
        };

        let size = self.store.move_object(src_group, dest_group, id).await?;
        if size == 0 {
            return Ok(0);
        }
        if let Some(previous) = replaced {
            self.odometer
                .adjust(OdometerDelta {
                    count: -1,
                    storesize: -previous,
                    ..OdometerDelta::default()
                })
                .await?;
            debug!(dest_group, id, previous, "move replaced an existing replica");
        }
        info!(src_group, dest_group, id, size, "moved replica");
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_ids_invert() {
        let handles = [
            "123456789/42",
            "10.5072/abc",
            "hdl/7",
            "123456789/1.2",
            "hdl/v2.0",
            "10.1000/abc.def",
        ];
        for handle in handles {
            for kind in [None, Some(ObjectType::Item), Some(ObjectType::Community)] {
                for ext in [None, Some("zip"), Some("tgz"), Some("txt")] {
                    let id = ReplicaManager::storage_id_for(kind, handle, ext);
                    assert_eq!(ReplicaManager::canonical_id(&id), handle, "{id}");
                }
            }
        }
    }

    #[test]
    fn storage_id_layout() {
        assert_eq!(
            ReplicaManager::storage_id_for(Some(ObjectType::Item), "123456789/42", Some("zip")),
            "ITEM@123456789-42.zip"
        );
        assert_eq!(
            ReplicaManager::storage_id_for(None, "123456789/42", None),
            "123456789-42"
        );
        assert_eq!(
            ReplicaManager::canonical_id("COLLECTION@10.5072-abc.txt"),
            "10.5072/abc"
        );
        assert_eq!(
            ReplicaManager::canonical_id("ITEM@123456789-1.2"),
            "123456789/1.2"
        );
    }
}
