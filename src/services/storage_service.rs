//! src/services/storage_service.rs
//!
//! LocalObjectStore: the reference `ObjectStore` backend. Replica metadata
//! (size, MD5 checksum, modification time) lives in SQLite; payloads live on
//! disk sharded beneath `base_path/{group}/{shard}/{shard}/{key}`.

use crate::models::{group::Group, object::StoredObject};
use crate::services::object_store::{
    ATTR_ALGORITHM, ATTR_CHECKSUM, ATTR_MODIFIED, ATTR_SIZE, ObjectStore, StoreError, StoreResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const GROUP_NAME_MIN_LEN: usize = 3;
const GROUP_NAME_MAX_LEN: usize = 63;

/// Local filesystem object store:
/// - transfer streams a file to disk and upserts its index row
/// - fetch copies the payload out to a destination file
/// - remove soft-deletes the row and removes the payload
/// - move renames the payload into another group and re-points the row
#[derive(Clone)]
pub struct LocalObjectStore {
    /// Shared SQLite connection pool used for the replica index.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where replica payloads are stored.
    pub base_path: PathBuf,
}

impl LocalObjectStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Storage identifiers are flat, so separators are rejected outright.
    fn ensure_key_safe(&self, key: &str) -> StoreResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StoreError::InvalidObjectKey(key.to_string()));
        }
        if key.starts_with('.') || key.contains("..") || key.contains('/') {
            return Err(StoreError::InvalidObjectKey(key.to_string()));
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StoreError::InvalidObjectKey(key.to_string()));
        }
        Ok(())
    }

    /// Validate group name format.
    ///
    /// - 3–63 characters
    /// - lowercase letters, digits and hyphens only
    /// - cannot start or end with a hyphen
    fn ensure_group_name_safe(&self, name: &str) -> StoreResult<()> {
        let len = name.len();
        if !(GROUP_NAME_MIN_LEN..=GROUP_NAME_MAX_LEN).contains(&len) {
            return Err(StoreError::InvalidGroupName {
                name: name.to_string(),
                reason: "must be between 3 and 63 characters".into(),
            });
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-'))
        {
            return Err(StoreError::InvalidGroupName {
                name: name.to_string(),
                reason: "allowed characters are lowercase letters, digits, and hyphens".into(),
            });
        }

        if name.starts_with('-') || name.ends_with('-') {
            return Err(StoreError::InvalidGroupName {
                name: name.to_string(),
                reason: "must start and end with a lowercase letter or digit".into(),
            });
        }

        Ok(())
    }

    /// Physical base folder for a group. Does not check for existence.
    fn group_root(&self, group: &str) -> PathBuf {
        self.base_path.join(group)
    }

    /// Two-level shard identifiers from MD5(group/key), as lowercase hex.
    fn object_shards(group: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", group, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// `base_path/group/{shard}/{shard}/{key}`. Parents may not exist yet.
    fn object_path(&self, group: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(group, key);
        let mut path = self.group_root(group);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn find_group(&self, name: &str) -> StoreResult<Option<Group>> {
        self.ensure_group_name_safe(name)?;
        let group = sqlx::query_as::<Sqlite, Group>(
            "SELECT id, name, created_at FROM groups WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&*self.db)
        .await?;
        Ok(group)
    }

    /// Fetch the group row, creating it (and its directory) on first use.
    async fn ensure_group(&self, name: &str) -> StoreResult<Group> {
        if let Some(group) = self.find_group(name).await? {
            return Ok(group);
        }
        fs::create_dir_all(self.group_root(name)).await?;
        sqlx::query(
            "INSERT INTO groups (id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        debug!("created group {}", name);

        let group = sqlx::query_as::<Sqlite, Group>(
            "SELECT id, name, created_at FROM groups WHERE name = ?",
        )
        .bind(name)
        .fetch_one(&*self.db)
        .await?;
        Ok(group)
    }

    /// Fetch a live (not removed) replica row.
    async fn find_object(&self, group: &Group, key: &str) -> StoreResult<Option<StoredObject>> {
        let object = sqlx::query_as::<Sqlite, StoredObject>(
            "SELECT id, group_id, key, size_bytes, checksum, checksum_algorithm,
                    last_modified, is_deleted
             FROM objects
             WHERE key = ? AND group_id = ? AND is_deleted = 0",
        )
        .bind(key)
        .bind(group.id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(object)
    }

    async fn lookup(&self, group: &str, key: &str) -> StoreResult<Option<StoredObject>> {
        self.ensure_key_safe(key)?;
        match self.find_group(group).await? {
            Some(group_rec) => self.find_object(&group_rec, key).await,
            None => Ok(None),
        }
    }

    /// Stream-upload a replica to disk and upsert its index row.
    ///
    /// - Writes bytes incrementally to a temporary file.
    /// - Computes MD5 and size while streaming.
    /// - fsyncs, then renames into the final location.
    ///
    /// Cleans up temp files on errors so a partial upload is never visible.
    pub async fn upload_object_stream<S>(
        &self,
        group: &str,
        key: &str,
        stream: S,
    ) -> StoreResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.ensure_key_safe(key)?;
        let group_rec = self.ensure_group(group).await?;

        let file_path = self.object_path(&group_rec.name, key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }

        let checksum = format!("{:x}", digest.compute());
        let insert_result = sqlx::query_as::<Sqlite, StoredObject>(
            r#"
            INSERT INTO objects (
                id, group_id, key, size_bytes, checksum, checksum_algorithm,
                last_modified, is_deleted
            ) VALUES (?, ?, ?, ?, ?, 'MD5', ?, 0)
            ON CONFLICT(group_id, key) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                checksum = excluded.checksum,
                checksum_algorithm = excluded.checksum_algorithm,
                last_modified = excluded.last_modified,
                is_deleted = 0
            RETURNING id, group_id, key, size_bytes, checksum, checksum_algorithm,
                      last_modified, is_deleted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(group_rec.id)
        .bind(key)
        .bind(size_bytes)
        .bind(&checksum)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(obj) => Ok(obj),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(StoreError::Sqlx(err))
            }
        }
    }

    /// List live replicas in a group, ordered by key, optionally filtered by
    /// key prefix.
    pub async fn list_objects(
        &self,
        group: &str,
        prefix: Option<&str>,
    ) -> StoreResult<Vec<StoredObject>> {
        let Some(group_rec) = self.find_group(group).await? else {
            return Ok(Vec::new());
        };

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, group_id, key, size_bytes, checksum, checksum_algorithm, \
             last_modified, is_deleted FROM objects WHERE group_id = ",
        );
        builder.push_bind(group_rec.id);
        builder.push(" AND is_deleted = 0");
        if let Some(prefix) = prefix {
            builder.push(" AND key LIKE ");
            builder.push_bind(format!("{}%", prefix));
        }
        builder.push(" ORDER BY key ASC");

        let rows: Vec<StoredObject> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    /// Recursively remove empty directories up to the group root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    /// Creates the storage root and checks the index and disk are usable.
    #[instrument(skip(self), fields(backend = "local"))]
    async fn init(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.base_path).await?;

        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM groups")
            .fetch_one(&*self.db)
            .await
            .map_err(|err| {
                StoreError::Unreachable(format!("replica index unavailable ({err}); run --migrate"))
            })?;

        let probe = self.base_path.join(format!(".probe-{}", Uuid::new_v4()));
        fs::write(&probe, b"probe")
            .await
            .map_err(|err| StoreError::Unreachable(format!("storage dir not writable: {err}")))?;
        if let Err(err) = fs::remove_file(&probe).await {
            warn!("could not remove probe file {}: {}", probe.display(), err);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn object_exists(&self, group: &str, id: &str) -> StoreResult<bool> {
        Ok(self.lookup(group, id).await?.is_some())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn object_attribute(
        &self,
        group: &str,
        id: &str,
        attr: &str,
    ) -> StoreResult<Option<String>> {
        let Some(object) = self.lookup(group, id).await? else {
            return Ok(None);
        };
        let value = match attr {
            ATTR_SIZE => Some(object.size_bytes.to_string()),
            ATTR_CHECKSUM => object.checksum,
            ATTR_ALGORITHM => Some(object.checksum_algorithm),
            ATTR_MODIFIED => Some(
                object
                    .last_modified
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            _ => None,
        };
        Ok(value)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn fetch_object(&self, group: &str, id: &str, dest: &Path) -> StoreResult<u64> {
        if self.lookup(group, id).await?.is_none() {
            return Ok(0);
        }

        let source = self.object_path(group, id);
        let mut reader = match File::open(&source).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("index lists {}/{} but payload is missing", group, id);
                return Ok(0);
            }
            Err(err) => return Err(StoreError::Io(err)),
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = dest.with_file_name(format!(".fetch-{}", Uuid::new_v4()));
        let mut writer = File::create(&tmp_path).await?;
        let copied = match tokio::io::copy(&mut reader, &mut writer).await {
            Ok(copied) => copied,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        };
        writer.flush().await?;
        drop(writer);
        fs::rename(&tmp_path, dest).await?;
        Ok(copied)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn transfer_object(&self, group: &str, source: &Path) -> StoreResult<u64> {
        let key = source
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StoreError::InvalidObjectKey(source.display().to_string()))?
            .to_string();
        let file = File::open(source).await?;
        let object = self
            .upload_object_stream(group, &key, ReaderStream::new(file))
            .await?;
        Ok(object.size_bytes as u64)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn remove_object(&self, group: &str, id: &str) -> StoreResult<u64> {
        let Some(object) = self.lookup(group, id).await? else {
            return Ok(0);
        };

        // payload first, so a failed unlink leaves the index row live
        let file_path = self.object_path(group, id);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        sqlx::query("UPDATE objects SET is_deleted = 1 WHERE id = ?")
            .bind(object.id)
            .execute(&*self.db)
            .await?;
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.group_root(group)).await;
        }

        Ok(object.size_bytes as u64)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn move_object(&self, src_group: &str, dest_group: &str, id: &str) -> StoreResult<u64> {
        let Some(object) = self.lookup(src_group, id).await? else {
            return Ok(0);
        };
        if src_group == dest_group {
            return Ok(object.size_bytes as u64);
        }
        let dest_rec = self.ensure_group(dest_group).await?;

        let from = self.object_path(src_group, id);
        let to = self.object_path(dest_group, id);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::rename(&from, &to).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("index lists {}/{} but payload is missing", src_group, id);
                return Ok(0);
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM objects WHERE group_id = ? AND key = ?")
            .bind(dest_rec.id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE objects SET group_id = ? WHERE id = ?")
            .bind(dest_rec.id)
            .bind(object.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if let Some(parent) = from.parent() {
            self.prune_empty_dirs(parent, &self.group_root(src_group))
                .await;
        }
        Ok(object.size_bytes as u64)
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shards_are_stable_hex_pairs() {
        let (a, b) = LocalObjectStore::object_shards("store", "ITEM@123456789-42.zip");
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        assert_eq!(
            (a, b),
            LocalObjectStore::object_shards("store", "ITEM@123456789-42.zip")
        );
    }

    async fn scratch_store(tmp: &tempfile::TempDir) -> LocalObjectStore {
        let url = format!("sqlite://{}", tmp.path().join("index.db").display());
        let db = crate::db::connect(&url).await.unwrap();
        crate::db::run_migrations(&db).await.unwrap();
        let store = LocalObjectStore::new(db, tmp.path().join("replicas"));
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn failed_payload_removal_keeps_the_replica_listed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = scratch_store(&tmp).await;
        let source = tmp.path().join("ITEM@1-2.zip");
        fs::write(&source, b"0123456789").await.unwrap();
        assert_eq!(store.transfer_object("store", &source).await.unwrap(), 10);

        // a directory where the payload should be cannot be unlinked
        let payload = store.object_path("store", "ITEM@1-2.zip");
        fs::remove_file(&payload).await.unwrap();
        fs::create_dir(&payload).await.unwrap();

        assert!(store.remove_object("store", "ITEM@1-2.zip").await.is_err());
        assert!(store.object_exists("store", "ITEM@1-2.zip").await.unwrap());

        fs::remove_dir(&payload).await.unwrap();
        assert_eq!(store.remove_object("store", "ITEM@1-2.zip").await.unwrap(), 10);
        assert!(!store.object_exists("store", "ITEM@1-2.zip").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_unsafe_keys_and_groups() {
        let pool = SqlitePool::connect_lazy("sqlite::memory:").unwrap();
        let store = LocalObjectStore::new(Arc::new(pool), "/tmp/unused");
        assert!(store.ensure_key_safe("ITEM@1-2.zip").is_ok());
        assert!(store.ensure_key_safe("../etc").is_err());
        assert!(store.ensure_key_safe("a/b").is_err());
        assert!(store.ensure_key_safe("").is_err());
        assert!(store.ensure_group_name_safe("store").is_ok());
        assert!(store.ensure_group_name_safe("St").is_err());
        assert!(store.ensure_group_name_safe("-store").is_err());
    }
}
