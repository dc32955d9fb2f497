//! Object store contract.
//!
//! Every operation is keyed by `(group, id)`: a named partition plus a flat
//! storage identifier. "Not present" is an expected outcome and is reported
//! through sentinels (`false`, `None`, `0`), never as an error.

use async_trait::async_trait;
use std::{io, path::Path};
use thiserror::Error;

/// Attribute holding the replica size in bytes.
pub const ATTR_SIZE: &str = "sizebytes";
/// Attribute holding the replica's hex digest.
pub const ATTR_CHECKSUM: &str = "checksum";
/// Attribute holding the digest algorithm name.
pub const ATTR_ALGORITHM: &str = "algorithm";
/// Attribute holding the RFC 3339 last-write time.
pub const ATTR_MODIFIED: &str = "modified";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("group `{name}` invalid: {reason}")]
    InvalidGroupName { name: String, reason: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Idempotent setup; fails if the backend cannot be reached.
    async fn init(&self) -> StoreResult<()>;

    async fn object_exists(&self, group: &str, id: &str) -> StoreResult<bool>;

    /// Read a named attribute (see the `ATTR_*` constants).
    async fn object_attribute(&self, group: &str, id: &str, attr: &str)
    -> StoreResult<Option<String>>;

    /// Copy the replica into `dest`. Returns 0 when it does not exist.
    async fn fetch_object(&self, group: &str, id: &str, dest: &Path) -> StoreResult<u64>;

    /// Upload `source` under its file name, replacing any previous replica.
    async fn transfer_object(&self, group: &str, source: &Path) -> StoreResult<u64>;

    /// Returns the bytes freed, 0 when nothing was there.
    async fn remove_object(&self, group: &str, id: &str) -> StoreResult<u64>;

    /// Relocate a replica between groups. Returns 0 when the source is absent.
    async fn move_object(&self, src_group: &str, dest_group: &str, id: &str) -> StoreResult<u64>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}
