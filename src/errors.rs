use crate::content::ContentError;
use crate::pack::PackError;
use crate::services::object_store::StoreError;
use std::io;
use thiserror::Error;

/// Failures surfaced by the replica manager, the odometer and the tasks
/// built on them.
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("no object store backend configured")]
    NoBackend,
    #[error("unsupported object store backend `{0}`")]
    UnsupportedBackend(String),
    #[error("object `{0}` not found in the repository")]
    ObjectNotFound(String),
    #[error("no deletion catalog for `{0}`")]
    CatalogNotFound(String),
    #[error("members of `{0}` have circular ownership")]
    OwnerCycle(String),
    #[error("replica `{id}` missing from group `{group}`")]
    ReplicaMissing { group: String, id: String },
    #[error("malformed manifest `{manifest}` at line {line}: {reason}")]
    MalformedManifest {
        manifest: String,
        line: usize,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pack(#[from] PackError),
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ReplicaResult<T> = Result<T, ReplicaError>;
