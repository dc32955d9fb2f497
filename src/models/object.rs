//! Represents a replica (archive, catalog or manifest) held in a group.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Index row for a single stored replica.
///
/// The row carries the attributes the replication layer reads back
/// (`sizebytes`, `checksum`); the payload bytes live on disk.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredObject {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the owning group.
    pub group_id: Uuid,

    /// Storage identifier (flat key within the group).
    pub key: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex digest of the payload.
    pub checksum: Option<String>,

    /// Digest algorithm name, `MD5` for the local backend.
    pub checksum_algorithm: String,

    /// Timestamp when the replica was last written.
    pub last_modified: DateTime<Utc>,

    /// Whether the replica has been removed (soft delete).
    pub is_deleted: bool,
}
