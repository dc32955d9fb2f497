//! Represents a store group, a named partition ("folder") of the object store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A logical group inside the object store such as `store`, `delete` or `manifest`.
///
/// Groups are created on first use by the local backend and map one-to-one
/// onto a directory beneath the storage root.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Group {
    /// Unique identifier for this group (UUID for internal DB use).
    pub id: Uuid,

    /// Group name, also used as the directory name on disk.
    pub name: String,

    /// When this group was first written to.
    pub created_at: DateTime<Utc>,
}
