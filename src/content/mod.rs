//! Content-object model consumed by the replication layer.
//!
//! The repository (communities, collections, items, their metadata and
//! bitstreams) is owned elsewhere; packers read it through
//! [`ContentRepository`] and restores write back through the same contract.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use memory::MemoryRepository;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("object `{0}` already exists")]
    AlreadyExists(String),
    #[error("`{child}` cannot be owned by `{owner}`")]
    InvalidOwner { child: String, owner: String },
    #[error("metadata field `{field}` cannot be resolved: unknown schema `{schema}`")]
    UnknownSchema { schema: String, field: String },
    #[error("bitstream {sequence_id} not found in bundle `{bundle}` of `{handle}`")]
    BitstreamNotFound {
        handle: String,
        bundle: String,
        sequence_id: u32,
    },
}

pub type ContentResult<T> = Result<T, ContentError>;

/// Kind of content object. The order of [`ObjectType::PROBE_ORDER`] is the
/// preference used when a type has to be guessed from the store.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Community,
    Collection,
    Item,
}

impl ObjectType {
    pub const PROBE_ORDER: [ObjectType; 3] =
        [ObjectType::Item, ObjectType::Collection, ObjectType::Community];

    /// Upper-case tag used in storage prefixes and bag properties.
    pub fn type_text(&self) -> &'static str {
        match self {
            ObjectType::Community => "COMMUNITY",
            ObjectType::Collection => "COLLECTION",
            ObjectType::Item => "ITEM",
        }
    }

    pub fn from_type_text(text: &str) -> Option<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "COMMUNITY" => Some(ObjectType::Community),
            "COLLECTION" => Some(ObjectType::Collection),
            "ITEM" => Some(ObjectType::Item),
            _ => None,
        }
    }

    pub fn is_container(&self) -> bool {
        !matches!(self, ObjectType::Item)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_text())
    }
}

/// One metadata value keyed by `schema.element.qualifier` and language.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetadataValue {
    pub schema: String,
    pub element: String,
    pub qualifier: Option<String>,
    pub language: Option<String>,
    pub value: String,
}

impl MetadataValue {
    pub fn new(schema: &str, element: &str, qualifier: Option<&str>, value: &str) -> Self {
        Self {
            schema: schema.to_string(),
            element: element.to_string(),
            qualifier: qualifier.map(str::to_string),
            language: None,
            value: value.to_string(),
        }
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }

    /// Dotted field name, e.g. `dc.title.alternative`.
    pub fn field(&self) -> String {
        match &self.qualifier {
            Some(q) => format!("{}.{}.{}", self.schema, self.element, q),
            None => format!("{}.{}", self.schema, self.element),
        }
    }
}

/// Snapshot of a community, collection or item.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContentObject {
    pub handle: String,
    pub kind: ObjectType,
    /// Owning container; `None` for top-level communities.
    pub owner: Option<String>,
    /// Extra collections an item is mapped into besides its owner.
    pub linked: Vec<String>,
    pub withdrawn: bool,
    pub last_modified: DateTime<Utc>,
    pub metadata: Vec<MetadataValue>,
}

/// Descriptive properties of a stored bitstream.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Bitstream {
    pub name: String,
    pub source: Option<String>,
    pub description: Option<String>,
    pub sequence_id: u32,
    pub size: u64,
    pub checksum: String,
    pub checksum_algorithm: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Bundle {
    pub name: String,
    /// Sequence id of the bundle's primary bitstream.
    pub primary: Option<u32>,
    pub bitstreams: Vec<Bitstream>,
}

impl Bundle {
    pub fn is_primary(&self, bitstream: &Bitstream) -> bool {
        self.primary == Some(bitstream.sequence_id)
    }
}

/// Input for [`ContentRepository::add_bitstream`].
#[derive(Clone, Debug)]
pub struct NewBitstream {
    pub name: String,
    pub source: Option<String>,
    pub description: Option<String>,
    pub sequence_id: u32,
    pub primary: bool,
    pub content: Bytes,
}

/// Narrow read/write contract onto the repository's object model.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    async fn find(&self, handle: &str) -> ContentResult<Option<ContentObject>>;

    async fn sub_communities(&self, handle: &str) -> ContentResult<Vec<ContentObject>>;

    async fn collections(&self, handle: &str) -> ContentResult<Vec<ContentObject>>;

    async fn items(&self, handle: &str) -> ContentResult<Vec<ContentObject>>;

    async fn logo(&self, handle: &str) -> ContentResult<Option<Bytes>>;

    async fn set_logo(&self, handle: &str, logo: Option<Bytes>) -> ContentResult<()>;

    async fn bundles(&self, handle: &str) -> ContentResult<Vec<Bundle>>;

    async fn bitstream_content(
        &self,
        handle: &str,
        bundle: &str,
        sequence_id: u32,
    ) -> ContentResult<Bytes>;

    /// Create an empty object. Communities may have no owner.
    async fn create(
        &self,
        kind: ObjectType,
        handle: &str,
        owner: Option<&str>,
    ) -> ContentResult<ContentObject>;

    async fn replace_metadata(&self, handle: &str, values: Vec<MetadataValue>)
    -> ContentResult<()>;

    async fn clear_bundles(&self, handle: &str) -> ContentResult<()>;

    async fn add_bitstream(
        &self,
        handle: &str,
        bundle: &str,
        bitstream: NewBitstream,
    ) -> ContentResult<Bitstream>;

    async fn set_withdrawn(&self, handle: &str, withdrawn: bool) -> ContentResult<()>;

    /// Map an item into an additional collection.
    async fn link(&self, item: &str, collection: &str) -> ContentResult<()>;

    /// Remove an object and everything it owns.
    async fn delete(&self, handle: &str) -> ContentResult<()>;

    /// Immediate children: sub-communities then collections for a community,
    /// items for a collection, nothing for an item.
    async fn children(&self, object: &ContentObject) -> ContentResult<Vec<ContentObject>> {
        match object.kind {
            ObjectType::Community => {
                let mut children = self.sub_communities(&object.handle).await?;
                children.extend(self.collections(&object.handle).await?);
                Ok(children)
            }
            ObjectType::Collection => self.items(&object.handle).await,
            ObjectType::Item => Ok(Vec::new()),
        }
    }
}
