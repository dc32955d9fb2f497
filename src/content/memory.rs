//! In-memory content repository.
//!
//! Backs tests and embedders that do not have a real repository at hand.
//! Everything sits behind one `RwLock`; values are cloned on the way out.

use super::{
    Bitstream, Bundle, ContentError, ContentObject, ContentRepository, ContentResult,
    MetadataValue, NewBitstream, ObjectType,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

const DEFAULT_SCHEMAS: [&str; 3] = ["dc", "dcterms", "local"];

struct StoredBundle {
    name: String,
    primary: Option<u32>,
    bitstreams: Vec<(Bitstream, Bytes)>,
}

struct Node {
    object: ContentObject,
    logo: Option<Bytes>,
    bundles: Vec<StoredBundle>,
    /// Owned children in insertion order.
    children: Vec<String>,
}

#[derive(Default)]
struct State {
    nodes: HashMap<String, Node>,
    schemas: HashSet<String>,
}

pub struct MemoryRepository {
    state: RwLock<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        let schemas = DEFAULT_SCHEMAS.iter().map(|s| s.to_string()).collect();
        Self {
            state: RwLock::new(State {
                nodes: HashMap::new(),
                schemas,
            }),
        }
    }

    /// Allow metadata in an additional schema.
    pub async fn register_schema(&self, schema: &str) {
        self.state.write().await.schemas.insert(schema.to_string());
    }

    /// Append a single metadata value, keeping the existing ones.
    pub async fn add_metadata(&self, handle: &str, value: MetadataValue) -> ContentResult<()> {
        let mut state = self.state.write().await;
        ensure_schema(&state.schemas, &value)?;
        let node = node_mut(&mut state.nodes, handle)?;
        node.object.metadata.push(value);
        node.object.last_modified = Utc::now();
        Ok(())
    }

    /// Number of objects currently held.
    pub async fn len(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.nodes.is_empty()
    }

    async fn children_of(
        &self,
        handle: &str,
        kind: ObjectType,
    ) -> ContentResult<Vec<ContentObject>> {
        let state = self.state.read().await;
        let node = state
            .nodes
            .get(handle)
            .ok_or_else(|| ContentError::NotFound(handle.to_string()))?;
        Ok(node
            .children
            .iter()
            .filter_map(|child| state.nodes.get(child))
            .filter(|child| child.object.kind == kind)
            .map(|child| child.object.clone())
            .collect())
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn node_mut<'a>(nodes: &'a mut HashMap<String, Node>, handle: &str) -> ContentResult<&'a mut Node> {
    nodes
        .get_mut(handle)
        .ok_or_else(|| ContentError::NotFound(handle.to_string()))
}

fn ensure_schema(schemas: &HashSet<String>, value: &MetadataValue) -> ContentResult<()> {
    if schemas.contains(&value.schema) {
        Ok(())
    } else {
        Err(ContentError::UnknownSchema {
            schema: value.schema.clone(),
            field: value.field(),
        })
    }
}

fn owner_allowed(child: ObjectType, owner: Option<ObjectType>) -> bool {
    matches!(
        (child, owner),
        (ObjectType::Community, None)
            | (ObjectType::Community, Some(ObjectType::Community))
            | (ObjectType::Collection, Some(ObjectType::Community))
            | (ObjectType::Item, Some(ObjectType::Collection))
    )
}

#[async_trait]
impl ContentRepository for MemoryRepository {
    async fn find(&self, handle: &str) -> ContentResult<Option<ContentObject>> {
        let state = self.state.read().await;
        Ok(state.nodes.get(handle).map(|node| node.object.clone()))
    }

    async fn sub_communities(&self, handle: &str) -> ContentResult<Vec<ContentObject>> {
        self.children_of(handle, ObjectType::Community).await
    }

    async fn collections(&self, handle: &str) -> ContentResult<Vec<ContentObject>> {
        self.children_of(handle, ObjectType::Collection).await
    }

    async fn items(&self, handle: &str) -> ContentResult<Vec<ContentObject>> {
        self.children_of(handle, ObjectType::Item).await
    }

    async fn logo(&self, handle: &str) -> ContentResult<Option<Bytes>> {
        let state = self.state.read().await;
        let node = state
            .nodes
            .get(handle)
            .ok_or_else(|| ContentError::NotFound(handle.to_string()))?;
        Ok(node.logo.clone())
    }

    async fn set_logo(&self, handle: &str, logo: Option<Bytes>) -> ContentResult<()> {
        let mut state = self.state.write().await;
        let node = node_mut(&mut state.nodes, handle)?;
        node.logo = logo;
        node.object.last_modified = Utc::now();
        Ok(())
    }

    async fn bundles(&self, handle: &str) -> ContentResult<Vec<Bundle>> {
        let state = self.state.read().await;
        let node = state
            .nodes
            .get(handle)
            .ok_or_else(|| ContentError::NotFound(handle.to_string()))?;
        Ok(node
            .bundles
            .iter()
            .map(|bundle| Bundle {
                name: bundle.name.clone(),
                primary: bundle.primary,
                bitstreams: bundle.bitstreams.iter().map(|(b, _)| b.clone()).collect(),
            })
            .collect())
    }

    async fn bitstream_content(
        &self,
        handle: &str,
        bundle: &str,
        sequence_id: u32,
    ) -> ContentResult<Bytes> {
        let state = self.state.read().await;
        let missing = || ContentError::BitstreamNotFound {
            handle: handle.to_string(),
            bundle: bundle.to_string(),
            sequence_id,
        };
        let node = state
            .nodes
            .get(handle)
            .ok_or_else(|| ContentError::NotFound(handle.to_string()))?;
        node.bundles
            .iter()
            .find(|b| b.name == bundle)
            .and_then(|b| {
                b.bitstreams
                    .iter()
                    .find(|(bs, _)| bs.sequence_id == sequence_id)
            })
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(missing)
    }

    async fn create(
        &self,
        kind: ObjectType,
        handle: &str,
        owner: Option<&str>,
    ) -> ContentResult<ContentObject> {
        let mut state = self.state.write().await;
        if state.nodes.contains_key(handle) {
            return Err(ContentError::AlreadyExists(handle.to_string()));
        }
        let owner_kind = match owner {
            Some(owner) => Some(
                state
                    .nodes
                    .get(owner)
                    .map(|node| node.object.kind)
                    .ok_or_else(|| ContentError::NotFound(owner.to_string()))?,
            ),
            None => None,
        };
        if !owner_allowed(kind, owner_kind) {
            return Err(ContentError::InvalidOwner {
                child: handle.to_string(),
                owner: owner.unwrap_or("<none>").to_string(),
            });
        }

        let object = ContentObject {
            handle: handle.to_string(),
            kind,
            owner: owner.map(str::to_string),
            linked: Vec::new(),
            withdrawn: false,
            last_modified: Utc::now(),
            metadata: Vec::new(),
        };
        if let Some(owner) = owner {
            node_mut(&mut state.nodes, owner)?
                .children
                .push(handle.to_string());
        }
        state.nodes.insert(
            handle.to_string(),
            Node {
                object: object.clone(),
                logo: None,
                bundles: Vec::new(),
                children: Vec::new(),
            },
        );
        Ok(object)
    }

    async fn replace_metadata(
        &self,
        handle: &str,
        values: Vec<MetadataValue>,
    ) -> ContentResult<()> {
        let mut state = self.state.write().await;
        for value in &values {
            ensure_schema(&state.schemas, value)?;
        }
        let node = node_mut(&mut state.nodes, handle)?;
        node.object.metadata = values;
        node.object.last_modified = Utc::now();
        Ok(())
    }

    async fn clear_bundles(&self, handle: &str) -> ContentResult<()> {
        let mut state = self.state.write().await;
        let node = node_mut(&mut state.nodes, handle)?;
        node.bundles.clear();
        node.object.last_modified = Utc::now();
        Ok(())
    }

    async fn add_bitstream(
        &self,
        handle: &str,
        bundle: &str,
        bitstream: NewBitstream,
    ) -> ContentResult<Bitstream> {
        let mut state = self.state.write().await;
        let node = node_mut(&mut state.nodes, handle)?;
        if node.object.kind != ObjectType::Item {
            return Err(ContentError::InvalidOwner {
                child: bitstream.name,
                owner: handle.to_string(),
            });
        }

        let stored = Bitstream {
            name: bitstream.name,
            source: bitstream.source,
            description: bitstream.description,
            sequence_id: bitstream.sequence_id,
            size: bitstream.content.len() as u64,
            checksum: format!("{:x}", md5::compute(&bitstream.content)),
            checksum_algorithm: "MD5".to_string(),
        };

        let position = match node.bundles.iter().position(|b| b.name == bundle) {
            Some(position) => position,
            None => {
                node.bundles.push(StoredBundle {
                    name: bundle.to_string(),
                    primary: None,
                    bitstreams: Vec::new(),
                });
                node.bundles.len() - 1
            }
        };
        let target = &mut node.bundles[position];
        if bitstream.primary {
            target.primary = Some(stored.sequence_id);
        }
        target
            .bitstreams
            .retain(|(existing, _)| existing.sequence_id != stored.sequence_id);
        target.bitstreams.push((stored.clone(), bitstream.content));
        node.object.last_modified = Utc::now();
        Ok(stored)
    }

    async fn set_withdrawn(&self, handle: &str, withdrawn: bool) -> ContentResult<()> {
        let mut state = self.state.write().await;
        let node = node_mut(&mut state.nodes, handle)?;
        node.object.withdrawn = withdrawn;
        node.object.last_modified = Utc::now();
        Ok(())
    }

    async fn link(&self, item: &str, collection: &str) -> ContentResult<()> {
        let mut state = self.state.write().await;
        match state.nodes.get(collection).map(|n| n.object.kind) {
            Some(ObjectType::Collection) => {}
            Some(_) => {
                return Err(ContentError::InvalidOwner {
                    child: item.to_string(),
                    owner: collection.to_string(),
                });
            }
            None => return Err(ContentError::NotFound(collection.to_string())),
        }
        let node = node_mut(&mut state.nodes, item)?;
        if node.object.owner.as_deref() != Some(collection)
            && !node.object.linked.iter().any(|c| c == collection)
        {
            node.object.linked.push(collection.to_string());
            node.object.last_modified = Utc::now();
        }
        Ok(())
    }

    async fn delete(&self, handle: &str) -> ContentResult<()> {
        let mut state = self.state.write().await;
        let owner = state
            .nodes
            .get(handle)
            .ok_or_else(|| ContentError::NotFound(handle.to_string()))?
            .object
            .owner
            .clone();

        let mut pending = vec![handle.to_string()];
        let mut removed = HashSet::new();
        while let Some(current) = pending.pop() {
            if let Some(node) = state.nodes.remove(&current) {
                pending.extend(node.children);
                removed.insert(current);
            }
        }

        if let Some(owner) = owner {
            if let Some(node) = state.nodes.get_mut(&owner) {
                node.children.retain(|child| child != handle);
            }
        }
        for node in state.nodes.values_mut() {
            node.object.linked.retain(|c| !removed.contains(c));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> MemoryRepository {
        let repo = MemoryRepository::new();
        repo.create(ObjectType::Community, "123456789/1", None)
            .await
            .unwrap();
        repo.create(ObjectType::Collection, "123456789/2", Some("123456789/1"))
            .await
            .unwrap();
        repo.create(ObjectType::Item, "123456789/3", Some("123456789/2"))
            .await
            .unwrap();
        repo
    }

    #[tokio::test]
    async fn children_follow_container_kind() {
        let repo = seeded().await;
        let community = repo.find("123456789/1").await.unwrap().unwrap();
        let children = repo.children(&community).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].kind, ObjectType::Collection);

        let item = repo.find("123456789/3").await.unwrap().unwrap();
        assert!(repo.children(&item).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn item_requires_collection_owner() {
        let repo = seeded().await;
        let err = repo
            .create(ObjectType::Item, "123456789/9", Some("123456789/1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ContentError::InvalidOwner { .. }));
    }

    #[tokio::test]
    async fn unknown_schema_is_rejected() {
        let repo = seeded().await;
        let err = repo
            .replace_metadata(
                "123456789/3",
                vec![MetadataValue::new("mods", "title", None, "x")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ContentError::UnknownSchema { .. }));
    }

    #[tokio::test]
    async fn delete_removes_subtree() {
        let repo = seeded().await;
        repo.delete("123456789/2").await.unwrap();
        assert!(repo.find("123456789/3").await.unwrap().is_none());
        let community = repo.find("123456789/1").await.unwrap().unwrap();
        assert!(repo.children(&community).await.unwrap().is_empty());
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn add_bitstream_records_checksum_and_primary() {
        let repo = seeded().await;
        let stored = repo
            .add_bitstream(
                "123456789/3",
                "ORIGINAL",
                NewBitstream {
                    name: "a.txt".into(),
                    source: None,
                    description: None,
                    sequence_id: 1,
                    primary: true,
                    content: Bytes::from_static(b"hello"),
                },
            )
            .await
            .unwrap();
        assert_eq!(stored.checksum, format!("{:x}", md5::compute(b"hello")));
        let bundles = repo.bundles("123456789/3").await.unwrap();
        assert_eq!(bundles[0].primary, Some(1));
    }
}
