//! Deletion catalogs: a receipt of a deleted object's owner and members.

use super::{
    ArchiveFormat, BAG_TYPE_CATALOG, BagBuilder, PROP_BAG_TYPE, PROP_CREATED, PROP_OBJECT_ID,
    PROP_OBJECT_TYPE, PROP_OWNER_ID, PackError, PackResult, Packer, SizeMethod, bag::Bag,
    payload_text,
};
use crate::content::ObjectType;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};

/// Payload holding the member ids, one per line.
pub const MEMBERS_PAYLOAD: &str = "members.txt";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogPacker {
    pub object_id: String,
    pub object_type: Option<ObjectType>,
    pub owner_id: Option<String>,
    /// Former descendants, owners listed before the objects they own.
    pub members: Vec<String>,
    pub format: ArchiveFormat,
}

impl CatalogPacker {
    pub fn new(object_id: &str, format: ArchiveFormat) -> Self {
        Self {
            object_id: object_id.to_string(),
            format,
            ..Self::default()
        }
    }

    fn members_text(&self) -> String {
        self.members
            .iter()
            .map(|member| format!("{member}\n"))
            .collect()
    }
}

#[async_trait]
impl Packer for CatalogPacker {
    async fn pack(&self, staging: &Path) -> PackResult<PathBuf> {
        let mut bag = BagBuilder::create(staging).await?;
        bag.property(PROP_BAG_TYPE, BAG_TYPE_CATALOG);
        if let Some(kind) = self.object_type {
            bag.property(PROP_OBJECT_TYPE, kind.type_text());
        }
        bag.property(PROP_OBJECT_ID, &self.object_id);
        if let Some(owner) = &self.owner_id {
            bag.property(PROP_OWNER_ID, owner);
        }
        bag.property(
            PROP_CREATED,
            &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        bag.add_payload(MEMBERS_PAYLOAD, self.members_text().as_bytes())
            .await?;
        bag.finish(self.format).await
    }

    async fn unpack(&mut self, archive: &Path) -> PackResult<()> {
        let bag = Bag::open(archive).await?;
        let parsed = read_catalog(&bag).await;
        bag.clean().await;
        let (object_id, object_type, owner_id, members) = parsed?;

        self.object_id = object_id;
        self.object_type = object_type;
        self.owner_id = owner_id;
        self.members = members;
        self.format = ArchiveFormat::from_path(archive)?;
        Ok(())
    }

    async fn size(&self, _method: SizeMethod) -> PackResult<u64> {
        Ok(self.members_text().len() as u64)
    }
}

type CatalogParts = (String, Option<ObjectType>, Option<String>, Vec<String>);

async fn read_catalog(bag: &Bag) -> PackResult<CatalogParts> {
    if bag.property(PROP_BAG_TYPE) != Some(BAG_TYPE_CATALOG) {
        return Err(PackError::MissingProperty(PROP_BAG_TYPE));
    }
    let object_id = bag
        .property(PROP_OBJECT_ID)
        .ok_or(PackError::MissingProperty(PROP_OBJECT_ID))?
        .to_string();
    let object_type = match bag.property(PROP_OBJECT_TYPE) {
        Some(text) => Some(
            ObjectType::from_type_text(text)
                .ok_or_else(|| PackError::UnknownObjectType(text.to_string()))?,
        ),
        None => None,
    };
    let owner_id = bag.property(PROP_OWNER_ID).map(str::to_string);
    let members = bag
        .read_payload(MEMBERS_PAYLOAD)
        .await?
        .ok_or_else(|| PackError::MissingPayload(MEMBERS_PAYLOAD.to_string()))?;
    let members = payload_text(MEMBERS_PAYLOAD, members)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    Ok((object_id, object_type, owner_id, members))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn catalog_round_trips_owner_and_members() {
        let tmp = TempDir::new().unwrap();
        let mut catalog = CatalogPacker::new("123456789/7", ArchiveFormat::Zip);
        catalog.object_type = Some(ObjectType::Collection);
        catalog.owner_id = Some("123456789/1".to_string());
        catalog.members = vec!["123456789/8".to_string(), "123456789/9".to_string()];

        let archive = catalog.pack(&tmp.path().join("123456789-7")).await.unwrap();
        assert_eq!(archive.extension().unwrap(), "zip");

        let mut restored = CatalogPacker::default();
        restored.unpack(&archive).await.unwrap();
        assert_eq!(restored, catalog);
        assert!(!tmp.path().join("123456789-7").exists());
    }

    #[tokio::test]
    async fn live_object_bag_is_not_a_catalog() {
        let tmp = TempDir::new().unwrap();
        let mut bag = BagBuilder::create(&tmp.path().join("x")).await.unwrap();
        bag.property(PROP_BAG_TYPE, super::super::BAG_TYPE_AIP);
        bag.property(PROP_OBJECT_ID, "1/2");
        let archive = bag.finish(ArchiveFormat::Tgz).await.unwrap();

        let mut catalog = CatalogPacker::default();
        let err = catalog.unpack(&archive).await.unwrap_err();
        assert!(matches!(err, PackError::MissingProperty(PROP_BAG_TYPE)));
    }
}
