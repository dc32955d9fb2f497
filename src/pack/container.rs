//! Collection and community packages: metadata export plus optional logo.
//! Children are never embedded; each gets its own package.

use super::{
    BagBuilder, LOGO_PAYLOAD, METADATA_PAYLOAD, PackError, PackResult, Packer, PackerOptions,
    SizeMethod, bag::Bag, load_object, metadata_xml, packer_for, payload_text,
    write_object_properties,
};
use crate::content::ContentRepository;
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::debug;

/// State shared by both container packers.
struct Container {
    repo: Arc<dyn ContentRepository>,
    handle: String,
    options: PackerOptions,
}

impl Container {
    async fn pack(&self, staging: &Path) -> PackResult<PathBuf> {
        let object = load_object(&self.repo, &self.handle).await?;
        let mut bag = BagBuilder::create(staging).await?;
        write_object_properties(&mut bag, &object);
        bag.add_payload(METADATA_PAYLOAD, metadata_xml::encode(&object.metadata).as_bytes())
            .await?;
        if let Some(logo) = self.repo.logo(&self.handle).await? {
            bag.add_payload(LOGO_PAYLOAD, &logo).await?;
        }
        bag.finish(self.options.format).await
    }

    async fn unpack(&self, archive: &Path) -> PackResult<()> {
        let bag = Bag::open(archive).await?;
        let applied = self.apply(&bag).await;
        bag.clean().await;
        applied
    }

    async fn apply(&self, bag: &Bag) -> PackResult<()> {
        let export = bag
            .read_payload(METADATA_PAYLOAD)
            .await?
            .ok_or_else(|| PackError::MissingPayload(METADATA_PAYLOAD.to_string()))?;
        let values = metadata_xml::decode(&payload_text(METADATA_PAYLOAD, export)?)?;
        self.repo.replace_metadata(&self.handle, values).await?;

        let logo = bag.read_payload(LOGO_PAYLOAD).await?.map(Bytes::from);
        debug!(handle = %self.handle, has_logo = logo.is_some(), "restoring container");
        self.repo.set_logo(&self.handle, logo).await?;
        Ok(())
    }

    async fn size(&self, method: SizeMethod) -> PackResult<u64> {
        let object = load_object(&self.repo, &self.handle).await?;
        let mut total = self
            .repo
            .logo(&self.handle)
            .await?
            .map_or(0, |logo| logo.len() as u64);
        if method == SizeMethod::Recurse {
            for child in self.repo.children(&object).await? {
                let packer = packer_for(self.repo.clone(), &child, self.options.clone());
                total += packer.size(method).await?;
            }
        }
        Ok(total)
    }
}

macro_rules! container_packer {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name {
            inner: Container,
        }

        impl $name {
            pub fn new(
                repo: Arc<dyn ContentRepository>,
                handle: String,
                options: PackerOptions,
            ) -> Self {
                Self {
                    inner: Container {
                        repo,
                        handle,
                        options,
                    },
                }
            }
        }

        #[async_trait]
        impl Packer for $name {
            async fn pack(&self, staging: &Path) -> PackResult<PathBuf> {
                self.inner.pack(staging).await
            }

            async fn unpack(&mut self, archive: &Path) -> PackResult<()> {
                self.inner.unpack(archive).await
            }

            async fn size(&self, method: SizeMethod) -> PackResult<u64> {
                self.inner.size(method).await
            }
        }
    };
}

container_packer!(
    /// Packs a collection's metadata and logo.
    CollectionPacker
);
container_packer!(
    /// Packs a community's metadata and logo.
    CommunityPacker
);
