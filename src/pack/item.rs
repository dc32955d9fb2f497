//! Item packages: metadata export plus one payload directory per bundle.
//!
//! Each bitstream is stored as `data/<bundle>/<sequence>` with a companion
//! `data/<bundle>/<sequence>-metadata.xml` stanza. Bitstreams matched by a
//! reference filter are listed in `fetch.txt` instead of being copied.

use super::{
    BagBuilder, METADATA_PAYLOAD, PROP_OTHER_IDS, PROP_WITHDRAWN, PackError, PackResult,
    Packer, PackerOptions, SizeMethod, bag::Bag, load_object, metadata_xml,
    payload_text, write_object_properties,
};
use crate::content::{Bitstream, ContentRepository, MetadataValue, NewBitstream};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};

/// Suffix of a bitstream's companion metadata file.
pub const COMPANION_SUFFIX: &str = "-metadata.xml";

const STANZA_SCHEMA: &str = "bitstream";

pub struct ItemPacker {
    repo: Arc<dyn ContentRepository>,
    handle: String,
    options: PackerOptions,
}

impl ItemPacker {
    pub fn new(repo: Arc<dyn ContentRepository>, handle: String, options: PackerOptions) -> Self {
        Self {
            repo,
            handle,
            options,
        }
    }

    async fn apply(&self, bag: &Bag) -> PackResult<()> {
        let export = bag
            .read_payload(METADATA_PAYLOAD)
            .await?
            .ok_or_else(|| PackError::MissingPayload(METADATA_PAYLOAD.to_string()))?;
        let values = metadata_xml::decode(&payload_text(METADATA_PAYLOAD, export)?)?;
        self.repo.replace_metadata(&self.handle, values).await?;

        let withdrawn = bag
            .property(PROP_WITHDRAWN)
            .is_some_and(|flag| flag.eq_ignore_ascii_case("true"));
        self.repo.set_withdrawn(&self.handle, withdrawn).await?;

        if let Some(others) = bag.property(PROP_OTHER_IDS) {
            for collection in others.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                if self.repo.find(collection).await?.is_some() {
                    self.repo.link(&self.handle, collection).await?;
                } else {
                    warn!(item = %self.handle, collection, "linked collection no longer exists");
                }
            }
        }

        self.repo.clear_bundles(&self.handle).await?;
        for bundle in bag.payload_dirs().await? {
            for file in bag.payload_files(&bundle).await? {
                if file.ends_with(COMPANION_SUFFIX) {
                    continue;
                }
                let rel = format!("{bundle}/{file}");
                let content = bag
                    .read_payload(&rel)
                    .await?
                    .ok_or_else(|| PackError::MissingPayload(rel.clone()))?;
                self.restore_bitstream(bag, &bundle, &rel, content).await?;
            }
        }

        for entry in bag.references() {
            let Some((bundle, _)) = entry.path.split_once('/') else {
                return Err(PackError::UnsafeName(entry.path.clone()));
            };
            let content = bag.resolve_reference(entry).await?;
            self.restore_bitstream(bag, bundle, &entry.path, content)
                .await?;
        }
        Ok(())
    }

    async fn restore_bitstream(
        &self,
        bag: &Bag,
        bundle: &str,
        rel: &str,
        content: Vec<u8>,
    ) -> PackResult<()> {
        let companion = format!("{rel}{COMPANION_SUFFIX}");
        let stanza = bag
            .read_payload(&companion)
            .await?
            .ok_or_else(|| PackError::MissingCompanion(rel.to_string()))?;
        let stanza = Stanza::decode(&payload_text(&companion, stanza)?, rel)?;
        debug!(item = %self.handle, bundle, name = %stanza.name, "restoring bitstream");
        self.repo
            .add_bitstream(
                &self.handle,
                bundle,
                NewBitstream {
                    name: stanza.name,
                    source: stanza.source,
                    description: stanza.description,
                    sequence_id: stanza.sequence_id,
                    primary: stanza.primary,
                    content: Bytes::from(content),
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Packer for ItemPacker {
    async fn pack(&self, staging: &Path) -> PackResult<PathBuf> {
        let item = load_object(&self.repo, &self.handle).await?;
        let mut bag = BagBuilder::create(staging).await?;
        write_object_properties(&mut bag, &item);
        if !item.linked.is_empty() {
            bag.property(PROP_OTHER_IDS, &item.linked.join(","));
        }
        if item.withdrawn {
            bag.property(PROP_WITHDRAWN, "true");
        }
        bag.add_payload(METADATA_PAYLOAD, metadata_xml::encode(&item.metadata).as_bytes())
            .await?;

        for bundle in self.repo.bundles(&self.handle).await? {
            if !self.options.accepts_bundle(&bundle.name) {
                debug!(item = %self.handle, bundle = %bundle.name, "bundle filtered out");
                continue;
            }
            for bitstream in &bundle.bitstreams {
                let rel = format!("{}/{}", bundle.name, bitstream.sequence_id);
                let stanza = Stanza::from_bitstream(bitstream, bundle.is_primary(bitstream));
                bag.add_payload(&format!("{rel}{COMPANION_SUFFIX}"), stanza.encode().as_bytes())
                    .await?;

                match self.options.reference_for(&bundle.name, bitstream.size) {
                    Some(reference) => {
                        bag.add_reference(&rel, &reference.url, bitstream.size)?;
                    }
                    None => {
                        let content = self
                            .repo
                            .bitstream_content(&self.handle, &bundle.name, bitstream.sequence_id)
                            .await?;
                        bag.add_payload(&rel, &content).await?;
                    }
                }
            }
        }

        bag.finish(self.options.format).await
    }

    async fn unpack(&mut self, archive: &Path) -> PackResult<()> {
        let bag = Bag::open(archive).await?;
        let applied = self.apply(&bag).await;
        bag.clean().await;
        applied
    }

    async fn size(&self, _method: SizeMethod) -> PackResult<u64> {
        let mut total = 0;
        for bundle in self.repo.bundles(&self.handle).await? {
            if !self.options.accepts_bundle(&bundle.name) {
                continue;
            }
            total += bundle
                .bitstreams
                .iter()
                .filter(|b| self.options.reference_for(&bundle.name, b.size).is_none())
                .map(|b| b.size)
                .sum::<u64>();
        }
        Ok(total)
    }
}

/// Per-bitstream descriptive stanza, stored in the metadata export dialect
/// under the `bitstream` schema.
struct Stanza {
    name: String,
    source: Option<String>,
    description: Option<String>,
    sequence_id: u32,
    primary: bool,
}

impl Stanza {
    fn from_bitstream(bitstream: &Bitstream, primary: bool) -> Self {
        Self {
            name: bitstream.name.clone(),
            source: bitstream.source.clone(),
            description: bitstream.description.clone(),
            sequence_id: bitstream.sequence_id,
            primary,
        }
    }

    fn encode(&self) -> String {
        let field = |element: &str, value: &str| MetadataValue::new(STANZA_SCHEMA, element, None, value);
        let mut values = vec![field("name", &self.name)];
        if let Some(source) = &self.source {
            values.push(field("source", source));
        }
        if let Some(description) = &self.description {
            values.push(field("description", description));
        }
        values.push(field("sequence", &self.sequence_id.to_string()));
        if self.primary {
            values.push(field("primary", "true"));
        }
        metadata_xml::encode(&values)
    }

    fn decode(text: &str, rel: &str) -> PackResult<Self> {
        let mut name = None;
        let mut source = None;
        let mut description = None;
        let mut sequence_id = None;
        let mut primary = false;
        for value in metadata_xml::decode(text)? {
            match value.element.as_str() {
                "name" => name = Some(value.value),
                "source" => source = Some(value.value),
                "description" => description = Some(value.value),
                "sequence" => {
                    sequence_id = Some(value.value.trim().parse::<u32>().map_err(|_| {
                        PackError::MalformedMetadata {
                            line: 0,
                            reason: format!("bad sequence id for `{rel}`"),
                        }
                    })?)
                }
                "primary" => primary = value.value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }
        let missing = |what: &str| PackError::MalformedMetadata {
            line: 0,
            reason: format!("stanza for `{rel}` has no {what}"),
        };
        Ok(Self {
            name: name.ok_or_else(|| missing("name"))?,
            source,
            description,
            sequence_id: sequence_id.ok_or_else(|| missing("sequence id"))?,
            primary,
        })
    }
}
