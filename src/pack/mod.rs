//! Archival packages.
//!
//! A packer serializes one content object (or a deletion catalog) into a
//! bag on disk, archives it into a single file, and reverses the process on
//! restore. Content and reference filters are fixed per packer instance.

pub mod bag;
pub mod catalog;
pub mod container;
pub mod item;
pub mod metadata_xml;

use crate::content::{ContentError, ContentObject, ContentRepository, ObjectType};
use async_trait::async_trait;
use chrono::SecondsFormat;
use std::{
    collections::HashSet,
    fmt, io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use thiserror::Error;

pub use bag::{Bag, BagBuilder};
pub use catalog::CatalogPacker;
pub use container::{CollectionPacker, CommunityPacker};
pub use item::ItemPacker;

/// Bag type for live-object packages.
pub const BAG_TYPE_AIP: &str = "AIP";
/// Bag type for deletion catalogs.
pub const BAG_TYPE_CATALOG: &str = "MAN";

pub const PROP_BAG_TYPE: &str = "Bag-Type";
pub const PROP_OBJECT_TYPE: &str = "Object-Type";
pub const PROP_OBJECT_ID: &str = "Object-Id";
pub const PROP_OWNER_ID: &str = "Owner-Id";
pub const PROP_OTHER_IDS: &str = "Other-Ids";
pub const PROP_CREATED: &str = "Created";
pub const PROP_WITHDRAWN: &str = "Withdrawn";

/// Payload holding the object's metadata export.
pub const METADATA_PAYLOAD: &str = "metadata.xml";
/// Payload holding a container's logo.
pub const LOGO_PAYLOAD: &str = "logo";

#[derive(Debug, Error)]
pub enum PackError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error("archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("unsupported archive format `{0}`")]
    UnsupportedFormat(String),
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("unknown object type `{0}`")]
    UnknownObjectType(String),
    #[error("bag is missing required property `{0}`")]
    MissingProperty(&'static str),
    #[error("bag is missing payload `{0}`")]
    MissingPayload(String),
    #[error("bitstream `{0}` has no companion metadata file")]
    MissingCompanion(String),
    #[error("malformed metadata at line {line}: {reason}")]
    MalformedMetadata { line: usize, reason: String },
    #[error("checksum mismatch for `{path}`: manifest {expected}, computed {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("cannot resolve by-reference payload `{url}`: {reason}")]
    UnresolvedReference { url: String, reason: String },
    #[error("unsafe name `{0}` in package")]
    UnsafeName(String),
    #[error("invalid filter `{0}`")]
    InvalidFilter(String),
}

pub type PackResult<T> = Result<T, PackError>;

/// Archive container written by [`BagBuilder::finish`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ArchiveFormat {
    #[default]
    Zip,
    Tgz,
}

impl ArchiveFormat {
    pub const fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tgz => "tgz",
        }
    }

    /// Format implied by a file's extension.
    pub fn from_path(path: &Path) -> PackResult<Self> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        ext.parse()
    }
}

impl FromStr for ArchiveFormat {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zip" => Ok(ArchiveFormat::Zip),
            "tgz" | "tar.gz" => Ok(ArchiveFormat::Tgz),
            other => Err(PackError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Bundle allow/deny list. `+A,B` keeps only A and B; `-A,B` or `A,B`
/// drops them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentFilter {
    include_only: bool,
    bundles: HashSet<String>,
}

impl ContentFilter {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let (include_only, rest) = match text.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('-').unwrap_or(text)),
        };
        let bundles = rest
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            include_only,
            bundles,
        }
    }

    pub fn accepts(&self, bundle: &str) -> bool {
        self.bundles.contains(bundle) == self.include_only
    }
}

/// `bundle size url`: a bitstream in `bundle` of exactly `size` bytes is
/// packed as a pointer to `url` instead of its bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceFilter {
    pub bundle: String,
    pub size: u64,
    pub url: String,
}

impl ReferenceFilter {
    pub fn matches(&self, bundle: &str, size: u64) -> bool {
        self.bundle == bundle && self.size == size
    }
}

impl FromStr for ReferenceFilter {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let (Some(bundle), Some(size), Some(url), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(PackError::InvalidFilter(s.to_string()));
        };
        let size = size
            .parse::<u64>()
            .map_err(|_| PackError::InvalidFilter(s.to_string()))?;
        Ok(Self {
            bundle: bundle.to_string(),
            size,
            url: url.to_string(),
        })
    }
}

/// Per-packer configuration applied before `pack`.
#[derive(Clone, Debug, Default)]
pub struct PackerOptions {
    pub format: ArchiveFormat,
    pub content_filter: Option<ContentFilter>,
    pub reference_filters: Vec<ReferenceFilter>,
}

impl PackerOptions {
    pub fn accepts_bundle(&self, bundle: &str) -> bool {
        self.content_filter
            .as_ref()
            .is_none_or(|filter| filter.accepts(bundle))
    }

    pub fn reference_for(&self, bundle: &str, size: u64) -> Option<&ReferenceFilter> {
        self.reference_filters
            .iter()
            .find(|filter| filter.matches(bundle, size))
    }
}

/// How [`Packer::size`] treats containers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeMethod {
    Recurse,
    NoRecurse,
}

impl SizeMethod {
    /// `"norecurse"` disables recursion; anything else recurses.
    pub fn parse(method: &str) -> Self {
        if method.eq_ignore_ascii_case("norecurse") {
            SizeMethod::NoRecurse
        } else {
            SizeMethod::Recurse
        }
    }
}

#[async_trait]
pub trait Packer: Send + Sync {
    /// Build the package in `staging` and return the archive file, named
    /// `staging` plus the format extension.
    async fn pack(&self, staging: &Path) -> PackResult<PathBuf>;

    /// Apply a previously built archive.
    async fn unpack(&mut self, archive: &Path) -> PackResult<()>;

    /// Estimate the payload bytes `pack` would include, without packing.
    async fn size(&self, method: SizeMethod) -> PackResult<u64>;
}

/// Packer matching the object's type.
pub fn packer_for(
    repo: Arc<dyn ContentRepository>,
    object: &ContentObject,
    options: PackerOptions,
) -> Box<dyn Packer> {
    let handle = object.handle.clone();
    match object.kind {
        ObjectType::Item => Box::new(ItemPacker::new(repo, handle, options)),
        ObjectType::Collection => Box::new(CollectionPacker::new(repo, handle, options)),
        ObjectType::Community => Box::new(CommunityPacker::new(repo, handle, options)),
    }
}

/// Object-level properties shared by every live-object package.
pub(crate) fn write_object_properties(bag: &mut BagBuilder, object: &ContentObject) {
    bag.property(PROP_BAG_TYPE, BAG_TYPE_AIP);
    bag.property(PROP_OBJECT_TYPE, object.kind.type_text());
    bag.property(PROP_OBJECT_ID, &object.handle);
    if let Some(owner) = &object.owner {
        bag.property(PROP_OWNER_ID, owner);
    }
    bag.property(
        PROP_CREATED,
        &object
            .last_modified
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    );
}

/// Decode a text payload. Invalid UTF-8 is reported at the line where it
/// starts.
pub(crate) fn payload_text(name: &str, bytes: Vec<u8>) -> PackResult<String> {
    String::from_utf8(bytes).map_err(|err| {
        let valid = &err.as_bytes()[..err.utf8_error().valid_up_to()];
        PackError::MalformedMetadata {
            line: valid.iter().filter(|b| **b == b'\n').count() + 1,
            reason: format!("`{name}` is not valid UTF-8"),
        }
    })
}

/// Load the object a packer is bound to.
pub(crate) async fn load_object(
    repo: &Arc<dyn ContentRepository>,
    handle: &str,
) -> PackResult<ContentObject> {
    repo.find(handle)
        .await?
        .ok_or_else(|| PackError::ObjectNotFound(handle.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_utf8_payload_is_malformed() {
        assert_eq!(payload_text("members.txt", b"1/2\n".to_vec()).unwrap(), "1/2\n");
        let err = payload_text("members.txt", b"1/2\n1/\xff3\n".to_vec()).unwrap_err();
        match err {
            PackError::MalformedMetadata { line, reason } => {
                assert_eq!(line, 2);
                assert!(reason.contains("members.txt"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn exclude_filter_drops_named_bundles() {
        let filter = ContentFilter::parse("-LICENSE");
        assert!(!filter.accepts("LICENSE"));
        assert!(filter.accepts("ORIGINAL"));

        let bare = ContentFilter::parse("LICENSE, TEXT");
        assert!(!bare.accepts("TEXT"));
        assert!(bare.accepts("ORIGINAL"));
    }

    #[test]
    fn include_filter_keeps_only_named_bundles() {
        let filter = ContentFilter::parse("+ORIGINAL");
        assert!(filter.accepts("ORIGINAL"));
        assert!(!filter.accepts("LICENSE"));
        assert!(!filter.accepts("THUMBNAIL"));
    }

    #[test]
    fn reference_filter_parses_triples() {
        let filter: ReferenceFilter = "ORIGINAL 1048576 https://mirror.example.org/big.iso"
            .parse()
            .unwrap();
        assert!(filter.matches("ORIGINAL", 1_048_576));
        assert!(!filter.matches("ORIGINAL", 1_048_575));
        assert!("ORIGINAL notanumber url".parse::<ReferenceFilter>().is_err());
        assert!("ORIGINAL 10".parse::<ReferenceFilter>().is_err());
    }

    #[test]
    fn archive_format_from_extension() {
        assert_eq!(
            ArchiveFormat::from_path(Path::new("/tmp/ITEM@1-2.zip")).unwrap(),
            ArchiveFormat::Zip
        );
        assert_eq!(
            ArchiveFormat::from_path(Path::new("/tmp/ITEM@1-2.tgz")).unwrap(),
            ArchiveFormat::Tgz
        );
        assert!(ArchiveFormat::from_path(Path::new("/tmp/x.rar")).is_err());
        assert_eq!(SizeMethod::parse("NoRecurse"), SizeMethod::NoRecurse);
        assert_eq!(SizeMethod::parse("recurse"), SizeMethod::Recurse);
    }
}
