//! Checkm 0.7 checksum manifests.
//!
//! ```text
//! #%checkm_0.7
//! #%fields name|alg|checksum|length|modified|unused
//! 123456789/42/1|MD5|9e107d9d372bb6826bd81d3542a419d6|100|2024-01-01T00:00:00.000Z|
//! ```
//!
//! Item manifests list `handle/sequence` entries. Container manifests list
//! the storage ids of their members' manifests, which always contain a dash.
//! A manifest with no entries ends in `#%eof`.

use super::{CurationTask, discard, load, settle, subtree};
use crate::content::{ContentError, ContentObject};
use crate::errors::{ReplicaError, ReplicaResult};
use crate::models::task::TaskOutcome;
use crate::services::ReplicaManager;
use async_trait::async_trait;
use chrono::SecondsFormat;
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

pub const CHECKM_HEADER: &str = "#%checkm_0.7";
pub const MANIFEST_EXT: &str = "txt";
const FIELDS_DIRECTIVE: &str = "#%fields";
const EOF_MARKER: &str = "#%eof";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub alg: String,
    pub checksum: String,
    pub length: Option<u64>,
    pub modified: String,
}

impl ManifestEntry {
    /// Entries naming another manifest rather than a bitstream.
    pub fn is_child_manifest(&self) -> bool {
        self.name.contains('-')
    }

    fn field(&self, field: &str) -> String {
        match field {
            "name" => self.name.clone(),
            "alg" => self.alg.clone(),
            "checksum" => self.checksum.clone(),
            "length" => self.length.map(|l| l.to_string()).unwrap_or_default(),
            "modified" => self.modified.clone(),
            _ => String::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub fields: Vec<String>,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(template: &str) -> Self {
        Self {
            fields: parse_template(template),
            entries: Vec::new(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("{CHECKM_HEADER}\n{FIELDS_DIRECTIVE} {}\n", self.fields.join("|"));
        for entry in &self.entries {
            let line = self
                .fields
                .iter()
                .map(|field| entry.field(field))
                .collect::<Vec<_>>()
                .join("|");
            out.push_str(&line);
            out.push('\n');
        }
        if self.entries.is_empty() {
            out.push_str(EOF_MARKER);
            out.push('\n');
        }
        out
    }

    /// Parse manifest text. A `#%fields` directive overrides `template`.
    pub fn parse(name: &str, text: &str, template: &str) -> ReplicaResult<Self> {
        let mut manifest = Self::new(template);
        let malformed = |line: usize, reason: String| ReplicaError::MalformedManifest {
            manifest: name.to_string(),
            line,
            reason,
        };

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if let Some(fields) = line.strip_prefix(FIELDS_DIRECTIVE) {
                manifest.fields = parse_template(fields);
                continue;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut entry = ManifestEntry::default();
            for (field, value) in manifest.fields.iter().zip(line.split('|')) {
                let value = value.trim();
                match field.as_str() {
                    "name" => entry.name = value.to_string(),
                    "alg" => entry.alg = value.to_string(),
                    "checksum" => entry.checksum = value.to_string(),
                    "length" if !value.is_empty() => {
                        entry.length = Some(value.parse().map_err(|_| {
                            malformed(index + 1, format!("bad length `{value}`"))
                        })?)
                    }
                    "modified" => entry.modified = value.to_string(),
                    _ => {}
                }
            }
            if entry.name.is_empty() {
                return Err(malformed(index + 1, "entry has no name".to_string()));
            }
            manifest.entries.push(entry);
        }
        Ok(manifest)
    }
}

fn parse_template(template: &str) -> Vec<String> {
    template
        .split('|')
        .map(|field| field.trim().to_ascii_lowercase())
        .filter(|field| !field.is_empty())
        .collect()
}

/// Storage id of an object's manifest.
async fn manifest_id(manager: &ReplicaManager, handle: &str) -> ReplicaResult<String> {
    manager.storage_id(handle, Some(MANIFEST_EXT)).await
}

/// Describe a live object: member manifests for containers, accepted
/// bitstreams for items.
pub async fn build_manifest(
    manager: &ReplicaManager,
    object: &ContentObject,
) -> ReplicaResult<Manifest> {
    let repo = manager.repository();
    let mut manifest = Manifest::new(&manager.config().manifest_template);
    if object.kind.is_container() {
        for child in repo.children(object).await? {
            manifest.entries.push(ManifestEntry {
                name: manifest_id(manager, &child.handle).await?,
                ..ManifestEntry::default()
            });
        }
        return Ok(manifest);
    }

    let options = manager.packer_options();
    let modified = object
        .last_modified
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    for bundle in repo.bundles(&object.handle).await? {
        if !options.accepts_bundle(&bundle.name) {
            continue;
        }
        for bitstream in bundle.bitstreams {
            manifest.entries.push(ManifestEntry {
                name: format!("{}/{}", object.handle, bitstream.sequence_id),
                alg: bitstream.checksum_algorithm,
                checksum: bitstream.checksum,
                length: Some(bitstream.size),
                modified: modified.clone(),
            });
        }
    }
    Ok(manifest)
}

/// Write and upload the manifests of an object and everything below it.
pub struct TransmitManifest {
    manager: Arc<ReplicaManager>,
}

impl TransmitManifest {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        Self { manager }
    }

    async fn run(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let manager = &self.manager;
        let group = manager.manifest_group();
        let root = load(manager, handle).await?;
        let mut sent = 0;
        for object in subtree(manager, root).await? {
            let manifest = build_manifest(manager, &object).await?;
            let id = manifest_id(manager, &object.handle).await?;
            let path = manager.stage(group, &id).await?;
            fs::write(&path, manifest.render()).await?;
            let transferred = manager.transfer_object(group, &path).await;
            discard(&path).await;
            transferred?;
            sent += 1;
        }
        Ok(TaskOutcome::success(format!(
            "{sent} manifests transmitted for {handle}"
        )))
    }
}

#[async_trait]
impl CurationTask for TransmitManifest {
    fn name(&self) -> &'static str {
        "transmitmanifest"
    }

    async fn perform(&self, handle: &str) -> TaskOutcome {
        settle(self.name(), handle, self.run(handle).await)
    }
}

/// Copy an object's manifest into the staging area.
pub struct FetchManifest {
    manager: Arc<ReplicaManager>,
}

impl FetchManifest {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        Self { manager }
    }

    async fn run(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let manager = &self.manager;
        let group = manager.manifest_group();
        let id = manifest_id(manager, handle).await?;
        let dest = manager.stage(group, &id).await?;
        let size = manager.fetch_object(group, &id, &dest).await?;
        if size == 0 {
            return Ok(TaskOutcome::fail(format!("no manifest stored for {handle}")));
        }
        Ok(TaskOutcome::success(format!(
            "manifest for {handle} fetched to {}",
            dest.display()
        )))
    }
}

#[async_trait]
impl CurationTask for FetchManifest {
    fn name(&self) -> &'static str {
        "fetchmanifest"
    }

    async fn perform(&self, handle: &str) -> TaskOutcome {
        settle(self.name(), handle, self.run(handle).await)
    }
}

/// Check that an object's manifest is stored.
pub struct VerifyManifest {
    manager: Arc<ReplicaManager>,
}

impl VerifyManifest {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        Self { manager }
    }

    async fn run(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let manager = &self.manager;
        let id = manifest_id(manager, handle).await?;
        if manager.object_exists(manager.manifest_group(), &id).await? {
            Ok(TaskOutcome::success(format!("manifest {id} found")))
        } else {
            Ok(TaskOutcome::fail(format!("manifest {id} not found")))
        }
    }
}

#[async_trait]
impl CurationTask for VerifyManifest {
    fn name(&self) -> &'static str {
        "verifymanifest"
    }

    async fn perform(&self, handle: &str) -> TaskOutcome {
        settle(self.name(), handle, self.run(handle).await)
    }
}

/// Remove the manifests of an object and everything below it.
pub struct RemoveManifest {
    manager: Arc<ReplicaManager>,
}

impl RemoveManifest {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        Self { manager }
    }

    async fn run(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let manager = &self.manager;
        let root = load(manager, handle).await?;
        let mut removed = 0;
        for object in subtree(manager, root).await? {
            let id = manifest_id(manager, &object.handle).await?;
            if manager.remove_object(manager.manifest_group(), &id).await? > 0 {
                removed += 1;
            }
        }
        Ok(TaskOutcome::success(format!(
            "{removed} manifests removed for {handle}"
        )))
    }
}

#[async_trait]
impl CurationTask for RemoveManifest {
    fn name(&self) -> &'static str {
        "removemanifest"
    }

    async fn perform(&self, handle: &str) -> TaskOutcome {
        settle(self.name(), handle, self.run(handle).await)
    }
}

/// Result of a manifest audit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManifestAudit {
    /// Bitstream entries compared before the walk ended.
    pub checked: usize,
    /// First problem found; the walk stops there.
    pub failure: Option<String>,
}

/// Compare stored manifests with the live repository, stopping at the
/// first missing manifest or differing checksum.
pub struct CompareWithManifest {
    manager: Arc<ReplicaManager>,
}

impl CompareWithManifest {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        Self { manager }
    }

    pub async fn audit(&self, handle: &str) -> ReplicaResult<ManifestAudit> {
        let manager = &self.manager;
        let group = manager.manifest_group();
        let mut audit = ManifestAudit::default();
        let mut pending = vec![manifest_id(manager, handle).await?];

        while let Some(name) = pending.pop() {
            let path = manager.stage(group, &name).await?;
            if manager.fetch_object(group, &name, &path).await? == 0 {
                audit.failure = Some(format!("manifest {name} missing"));
                return Ok(audit);
            }
            let text = fs::read_to_string(&path).await;
            discard(&path).await;
            let manifest = Manifest::parse(&name, &text?, &manager.config().manifest_template)?;

            let mut children = Vec::new();
            for entry in manifest.entries {
                if entry.is_child_manifest() {
                    children.push(entry.name);
                    continue;
                }
                audit.checked += 1;
                if let Some(problem) = self.check_entry(&name, &entry).await? {
                    audit.failure = Some(problem);
                    return Ok(audit);
                }
            }
            children.reverse();
            pending.extend(children);
        }
        Ok(audit)
    }

    /// `Some(description)` when the entry no longer matches.
    async fn check_entry(
        &self,
        manifest: &str,
        entry: &ManifestEntry,
    ) -> ReplicaResult<Option<String>> {
        let Some((item, sequence)) = entry.name.rsplit_once('/') else {
            return Err(ReplicaError::MalformedManifest {
                manifest: manifest.to_string(),
                line: 0,
                reason: format!("entry `{}` is not handle/sequence", entry.name),
            });
        };
        let sequence: u32 = sequence
            .parse()
            .map_err(|_| ReplicaError::MalformedManifest {
                manifest: manifest.to_string(),
                line: 0,
                reason: format!("entry `{}` has a bad sequence id", entry.name),
            })?;

        let bundles = match self.manager.repository().bundles(item).await {
            Ok(bundles) => bundles,
            Err(ContentError::NotFound(_)) => {
                return Ok(Some(format!("{}: item {item} no longer exists", entry.name)));
            }
            Err(err) => return Err(err.into()),
        };
        let current = bundles
            .iter()
            .flat_map(|bundle| bundle.bitstreams.iter())
            .find(|bitstream| bitstream.sequence_id == sequence);
        let Some(current) = current else {
            return Ok(Some(format!("{}: bitstream no longer exists", entry.name)));
        };

        debug!(entry = %entry.name, "comparing manifest checksum");
        if current.checksum.eq_ignore_ascii_case(&entry.checksum) {
            Ok(None)
        } else {
            Ok(Some(format!(
                "checksum mismatch for {}: manifest {}, current {}",
                entry.name, entry.checksum, current.checksum
            )))
        }
    }

    async fn run(&self, handle: &str) -> ReplicaResult<TaskOutcome> {
        let audit = self.audit(handle).await?;
        Ok(match audit.failure {
            Some(problem) => TaskOutcome::fail(problem),
            None => TaskOutcome::success(format!(
                "{} bitstreams match the manifests for {handle}",
                audit.checked
            )),
        })
    }
}

#[async_trait]
impl CurationTask for CompareWithManifest {
    fn name(&self) -> &'static str {
        "checkmanifest"
    }

    async fn perform(&self, handle: &str) -> TaskOutcome {
        settle(self.name(), handle, self.run(handle).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MANIFEST_TEMPLATE;

    #[test]
    fn empty_manifest_ends_with_eof() {
        let text = Manifest::new(DEFAULT_MANIFEST_TEMPLATE).render();
        assert_eq!(
            text,
            "#%checkm_0.7\n#%fields name|alg|checksum|length|modified|unused\n#%eof\n"
        );
    }

    #[test]
    fn entries_follow_the_field_directive() {
        let text = "#%checkm_0.7\n\
                    #%fields checksum|name|length\n\
                    abc123|123456789/42/1|100\n\
                    |ITEM@123456789-43.txt|\n";
        let manifest = Manifest::parse("m", text, DEFAULT_MANIFEST_TEMPLATE).unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.entries[0].checksum, "abc123");
        assert_eq!(manifest.entries[0].length, Some(100));
        assert!(!manifest.entries[0].is_child_manifest());
        assert!(manifest.entries[1].is_child_manifest());
    }

    #[test]
    fn malformed_lines_are_errors() {
        let err = Manifest::parse("m", "x|MD5|abc|many|\n", DEFAULT_MANIFEST_TEMPLATE).unwrap_err();
        assert!(matches!(err, ReplicaError::MalformedManifest { line: 1, .. }));
        assert!(Manifest::parse("m", "|MD5|abc|1|\n", DEFAULT_MANIFEST_TEMPLATE).is_err());
    }

    #[test]
    fn render_then_parse_keeps_entries() {
        let mut manifest = Manifest::new(DEFAULT_MANIFEST_TEMPLATE);
        manifest.entries.push(ManifestEntry {
            name: "1/2/1".into(),
            alg: "MD5".into(),
            checksum: "def456".into(),
            length: Some(7),
            modified: "2024-01-01T00:00:00.000Z".into(),
        });
        let parsed =
            Manifest::parse("m", &manifest.render(), DEFAULT_MANIFEST_TEMPLATE).unwrap();
        assert_eq!(parsed, manifest);
    }
}
