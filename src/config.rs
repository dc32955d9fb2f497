use crate::pack::{ArchiveFormat, ContentFilter, PackerOptions, ReferenceFilter};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf};

const ENV_PREFIX: &str = "AIP_REPLICA_";

/// Default Checkm field template.
pub const DEFAULT_MANIFEST_TEMPLATE: &str = "name|alg|checksum|length|modified|unused";

/// Settings for the replica manager and everything it drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaConfig {
    pub storage_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub database_url: String,
    /// Object store backend; only `local` is built in.
    pub backend: Option<String>,
    pub store_group: String,
    pub delete_group: String,
    pub manifest_group: String,
    /// Prepend `TYPE@` to storage ids.
    pub type_prefix: bool,
    pub format: ArchiveFormat,
    pub content_filter: Option<String>,
    pub reference_filters: Vec<String>,
    pub manifest_template: String,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./data/replicas"),
            staging_dir: PathBuf::from("./data/staging"),
            database_url: "sqlite://./data/meta/aip_replica.db".into(),
            backend: Some("local".into()),
            store_group: "store".into(),
            delete_group: "delete".into(),
            manifest_group: "manifest".into(),
            type_prefix: true,
            format: ArchiveFormat::Zip,
            content_filter: None,
            reference_filters: Vec::new(),
            manifest_template: DEFAULT_MANIFEST_TEMPLATE.into(),
        }
    }
}

impl ReplicaConfig {
    /// Read `AIP_REPLICA_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name: &str| env::var(name).ok())
    }

    /// Build from an arbitrary variable source; `lookup` receives full
    /// variable names such as `AIP_REPLICA_FORMAT`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));
        let mut cfg = Self::default();

        if let Some(dir) = var("STORAGE_DIR") {
            cfg.storage_dir = dir.into();
        }
        if let Some(dir) = var("STAGING_DIR") {
            cfg.staging_dir = dir.into();
        }
        if let Some(url) = var("DATABASE_URL") {
            cfg.database_url = url;
        }
        if let Some(backend) = var("BACKEND") {
            // an empty value means "no backend"
            cfg.backend = Some(backend.trim().to_string()).filter(|b| !b.is_empty());
        }
        if let Some(group) = var("STORE_GROUP") {
            cfg.store_group = group;
        }
        if let Some(group) = var("DELETE_GROUP") {
            cfg.delete_group = group;
        }
        if let Some(group) = var("MANIFEST_GROUP") {
            cfg.manifest_group = group;
        }
        if let Some(value) = var("TYPE_PREFIX") {
            cfg.type_prefix = parse_bool(&value)
                .with_context(|| format!("parsing {ENV_PREFIX}TYPE_PREFIX value `{value}`"))?;
        }
        if let Some(value) = var("FORMAT") {
            cfg.format = value
                .parse()
                .with_context(|| format!("parsing {ENV_PREFIX}FORMAT value `{value}`"))?;
        }
        if let Some(filter) = var("CONTENT_FILTER") {
            cfg.content_filter = Some(filter).filter(|f| !f.trim().is_empty());
        }
        if let Some(filters) = var("REFERENCE_FILTERS") {
            cfg.reference_filters = filters
                .split(';')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(template) = var("MANIFEST_TEMPLATE") {
            cfg.manifest_template = template;
        }

        cfg.packer_options()
            .context("validating packer filters")?;
        Ok(cfg)
    }

    /// Filters and format handed to every packer.
    pub fn packer_options(&self) -> Result<PackerOptions> {
        let reference_filters = self
            .reference_filters
            .iter()
            .map(|filter| filter.parse::<ReferenceFilter>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PackerOptions {
            format: self.format,
            content_filter: self.content_filter.as_deref().map(ContentFilter::parse),
            reference_filters,
        })
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got `{other}`"),
    }
}

/// Command-line + environment configuration for the binary.
#[derive(Parser, Debug)]
#[command(author, version, about = "Archival package replication toolkit")]
pub struct Args {
    /// Replica payload directory (overrides AIP_REPLICA_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Scratch directory for packing (overrides AIP_REPLICA_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Database URL (overrides AIP_REPLICA_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object store backend (overrides AIP_REPLICA_BACKEND)
    #[arg(long)]
    pub backend: Option<String>,

    /// Archive format, zip or tgz (overrides AIP_REPLICA_FORMAT)
    #[arg(long)]
    pub format: Option<ArchiveFormat>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the odometer counters as JSON
    Odometer,
    /// Check whether a replica exists
    Exists { group: String, id: String },
    /// Read one replica attribute
    Attr {
        group: String,
        id: String,
        name: String,
    },
    /// Copy a replica to a local file
    Fetch {
        group: String,
        id: String,
        dest: PathBuf,
    },
    /// Remove a replica
    Remove { group: String, id: String },
    /// Move a replica between groups
    Move { from: String, to: String, id: String },
    /// List replicas in a group
    List {
        group: String,
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Storage id for a handle, probing the store when the type is unknown
    StorageId {
        handle: String,
        #[arg(long)]
        ext: Option<String>,
    },
    /// Handle encoded in a storage id
    CanonicalId { storage_id: String },
}

/// Merged configuration plus what the binary was asked to do.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub replica: ReplicaConfig,
    pub migrate: bool,
    pub command: Option<Command>,
}

impl AppConfig {
    /// Parse environment variables + CLI args.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();
        let replica = ReplicaConfig::from_env()?;
        Ok(Self::merge(replica, args))
    }

    /// Command-line flags win over the environment.
    pub fn merge(mut replica: ReplicaConfig, args: Args) -> Self {
        if let Some(dir) = args.storage_dir {
            replica.storage_dir = dir;
        }
        if let Some(dir) = args.staging_dir {
            replica.staging_dir = dir;
        }
        if let Some(url) = args.database_url {
            replica.database_url = url;
        }
        if let Some(backend) = args.backend {
            replica.backend = Some(backend);
        }
        if let Some(format) = args.format {
            replica.format = format;
        }
        Self {
            replica,
            migrate: args.migrate,
            command: args.command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = ReplicaConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, ReplicaConfig::default());
        assert_eq!(cfg.backend.as_deref(), Some("local"));
        assert_eq!(cfg.format, ArchiveFormat::Zip);
    }

    #[test]
    fn environment_overrides_and_filters() {
        let cfg = ReplicaConfig::from_lookup(lookup(&[
            ("AIP_REPLICA_FORMAT", "tgz"),
            ("AIP_REPLICA_TYPE_PREFIX", "off"),
            ("AIP_REPLICA_BACKEND", ""),
            ("AIP_REPLICA_CONTENT_FILTER", "-LICENSE"),
            (
                "AIP_REPLICA_REFERENCE_FILTERS",
                "ORIGINAL 100 file:///srv/a.pdf; TEXT 5 file:///srv/b.txt",
            ),
        ]))
        .unwrap();
        assert_eq!(cfg.format, ArchiveFormat::Tgz);
        assert!(!cfg.type_prefix);
        assert!(cfg.backend.is_none());

        let options = cfg.packer_options().unwrap();
        assert!(!options.accepts_bundle("LICENSE"));
        assert_eq!(options.reference_filters.len(), 2);
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = ReplicaConfig::from_lookup(lookup(&[("AIP_REPLICA_TYPE_PREFIX", "maybe")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("AIP_REPLICA_TYPE_PREFIX"));
        assert!(
            ReplicaConfig::from_lookup(lookup(&[("AIP_REPLICA_REFERENCE_FILTERS", "ORIGINAL x")]))
                .is_err()
        );
    }

    #[test]
    fn flags_override_environment() {
        let args = Args::parse_from([
            "aip-replica",
            "--format",
            "tgz",
            "--storage-dir",
            "/srv/replicas",
            "exists",
            "store",
            "ITEM@1-2.zip",
        ]);
        let cfg = AppConfig::merge(ReplicaConfig::default(), args);
        assert_eq!(cfg.replica.format, ArchiveFormat::Tgz);
        assert_eq!(cfg.replica.storage_dir, PathBuf::from("/srv/replicas"));
        assert_eq!(
            cfg.command,
            Some(Command::Exists {
                group: "store".into(),
                id: "ITEM@1-2.zip".into()
            })
        );
    }
}
