//! Bag container: a directory with tag files and a `data/` payload, archived
//! into one file.
//!
//! ```text
//! bagit.txt
//! bag-info.txt            Key: value properties
//! fetch.txt               by-reference payloads (URL SIZE data/path)
//! manifest-md5.txt        MD5 of every payload file
//! tagmanifest-md5.txt     MD5 of the tag files above
//! data/...
//! ```
//!
//! Archive entries carry fixed timestamps and permissions, so packing the
//! same content twice produces identical bytes.

use super::{ArchiveFormat, PackError, PackResult};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::{
    ffi::OsString,
    fs::File,
    io,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

const BAGIT_TXT: &str = "bagit.txt";
const BAG_INFO_TXT: &str = "bag-info.txt";
const FETCH_TXT: &str = "fetch.txt";
const MANIFEST_TXT: &str = "manifest-md5.txt";
const TAG_MANIFEST_TXT: &str = "tagmanifest-md5.txt";
const PAYLOAD_DIR: &str = "data";
const BAGIT_DECLARATION: &str = "BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n";

/// A by-reference payload entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchEntry {
    pub url: String,
    pub size: u64,
    /// Path relative to `data/`.
    pub path: String,
}

/// Writes a bag into a staging directory.
pub struct BagBuilder {
    root: PathBuf,
    properties: Vec<(String, String)>,
    references: Vec<FetchEntry>,
}

impl BagBuilder {
    /// Start a fresh bag at `root`, discarding anything left there.
    pub async fn create(root: &Path) -> PackResult<Self> {
        match fs::remove_dir_all(root).await {
            Ok(_) => debug!("cleared stale staging dir {}", root.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(root.join(PAYLOAD_DIR)).await?;
        Ok(Self {
            root: root.to_path_buf(),
            properties: Vec::new(),
            references: Vec::new(),
        })
    }

    pub fn property(&mut self, key: &str, value: &str) {
        self.properties.push((key.to_string(), value.to_string()));
    }

    /// Write `bytes` to `data/<rel>`.
    pub async fn add_payload(&mut self, rel: &str, bytes: &[u8]) -> PackResult<()> {
        let path = payload_path(&self.root, rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        Ok(())
    }

    /// Record `data/<rel>` as fetched from `url` rather than carried.
    pub fn add_reference(&mut self, rel: &str, url: &str, size: u64) -> PackResult<()> {
        check_relative(rel)?;
        self.references.push(FetchEntry {
            url: url.to_string(),
            size,
            path: rel.to_string(),
        });
        Ok(())
    }

    /// Write tag files and manifests, archive the bag next to its staging
    /// directory, and remove the directory.
    pub async fn finish(self, format: ArchiveFormat) -> PackResult<PathBuf> {
        let archive = archive_path(&self.root, format);
        let root = self.root.clone();
        let properties = self.properties;
        let references = self.references;

        let built = tokio::task::spawn_blocking(move || -> PackResult<PathBuf> {
            write_tag_files(&root, &properties, &references)?;
            match format {
                ArchiveFormat::Zip => write_zip(&root, &archive)?,
                ArchiveFormat::Tgz => write_tgz(&root, &archive)?,
            }
            Ok(archive)
        })
        .await??;

        if let Err(err) = fs::remove_dir_all(&self.root).await {
            warn!("could not remove staging dir {}: {}", self.root.display(), err);
        }
        Ok(built)
    }
}

/// An extracted, checksum-verified bag.
pub struct Bag {
    root: PathBuf,
    properties: Vec<(String, String)>,
    references: Vec<FetchEntry>,
}

impl Bag {
    /// Extract `archive` beside itself (the archive path minus its
    /// extension) and validate the payload manifest.
    pub async fn open(archive: &Path) -> PackResult<Self> {
        let format = ArchiveFormat::from_path(archive)?;
        let root = archive.with_extension("");
        let source = archive.to_path_buf();
        let target = root.clone();

        tokio::task::spawn_blocking(move || -> PackResult<()> {
            match std::fs::remove_dir_all(&target) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            std::fs::create_dir_all(&target)?;
            match format {
                ArchiveFormat::Zip => extract_zip(&source, &target),
                ArchiveFormat::Tgz => extract_tgz(&source, &target),
            }?;
            verify_manifest(&target)
        })
        .await??;

        let properties = match fs::read_to_string(root.join(BAG_INFO_TXT)).await {
            Ok(text) => parse_properties(&text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let references = match fs::read_to_string(root.join(FETCH_TXT)).await {
            Ok(text) => parse_fetch(&text)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            root,
            properties,
            references,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn references(&self) -> &[FetchEntry] {
        &self.references
    }

    /// Bytes of `data/<rel>`, `None` when absent.
    pub async fn read_payload(&self, rel: &str) -> PackResult<Option<Vec<u8>>> {
        let path = payload_path(&self.root, rel)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Sorted sub-directories of `data/`.
    pub async fn payload_dirs(&self) -> PackResult<Vec<String>> {
        self.list(&self.root.join(PAYLOAD_DIR), true).await
    }

    /// Sorted file names inside `data/<dir>`.
    pub async fn payload_files(&self, dir: &str) -> PackResult<Vec<String>> {
        let path = payload_path(&self.root, dir)?;
        self.list(&path, false).await
    }

    async fn list(&self, dir: &Path, dirs: bool) -> PackResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() != dirs {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Resolve a by-reference payload. Only `file://` URLs can be read
    /// locally; the declared size must match.
    pub async fn resolve_reference(&self, entry: &FetchEntry) -> PackResult<Vec<u8>> {
        let unresolved = |reason: String| PackError::UnresolvedReference {
            url: entry.url.clone(),
            reason,
        };
        let (scheme, rest) = entry
            .url
            .split_once("://")
            .ok_or_else(|| unresolved("not a URL".to_string()))?;
        if !scheme.eq_ignore_ascii_case("file") {
            return Err(unresolved(format!("unsupported scheme `{scheme}`")));
        }
        let path = PathBuf::from(rest);
        if !path.is_absolute() {
            return Err(unresolved("not a local path".to_string()));
        }
        let bytes = fs::read(&path)
            .await
            .map_err(|err| unresolved(err.to_string()))?;
        if bytes.len() as u64 != entry.size {
            return Err(unresolved(format!(
                "declared {} bytes, found {}",
                entry.size,
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Remove the extracted directory.
    pub async fn clean(self) {
        if let Err(err) = fs::remove_dir_all(&self.root).await {
            warn!("could not remove bag dir {}: {}", self.root.display(), err);
        }
    }
}

/// `root` with `.ext` appended (not substituted: storage ids may contain dots).
pub fn archive_path(root: &Path, format: ArchiveFormat) -> PathBuf {
    let mut name = OsString::from(root.as_os_str());
    name.push(".");
    name.push(format.extension());
    PathBuf::from(name)
}

fn check_relative(rel: &str) -> PackResult<()> {
    let unsafe_part = rel.is_empty()
        || rel.starts_with('/')
        || rel.contains('\\')
        || rel.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if unsafe_part {
        return Err(PackError::UnsafeName(rel.to_string()));
    }
    Ok(())
}

fn payload_path(root: &Path, rel: &str) -> PackResult<PathBuf> {
    check_relative(rel)?;
    Ok(root.join(PAYLOAD_DIR).join(rel))
}

fn parse_properties(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn parse_fetch(text: &str) -> PackResult<Vec<FetchEntry>> {
    let mut entries = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let mut parts = line.split_whitespace();
        let (Some(url), Some(size), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(PackError::MissingPayload(format!("bad fetch line `{line}`")));
        };
        let size = size
            .parse::<u64>()
            .map_err(|_| PackError::MissingPayload(format!("bad fetch size `{line}`")))?;
        let path = path
            .strip_prefix("data/")
            .ok_or_else(|| PackError::UnsafeName(path.to_string()))?;
        check_relative(path)?;
        entries.push(FetchEntry {
            url: url.to_string(),
            size,
            path: path.to_string(),
        });
    }
    Ok(entries)
}

/// Regular files beneath `dir`, sorted, with `/`-separated paths relative
/// to `root`.
fn sorted_files(root: &Path, dir: &Path) -> PackResult<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| PackError::UnsafeName(entry.path().display().to_string()))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push((rel, entry.path().to_path_buf()));
    }
    Ok(files)
}

pub(crate) fn md5_file(path: &Path) -> PackResult<String> {
    let mut file = File::open(path)?;
    let mut context = md5::Context::new();
    io::copy(&mut file, &mut context)?;
    Ok(format!("{:x}", context.compute()))
}

fn write_tag_files(
    root: &Path,
    properties: &[(String, String)],
    references: &[FetchEntry],
) -> PackResult<()> {
    let payload = sorted_files(root, &root.join(PAYLOAD_DIR))?;

    let mut manifest = String::new();
    let mut octets: u64 = 0;
    for (rel, path) in &payload {
        manifest.push_str(&format!("{}  {}\n", md5_file(path)?, rel));
        octets += std::fs::metadata(path)?.len();
    }

    let mut info = String::new();
    for (key, value) in properties {
        info.push_str(&format!("{}: {}\n", key, value));
    }
    info.push_str(&format!("Payload-Oxum: {}.{}\n", octets, payload.len()));

    std::fs::write(root.join(BAGIT_TXT), BAGIT_DECLARATION)?;
    std::fs::write(root.join(BAG_INFO_TXT), info)?;
    std::fs::write(root.join(MANIFEST_TXT), manifest)?;

    let mut tag_files = vec![BAGIT_TXT, BAG_INFO_TXT, MANIFEST_TXT];
    if !references.is_empty() {
        let fetch: String = references
            .iter()
            .map(|r| format!("{} {} {}/{}\n", r.url, r.size, PAYLOAD_DIR, r.path))
            .collect();
        std::fs::write(root.join(FETCH_TXT), fetch)?;
        tag_files.push(FETCH_TXT);
    }

    let mut tag_manifest = String::new();
    for name in tag_files {
        tag_manifest.push_str(&format!("{}  {}\n", md5_file(&root.join(name))?, name));
    }
    std::fs::write(root.join(TAG_MANIFEST_TXT), tag_manifest)?;
    Ok(())
}

fn verify_manifest(root: &Path) -> PackResult<()> {
    let manifest = match std::fs::read_to_string(root.join(MANIFEST_TXT)) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(PackError::MissingPayload(MANIFEST_TXT.to_string()));
        }
        Err(err) => return Err(err.into()),
    };
    for line in manifest.lines().filter(|l| !l.trim().is_empty()) {
        let (expected, rel) = line
            .split_once(char::is_whitespace)
            .map(|(sum, rel)| (sum.trim(), rel.trim()))
            .ok_or_else(|| PackError::MissingPayload(format!("bad manifest line `{line}`")))?;
        let payload = rel
            .strip_prefix("data/")
            .ok_or_else(|| PackError::UnsafeName(rel.to_string()))?;
        let path = payload_path(root, payload)?;
        if !path.is_file() {
            return Err(PackError::MissingPayload(rel.to_string()));
        }
        let actual = md5_file(&path)?;
        if actual != expected {
            return Err(PackError::ChecksumMismatch {
                path: rel.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
    }
    Ok(())
}

fn write_zip(root: &Path, dest: &Path) -> PackResult<()> {
    let file = File::create(dest)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);
    for (rel, path) in sorted_files(root, root)? {
        zip.start_file(rel, options)?;
        let mut source = File::open(&path)?;
        io::copy(&mut source, &mut zip)?;
    }
    zip.finish()?;
    Ok(())
}

fn write_tgz(root: &Path, dest: &Path) -> PackResult<()> {
    let file = File::create(dest)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (rel, path) in sorted_files(root, root)? {
        let data = std::fs::read(&path)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        builder.append_data(&mut header, &rel, data.as_slice())?;
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

fn extract_zip(archive: &Path, root: &Path) -> PackResult<()> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| PackError::UnsafeName(entry.name().to_string()))?;
        let out = root.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut target = File::create(&out)?;
        io::copy(&mut entry, &mut target)?;
    }
    Ok(())
}

fn extract_tgz(archive: &Path, root: &Path) -> PackResult<()> {
    let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    tar.unpack(root)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn sample(dir: &Path, format: ArchiveFormat) -> PathBuf {
        let mut bag = BagBuilder::create(&dir.join("ITEM@1-2")).await.unwrap();
        bag.property("Object-Id", "1/2");
        bag.add_payload("metadata.xml", b"<metadata>\n</metadata>\n")
            .await
            .unwrap();
        bag.add_payload("ORIGINAL/1", b"payload").await.unwrap();
        bag.finish(format).await.unwrap()
    }

    #[tokio::test]
    async fn zip_and_tgz_bags_reopen_with_properties() {
        let tmp = TempDir::new().unwrap();
        for format in [ArchiveFormat::Zip, ArchiveFormat::Tgz] {
            let archive = sample(tmp.path(), format).await;
            assert!(archive.to_string_lossy().ends_with(format.extension()));
            assert!(!tmp.path().join("ITEM@1-2").exists());

            let bag = Bag::open(&archive).await.unwrap();
            assert_eq!(bag.property("Object-Id"), Some("1/2"));
            assert_eq!(bag.property("Payload-Oxum"), Some("30.2"));
            assert_eq!(bag.payload_dirs().await.unwrap(), vec!["ORIGINAL"]);
            assert_eq!(
                bag.read_payload("ORIGINAL/1").await.unwrap().as_deref(),
                Some(&b"payload"[..])
            );
            assert!(bag.read_payload("ORIGINAL/2").await.unwrap().is_none());
            bag.clean().await;
        }
    }

    #[tokio::test]
    async fn repacking_is_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let first = std::fs::read(sample(tmp.path(), ArchiveFormat::Zip).await).unwrap();
        let second = std::fs::read(sample(tmp.path(), ArchiveFormat::Zip).await).unwrap();
        assert_eq!(md5::compute(&first), md5::compute(&second));
    }

    #[tokio::test]
    async fn tampered_payload_fails_verification() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("ITEM@1-3");
        let mut bag = BagBuilder::create(&root).await.unwrap();
        bag.add_payload("ORIGINAL/1", b"payload").await.unwrap();
        let archive = bag.finish(ArchiveFormat::Tgz).await.unwrap();

        // rebuild the archive with altered payload but the old manifest
        Bag::open(&archive).await.unwrap();
        std::fs::write(root.join("data/ORIGINAL/1"), b"tampered").unwrap();
        write_tgz(&root, &archive).unwrap();

        let err = Bag::open(&archive).await.err().unwrap();
        assert!(matches!(err, PackError::ChecksumMismatch { .. }));
    }

    #[test]
    fn archive_path_appends_extension() {
        let path = archive_path(Path::new("/tmp/store/ITEM@10.5072-abc"), ArchiveFormat::Zip);
        assert_eq!(path, PathBuf::from("/tmp/store/ITEM@10.5072-abc.zip"));
        assert!(check_relative("../x").is_err());
        assert!(check_relative("ORIGINAL/1").is_ok());
    }
}
