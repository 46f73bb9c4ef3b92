//! Layer creation utilities for image building.
//!
//! Provides filesystem snapshotting, diffing, and tar.gz layer creation
//! for producing OCI image layers from build steps. Layers are written
//! with deterministic headers so identical inputs yield identical blobs.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use stratum_core::error::{Result, StratumError};

/// Prefix marking a deleted path inside an OCI layer.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Kind of filesystem entry recorded in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Metadata for a single file in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Relative path from rootfs root
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Modification time (nanoseconds since epoch)
    pub mtime_ns: i64,
    /// Permission bits
    pub mode: u32,
    /// Entry kind
    pub kind: EntryKind,
}

/// A snapshot of a directory's file state.
#[derive(Debug, Clone)]
pub struct DirSnapshot {
    /// Map of relative path → file entry
    pub entries: HashMap<PathBuf, FileEntry>,
}

/// Paths that differ between two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
    /// Added or modified paths, sorted
    pub changed: Vec<PathBuf>,
    /// Removed paths, sorted; children of a removed directory are omitted
    pub removed: Vec<PathBuf>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

impl DirSnapshot {
    /// Take a snapshot of a directory, recording all files and their metadata.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = HashMap::new();
        walk_dir(root, root, &mut entries)?;
        Ok(DirSnapshot { entries })
    }

    /// Compute the diff between this snapshot (before) and another (after).
    pub fn diff(&self, after: &DirSnapshot) -> SnapshotDiff {
        let mut changed: Vec<PathBuf> = after
            .entries
            .iter()
            .filter(|(path, after_entry)| match self.entries.get(*path) {
                None => true,
                Some(before_entry) => {
                    before_entry.kind != after_entry.kind
                        || before_entry.size != after_entry.size
                        || before_entry.mtime_ns != after_entry.mtime_ns
                        || before_entry.mode != after_entry.mode
                }
            })
            .map(|(path, _)| path.clone())
            .collect();
        changed.sort();

        let mut gone: Vec<&PathBuf> = self
            .entries
            .keys()
            .filter(|path| !after.entries.contains_key(*path))
            .collect();
        gone.sort();

        // A whiteout for a directory covers everything beneath it
        let mut removed: Vec<PathBuf> = Vec::new();
        for path in gone {
            if removed.iter().any(|r| path.starts_with(r)) {
                continue;
            }
            removed.push(path.clone());
        }

        SnapshotDiff { changed, removed }
    }
}

/// Recursively walk a directory and collect file entries.
fn walk_dir(root: &Path, current: &Path, entries: &mut HashMap<PathBuf, FileEntry>) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        StratumError::Filesystem(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry.map_err(|e| {
            StratumError::Filesystem(format!("Failed to read directory entry: {}", e))
        })?;

        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| {
                StratumError::Filesystem(format!(
                    "Failed to compute relative path for {}: {}",
                    path.display(),
                    e
                ))
            })?
            .to_path_buf();

        // DirEntry::metadata does not follow symlinks
        let metadata = entry.metadata().map_err(|e| {
            StratumError::Filesystem(format!(
                "Failed to read metadata for {}: {}",
                path.display(),
                e
            ))
        })?;

        let mtime_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);

        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        entries.insert(
            relative.clone(),
            FileEntry {
                path: relative,
                size: metadata.len(),
                mtime_ns,
                mode: permission_bits(&metadata),
                kind,
            },
        );

        if kind == EntryKind::Dir {
            walk_dir(root, &path, entries)?;
        }
    }

    Ok(())
}

#[cfg(unix)]
pub(crate) fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Information about a created layer.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    /// Path to the layer tar.gz file
    pub path: PathBuf,
    /// SHA256 of the compressed blob (hex, without "sha256:" prefix)
    pub digest: String,
    /// SHA256 of the uncompressed tar stream (hex)
    pub diff_id: String,
    /// Compressed size in bytes
    pub size: u64,
}

impl LayerInfo {
    /// Get the digest with "sha256:" prefix.
    pub fn prefixed_digest(&self) -> String {
        format!("sha256:{}", self.digest)
    }

    /// Get the diff_id with "sha256:" prefix.
    pub fn prefixed_diff_id(&self) -> String {
        format!("sha256:{}", self.diff_id)
    }

    /// Describe an existing layer blob, hashing it from disk.
    pub fn from_blob(path: &Path) -> Result<Self> {
        let digest = sha256_file(path)?;
        let diff_id = compute_diff_id(path)?;
        let size = std::fs::metadata(path)
            .map_err(|e| {
                StratumError::Filesystem(format!("Failed to stat {}: {}", path.display(), e))
            })?
            .len();
        Ok(Self {
            path: path.to_path_buf(),
            digest,
            diff_id,
            size,
        })
    }
}

enum LayerEntry {
    Path(PathBuf),
    Whiteout,
}

/// Create a tar.gz layer from changed and removed paths of a rootfs.
///
/// Entries are sorted and written with `HeaderMode::Deterministic`. Removed
/// paths become `.wh.<name>` whiteout entries. Symlinks are stored as links.
pub fn create_layer(
    rootfs: &Path,
    changed: &[PathBuf],
    removed: &[PathBuf],
    output_path: &Path,
) -> Result<LayerInfo> {
    let mut entries: BTreeMap<PathBuf, LayerEntry> = BTreeMap::new();
    for path in changed {
        entries.insert(path.clone(), LayerEntry::Path(rootfs.join(path)));
    }
    for path in removed {
        entries.insert(whiteout_path(path)?, LayerEntry::Whiteout);
    }

    let file = File::create(output_path).map_err(|e| {
        StratumError::Filesystem(format!(
            "Failed to create layer file {}: {}",
            output_path.display(),
            e
        ))
    })?;

    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(DigestWriter::new(encoder));
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    for (tar_path, entry) in &entries {
        match entry {
            LayerEntry::Path(full_path) => {
                let metadata = match std::fs::symlink_metadata(full_path) {
                    Ok(m) => m,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        return Err(StratumError::Filesystem(format!(
                            "Failed to stat {}: {}",
                            full_path.display(),
                            e
                        )))
                    }
                };
                let appended = if metadata.is_dir() {
                    builder.append_dir(tar_path, full_path)
                } else {
                    builder.append_path_with_name(full_path, tar_path)
                };
                appended.map_err(|e| {
                    StratumError::Filesystem(format!(
                        "Failed to add {} to layer: {}",
                        tar_path.display(),
                        e
                    ))
                })?;
            }
            LayerEntry::Whiteout => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(0);
                header.set_mode(0o644);
                header.set_mtime(0);
                header.set_uid(0);
                header.set_gid(0);
                builder
                    .append_data(&mut header, tar_path, std::io::empty())
                    .map_err(|e| {
                        StratumError::Filesystem(format!(
                            "Failed to add whiteout {} to layer: {}",
                            tar_path.display(),
                            e
                        ))
                    })?;
            }
        }
    }

    let writer = builder
        .into_inner()
        .map_err(|e| StratumError::Filesystem(format!("Failed to finalize layer: {}", e)))?;
    let (encoder, diff_id) = writer.finish();
    encoder
        .finish()
        .map_err(|e| StratumError::Filesystem(format!("Failed to finalize layer: {}", e)))?;

    let digest = sha256_file(output_path)?;
    let size = std::fs::metadata(output_path).map(|m| m.len()).unwrap_or(0);

    Ok(LayerInfo {
        path: output_path.to_path_buf(),
        digest,
        diff_id,
        size,
    })
}

/// Map `a/b` to the whiteout entry `a/.wh.b`.
fn whiteout_path(path: &Path) -> Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        StratumError::Filesystem(format!("Cannot whiteout path {}", path.display()))
    })?;
    let whiteout = format!("{}{}", WHITEOUT_PREFIX, name.to_string_lossy());
    Ok(match path.parent() {
        Some(parent) => parent.join(whiteout),
        None => PathBuf::from(whiteout),
    })
}

/// Writer that hashes everything passing through it.
struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> DigestWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Compute the diff_id (SHA256 of uncompressed layer content).
pub fn compute_diff_id(layer_path: &Path) -> Result<String> {
    let file = File::open(layer_path).map_err(|e| {
        StratumError::Filesystem(format!(
            "Failed to read layer {} for diff_id: {}",
            layer_path.display(),
            e
        ))
    })?;
    let mut decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(file));
    let mut hasher = Sha256::new();
    std::io::copy(&mut decoder, &mut hasher).map_err(|e| {
        StratumError::Filesystem(format!(
            "Failed to decompress layer {} for diff_id: {}",
            layer_path.display(),
            e
        ))
    })?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        StratumError::Filesystem(format!(
            "Failed to read file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| {
        StratumError::Filesystem(format!("Failed to hash {}: {}", path.display(), e))
    })?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
