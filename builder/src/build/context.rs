//! Build context access.
//!
//! All COPY sources resolve inside the context directory, never against the
//! current directory of the invoking process. `.dockerignore` rules are
//! applied with gitignore semantics.

use std::path::{Component, Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use sha2::{Digest, Sha256};
use stratum_core::error::{Result, StratumError};

use super::layer::{permission_bits, EntryKind};

/// Name of the ignore file read from the context root.
pub const IGNORE_FILE: &str = ".dockerignore";

/// A file, directory or symlink inside the build context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    /// Absolute path on the host
    pub path: PathBuf,
    /// Path relative to the walked source (empty for the source itself)
    pub relative: PathBuf,
    /// Entry kind
    pub kind: EntryKind,
}

/// A build context directory with its ignore rules.
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
    ignore: Gitignore,
}

impl BuildContext {
    /// Open a context directory and load its `.dockerignore`.
    pub fn open(dir: &Path) -> Result<Self> {
        let root = dir.canonicalize().map_err(|e| {
            StratumError::Filesystem(format!(
                "Build context {} is not accessible: {}",
                dir.display(),
                e
            ))
        })?;
        if !root.is_dir() {
            return Err(StratumError::Filesystem(format!(
                "Build context {} is not a directory",
                root.display()
            )));
        }

        let mut builder = GitignoreBuilder::new(&root);
        let ignore_path = root.join(IGNORE_FILE);
        if ignore_path.is_file() {
            if let Some(e) = builder.add(&ignore_path) {
                return Err(StratumError::Filesystem(format!(
                    "Failed to read {}: {}",
                    ignore_path.display(),
                    e
                )));
            }
        }
        let ignore = builder.build().map_err(|e| {
            StratumError::Filesystem(format!("Invalid {}: {}", IGNORE_FILE, e))
        })?;

        tracing::debug!(
            context = %root.display(),
            ignore_rules = ignore.num_ignores(),
            "Opened build context"
        );

        Ok(Self { root, ignore })
    }

    /// Canonical context root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a COPY source to a path inside the context.
    ///
    /// Leading `/` is ignored, `..` may not climb out of the context, and
    /// the source must exist and not be excluded by `.dockerignore`.
    pub fn resolve(&self, src: &str) -> Result<PathBuf> {
        let mut relative = PathBuf::new();
        for component in Path::new(src).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(StratumError::Filesystem(format!(
                            "COPY source '{}' is outside the build context",
                            src
                        )));
                    }
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }

        let path = self.root.join(&relative);
        let metadata = std::fs::symlink_metadata(&path).map_err(|_| {
            StratumError::Filesystem(format!(
                "COPY source not found: {} (in context {})",
                src,
                self.root.display()
            ))
        })?;

        if relative.as_os_str().is_empty() {
            return Ok(path);
        }

        if self.is_ignored(&relative, metadata.is_dir()) {
            return Err(StratumError::Filesystem(format!(
                "COPY source '{}' is excluded by {}",
                src, IGNORE_FILE
            )));
        }

        // A symlinked source must still land inside the context
        if metadata.file_type().is_symlink() {
            let target = path.canonicalize().map_err(|e| {
                StratumError::Filesystem(format!("Failed to resolve {}: {}", path.display(), e))
            })?;
            if !target.starts_with(&self.root) {
                return Err(StratumError::Filesystem(format!(
                    "COPY source '{}' points outside the build context",
                    src
                )));
            }
        }

        Ok(path)
    }

    /// List a source and, for directories, everything beneath it that is
    /// not ignored. Entries are sorted by path; symlinks are not followed.
    pub fn walk(&self, src: &str) -> Result<Vec<ContextEntry>> {
        let base = self.resolve(src)?;
        let root = self.root.clone();
        let rules = self.ignore.clone();

        let walker = ignore::WalkBuilder::new(&base)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let is_dir = entry.file_type().map_or(false, |t| t.is_dir());
                match entry.path().strip_prefix(&root) {
                    Ok(rel) => !rules.matched_path_or_any_parents(rel, is_dir).is_ignore(),
                    Err(_) => false,
                }
            })
            .build();

        let mut entries = Vec::new();
        for result in walker {
            let entry = result.map_err(|e| {
                StratumError::Filesystem(format!("Failed to walk {}: {}", base.display(), e))
            })?;
            let file_type = entry.file_type().ok_or_else(|| {
                StratumError::Filesystem(format!("Cannot read type of {}", entry.path().display()))
            })?;
            let kind = if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            let relative = entry
                .path()
                .strip_prefix(&base)
                .map(Path::to_path_buf)
                .unwrap_or_default();
            entries.push(ContextEntry {
                path: entry.path().to_path_buf(),
                relative,
                kind,
            });
        }

        Ok(entries)
    }

    /// Content digest of the given sources.
    ///
    /// Covers relative path, entry kind, permission bits, file contents and
    /// symlink targets of every included entry. Timestamps are not hashed,
    /// so touching a file leaves the digest unchanged.
    pub fn digest(&self, sources: &[String]) -> Result<String> {
        let mut hasher = Sha256::new();

        for src in sources {
            hasher.update(b"src\0");
            hasher.update(src.as_bytes());
            hasher.update(b"\0");

            for entry in self.walk(src)? {
                let metadata = std::fs::symlink_metadata(&entry.path).map_err(|e| {
                    StratumError::Filesystem(format!(
                        "Failed to stat {}: {}",
                        entry.path.display(),
                        e
                    ))
                })?;
                hasher.update(entry.relative.to_string_lossy().as_bytes());
                hasher.update(b"\0");
                hasher.update(format!("{:?}\0{:o}\0", entry.kind, permission_bits(&metadata)));

                match entry.kind {
                    EntryKind::File => {
                        hasher.update(metadata.len().to_le_bytes());
                        hash_file_contents(&entry.path, &mut hasher)?;
                    }
                    EntryKind::Symlink => {
                        let target = std::fs::read_link(&entry.path).map_err(|e| {
                            StratumError::Filesystem(format!(
                                "Failed to read link {}: {}",
                                entry.path.display(),
                                e
                            ))
                        })?;
                        hasher.update(target.to_string_lossy().as_bytes());
                    }
                    EntryKind::Dir => {}
                }
                hasher.update(b"\n");
            }
        }

        Ok(hex::encode(hasher.finalize()))
    }

    fn is_ignored(&self, relative: &Path, is_dir: bool) -> bool {
        self.ignore
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }
}

fn hash_file_contents(path: &Path, hasher: &mut Sha256) -> Result<()> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        StratumError::Filesystem(format!("Failed to read {}: {}", path.display(), e))
    })?;
    std::io::copy(&mut file, hasher).map_err(|e| {
        StratumError::Filesystem(format!("Failed to read {}: {}", path.display(), e))
    })?;
    Ok(())
}
