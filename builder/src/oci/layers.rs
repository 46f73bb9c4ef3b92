//! Layer extraction.
//!
//! Applies a layer tarball (gzip or plain tar) onto a rootfs, honoring
//! whiteout entries: `.wh.<name>` deletes `<name>` and `.wh..wh..opq`
//! empties its directory.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use stratum_core::error::{Result, StratumError};
use tar::Archive;

use crate::build::layer::WHITEOUT_PREFIX;

const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Extract a layer onto `target_dir`.
///
/// Whiteouts are applied before the layer's own entries are written, so
/// they only affect content from lower layers.
pub fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<()> {
    if !layer_path.exists() {
        return Err(StratumError::OciImage(format!(
            "Layer file not found: {}",
            layer_path.display()
        )));
    }

    std::fs::create_dir_all(target_dir).map_err(|e| {
        StratumError::Filesystem(format!(
            "Failed to create target directory {}: {}",
            target_dir.display(),
            e
        ))
    })?;

    let whiteouts = apply_whiteouts(layer_path, target_dir)?;

    let mut archive = open_archive(layer_path)?;
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let entries = archive.entries().map_err(|e| extract_error(layer_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| extract_error(layer_path, e))?;
        let path = entry
            .path()
            .map_err(|e| extract_error(layer_path, e))?
            .into_owned();
        if whiteout_name(&path).is_some() {
            continue;
        }
        // unpack_in refuses entries escaping the target
        entry
            .unpack_in(target_dir)
            .map_err(|e| extract_error(layer_path, e))?;
    }

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        whiteouts,
        "Extracted layer"
    );

    Ok(())
}

/// Apply the whiteout entries of a layer. Returns how many were applied.
fn apply_whiteouts(layer_path: &Path, target_dir: &Path) -> Result<usize> {
    let mut archive = open_archive(layer_path)?;
    let mut applied = 0;

    let entries = archive.entries().map_err(|e| extract_error(layer_path, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| extract_error(layer_path, e))?;
        let path = entry
            .path()
            .map_err(|e| extract_error(layer_path, e))?
            .into_owned();
        let Some(name) = whiteout_name(&path) else {
            continue;
        };
        let Some(parent) = sanitize(path.parent().unwrap_or(Path::new(""))) else {
            tracing::warn!(path = %path.display(), "Ignoring whiteout outside the rootfs");
            continue;
        };

        let dir = target_dir.join(parent);
        if name == OPAQUE_WHITEOUT {
            clear_dir(&dir)?;
        } else {
            let hidden = &name[WHITEOUT_PREFIX.len()..];
            remove_path(&dir.join(hidden))?;
        }
        applied += 1;
    }

    Ok(applied)
}

fn open_archive(layer_path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let file = File::open(layer_path).map_err(|e| {
        StratumError::OciImage(format!(
            "Failed to open layer file {}: {}",
            layer_path.display(),
            e
        ))
    })?;
    let mut reader = BufReader::new(file);
    let is_gzip = reader
        .fill_buf()
        .map(|head| head.starts_with(&[0x1f, 0x8b]))
        .unwrap_or(false);

    let reader: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    Ok(Archive::new(reader))
}

fn whiteout_name(path: &Path) -> Option<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| n.starts_with(WHITEOUT_PREFIX))
}

/// Relative form of an archive path, or `None` if it escapes the root.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(clean)
}

fn clear_dir(dir: &Path) -> Result<()> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(fs_error(dir, e)),
    };
    for entry in read_dir {
        let entry = entry.map_err(|e| fs_error(dir, e))?;
        remove_path(&entry.path())?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(fs_error(path, e)),
    };
    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(|e| fs_error(path, e))
}

fn fs_error(path: &Path, e: std::io::Error) -> StratumError {
    StratumError::Filesystem(format!("Failed to remove {}: {}", path.display(), e))
}

fn extract_error(layer_path: &Path, e: std::io::Error) -> StratumError {
    StratumError::OciImage(format!(
        "Failed to extract layer {}: {}",
        layer_path.display(),
        e
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_layer(path: &Path, gzip: bool, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let writer: Box<dyn std::io::Write> = if gzip {
            Box::new(GzEncoder::new(file, Compression::default()))
        } else {
            Box::new(file)
        };
        let mut builder = tar::Builder::new(writer);
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap().flush().unwrap();
    }

    #[test]
    fn test_extract_layer_files() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer.tar.gz");
        let target = tmp.path().join("rootfs");
        write_layer(
            &layer,
            true,
            &[("etc/os-release", b"ID=test"), ("bin/tool", b"#!/bin/sh")],
        );

        extract_layer(&layer, &target).unwrap();

        assert_eq!(
            fs::read_to_string(target.join("etc/os-release")).unwrap(),
            "ID=test"
        );
        assert!(target.join("bin/tool").is_file());
    }

    #[test]
    fn test_extract_uncompressed_layer() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer.tar");
        let target = tmp.path().join("rootfs");
        write_layer(&layer, false, &[("plain.txt", b"plain")]);

        extract_layer(&layer, &target).unwrap();
        assert_eq!(fs::read_to_string(target.join("plain.txt")).unwrap(), "plain");
    }

    #[test]
    fn test_extract_layer_overwrites() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("rootfs");
        let l1 = tmp.path().join("l1.tar.gz");
        let l2 = tmp.path().join("l2.tar.gz");
        write_layer(&l1, true, &[("app/config", b"v1")]);
        write_layer(&l2, true, &[("app/config", b"v2")]);

        extract_layer(&l1, &target).unwrap();
        extract_layer(&l2, &target).unwrap();
        assert_eq!(fs::read_to_string(target.join("app/config")).unwrap(), "v2");
    }

    #[test]
    fn test_whiteout_removes_lower_file() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("rootfs");
        let l1 = tmp.path().join("l1.tar.gz");
        let l2 = tmp.path().join("l2.tar.gz");
        write_layer(&l1, true, &[("tmp/cache.bin", b"x"), ("tmp/keep", b"k")]);
        write_layer(&l2, true, &[("tmp/.wh.cache.bin", b"")]);

        extract_layer(&l1, &target).unwrap();
        extract_layer(&l2, &target).unwrap();

        assert!(!target.join("tmp/cache.bin").exists());
        assert!(!target.join("tmp/.wh.cache.bin").exists());
        assert!(target.join("tmp/keep").exists());
    }

    #[test]
    fn test_opaque_whiteout_keeps_same_layer_entries() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("rootfs");
        let l1 = tmp.path().join("l1.tar.gz");
        let l2 = tmp.path().join("l2.tar.gz");
        write_layer(&l1, true, &[("data/old1", b"1"), ("data/old2", b"2")]);
        write_layer(&l2, true, &[("data/new", b"n"), ("data/.wh..wh..opq", b"")]);

        extract_layer(&l1, &target).unwrap();
        extract_layer(&l2, &target).unwrap();

        assert!(!target.join("data/old1").exists());
        assert!(!target.join("data/old2").exists());
        assert!(target.join("data/new").exists());
    }

    #[test]
    fn test_extract_layer_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = extract_layer(&tmp.path().join("missing.tar.gz"), tmp.path()).unwrap_err();
        assert!(err.to_string().contains("Layer file not found"));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize(Path::new("./a/b")), Some(PathBuf::from("a/b")));
        assert_eq!(sanitize(Path::new("/a")), Some(PathBuf::from("a")));
        assert_eq!(sanitize(Path::new("a/../../b")), None);
    }
}
