//! Safe extraction and packaging of index archives.
//!
//! Artifacts are ZIP files whose root holds `manifest.json` and the index
//! file. [`unpack`] treats every archive as untrusted:
//!
//! - all entries are checked before anything is written; an entry whose
//!   resolved path leaves the target (`../`, absolute paths, drive
//!   prefixes) or that is a symbolic link fails the whole archive with
//!   [`UnpackError::UnsafePath`];
//! - declared and actual decompressed sizes are bounded (zip-bomb
//!   protection);
//! - extraction happens in a hidden sibling staging directory that is
//!   renamed onto the target as the last step, so the target either
//!   holds the complete archive or does not exist.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::UnpackError;

/// Maximum decompressed bytes of a single entry.
pub const MAX_ENTRY_BYTES: u64 = 8 * 1024 * 1024 * 1024;

/// Maximum declared decompressed bytes of a whole archive.
pub const MAX_TOTAL_BYTES: u64 = 32 * 1024 * 1024 * 1024;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Extract `archive_path` into `target`, which must not exist yet.
///
/// On any error nothing is left at `target` and the staging directory is
/// removed.
pub fn unpack(archive_path: &Path, target: &Path) -> Result<usize, UnpackError> {
    if target.exists() {
        return Err(UnpackError::io(
            target,
            io::Error::new(io::ErrorKind::AlreadyExists, "unpack target already exists"),
        ));
    }

    let file = File::open(archive_path).map_err(|e| UnpackError::io(archive_path, e))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| UnpackError::CorruptArchive(e.to_string()))?;

    let entries = plan(&mut archive)?;

    let parent = target
        .parent()
        .ok_or_else(|| UnpackError::io(target, io::Error::other("target has no parent directory")))?;
    std::fs::create_dir_all(parent).map_err(|e| UnpackError::io(parent, e))?;

    let staging = parent.join(format!(
        ".{}.unpacking-{}",
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        uuid::Uuid::new_v4().simple()
    ));

    let result = std::fs::create_dir(&staging)
        .map_err(|e| UnpackError::io(&staging, e))
        .and_then(|_| extract(&mut archive, &entries, &staging))
        .and_then(|_| std::fs::rename(&staging, target).map_err(|e| UnpackError::io(target, e)));

    if let Err(e) = result {
        if staging.exists() {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                warn!(path = %staging.display(), error = %cleanup, "Failed to remove staging directory");
            }
        }
        return Err(e);
    }

    info!(
        archive = %archive_path.display(),
        target = %target.display(),
        entries = entries.len(),
        "Archive unpacked"
    );
    Ok(entries.len())
}

/// One validated entry: its index in the archive and relative output path.
struct PlannedEntry {
    index: usize,
    relative: PathBuf,
    is_dir: bool,
}

/// Validate every entry before a single byte is written.
fn plan<R: Read + io::Seek>(archive: &mut zip::ZipArchive<R>) -> Result<Vec<PlannedEntry>, UnpackError> {
    let mut planned = Vec::with_capacity(archive.len());
    let mut declared_total: u64 = 0;

    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| UnpackError::CorruptArchive(e.to_string()))?;
        let name = entry.name().to_string();

        let relative = entry
            .enclosed_name()
            .ok_or_else(|| UnpackError::UnsafePath(name.clone()))?;

        if let Some(mode) = entry.unix_mode() {
            if mode & S_IFMT == S_IFLNK {
                return Err(UnpackError::UnsafePath(format!("{} (symbolic link)", name)));
            }
        }

        if entry.size() > MAX_ENTRY_BYTES {
            return Err(UnpackError::CorruptArchive(format!(
                "entry '{}' declares {} bytes (limit {})",
                name,
                entry.size(),
                MAX_ENTRY_BYTES
            )));
        }
        declared_total = declared_total.saturating_add(entry.size());
        if declared_total > MAX_TOTAL_BYTES {
            return Err(UnpackError::CorruptArchive(format!(
                "archive declares more than {} bytes",
                MAX_TOTAL_BYTES
            )));
        }

        planned.push(PlannedEntry {
            index,
            relative,
            is_dir: entry.is_dir(),
        });
    }

    Ok(planned)
}

fn extract<R: Read + io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    entries: &[PlannedEntry],
    staging: &Path,
) -> Result<(), UnpackError> {
    for planned in entries {
        let out_path = staging.join(&planned.relative);

        if planned.is_dir {
            std::fs::create_dir_all(&out_path).map_err(|e| UnpackError::io(&out_path, e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| UnpackError::io(parent, e))?;
        }

        let mut entry = archive
            .by_index(planned.index)
            .map_err(|e| UnpackError::CorruptArchive(e.to_string()))?;
        let mut out = File::create(&out_path).map_err(|e| UnpackError::io(&out_path, e))?;

        let copied = io::copy(&mut (&mut entry).take(MAX_ENTRY_BYTES + 1), &mut out).map_err(|e| {
            // Decompression and CRC failures surface as read errors.
            if e.kind() == io::ErrorKind::InvalidData || e.kind() == io::ErrorKind::UnexpectedEof {
                UnpackError::CorruptArchive(format!("{}: {}", planned.relative.display(), e))
            } else {
                UnpackError::io(&out_path, e)
            }
        })?;
        if copied > MAX_ENTRY_BYTES {
            return Err(UnpackError::CorruptArchive(format!(
                "entry '{}' exceeds {} bytes when decompressed",
                planned.relative.display(),
                MAX_ENTRY_BYTES
            )));
        }
        debug!(entry = %planned.relative.display(), bytes = copied, "Extracted");
    }
    Ok(())
}

/// Check an archive against the contents of a `.sha256` sidecar.
///
/// The sidecar's first whitespace-separated token must be the hex digest;
/// anything after it (a file name, as `sha256sum` writes) is ignored.
pub fn verify_checksum(archive_path: &Path, sidecar: &str) -> Result<(), UnpackError> {
    let expected = sidecar
        .split_whitespace()
        .next()
        .map(str::to_ascii_lowercase)
        .filter(|h| h.len() == 64 && h.bytes().all(|b| b.is_ascii_hexdigit()))
        .ok_or_else(|| UnpackError::CorruptArchive("checksum sidecar is not a SHA-256 digest".into()))?;

    let actual = sha256_file(archive_path)?;
    if actual != expected {
        return Err(UnpackError::CorruptArchive(format!(
            "checksum mismatch: expected {}, got {}",
            expected, actual
        )));
    }
    debug!(archive = %archive_path.display(), "Archive checksum verified");
    Ok(())
}

/// Lowercase hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String, UnpackError> {
    let mut file = File::open(path).map_err(|e| UnpackError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| UnpackError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Write the tree under `src_dir` into a ZIP at `archive_path`, with the
/// directory's contents at the archive root. Returns the number of files.
pub fn pack_dir(src_dir: &Path, archive_path: &Path) -> Result<usize> {
    if !src_dir.is_dir() {
        anyhow::bail!("Not a directory: {}", src_dir.display());
    }

    let file = File::create(archive_path)
        .with_context(|| format!("Failed to create {}", archive_path.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(true);

    let mut files = 0usize;
    for entry in WalkDir::new(src_dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let relative = path.strip_prefix(src_dir)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut input =
                File::open(path).with_context(|| format!("Failed to read {}", path.display()))?;
            io::copy(&mut input, &mut zip)?;
            files += 1;
        } else {
            anyhow::bail!("Refusing to pack non-regular file: {}", path.display());
        }
    }
    zip.finish()?;

    Ok(files)
}
