//! Replays a container filesystem tar stream onto disk.
//!
//! Entries are applied strictly in stream order. Directories and regular
//! files always get owner read/write added to their mode so the tree can be
//! traversed and removed later. Device nodes, FIFOs, sockets and other
//! special entries are skipped.

use std::borrow::Cow;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use tar::{Entry, EntryType};

/// Directory the runtime's copy-out archive nests the image root under.
pub const ROOTFS_DIR: &str = "rootfs";

/// Added to every directory and file so extraction never locks itself out.
pub const OWNER_RW: u32 = 0o600;

/// Counters for one replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaterializeSummary {
    /// Entries written to disk.
    pub entries: u64,
    /// Entries deliberately left out (special files, unsafe paths).
    pub skipped: u64,
    /// Regular file payload bytes written.
    pub bytes: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("unable to use destination {path}: {source}")]
    Destination { path: PathBuf, source: io::Error },

    #[error("unable to read archive: {0}")]
    Read(#[source] io::Error),

    #[error("unable to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("unable to update directory mode of {path}: {source}")]
    DirMode { path: PathBuf, source: io::Error },

    #[error("unable to replace existing {path}: {source}")]
    Replace { path: PathBuf, source: io::Error },

    #[error("unable to create file {path}: {source}")]
    CreateFile { path: PathBuf, source: io::Error },

    #[error("unable to write into file {path}: {source}")]
    WriteFile { path: PathBuf, source: io::Error },

    #[error("truncated payload for {path}: expected {expected} bytes, got {written}")]
    ShortWrite {
        path: PathBuf,
        expected: u64,
        written: u64,
    },

    #[error("unable to create symlink {path} -> {target}: {source}")]
    Symlink {
        path: PathBuf,
        target: PathBuf,
        source: io::Error,
    },

    #[error("unable to create link {path} -> {target}: {source}")]
    Hardlink {
        path: PathBuf,
        target: PathBuf,
        source: io::Error,
    },
}

enum Outcome {
    Written(u64),
    Skipped,
}

/// Replay the tar archive read from `reader` under `destination`.
///
/// A clean end of archive finishes successfully. Any read or write failure
/// stops the replay; whatever was already written stays on disk.
pub fn materialize<R: Read>(
    reader: R,
    destination: &Path,
) -> Result<MaterializeSummary, MaterializeError> {
    let root = destination
        .canonicalize()
        .map_err(|source| MaterializeError::Destination {
            path: destination.to_path_buf(),
            source,
        })?;

    let mut archive = tar::Archive::new(reader);
    let mut summary = MaterializeSummary::default();

    for entry in archive.entries().map_err(MaterializeError::Read)? {
        let mut entry = entry.map_err(MaterializeError::Read)?;
        match replay_entry(&mut entry, &root)? {
            Outcome::Written(bytes) => {
                summary.entries += 1;
                summary.bytes += bytes;
            }
            Outcome::Skipped => summary.skipped += 1,
        }
    }

    Ok(summary)
}

fn replay_entry<R: Read>(entry: &mut Entry<'_, R>, root: &Path) -> Result<Outcome, MaterializeError> {
    let name = entry.path().map_err(MaterializeError::Read)?.into_owned();
    let kind = entry.header().entry_type();
    let mode = (entry.header().mode().map_err(MaterializeError::Read)? & 0o777) | OWNER_RW;
    let link = entry
        .link_name()
        .map_err(MaterializeError::Read)?
        .map(Cow::into_owned);
    let (atime, mtime) = entry_times(entry);

    let Some(relative) = strip_root(&name) else {
        tracing::warn!(entry = %name.display(), "Skipping entry outside the image root");
        return Ok(Outcome::Skipped);
    };
    let dst = root.join(&relative);

    if !relative.as_os_str().is_empty() && !parent_within(root, &dst) {
        tracing::warn!(entry = %name.display(), "Skipping entry whose parent resolves outside the destination");
        return Ok(Outcome::Skipped);
    }

    let written = match kind {
        EntryType::Directory => {
            create_dir(&dst, mode)?;
            0
        }
        EntryType::Regular | EntryType::Continuous => write_file(entry, &dst, mode)?,
        EntryType::Symlink => {
            // Symlink targets are kept verbatim: they are interpreted inside the image.
            let target = link.ok_or_else(|| missing_link_target(&name))?;
            replace_non_dir(&dst)?;
            std::os::unix::fs::symlink(&target, &dst).map_err(|source| {
                MaterializeError::Symlink {
                    path: dst.clone(),
                    target,
                    source,
                }
            })?;
            0
        }
        EntryType::Link => {
            let target = link.ok_or_else(|| missing_link_target(&name))?;
            let Some(target_relative) = strip_root(&target) else {
                tracing::warn!(
                    entry = %name.display(),
                    target = %target.display(),
                    "Skipping hard link pointing outside the image root"
                );
                return Ok(Outcome::Skipped);
            };
            let target = root.join(target_relative);
            if !parent_within(root, &target) {
                tracing::warn!(
                    entry = %name.display(),
                    target = %target.display(),
                    "Skipping hard link whose target resolves outside the destination"
                );
                return Ok(Outcome::Skipped);
            }
            replace_non_dir(&dst)?;
            fs::hard_link(&target, &dst).map_err(|source| MaterializeError::Hardlink {
                path: dst.clone(),
                target,
                source,
            })?;
            0
        }
        other => {
            tracing::trace!(entry = %name.display(), kind = ?other, "Skipping special entry");
            return Ok(Outcome::Skipped);
        }
    };

    if let Some(mtime) = mtime {
        // Best effort; a failure here never fails the replay.
        let _ = filetime::set_symlink_file_times(&dst, atime.unwrap_or(mtime), mtime);
    }

    tracing::trace!(entry = %name.display(), "Materialized entry");
    Ok(Outcome::Written(written))
}

/// Drop the `rootfs/` marker and any leading `/` or `./`. Returns `None` for
/// names that would climb out of the destination.
pub fn strip_root(name: &Path) -> Option<PathBuf> {
    let name = name.strip_prefix(ROOTFS_DIR).unwrap_or(name);
    let mut relative = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(relative)
}

fn parent_within(root: &Path, dst: &Path) -> bool {
    match dst.parent().map(fs::canonicalize) {
        Some(Ok(parent)) => parent.starts_with(root),
        // A missing parent makes the create fail with a clearer error.
        _ => true,
    }
}

fn create_dir(dst: &Path, mode: u32) -> Result<(), MaterializeError> {
    match fs::DirBuilder::new().mode(mode).create(dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let is_dir = fs::symlink_metadata(dst)
                .map(|m| m.file_type().is_dir())
                .unwrap_or(false);
            if !is_dir {
                replace_non_dir(dst)?;
                return fs::DirBuilder::new()
                    .mode(mode)
                    .create(dst)
                    .map_err(|source| MaterializeError::CreateDir {
                        path: dst.to_path_buf(),
                        source,
                    });
            }
            fs::set_permissions(dst, Permissions::from_mode(mode)).map_err(|source| {
                MaterializeError::DirMode {
                    path: dst.to_path_buf(),
                    source,
                }
            })
        }
        Err(source) => Err(MaterializeError::CreateDir {
            path: dst.to_path_buf(),
            source,
        }),
    }
}

fn write_file<R: Read>(entry: &mut Entry<'_, R>, dst: &Path, mode: u32) -> Result<u64, MaterializeError> {
    // Never write through a symlink or a hard-linked inode left by an earlier entry.
    replace_non_dir(dst)?;

    let expected = entry.size();
    let written = {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(dst)
            .map_err(|source| MaterializeError::CreateFile {
                path: dst.to_path_buf(),
                source,
            })?;
        io::copy(entry, &mut file).map_err(|source| MaterializeError::WriteFile {
            path: dst.to_path_buf(),
            source,
        })?
    };

    if written != expected {
        return Err(MaterializeError::ShortWrite {
            path: dst.to_path_buf(),
            expected,
            written,
        });
    }
    Ok(written)
}

/// Remove whatever non-directory already sits at `dst`.
fn replace_non_dir(dst: &Path) -> Result<(), MaterializeError> {
    match fs::symlink_metadata(dst) {
        Ok(meta) if !meta.file_type().is_dir() => {
            fs::remove_file(dst).map_err(|source| MaterializeError::Replace {
                path: dst.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

fn missing_link_target(name: &Path) -> MaterializeError {
    MaterializeError::Read(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("link entry {} has no target", name.display()),
    ))
}

/// Access and modification times from the header, preferring PAX records.
fn entry_times<R: Read>(entry: &mut Entry<'_, R>) -> (Option<FileTime>, Option<FileTime>) {
    let header = entry.header();
    let mut mtime = header
        .mtime()
        .ok()
        .map(|secs| FileTime::from_unix_time(secs as i64, 0));
    let mut atime = header
        .as_gnu()
        .and_then(|gnu| gnu.atime().ok())
        .filter(|&secs| secs > 0)
        .map(|secs| FileTime::from_unix_time(secs as i64, 0));

    if let Ok(Some(extensions)) = entry.pax_extensions() {
        for extension in extensions.flatten() {
            let (Ok(key), Ok(value)) = (extension.key(), extension.value()) else {
                continue;
            };
            match key {
                "mtime" => mtime = parse_pax_time(value).or(mtime),
                "atime" => atime = parse_pax_time(value).or(atime),
                _ => {}
            }
        }
    }

    (atime, mtime)
}

/// PAX times are decimal seconds with an optional fraction (`1700000000.25`).
fn parse_pax_time(value: &str) -> Option<FileTime> {
    let (secs, fraction) = value.split_once('.').unwrap_or((value, ""));
    let secs: i64 = secs.parse().ok()?;
    let digits: String = fraction.chars().take(9).collect();
    let nanos = if digits.is_empty() {
        0
    } else {
        format!("{digits:0<9}").parse::<u32>().ok()?
    };
    Some(FileTime::from_unix_time(secs, nanos))
}
