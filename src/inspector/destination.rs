//! Where the extracted filesystem goes.

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// Temporary destinations go here; `/tmp` is frequently memory-backed.
pub const DEFAULT_TEMP_ROOT: &str = "/var/tmp";

pub const TEMP_DIR_PREFIX: &str = "image-inspector-";

const DIR_MODE: u32 = 0o755;

#[derive(Debug, thiserror::Error)]
pub enum DestinationError {
    #[error("unable to create destination path {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("destination path {path} exists and is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("unable to create temporary path under {root}: {source}")]
    Temp {
        root: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Filesystem operations used to set up the destination. Swappable so the
/// failure paths can be exercised.
pub trait DestinationDirs: Send + Sync {
    fn create_dir(&self, path: &Path) -> io::Result<()>;

    /// Create a fresh uniquely named directory under `root` and return it.
    fn create_temp_dir(&self, root: &Path, prefix: &str) -> io::Result<PathBuf>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsDestinationDirs;

impl DestinationDirs for FsDestinationDirs {
    fn create_dir(&self, path: &Path) -> io::Result<()> {
        DirBuilder::new().mode(DIR_MODE).create(path)
    }

    fn create_temp_dir(&self, root: &Path, prefix: &str) -> io::Result<PathBuf> {
        // The directory outlives this process; it is the inspection's output.
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(root)?;
        Ok(dir.keep())
    }
}

/// Use `requested` if given (an existing directory is fine), otherwise make a
/// new temporary directory under `temp_root`.
pub fn resolve(
    dirs: &dyn DestinationDirs,
    requested: Option<&Path>,
    temp_root: &Path,
) -> Result<PathBuf, DestinationError> {
    match requested {
        Some(path) => {
            match dirs.create_dir(path) {
                Ok(()) => tracing::debug!(destination = %path.display(), "Created destination"),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if !path.is_dir() {
                        return Err(DestinationError::NotADirectory {
                            path: path.to_path_buf(),
                        });
                    }
                }
                Err(source) => {
                    return Err(DestinationError::Create {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
            Ok(path.to_path_buf())
        }
        None => {
            let path = dirs
                .create_temp_dir(temp_root, TEMP_DIR_PREFIX)
                .map_err(|source| DestinationError::Temp {
                    root: temp_root.to_path_buf(),
                    source,
                })?;
            tracing::debug!(destination = %path.display(), "Created temporary destination");
            Ok(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Failing;

    impl DestinationDirs for Failing {
        fn create_dir(&self, _: &Path) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "MKFAIL"))
        }

        fn create_temp_dir(&self, _: &Path, _: &str) -> io::Result<PathBuf> {
            Err(io::Error::other("TEMPFAIL"))
        }
    }

    #[test]
    fn test_existing_dir_is_accepted() {
        let root = TempDir::new().unwrap();
        let path = resolve(&FsDestinationDirs, Some(root.path()), Path::new(DEFAULT_TEMP_ROOT))
            .unwrap();
        assert_eq!(path, root.path());
    }

    #[test]
    fn test_new_dir_is_created() {
        let root = TempDir::new().unwrap();
        let wanted = root.path().join("out");

        let path = resolve(&FsDestinationDirs, Some(&wanted), root.path()).unwrap();

        assert!(path.is_dir());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        // umask can only remove bits.
        assert_eq!(mode & !DIR_MODE, 0);
    }

    #[test]
    fn test_existing_file_is_rejected() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        let err = resolve(&FsDestinationDirs, Some(&file), root.path()).unwrap_err();

        assert!(matches!(err, DestinationError::NotADirectory { .. }));
    }

    #[test]
    fn test_temp_dir_under_root() {
        let root = TempDir::new().unwrap();

        let path = resolve(&FsDestinationDirs, None, root.path()).unwrap();

        assert!(path.is_dir());
        assert_eq!(path.parent(), Some(root.path()));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(TEMP_DIR_PREFIX));
    }

    #[test]
    fn test_failures_are_reported() {
        let err = resolve(&Failing, Some(Path::new("delete_me")), Path::new(DEFAULT_TEMP_ROOT))
            .unwrap_err();
        assert!(matches!(err, DestinationError::Create { .. }));
        assert!(err.to_string().contains("MKFAIL"));

        let err = resolve(&Failing, None, Path::new(DEFAULT_TEMP_ROOT)).unwrap_err();
        assert!(matches!(err, DestinationError::Temp { .. }));
    }
}
