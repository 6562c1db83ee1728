//! Owner-only file primitives.
//!
//! Every identity and credential file the agent persists goes through this module:
//! - directories are created and restricted to the agent's own account
//! - files are written to a sibling temp file, synced, restricted, then renamed over the
//!   target, so a reader sees either the old document or the new one
//! - reads treat a missing file as absent and refuse to follow symlinks

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::FileStoreError;

/// Permission bits for secret files.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Permission bits for owner-executable scripts.
pub const PRIVATE_EXEC_MODE: u32 = 0o700;

/// Permission bits for private directories.
pub const PRIVATE_DIR_MODE: u32 = 0o700;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> FileStoreError + '_ {
    move |source| FileStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Create `path` (and parents) and restrict the leaf directory to the current user.
pub fn ensure_private_dir(path: &Path) -> Result<(), FileStoreError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            return Err(FileStoreError::Symlink {
                path: path.to_path_buf(),
            });
        }
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path).map_err(io_error(path))?;
        }
        Err(err) => return Err(io_error(path)(err)),
    }
    restrict_to_owner(path, PRIVATE_DIR_MODE)
}

/// Atomically replace `path` with `contents`, readable only by the current user.
///
/// The parent directory must already exist.
pub fn write_private_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), FileStoreError> {
    let dir = path.parent().ok_or_else(|| FileStoreError::NoParent {
        path: path.to_path_buf(),
    })?;
    let prefix = format!(
        ".{}.",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );

    let mut temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(io_error(path))?;
    // The temp file must be private before secret bytes land in it.
    restrict_to_owner(temp.path(), mode)?;
    temp.write_all(contents).map_err(io_error(path))?;
    temp.as_file().sync_all().map_err(io_error(path))?;
    temp.persist(path).map_err(|err| FileStoreError::Io {
        path: path.to_path_buf(),
        source: err.error,
    })?;
    restrict_to_owner(path, mode)?;

    #[cfg(unix)]
    {
        if let Ok(dir) = fs::File::open(dir) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Read a private file. A missing file is `Ok(None)`.
pub fn read_private(path: &Path) -> Result<Option<Vec<u8>>, FileStoreError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(FileStoreError::Symlink {
            path: path.to_path_buf(),
        }),
        Ok(_) => fs::read(path).map(Some).map_err(io_error(path)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error(path)(err)),
    }
}

/// Delete a file. A missing file is success.
pub fn remove_file(path: &Path) -> Result<(), FileStoreError> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(io_error(path)(err)),
        _ => Ok(()),
    }
}

/// Delete a directory tree. A missing directory is success.
pub fn remove_tree(path: &Path) -> Result<(), FileStoreError> {
    match fs::remove_dir_all(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(io_error(path)(err)),
        _ => Ok(()),
    }
}

/// Whether a directory exists and has at least one entry.
pub fn dir_has_entries(path: &Path) -> Result<bool, FileStoreError> {
    let mut entries = fs::read_dir(path).map_err(io_error(path))?;
    Ok(entries.next().is_some())
}

/// Names of the temp files an interrupted [`write_private_atomic`] may leave behind in `dir`.
pub fn stale_temp_files(dir: &Path) -> Result<Vec<PathBuf>, FileStoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error(dir)(err)),
    };
    let mut stale = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_error(dir))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') && name.ends_with(".tmp") {
            stale.push(entry.path());
        }
    }
    stale.sort();
    Ok(stale)
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path, mode: u32) -> Result<(), FileStoreError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
        FileStoreError::Permissions {
            path: path.to_path_buf(),
            reason: source.to_string(),
        }
    })
}

#[cfg(windows)]
fn restrict_to_owner(path: &Path, _mode: u32) -> Result<(), FileStoreError> {
    use std::process::Command;

    let user = std::env::var("USERNAME").map_err(|_| FileStoreError::Permissions {
        path: path.to_path_buf(),
        reason: "USERNAME is not set".to_string(),
    })?;
    let grant = if path.is_dir() {
        format!("{user}:(OI)(CI)F")
    } else {
        format!("{user}:F")
    };
    let output = Command::new("icacls")
        .arg(path)
        .args(["/inheritance:r", "/grant:r", &grant])
        .output()
        .map_err(|source| FileStoreError::Permissions {
            path: path.to_path_buf(),
            reason: source.to_string(),
        })?;
    if !output.status.success() {
        return Err(FileStoreError::Permissions {
            path: path.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
