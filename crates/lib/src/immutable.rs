//! Write-protection for committed jobs.
//!
//! After commit, every file in a job is made read-only except
//! `metadata.yaml` and the contents of `output/`, which stay mutable for
//! the job's whole lifetime. Filesystem permissions are the only mutation
//! barrier; cooperating processes are assumed to honor them.
//!
//! On Unix, files become 0444 (0555 when executable) and directories 0555;
//! `output/` keeps 0755 so results can still be written into it. Elsewhere
//! the read-only flag is set on files, best-effort.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::consts::{METADATA_FILE, OUTPUT_DIR};

#[derive(Debug, Error)]
pub enum ImmutableError {
  #[error("failed to set permissions on {path}: {source}")]
  SetPermissions {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to read metadata for {path}: {source}")]
  Metadata {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to traverse directory {path}: {source}")]
  WalkDir {
    path: String,
    #[source]
    source: walkdir::Error,
  },
}

/// Write-protect a committed job directory, sparing the mutable paths.
///
/// Entries that fail to change are logged and skipped; protection is
/// best-effort on filesystems that do not support it.
pub fn protect_job(path: &Path) -> Result<(), ImmutableError> {
  debug!(path = ?path, "write-protecting job");

  // Deepest entries first so directories are restricted after their
  // contents.
  for entry in WalkDir::new(path).contents_first(true) {
    let entry = entry.map_err(|e| ImmutableError::WalkDir {
      path: path.display().to_string(),
      source: e,
    })?;

    if is_mutable_path(path, entry.path()) {
      continue;
    }

    if let Err(e) = set_entry_readonly(entry.path(), true) {
      warn!(path = ?entry.path(), error = %e, "failed to write-protect, continuing");
    }
  }

  Ok(())
}

/// Restore write permissions on a job directory, e.g. before removal.
pub fn unprotect_job(path: &Path) -> Result<(), ImmutableError> {
  debug!(path = ?path, "restoring write permissions");

  // Directories before contents so the walk can descend.
  for entry in WalkDir::new(path) {
    let entry = entry.map_err(|e| ImmutableError::WalkDir {
      path: path.display().to_string(),
      source: e,
    })?;

    if let Err(e) = set_entry_readonly(entry.path(), false) {
      warn!(path = ?entry.path(), error = %e, "failed to restore permissions, continuing");
    }
  }

  Ok(())
}

/// Whether a path inside a job stays mutable: `metadata.yaml` and the whole
/// `output/` subtree.
fn is_mutable_path(job_root: &Path, path: &Path) -> bool {
  let Ok(rel) = path.strip_prefix(job_root) else {
    return false;
  };
  let mut components = rel.components();
  match components.next() {
    Some(first) => {
      let name = first.as_os_str();
      name == METADATA_FILE || name == OUTPUT_DIR
    }
    None => false,
  }
}

#[cfg(unix)]
fn set_entry_readonly(path: &Path, readonly: bool) -> Result<(), ImmutableError> {
  use std::os::unix::fs::PermissionsExt;

  let metadata = std::fs::symlink_metadata(path).map_err(|e| ImmutableError::Metadata {
    path: path.display().to_string(),
    source: e,
  })?;
  if metadata.file_type().is_symlink() {
    return Ok(());
  }

  let current_mode = metadata.permissions().mode();
  let executable = metadata.is_dir() || (current_mode & 0o111 != 0);
  let new_mode = match (readonly, executable) {
    (true, true) => 0o555,
    (true, false) => 0o444,
    (false, true) => 0o755,
    (false, false) => 0o644,
  };

  let mut perms = metadata.permissions();
  perms.set_mode(new_mode);
  std::fs::set_permissions(path, perms).map_err(|e| ImmutableError::SetPermissions {
    path: path.display().to_string(),
    source: e,
  })
}

#[cfg(not(unix))]
fn set_entry_readonly(path: &Path, readonly: bool) -> Result<(), ImmutableError> {
  let metadata = std::fs::symlink_metadata(path).map_err(|e| ImmutableError::Metadata {
    path: path.display().to_string(),
    source: e,
  })?;
  if metadata.is_dir() || metadata.file_type().is_symlink() {
    return Ok(());
  }

  let mut perms = metadata.permissions();
  perms.set_readonly(readonly);
  std::fs::set_permissions(path, perms).map_err(|e| ImmutableError::SetPermissions {
    path: path.display().to_string(),
    source: e,
  })
}

#[cfg(test)]
mod tests {
  use std::fs;

  use tempfile::TempDir;

  use super::*;

  fn job_fixture() -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("r3.yaml"), "parameters: {}\n").unwrap();
    fs::write(temp.path().join("run.py"), "print('hi')\n").unwrap();
    fs::write(temp.path().join("metadata.yaml"), "").unwrap();
    fs::create_dir(temp.path().join("output")).unwrap();
    fs::create_dir(temp.path().join("src")).unwrap();
    fs::write(temp.path().join("src/util.py"), "x = 1\n").unwrap();
    temp
  }

  /// Whether this filesystem denies writes to read-only files. Running as
  /// root bypasses permission checks, in which case denial assertions are
  /// skipped.
  fn enforces_readonly() -> bool {
    let temp = TempDir::new().unwrap();
    let probe = temp.path().join("probe");
    fs::write(&probe, "x").unwrap();
    let mut perms = fs::metadata(&probe).unwrap().permissions();
    perms.set_readonly(true);
    fs::set_permissions(&probe, perms).unwrap();
    let denied = fs::write(&probe, "y").is_err();
    let mut perms = fs::metadata(&probe).unwrap().permissions();
    perms.set_readonly(false);
    fs::set_permissions(&probe, perms).unwrap();
    denied
  }

  #[test]
  fn hashed_files_become_readonly() {
    let job = job_fixture();
    protect_job(job.path()).unwrap();

    assert!(fs::metadata(job.path().join("r3.yaml")).unwrap().permissions().readonly());
    assert!(fs::metadata(job.path().join("run.py")).unwrap().permissions().readonly());
    assert!(fs::metadata(job.path().join("src/util.py")).unwrap().permissions().readonly());

    if enforces_readonly() {
      assert!(fs::write(job.path().join("run.py"), "tampered").is_err());
    }

    unprotect_job(job.path()).unwrap();
  }

  #[test]
  fn metadata_and_output_stay_mutable() {
    let job = job_fixture();
    protect_job(job.path()).unwrap();

    fs::write(job.path().join("metadata.yaml"), "tags: [done]\n").unwrap();
    fs::write(job.path().join("output/result.txt"), "42\n").unwrap();

    unprotect_job(job.path()).unwrap();
  }

  #[cfg(unix)]
  #[test]
  fn directories_disallow_writes() {
    use std::os::unix::fs::PermissionsExt;

    let job = job_fixture();
    protect_job(job.path()).unwrap();

    let mode = fs::metadata(job.path().join("src")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o555);
    if enforces_readonly() {
      // Creating a new entry inside the job root is denied.
      assert!(fs::write(job.path().join("new-file"), "x").is_err());
    }

    unprotect_job(job.path()).unwrap();
  }

  #[cfg(unix)]
  #[test]
  fn executables_keep_their_execute_bit() {
    use std::os::unix::fs::PermissionsExt;

    let job = job_fixture();
    let script = job.path().join("run.sh");
    fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
    let mut perms = fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script, perms).unwrap();

    protect_job(job.path()).unwrap();
    let mode = fs::metadata(&script).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o555);

    unprotect_job(job.path()).unwrap();
  }

  #[test]
  fn unprotect_restores_writes() {
    let job = job_fixture();
    protect_job(job.path()).unwrap();
    unprotect_job(job.path()).unwrap();

    fs::write(job.path().join("run.py"), "modified").unwrap();
  }
}
