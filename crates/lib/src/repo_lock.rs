//! File-based repository locking.
//!
//! Commits and removals take the exclusive lock; readers take the shared
//! lock or none at all (visibility is guaranteed by atomic renames, not by
//! locking). The lock file lives at `.lock` under the repository root and
//! carries JSON metadata about the holder so contention errors can name the
//! offending process.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::LOCK_TIMEOUT;

const LOCK_FILENAME: &str = ".lock";
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  pub root: PathBuf,
}

#[derive(Debug, Error)]
pub enum RepoLockError {
  #[error(
    "timed out waiting for the repository lock held by: {command} (PID {pid})\n\
     If no other r3 process is running, remove the lock file:\n  {lock_path}"
  )]
  Timeout {
    command: String,
    pid: u32,
    lock_path: PathBuf,
  },

  #[error(
    "timed out waiting for the repository lock (could not read lock metadata)\n\
     If no other r3 process is running, remove the lock file:\n  {lock_path}"
  )]
  TimeoutUnknown { lock_path: PathBuf },

  #[error("failed to open lock file {path}: {source}")]
  OpenFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

/// A held repository lock. Released on drop.
pub struct RepoLock {
  _file: File,
  lock_path: PathBuf,
}

impl RepoLock {
  /// Acquire the lock for a repository root, waiting up to the default
  /// timeout before surfacing contention to the caller.
  pub fn acquire(root: &Path, mode: LockMode, command: &str) -> Result<Self, RepoLockError> {
    Self::acquire_at(root.join(LOCK_FILENAME), mode, command, LOCK_TIMEOUT)
  }

  /// Acquire a lock at an explicit path, e.g. the per-clone git locks.
  pub fn acquire_at(
    lock_path: PathBuf,
    mode: LockMode,
    command: &str,
    timeout: Duration,
  ) -> Result<Self, RepoLockError> {
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(|e| RepoLockError::OpenFile {
        path: lock_path.clone(),
        source: e,
      })?;

    let deadline = Instant::now() + timeout;
    loop {
      match try_lock(&file, mode) {
        Ok(()) => break,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
          if Instant::now() >= deadline {
            return Err(Self::timeout_error(&lock_path));
          }
          std::thread::sleep(RETRY_INTERVAL);
        }
        Err(e) => return Err(RepoLockError::LockFailed(e)),
      }
    }

    if mode == LockMode::Exclusive {
      Self::write_metadata(&file, command, &lock_path)?;
    }

    Ok(RepoLock { _file: file, lock_path })
  }

  /// Reads the holder metadata back from the held file handle.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    use std::io::{Seek, SeekFrom};

    let mut file = &self._file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }

  fn write_metadata(file: &File, command: &str, lock_path: &Path) -> Result<(), RepoLockError> {
    let metadata = LockMetadata {
      version: 1,
      pid: std::process::id(),
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      command: command.to_string(),
      root: lock_path.parent().unwrap_or(Path::new("")).to_path_buf(),
    };

    file.set_len(0).map_err(RepoLockError::WriteMetadata)?;
    let mut writer = io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &metadata)
      .map_err(|e| RepoLockError::WriteMetadata(io::Error::other(e)))?;
    writer.flush().map_err(RepoLockError::WriteMetadata)?;

    Ok(())
  }

  fn timeout_error(lock_path: &Path) -> RepoLockError {
    if let Ok(mut file) = File::open(lock_path) {
      let mut contents = String::new();
      if file.read_to_string(&mut contents).is_ok() {
        if let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents) {
          return RepoLockError::Timeout {
            command: metadata.command,
            pid: metadata.pid,
            lock_path: lock_path.to_path_buf(),
          };
        }
      }
    }

    RepoLockError::TimeoutUnknown {
      lock_path: lock_path.to_path_buf(),
    }
  }
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::unix::io::AsFd;

  use rustix::fs::{FlockOperation, flock};

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

// Advisory locking is only enforced on Unix. Elsewhere the lock file still
// records the holder, and processes are assumed to cooperate.
#[cfg(not(unix))]
fn try_lock(_file: &File, _mode: LockMode) -> io::Result<()> {
  Ok(())
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  #[test]
  fn acquire_exclusive_lock() {
    let temp = TempDir::new().unwrap();
    let lock = RepoLock::acquire(temp.path(), LockMode::Exclusive, "test").unwrap();
    assert!(lock.lock_path().exists());
  }

  #[test]
  fn multiple_shared_locks() {
    let temp = TempDir::new().unwrap();
    let lock1 = RepoLock::acquire(temp.path(), LockMode::Shared, "read1").unwrap();
    let lock2 = RepoLock::acquire(temp.path(), LockMode::Shared, "read2").unwrap();
    assert!(lock1.lock_path().exists());
    assert!(lock2.lock_path().exists());
  }

  #[test]
  fn lock_metadata_written() {
    let temp = TempDir::new().unwrap();
    let lock = RepoLock::acquire(temp.path(), LockMode::Exclusive, "commit").unwrap();

    let metadata = lock.read_metadata().unwrap();
    assert_eq!(metadata.version, 1);
    assert_eq!(metadata.command, "commit");
    assert_eq!(metadata.pid, std::process::id());
  }

  #[test]
  fn lock_released_on_drop() {
    let temp = TempDir::new().unwrap();
    {
      let _lock = RepoLock::acquire(temp.path(), LockMode::Exclusive, "first").unwrap();
    }
    let lock2 = RepoLock::acquire(temp.path(), LockMode::Exclusive, "second").unwrap();
    assert!(lock2.lock_path().exists());
  }

  #[cfg(unix)]
  #[test]
  fn contended_lock_times_out_with_holder_info() {
    let temp = TempDir::new().unwrap();
    let _held = RepoLock::acquire(temp.path(), LockMode::Exclusive, "long-commit").unwrap();

    let result = RepoLock::acquire_at(
      temp.path().join(".lock"),
      LockMode::Exclusive,
      "second",
      Duration::from_millis(50),
    );

    match result {
      Err(RepoLockError::Timeout { command, pid, .. }) => {
        assert_eq!(command, "long-commit");
        assert_eq!(pid, std::process::id());
      }
      other => panic!("expected Timeout, got {:?}", other.map(|l| l.lock_path().to_path_buf())),
    }
  }
}
