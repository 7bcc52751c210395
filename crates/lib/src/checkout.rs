//! The checkout engine: materialize a committed job into a working
//! directory.
//!
//! Payload files are copied (never linked) so edits in a checkout can not
//! corrupt the store. `output/` becomes a symlink back into the committed
//! job, so results written by a run land in the repository. Dependencies
//! become symlinks: job dependencies point into `jobs/<id>/<source>`, git
//! dependencies into a per-commit checkout of the bare clone.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ConfigError, JobConfig};
use crate::consts::{METADATA_FILE, OUTPUT_DIR};
use crate::dependency::Dependency;
use crate::hash::JobId;
use crate::store::Store;
use crate::store::git::{GitCache, GitError};

#[derive(Debug, Error)]
pub enum CheckoutError {
  #[error("target path `{0}` exists already")]
  Conflict(PathBuf),

  #[error("job `{0}` not found")]
  JobNotFound(JobId),

  #[error("missing dependency `{destination}`: job `{job}` is not in the repository")]
  MissingDependency { destination: String, job: JobId },

  #[error("dangling dependency `{destination}`: `{path}` does not exist")]
  DanglingSymlink { destination: String, path: PathBuf },

  #[error("dependency `{0}` is unresolved; the committed manifest is corrupt")]
  Unresolved(String),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Git(#[from] GitError),

  #[error("failed to {action} {path}: {source}")]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Materialize the job `id` into `target`, which must not exist yet.
pub fn checkout(store: &Store, git: &GitCache, id: &JobId, target: &Path) -> Result<(), CheckoutError> {
  let job_path = store.job_path(id);
  if !job_path.is_dir() {
    return Err(CheckoutError::JobNotFound(id.clone()));
  }
  if target.exists() {
    return Err(CheckoutError::Conflict(target.to_path_buf()));
  }

  if let Some(parent) = target.parent() {
    fs::create_dir_all(parent).map_err(|e| io_error("create", parent, e))?;
  }
  fs::create_dir(target).map_err(|e| match e.kind() {
    io::ErrorKind::AlreadyExists => CheckoutError::Conflict(target.to_path_buf()),
    _ => io_error("create", target, e),
  })?;

  let config = JobConfig::load(&job_path)?;

  // Copy every hashed file, read-only permissions included.
  if let Some(files) = config.files() {
    for rel in files.keys() {
      let source = job_path.join(rel);
      let destination = target.join(rel);
      if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error("create", parent, e))?;
      }
      fs::copy(&source, &destination).map_err(|e| io_error("copy", &source, e))?;
    }
  }

  // Results keep flowing into the store through the output symlink.
  symlink(&job_path.join(OUTPUT_DIR), &target.join(OUTPUT_DIR))?;

  for dep in config.dependencies() {
    checkout_dependency(store, git, dep, target)?;
  }

  // Annotations travel with the checkout, writable again.
  let metadata_source = job_path.join(METADATA_FILE);
  if metadata_source.is_file() {
    let metadata_target = target.join(METADATA_FILE);
    fs::copy(&metadata_source, &metadata_target).map_err(|e| io_error("copy", &metadata_source, e))?;
    let mut perms = fs::metadata(&metadata_target)
      .map_err(|e| io_error("inspect", &metadata_target, e))?
      .permissions();
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      perms.set_mode(0o644);
    }
    #[cfg(not(unix))]
    perms.set_readonly(false);
    fs::set_permissions(&metadata_target, perms).map_err(|e| io_error("chmod", &metadata_target, e))?;
  }

  info!(id = %id, target = %target.display(), "checked out job");
  Ok(())
}

fn checkout_dependency(
  store: &Store,
  git: &GitCache,
  dep: &Dependency,
  target: &Path,
) -> Result<(), CheckoutError> {
  let (link_source, destination) = match dep {
    Dependency::Job(job_dep) => {
      if !store.contains(&job_dep.job) {
        return Err(CheckoutError::MissingDependency {
          destination: job_dep.destination.to_string(),
          job: job_dep.job.clone(),
        });
      }
      let source = job_dep.source.join_onto(&store.job_path(&job_dep.job));
      if !source.exists() {
        return Err(CheckoutError::DanglingSymlink {
          destination: job_dep.destination.to_string(),
          path: source,
        });
      }
      (source, &job_dep.destination)
    }
    Dependency::Git(git_dep) => {
      let worktree = git.commit_checkout(&git_dep.repository, &git_dep.commit)?;
      let source = git_dep.source.join_onto(&worktree);
      if !source.exists() {
        return Err(CheckoutError::DanglingSymlink {
          destination: git_dep.destination.to_string(),
          path: source,
        });
      }
      (source, &git_dep.destination)
    }
    Dependency::Query(query_dep) => {
      return Err(CheckoutError::Unresolved(query_dep.destination.to_string()));
    }
  };

  let link_path = destination.join_onto(target);
  if let Some(parent) = link_path.parent() {
    fs::create_dir_all(parent).map_err(|e| io_error("create", parent, e))?;
  }
  debug!(destination = %destination, source = %link_source.display(), "linking dependency");
  symlink(&link_source, &link_path)?;
  Ok(())
}

#[cfg(unix)]
fn symlink(source: &Path, link: &Path) -> Result<(), CheckoutError> {
  std::os::unix::fs::symlink(source, link).map_err(|e| io_error("symlink", link, e))
}

#[cfg(windows)]
fn symlink(source: &Path, link: &Path) -> Result<(), CheckoutError> {
  if source.is_dir() {
    std::os::windows::fs::symlink_dir(source, link).map_err(|e| io_error("symlink", link, e))
  } else {
    std::os::windows::fs::symlink_file(source, link).map_err(|e| io_error("symlink", link, e))
  }
}

fn io_error(action: &'static str, path: &Path, source: io::Error) -> CheckoutError {
  CheckoutError::Io {
    action,
    path: path.to_path_buf(),
    source,
  }
}
