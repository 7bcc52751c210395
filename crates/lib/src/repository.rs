//! The repository facade.
//!
//! A repository is a directory carrying an `r3.yaml` marker with the format
//! version, a `jobs/` tree of committed jobs, a `git/` tree of bare clones,
//! and an optional derived index. The root path is passed explicitly to
//! every operation; there is no process-wide state.
//!
//! Commits and removals serialize on the repository lock. Readers run
//! without a lock: every mutation becomes visible through a single atomic
//! rename, so a job is either fully present or absent.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::builder::{BuildError, JobBuilder};
use crate::checkout::{self, CheckoutError};
use crate::config::{ConfigError, JobConfig};
use crate::consts::{CONFIG_FILE, FORMAT_VERSION, GIT_DIR, JOBS_DIR};
use crate::dependency::Dependency;
use crate::hash::JobId;
use crate::index::{Index, IndexError};
use crate::repo_lock::{LockMode, RepoLock, RepoLockError};
use crate::resolver::{self, QuerySelect, ResolveError};
use crate::store::git::{GitCache, GitError};
use crate::store::{Store, StoreError};

pub use crate::store::CommitReceipt;

#[derive(Debug, Error)]
pub enum RepositoryError {
  #[error("no such directory: {0}")]
  NotFound(PathBuf),

  #[error("not a directory: {0}")]
  NotADirectory(PathBuf),

  #[error("not an r3 repository (missing {CONFIG_FILE}): {0}")]
  MissingMarker(PathBuf),

  #[error("path exists already: {0}")]
  AlreadyExists(PathBuf),

  #[error("unsupported repository version `{found}`; this build reads major version {major}")]
  Version { found: String, major: u64 },

  #[error(transparent)]
  Lock(#[from] RepoLockError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Checkout(#[from] CheckoutError),

  #[error(transparent)]
  Git(#[from] GitError),

  #[error(transparent)]
  Index(#[from] IndexError),

  #[error("failed to {action} {path}: {source}")]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// The repository marker document at `<root>/r3.yaml`.
#[derive(Debug, Serialize, Deserialize)]
struct Marker {
  version: String,
}

pub struct Repository {
  root: PathBuf,
}

impl Repository {
  /// Create a new repository. The path must not exist yet.
  pub fn init(path: &Path) -> Result<Self, RepositoryError> {
    if path.exists() {
      return Err(RepositoryError::AlreadyExists(path.to_path_buf()));
    }

    fs::create_dir_all(path.join(JOBS_DIR)).map_err(|e| io_error("create", path, e))?;
    fs::create_dir_all(path.join(GIT_DIR)).map_err(|e| io_error("create", path, e))?;

    let marker = Marker {
      version: FORMAT_VERSION.to_string(),
    };
    let text = serde_yaml::to_string(&marker).expect("marker serializes");
    fs::write(path.join(CONFIG_FILE), text).map_err(|e| io_error("write", path, e))?;

    info!(path = %path.display(), "initialized repository");
    Ok(Repository {
      root: path.to_path_buf(),
    })
  }

  /// Open an existing repository, verifying the marker and sweeping any
  /// stale staging directories left by cancelled commits.
  pub fn open(path: &Path) -> Result<Self, RepositoryError> {
    if !path.exists() {
      return Err(RepositoryError::NotFound(path.to_path_buf()));
    }
    if !path.is_dir() {
      return Err(RepositoryError::NotADirectory(path.to_path_buf()));
    }

    let marker_path = path.join(CONFIG_FILE);
    let text = match fs::read_to_string(&marker_path) {
      Ok(text) => text,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        return Err(RepositoryError::MissingMarker(path.to_path_buf()));
      }
      Err(e) => return Err(io_error("read", &marker_path, e)),
    };
    let marker: Marker = serde_yaml::from_str(&text).map_err(|e| {
      RepositoryError::Config(ConfigError::Yaml {
        path: marker_path.clone(),
        source: e,
      })
    })?;

    let supported_major = major_version(FORMAT_VERSION);
    if major_version(&marker.version) != supported_major {
      return Err(RepositoryError::Version {
        found: marker.version,
        major: supported_major,
      });
    }

    let repository = Repository {
      root: path.to_path_buf(),
    };
    repository.store().sweep_staging();
    Ok(repository)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn store(&self) -> Store {
    Store::new(&self.root)
  }

  fn git(&self) -> GitCache {
    GitCache::new(&self.root)
  }

  fn index(&self) -> Index {
    Index::new(&self.root)
  }

  /// Commit a staged job directory with default (unambiguous) query
  /// semantics.
  pub fn commit(&self, staged: &Path) -> Result<CommitReceipt, RepositoryError> {
    self.commit_with(staged, QuerySelect::One)
  }

  /// Commit a staged job directory.
  ///
  /// Resolves dependencies (queries through the index, symbolic git refs
  /// to full object ids), verifies every dependency exists, computes the
  /// job identity, and places the job atomically. Committing content that
  /// is already present succeeds without touching the store.
  pub fn commit_with(&self, staged: &Path, select: QuerySelect) -> Result<CommitReceipt, RepositoryError> {
    let _lock = RepoLock::acquire(&self.root, LockMode::Exclusive, "commit")?;
    let store = self.store();
    let git = self.git();
    store.sweep_staging();

    let mut config = JobConfig::load(staged)?;
    let resolved = resolver::resolve_dependencies(config.dependencies(), &self.index(), &git, select)?;

    for dep in &resolved {
      match dep {
        Dependency::Job(job_dep) => {
          if !store.contains(&job_dep.job) {
            return Err(ResolveError::MissingJob(job_dep.job.clone()).into());
          }
        }
        Dependency::Git(git_dep) => {
          git.ensure_commit(&git_dep.repository, &git_dep.commit)?;
        }
        Dependency::Query(_) => unreachable!("queries are expanded by resolve_dependencies"),
      }
    }
    config.set_dependencies(resolved);

    let built = JobBuilder::new(staged)
      .store_jobs_dir(&store.jobs_dir())
      .build_with_config(config)?;
    let receipt = store.place(&built, staged)?;

    if !receipt.already_present {
      // Pins go in after the rename: a reader that sees the job may
      // briefly race the tag, never the other way around.
      for dep in built.config.dependencies() {
        if let Dependency::Git(git_dep) = dep {
          git.pin(&git_dep.repository, &git_dep.commit, &receipt.id)?;
        }
      }

      // The index is a cache; losing a notification only costs a
      // rebuild later.
      if let Some(entry) = Index::entry_for(&store, &receipt.id) {
        if let Err(e) = self.index().add(&receipt.id, entry) {
          warn!(id = %receipt.id, error = %e, "index notification failed");
        }
      }
    }

    Ok(receipt)
  }

  /// Materialize a committed job into `target`.
  pub fn checkout(&self, id: &JobId, target: &Path) -> Result<(), RepositoryError> {
    checkout::checkout(&self.store(), &self.git(), id, target)?;
    Ok(())
  }

  /// Remove a committed job, refusing while other jobs depend on it.
  pub fn remove(&self, id: &JobId) -> Result<(), RepositoryError> {
    let _lock = RepoLock::acquire(&self.root, LockMode::Exclusive, "remove")?;
    self.store().remove(id, &self.git())?;
    if let Err(e) = self.index().remove(id) {
      warn!(id = %id, error = %e, "index notification failed");
    }
    Ok(())
  }

  /// Recompute a job's identity and compare it with its id.
  pub fn verify(&self, id: &JobId) -> Result<(), RepositoryError> {
    self.store().verify(id)?;
    Ok(())
  }

  /// Fetch new history for a cached repository, keeping every pin intact.
  pub fn pull(&self, url: &str) -> Result<(), RepositoryError> {
    self.git().pull(url)?;
    Ok(())
  }

  /// Rebuild the derived index by scanning `jobs/`. Returns the entry
  /// count.
  pub fn rebuild_index(&self) -> Result<usize, RepositoryError> {
    Ok(self.index().rebuild(&self.store())?)
  }

  /// Jobs whose metadata tags include every given tag, oldest first.
  pub fn find(&self, tags: &[String]) -> Result<Vec<JobId>, RepositoryError> {
    let matches = self.index().find(tags)?;
    Ok(matches.into_iter().map(|(id, _)| id).collect())
  }

  /// All committed job ids, sorted.
  pub fn jobs(&self) -> Result<Vec<JobId>, RepositoryError> {
    Ok(self.store().job_ids()?)
  }
}

fn major_version(version: &str) -> u64 {
  version
    .split(['.', '-'])
    .next()
    .and_then(|s| s.parse().ok())
    .unwrap_or(0)
}

fn io_error(action: &'static str, path: &Path, source: io::Error) -> RepositoryError {
  RepositoryError::Io {
    action,
    path: path.to_path_buf(),
    source,
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;
  use crate::immutable;

  fn init_repo() -> (TempDir, Repository) {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("repo");
    let repository = Repository::init(&root).unwrap();
    (temp, repository)
  }

  fn stage(parent: &Path, files: &[(&str, &str)]) -> PathBuf {
    let staged = parent.join("staged");
    let _ = fs::remove_dir_all(&staged);
    for (path, content) in files {
      let full = staged.join(path);
      fs::create_dir_all(full.parent().unwrap()).unwrap();
      fs::write(full, content).unwrap();
    }
    staged
  }

  fn cleanup(repository: &Repository) {
    for id in repository.jobs().unwrap() {
      let _ = immutable::unprotect_job(&repository.store().job_path(&id));
    }
  }

  #[test]
  fn init_creates_marker_and_layout() {
    let (_temp, repository) = init_repo();
    assert!(repository.root().join("r3.yaml").is_file());
    assert!(repository.root().join("jobs").is_dir());
    assert!(repository.root().join("git").is_dir());

    // Re-opening succeeds; re-initializing does not.
    Repository::open(repository.root()).unwrap();
    assert!(matches!(
      Repository::init(repository.root()),
      Err(RepositoryError::AlreadyExists(_))
    ));
  }

  #[test]
  fn open_rejects_non_repositories() {
    let temp = TempDir::new().unwrap();
    assert!(matches!(
      Repository::open(&temp.path().join("missing")),
      Err(RepositoryError::NotFound(_))
    ));
    assert!(matches!(
      Repository::open(temp.path()),
      Err(RepositoryError::MissingMarker(_))
    ));
  }

  #[test]
  fn open_rejects_unknown_major_version() {
    let (_temp, repository) = init_repo();
    fs::write(repository.root().join("r3.yaml"), "version: 2.0.0\n").unwrap();

    assert!(matches!(
      Repository::open(repository.root()),
      Err(RepositoryError::Version { .. })
    ));
  }

  #[test]
  fn open_tolerates_unknown_marker_keys() {
    let (_temp, repository) = init_repo();
    fs::write(
      repository.root().join("r3.yaml"),
      "version: 1.0.0\ncreated_by: some-other-tool\n",
    )
    .unwrap();

    Repository::open(repository.root()).unwrap();
  }

  #[test]
  fn commit_and_verify_roundtrip() {
    let (temp, repository) = init_repo();
    let staged = stage(temp.path(), &[("r3.yaml", "parameters:\n  name: World\n"), ("run.py", "print('hi')\n")]);

    let receipt = repository.commit(&staged).unwrap();
    assert!(!receipt.already_present);
    repository.verify(&receipt.id).unwrap();
    assert_eq!(repository.jobs().unwrap(), vec![receipt.id.clone()]);

    cleanup(&repository);
  }

  #[test]
  fn commit_rejects_missing_job_dependency() {
    let (temp, repository) = init_repo();
    let ghost = crate::hash::hash_bytes(b"ghost");
    let manifest = format!("dependencies:\n  - job: {ghost}\n    destination: data\n");
    let staged = stage(temp.path(), &[("r3.yaml", &manifest), ("run.py", "x\n")]);

    let result = repository.commit(&staged);
    assert!(matches!(
      result,
      Err(RepositoryError::Resolve(ResolveError::MissingJob(_)))
    ));
  }

  #[test]
  fn commit_notifies_the_index() {
    let (temp, repository) = init_repo();
    let staged = stage(
      temp.path(),
      &[("r3.yaml", ""), ("run.py", "x\n"), ("metadata.yaml", "tags: [baseline]\n")],
    );

    let receipt = repository.commit(&staged).unwrap();
    assert_eq!(repository.find(&["baseline".into()]).unwrap(), vec![receipt.id.clone()]);

    cleanup(&repository);
  }

  #[test]
  fn rebuild_index_recovers_from_scratch() {
    let (temp, repository) = init_repo();
    let staged = stage(
      temp.path(),
      &[("r3.yaml", ""), ("run.py", "x\n"), ("metadata.yaml", "tags: [baseline]\n")],
    );
    let receipt = repository.commit(&staged).unwrap();

    fs::remove_file(repository.root().join("index.yaml")).unwrap();
    assert_eq!(repository.rebuild_index().unwrap(), 1);
    assert_eq!(repository.find(&["baseline".into()]).unwrap(), vec![receipt.id.clone()]);

    cleanup(&repository);
  }

  #[test]
  fn remove_updates_index() {
    let (temp, repository) = init_repo();
    let staged = stage(
      temp.path(),
      &[("r3.yaml", ""), ("run.py", "x\n"), ("metadata.yaml", "tags: [gone]\n")],
    );
    let receipt = repository.commit(&staged).unwrap();

    repository.remove(&receipt.id).unwrap();
    assert!(repository.jobs().unwrap().is_empty());
    assert!(repository.find(&["gone".into()]).unwrap().is_empty());
  }
}
