//! The repository store: owns `jobs/` and `git/`.
//!
//! Layout:
//! ```text
//! <repo>/
//! ├── r3.yaml                  # repository marker {version}
//! ├── index.yaml               # derived cache (optional)
//! ├── git/<host>/<owner>/<name>/   # bare clones, pin tags r3/<id>
//! └── jobs/<id>/
//!     ├── r3.yaml              # frozen manifest (ro)
//!     ├── metadata.yaml        # mutable annotations
//!     ├── output/              # mutable results
//!     └── <payload files>      # ro
//! ```
//!
//! A job directory is either fully present or absent: commits assemble the
//! payload in a `jobs/.staging-<nonce>/` sibling and publish it with a
//! single atomic rename. Crashed commits leave only staging directories,
//! which are swept on the next repository open.

pub mod git;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::builder::{BuiltJob, JobBuilder};
use crate::config::{ConfigError, JobConfig};
use crate::consts::{CONFIG_FILE, JOBS_DIR, METADATA_FILE, OUTPUT_DIR, STAGING_MAX_AGE, STAGING_PREFIX};
use crate::dependency::Dependency;
use crate::hash::JobId;
use crate::immutable::{self, ImmutableError};

use self::git::{GitCache, GitError};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("job `{0}` not found")]
  JobNotFound(JobId),

  #[error("cannot remove job `{id}`: other jobs depend on it:\n{dependents}")]
  JobReferenced { id: JobId, dependents: String },

  #[error("integrity error for job `{id}`: {detail}")]
  Integrity { id: JobId, detail: String },

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Immutable(#[from] ImmutableError),

  #[error(transparent)]
  Git(#[from] GitError),

  #[error("failed to serialize manifest: {0}")]
  Serialize(#[from] serde_yaml::Error),

  #[error("failed to {action} {path}: {source}")]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Outcome of a commit: the job id, and whether the job already existed
/// (content-addressed dedup makes that a success, not a conflict).
#[derive(Debug, Clone)]
pub struct CommitReceipt {
  pub id: JobId,
  pub already_present: bool,
}

/// Filesystem-level operations on `jobs/`. Callers serialize mutations via
/// the repository lock; readers need no lock because placement is atomic.
pub struct Store {
  root: PathBuf,
}

impl Store {
  pub fn new(root: &Path) -> Self {
    Store {
      root: root.to_path_buf(),
    }
  }

  pub fn jobs_dir(&self) -> PathBuf {
    self.root.join(JOBS_DIR)
  }

  pub fn job_path(&self, id: &JobId) -> PathBuf {
    self.jobs_dir().join(id.as_str())
  }

  pub fn contains(&self, id: &JobId) -> bool {
    self.job_path(id).is_dir()
  }

  /// All committed job ids, sorted. Entries that do not parse as ids
  /// (staging directories, stray files) are skipped.
  pub fn job_ids(&self) -> Result<Vec<JobId>, StoreError> {
    let jobs_dir = self.jobs_dir();
    let entries = match fs::read_dir(&jobs_dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => {
        return Err(StoreError::Io {
          action: "read",
          path: jobs_dir,
          source: e,
        });
      }
    };

    let mut ids = Vec::new();
    for entry in entries {
      let entry = entry.map_err(|e| StoreError::Io {
        action: "read",
        path: jobs_dir.clone(),
        source: e,
      })?;
      if let Some(name) = entry.file_name().to_str() {
        if let Ok(id) = JobId::parse(name) {
          ids.push(id);
        }
      }
    }
    ids.sort();
    Ok(ids)
  }

  /// Place a built job into the store.
  ///
  /// Writes the frozen manifest, the payload, an empty `output/`, and the
  /// staged `metadata.yaml` (or an empty one) into a staging sibling,
  /// write-protects it, and publishes it with an atomic rename. Committing
  /// an id that already exists is a no-op success.
  pub fn place(&self, built: &BuiltJob, staged_dir: &Path) -> Result<CommitReceipt, StoreError> {
    let target = self.job_path(&built.id);
    if target.is_dir() {
      debug!(id = %built.id, "job exists already");
      return Ok(CommitReceipt {
        id: built.id.clone(),
        already_present: true,
      });
    }

    let staging = self.jobs_dir().join(format!("{STAGING_PREFIX}{}", nonce()));
    fs::create_dir_all(&staging).map_err(|e| StoreError::Io {
      action: "create",
      path: staging.clone(),
      source: e,
    })?;

    let result = self.populate_staging(built, staged_dir, &staging);
    if let Err(e) = result {
      let _ = immutable::unprotect_job(&staging);
      let _ = fs::remove_dir_all(&staging);
      return Err(e);
    }

    if let Err(e) = fs::rename(&staging, &target) {
      let _ = immutable::unprotect_job(&staging);
      let _ = fs::remove_dir_all(&staging);
      return Err(StoreError::Io {
        action: "rename",
        path: target,
        source: e,
      });
    }

    info!(id = %built.id, "committed job");
    Ok(CommitReceipt {
      id: built.id.clone(),
      already_present: false,
    })
  }

  fn populate_staging(&self, built: &BuiltJob, staged_dir: &Path, staging: &Path) -> Result<(), StoreError> {
    let mut config = built.config.clone();
    config.set_timestamp(&Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true));

    let manifest_path = staging.join(CONFIG_FILE);
    fs::write(&manifest_path, config.to_yaml()?).map_err(|e| StoreError::Io {
      action: "write",
      path: manifest_path,
      source: e,
    })?;

    let metadata_target = staging.join(METADATA_FILE);
    let metadata_source = staged_dir.join(METADATA_FILE);
    if metadata_source.is_file() {
      copy_file(&metadata_source, &metadata_target)?;
    } else {
      fs::write(&metadata_target, "").map_err(|e| StoreError::Io {
        action: "write",
        path: metadata_target,
        source: e,
      })?;
    }

    let output_dir = staging.join(OUTPUT_DIR);
    fs::create_dir(&output_dir).map_err(|e| StoreError::Io {
      action: "create",
      path: output_dir,
      source: e,
    })?;

    for (rel, source) in &built.payload {
      let target = staging.join(rel);
      if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::Io {
          action: "create",
          path: parent.to_path_buf(),
          source: e,
        })?;
      }
      copy_file(source, &target)?;
    }

    immutable::protect_job(staging)?;
    Ok(())
  }

  /// Remove a committed job. Refuses while any other committed job lists
  /// it as a dependency; the scan goes over the manifests in `jobs/`
  /// directly, never the index.
  pub fn remove(&self, id: &JobId, git: &GitCache) -> Result<(), StoreError> {
    let path = self.job_path(id);
    if !path.is_dir() {
      return Err(StoreError::JobNotFound(id.clone()));
    }

    let mut dependents = Vec::new();
    for other in self.job_ids()? {
      if other == *id {
        continue;
      }
      let config = JobConfig::load(&self.job_path(&other))?;
      let depends = config.dependencies().iter().any(|dep| match dep {
        Dependency::Job(job_dep) => job_dep.job == *id,
        _ => false,
      });
      if depends {
        dependents.push(other);
      }
    }
    if !dependents.is_empty() {
      let listing: Vec<String> = dependents.iter().map(|d| format!("  - {d}")).collect();
      return Err(StoreError::JobReferenced {
        id: id.clone(),
        dependents: listing.join("\n"),
      });
    }

    immutable::unprotect_job(&path)?;
    fs::remove_dir_all(&path).map_err(|e| StoreError::Io {
      action: "remove",
      path: path.clone(),
      source: e,
    })?;
    git.drop_pins(id)?;

    info!(id = %id, "removed job");
    Ok(())
  }

  /// Recompute a committed job's identity from its current contents and
  /// compare it with its id and recorded `files` mapping.
  pub fn verify(&self, id: &JobId) -> Result<(), StoreError> {
    let path = self.job_path(id);
    if !path.is_dir() {
      return Err(StoreError::JobNotFound(id.clone()));
    }

    let recorded = JobConfig::load(&path)?.files();
    let built = JobBuilder::new(&path).build().map_err(|e| StoreError::Integrity {
      id: id.clone(),
      detail: e.to_string(),
    })?;

    if built.id != *id {
      return Err(StoreError::Integrity {
        id: id.clone(),
        detail: format!("recomputed id `{}`", built.id),
      });
    }
    if recorded.as_ref() != built.config.files().as_ref() {
      return Err(StoreError::Integrity {
        id: id.clone(),
        detail: "recorded `files` mapping does not match the payload".to_string(),
      });
    }
    Ok(())
  }

  /// Delete leftover staging directories older than the sweep threshold.
  /// Best-effort: failures are logged, never fatal.
  pub fn sweep_staging(&self) {
    let jobs_dir = self.jobs_dir();
    let Ok(entries) = fs::read_dir(&jobs_dir) else {
      return;
    };

    for entry in entries.flatten() {
      let name = entry.file_name();
      let Some(name) = name.to_str() else { continue };
      if !name.starts_with(STAGING_PREFIX) {
        continue;
      }

      let age = entry
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok());
      match age {
        Some(age) if age >= STAGING_MAX_AGE => {
          let path = entry.path();
          warn!(path = %path.display(), "sweeping stale staging directory");
          let _ = immutable::unprotect_job(&path);
          if let Err(e) = fs::remove_dir_all(&path) {
            warn!(path = %path.display(), error = %e, "failed to sweep staging directory");
          }
        }
        _ => {}
      }
    }
  }
}

/// Copy retrying transient interruptions, the one class of FS error worth
/// retrying locally.
fn copy_file(source: &Path, target: &Path) -> Result<u64, StoreError> {
  loop {
    match fs::copy(source, target) {
      Ok(bytes) => return Ok(bytes),
      Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
      Err(e) => {
        return Err(StoreError::Io {
          action: "copy",
          path: target.to_path_buf(),
          source: e,
        });
      }
    }
  }
}

fn nonce() -> String {
  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_nanos();
  format!("{}-{}", std::process::id(), nanos)
}
