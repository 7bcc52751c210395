//! The job builder: turns a staged directory into a content-addressed job.
//!
//! Identity is computed over an entry list with one line per hashed input:
//!
//! ```text
//! <path> <sha256-hex>\n
//! ```
//!
//! sorted lexicographically by path. The list contains one entry for the
//! manifest (digest of its canonical hashed view), one per payload file
//! (digest of the file bytes), and one per dependency (digest of the
//! canonical record with `query` stripped). The job id is the SHA-256 of
//! the concatenated lines. Two runs over the same inputs yield the same id
//! on any host and in any walk order.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::canonical::{self, EncodingError};
use crate::config::{ConfigError, JobConfig};
use crate::consts::{CONFIG_FILE, METADATA_FILE, OUTPUT_DIR};
use crate::dependency::{Dependency, DependencyError, JobDependency};
use crate::hash::{self, JobId};
use crate::ignore::IgnoreSet;
use crate::relpath::RelPath;

#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Dependency(#[from] DependencyError),
  #[error(transparent)]
  Encoding(#[from] EncodingError),
  #[error("failed to walk {path}: {source}")]
  Walk {
    path: PathBuf,
    #[source]
    source: walkdir::Error,
  },
  #[error("failed to hash {path}: {source}")]
  HashFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("path `{0}` is not valid UTF-8")]
  NonUtf8Path(PathBuf),
  #[error("symlink `{path}` does not point at a repository dependency")]
  UnsupportedSymlink { path: String },
  #[error("dependency destination `{destination}` collides with payload path `{payload}`")]
  DestinationCollision { destination: String, payload: String },
  #[error("dependency destination `{0}` is reserved")]
  ReservedDestination(String),
  #[error("duplicate entry path `{0}`")]
  DuplicateEntry(String),
}

/// The result of building a staged job: its identity, the manifest to be
/// frozen at commit (with `files` populated and dependencies normalized),
/// and the concrete entry list for debugging.
#[derive(Debug)]
pub struct BuiltJob {
  pub id: JobId,
  pub config: JobConfig,
  pub entries: Vec<(String, String)>,
  /// Payload files as `(relative path, absolute source path)`.
  pub payload: Vec<(String, PathBuf)>,
}

/// Walks a staged directory, applies ignore rules, hashes every input, and
/// assembles the final manifest and job id.
pub struct JobBuilder<'a> {
  root: &'a Path,
  store_jobs: Option<PathBuf>,
}

impl<'a> JobBuilder<'a> {
  pub fn new(root: &'a Path) -> Self {
    JobBuilder {
      root,
      store_jobs: None,
    }
  }

  /// Enable symlink resolution against a repository's `jobs/` directory.
  /// A staged symlink pointing at `jobs/<id>/<path>` becomes a job
  /// dependency record instead of a hashed file.
  pub fn store_jobs_dir(mut self, jobs_dir: &Path) -> Self {
    self.store_jobs = Some(jobs_dir.to_path_buf());
    self
  }

  /// Build using the manifest found in the staged directory.
  pub fn build(self) -> Result<BuiltJob, BuildError> {
    let config = JobConfig::load(self.root)?;
    self.build_with_config(config)
  }

  /// Build with an already loaded (and possibly resolved) manifest.
  pub fn build_with_config(self, mut config: JobConfig) -> Result<BuiltJob, BuildError> {
    let ignore_set = IgnoreSet::build(self.root, &config)?;
    let (payload, symlinks) = self.walk(&ignore_set)?;

    // Ignore patterns must never match hashed files. A staged manifest that
    // carries a `files` mapping (a previously committed job being
    // re-committed) makes the stale set checkable directly.
    if let Some(files) = config.files() {
      for file in files.keys() {
        if file != CONFIG_FILE && ignore_set.matches(file, false) {
          return Err(
            ConfigError::IgnoredHashedFile {
              path: config.origin().to_path_buf(),
              file: file.clone(),
            }
            .into(),
          );
        }
      }
    }

    let mut dependencies = config.dependencies().to_vec();
    // A symlink at a declared destination is the materialization of that
    // record (e.g. a checked-out job being re-committed), not a new
    // dependency. Anything else must resolve into the jobs tree.
    let declared: std::collections::BTreeSet<String> =
      dependencies.iter().map(|d| d.destination().to_string()).collect();
    let mut had_symlinks = false;
    for (rel, link) in &symlinks {
      if declared.contains(rel.as_str()) {
        continue;
      }
      dependencies.push(self.symlink_dependency(link, rel)?);
      had_symlinks = true;
    }

    for dep in &dependencies {
      let destination = dep.destination().as_str();
      if destination == CONFIG_FILE
        || destination == METADATA_FILE
        || destination == OUTPUT_DIR
        || destination.starts_with("output/")
      {
        return Err(BuildError::ReservedDestination(destination.to_string()));
      }
      if ignore_set.matches(destination, true) {
        return Err(
          ConfigError::IgnoredDestination {
            path: config.origin().to_path_buf(),
            destination: destination.to_string(),
          }
          .into(),
        );
      }
      for (payload_path, _) in &payload {
        if collides(destination, payload_path) {
          return Err(BuildError::DestinationCollision {
            destination: destination.to_string(),
            payload: payload_path.clone(),
          });
        }
      }
    }
    if had_symlinks {
      config.set_dependencies(dependencies.clone());
    }

    let mut files = BTreeMap::new();
    let mut entries = Vec::with_capacity(payload.len() + dependencies.len() + 1);
    for (rel, source) in &payload {
      let digest = hash::hash_file(source).map_err(|e| BuildError::HashFile {
        path: source.clone(),
        source: e,
      })?;
      files.insert(rel.clone(), digest.clone());
      entries.push((rel.clone(), digest));
    }
    for dep in &dependencies {
      entries.push(dep.hash_entry()?);
    }

    let manifest_digest = hash::hash_bytes(canonical::encode(&config.hashed_view()?)?.as_bytes());
    files.insert(CONFIG_FILE.to_string(), manifest_digest.clone());
    entries.push((CONFIG_FILE.to_string(), manifest_digest));

    entries.sort();
    for pair in entries.windows(2) {
      if pair[0].0 == pair[1].0 {
        return Err(BuildError::DuplicateEntry(pair[0].0.clone()));
      }
    }

    let mut listing = String::new();
    for (path, digest) in &entries {
      listing.push_str(path);
      listing.push(' ');
      listing.push_str(digest);
      listing.push('\n');
    }
    let id = JobId::from_digest(hash::hash_bytes(listing.as_bytes()));
    debug!(id = %id, entries = entries.len(), "built job");

    config.set_files(&files);

    Ok(BuiltJob {
      id,
      config,
      entries,
      payload,
    })
  }

  /// Walk the staged tree, excluding reserved paths and ignored paths.
  /// Returns payload files and the symlinks encountered.
  fn walk(&self, ignore_set: &IgnoreSet) -> Result<(Vec<(String, PathBuf)>, Vec<(String, PathBuf)>), BuildError> {
    let mut payload = Vec::new();
    let mut symlinks = Vec::new();

    let mut iter = WalkDir::new(self.root).sort_by_file_name().into_iter();
    while let Some(entry) = iter.next() {
      let entry = entry.map_err(|e| BuildError::Walk {
        path: self.root.to_path_buf(),
        source: e,
      })?;
      if entry.depth() == 0 {
        continue;
      }

      let rel = relative_path(self.root, entry.path())?;
      let file_type = entry.file_type();

      if entry.depth() == 1 && (rel == CONFIG_FILE || rel == METADATA_FILE || rel == OUTPUT_DIR) {
        if file_type.is_dir() {
          iter.skip_current_dir();
        }
        continue;
      }

      if file_type.is_dir() {
        if ignore_set.matches(&rel, true) {
          iter.skip_current_dir();
        }
        continue;
      }

      if ignore_set.matches(&rel, false) {
        continue;
      }

      if file_type.is_symlink() {
        symlinks.push((rel, entry.path().to_path_buf()));
      } else {
        payload.push((rel, entry.path().to_path_buf()));
      }
    }

    Ok((payload, symlinks))
  }

  /// Convert a staged symlink into a job dependency record. Only links
  /// resolving inside the repository's `jobs/` tree are accepted.
  fn symlink_dependency(&self, link: &Path, rel: &str) -> Result<Dependency, BuildError> {
    let unsupported = || BuildError::UnsupportedSymlink { path: rel.to_string() };

    let jobs_dir = self.store_jobs.as_ref().ok_or_else(unsupported)?;
    let jobs_dir = jobs_dir.canonicalize().map_err(|_| unsupported())?;
    let resolved = link.canonicalize().map_err(|_| unsupported())?;
    let suffix = resolved.strip_prefix(&jobs_dir).map_err(|_| unsupported())?;

    let mut components = suffix.components();
    let job_component = components.next().ok_or_else(unsupported)?;
    let job_id = job_component.as_os_str().to_str().ok_or_else(unsupported)?;
    let job = JobId::parse(job_id).map_err(|_| unsupported())?;

    let source_path = components.as_path();
    let source_str = source_path.to_str().ok_or_else(unsupported)?;
    let source = RelPath::parse(&source_str.replace(std::path::MAIN_SEPARATOR, "/")).map_err(|_| unsupported())?;
    let destination = RelPath::parse_non_empty(rel).map_err(|_| unsupported())?;

    debug!(link = rel, job = %job, source = %source, "resolved symlink to job dependency");
    Ok(Dependency::Job(JobDependency {
      job,
      source,
      destination,
      query: None,
    }))
  }
}

/// Whether a dependency destination and a payload path occupy overlapping
/// locations in the checked-out tree.
fn collides(destination: &str, payload: &str) -> bool {
  destination == payload
    || payload.starts_with(&format!("{destination}/"))
    || destination.starts_with(&format!("{payload}/"))
}

fn relative_path(root: &Path, path: &Path) -> Result<String, BuildError> {
  let rel = path.strip_prefix(root).expect("walked path is under the root");
  let mut parts = Vec::new();
  for component in rel.components() {
    let part = component
      .as_os_str()
      .to_str()
      .ok_or_else(|| BuildError::NonUtf8Path(path.to_path_buf()))?;
    parts.push(part);
  }
  Ok(parts.join("/"))
}
