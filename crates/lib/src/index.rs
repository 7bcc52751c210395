//! The derived lookup cache.
//!
//! `index.yaml` at the repository root maps job ids to their tags, commit
//! time, and dependency records so queries and reverse-dependency lookups
//! do not have to open every manifest. The index is never authoritative:
//! it can always be rebuilt by scanning `jobs/`, and commit treats index
//! updates as best-effort notifications.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::JobConfig;
use crate::consts::{INDEX_FILE, METADATA_FILE};
use crate::dependency::Dependency;
use crate::hash::JobId;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum IndexError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to serialize index: {0}")]
  Serialize(#[source] serde_yaml::Error),
}

/// One cached job: its metadata tags, commit time, and dependency records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub datetime: String,
  #[serde(default)]
  pub dependencies: Vec<serde_json::Value>,
}

pub struct Index {
  path: PathBuf,
}

impl Index {
  pub fn new(root: &Path) -> Self {
    Index {
      path: root.join(INDEX_FILE),
    }
  }

  /// Load all entries. A missing index file is an empty index.
  pub fn load(&self) -> Result<BTreeMap<String, IndexEntry>, IndexError> {
    let text = match fs::read_to_string(&self.path) {
      Ok(text) => text,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
      Err(e) => {
        return Err(IndexError::Read {
          path: self.path.clone(),
          source: e,
        });
      }
    };
    if text.trim().is_empty() {
      return Ok(BTreeMap::new());
    }
    serde_yaml::from_str(&text).map_err(|e| IndexError::Parse {
      path: self.path.clone(),
      source: e,
    })
  }

  /// Save entries atomically (write to temp, then rename).
  fn save(&self, entries: &BTreeMap<String, IndexEntry>) -> Result<(), IndexError> {
    let content = serde_yaml::to_string(entries).map_err(IndexError::Serialize)?;
    let temp_path = self.path.with_extension("yaml.tmp");
    fs::write(&temp_path, &content).map_err(|e| IndexError::Write {
      path: temp_path.clone(),
      source: e,
    })?;
    fs::rename(&temp_path, &self.path).map_err(|e| IndexError::Write {
      path: self.path.clone(),
      source: e,
    })
  }

  pub fn add(&self, id: &JobId, entry: IndexEntry) -> Result<(), IndexError> {
    let mut entries = self.load()?;
    entries.insert(id.to_string(), entry);
    self.save(&entries)
  }

  pub fn remove(&self, id: &JobId) -> Result<(), IndexError> {
    let mut entries = self.load()?;
    if entries.remove(id.as_str()).is_some() {
      self.save(&entries)?;
    }
    Ok(())
  }

  /// Jobs whose tags include every queried tag, ordered by commit time
  /// (oldest first), ties broken by id.
  pub fn find(&self, tags: &[String]) -> Result<Vec<(JobId, String)>, IndexError> {
    let entries = self.load()?;
    let mut matches: Vec<(JobId, String)> = Vec::new();
    for (id, entry) in &entries {
      if tags.iter().all(|tag| entry.tags.contains(tag)) {
        if let Ok(id) = JobId::parse(id) {
          matches.push((id, entry.datetime.clone()));
        }
      }
    }
    matches.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    Ok(matches)
  }

  /// Jobs that list `id` as a job dependency, according to the cache.
  pub fn find_dependents(&self, id: &JobId) -> Result<Vec<JobId>, IndexError> {
    let entries = self.load()?;
    let mut dependents = Vec::new();
    for (candidate, entry) in &entries {
      let depends = entry
        .dependencies
        .iter()
        .any(|record| record.get("job").and_then(|v| v.as_str()) == Some(id.as_str()));
      if depends {
        if let Ok(candidate) = JobId::parse(candidate) {
          dependents.push(candidate);
        }
      }
    }
    Ok(dependents)
  }

  /// Build the cache entry for a committed job from its manifest and
  /// metadata.
  pub fn entry_for(store: &Store, id: &JobId) -> Option<IndexEntry> {
    let job_path = store.job_path(id);
    let config = match JobConfig::load(&job_path) {
      Ok(config) => config,
      Err(e) => {
        warn!(id = %id, error = %e, "skipping unreadable manifest");
        return None;
      }
    };

    let dependencies = config
      .dependencies()
      .iter()
      .map(Dependency::to_value)
      .collect();
    let datetime = config.timestamp().unwrap_or_default().to_string();
    let tags = read_tags(&job_path.join(METADATA_FILE));

    Some(IndexEntry {
      tags,
      datetime,
      dependencies,
    })
  }

  /// Drop the cache and rescan `jobs/`. Returns the number of entries.
  pub fn rebuild(&self, store: &Store) -> Result<usize, IndexError> {
    let mut entries = BTreeMap::new();
    let ids = match store.job_ids() {
      Ok(ids) => ids,
      Err(e) => {
        warn!(error = %e, "failed to scan jobs directory");
        Vec::new()
      }
    };
    for id in ids {
      if let Some(entry) = Self::entry_for(store, &id) {
        entries.insert(id.to_string(), entry);
      }
    }
    let count = entries.len();
    self.save(&entries)?;
    debug!(count, "rebuilt index");
    Ok(count)
  }
}

/// The `tags` list of a metadata document; anything unreadable counts as
/// no tags, since metadata is user-edited and the index must stay tolerant.
fn read_tags(metadata_path: &Path) -> Vec<String> {
  let Ok(text) = fs::read_to_string(metadata_path) else {
    return Vec::new();
  };
  let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(&text) else {
    return Vec::new();
  };
  match value.get("tags") {
    Some(serde_yaml::Value::Sequence(items)) => items
      .iter()
      .filter_map(|item| item.as_str().map(str::to_string))
      .collect(),
    _ => Vec::new(),
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;
  use crate::builder::JobBuilder;
  use crate::hash;
  use crate::immutable;

  fn entry(tags: &[&str], datetime: &str) -> IndexEntry {
    IndexEntry {
      tags: tags.iter().map(|t| t.to_string()).collect(),
      datetime: datetime.to_string(),
      dependencies: Vec::new(),
    }
  }

  #[test]
  fn empty_index_loads_as_empty() {
    let temp = TempDir::new().unwrap();
    let index = Index::new(temp.path());
    assert!(index.load().unwrap().is_empty());
    assert!(index.find(&["data".into()]).unwrap().is_empty());
  }

  #[test]
  fn add_find_remove_roundtrip() {
    let temp = TempDir::new().unwrap();
    let index = Index::new(temp.path());
    let id = JobId::parse(&hash::hash_bytes(b"job")).unwrap();

    index.add(&id, entry(&["data", "v1"], "2026-08-01T10:00:00Z")).unwrap();

    let matches = index.find(&["data".into()]).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].0, id);

    assert!(index.find(&["data".into(), "v2".into()]).unwrap().is_empty());

    index.remove(&id).unwrap();
    assert!(index.find(&["data".into()]).unwrap().is_empty());
  }

  #[test]
  fn find_orders_by_commit_time() {
    let temp = TempDir::new().unwrap();
    let index = Index::new(temp.path());
    let newer = JobId::parse(&hash::hash_bytes(b"newer")).unwrap();
    let older = JobId::parse(&hash::hash_bytes(b"older")).unwrap();

    index.add(&newer, entry(&["data"], "2026-08-02T10:00:00Z")).unwrap();
    index.add(&older, entry(&["data"], "2026-08-01T10:00:00Z")).unwrap();

    let matches = index.find(&["data".into()]).unwrap();
    assert_eq!(matches[0].0, older);
    assert_eq!(matches[1].0, newer);
  }

  #[test]
  fn find_dependents_reads_job_records() {
    let temp = TempDir::new().unwrap();
    let index = Index::new(temp.path());
    let upstream = JobId::parse(&hash::hash_bytes(b"upstream")).unwrap();
    let downstream = JobId::parse(&hash::hash_bytes(b"downstream")).unwrap();

    let mut dependent = entry(&[], "2026-08-02T10:00:00Z");
    dependent.dependencies = vec![serde_json::json!({
      "job": upstream.as_str(),
      "source": "",
      "destination": "data",
    })];
    index.add(&downstream, dependent).unwrap();

    assert_eq!(index.find_dependents(&upstream).unwrap(), vec![downstream]);
  }

  #[test]
  fn rebuild_scans_committed_jobs() {
    let repo = TempDir::new().unwrap();
    let store = Store::new(repo.path());
    let index = Index::new(repo.path());

    let staged = TempDir::new().unwrap();
    fs::write(staged.path().join("r3.yaml"), "").unwrap();
    fs::write(staged.path().join("run.py"), "x\n").unwrap();
    fs::write(staged.path().join("metadata.yaml"), "tags: [baseline]\n").unwrap();
    let built = JobBuilder::new(staged.path()).build().unwrap();
    let receipt = store.place(&built, staged.path()).unwrap();

    let count = index.rebuild(&store).unwrap();
    assert_eq!(count, 1);

    let matches = index.find(&["baseline".into()]).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].0, receipt.id);

    let _ = immutable::unprotect_job(&store.job_path(&receipt.id));
  }

  #[test]
  fn corrupt_index_is_an_error_not_a_panic() {
    let temp = TempDir::new().unwrap();
    let index = Index::new(temp.path());
    fs::write(temp.path().join(INDEX_FILE), "{{{not yaml").unwrap();

    assert!(matches!(index.load(), Err(IndexError::Parse { .. })));
  }
}
