//! Dependency records.
//!
//! A dependency is a tagged variant discriminated by key presence in its
//! manifest record: `job` references another committed job, `repository`
//! references a git commit, and `query` is a staged-only form that resolves
//! to a job dependency before commit. Mixed discriminator keys are invalid.
//!
//! For identity purposes a resolved dependency contributes one entry
//! `(destination, sha256(canonical(record)))`, where the record omits the
//! `query` key so provenance never changes a job id.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::canonical;
use crate::hash::{self, JobId};
use crate::relpath::{RelPath, RelPathError};

#[derive(Debug, Error)]
pub enum DependencyError {
  #[error("missing `destination`")]
  MissingDestination,
  #[error("missing `commit`; git dependencies must name a commit, branch, or tag")]
  MissingCommit,
  #[error("mixed `{0}` and `{1}` keys; a record is either a job, git, or query dependency")]
  MixedKinds(&'static str, &'static str),
  #[error("unrecognized record; expected a `job`, `repository`, or `query` key")]
  Unrecognized,
  #[error("`{key}` must be a string")]
  NotAString { key: &'static str },
  #[error("invalid `{key}`: {source}")]
  Path {
    key: &'static str,
    #[source]
    source: RelPathError,
  },
  #[error(transparent)]
  JobId(#[from] hash::InvalidJobId),
  #[error("`{destination}` is unresolved; queries must be resolved before hashing")]
  Unresolved { destination: String },
  #[error(transparent)]
  Encoding(#[from] canonical::EncodingError),
}

/// A dependency on another committed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDependency {
  pub job: JobId,
  pub source: RelPath,
  pub destination: RelPath,
  /// The query this record was resolved from, kept for provenance.
  /// Never participates in the job hash.
  pub query: Option<String>,
}

/// A dependency on a git repository pinned to a commit.
///
/// Until pre-commit resolution, `commit` may hold a symbolic ref (branch or
/// tag name); afterwards it is always a full lowercase object id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitDependency {
  pub repository: String,
  pub commit: String,
  pub source: RelPath,
  pub destination: RelPath,
}

/// A staged dependency described by a query instead of a concrete job id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDependency {
  pub query: String,
  pub source: RelPath,
  pub destination: RelPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
  Job(JobDependency),
  Git(GitDependency),
  Query(QueryDependency),
}

impl GitDependency {
  /// Whether `commit` is a full object id rather than a symbolic ref.
  pub fn is_pinned(&self) -> bool {
    self.commit.len() == 40 && self.commit.bytes().all(|b| b.is_ascii_hexdigit())
  }
}

impl Dependency {
  /// Parse a manifest record. `source` defaults to the empty path.
  pub fn from_value(record: &Map<String, Value>) -> Result<Self, DependencyError> {
    let has_job = record.contains_key("job");
    let has_repo = record.contains_key("repository");
    let has_query = record.contains_key("query");

    if has_job && has_repo {
      return Err(DependencyError::MixedKinds("job", "repository"));
    }
    if has_repo && has_query {
      return Err(DependencyError::MixedKinds("repository", "query"));
    }

    let destination = match record.get("destination") {
      Some(value) => parse_path(value, "destination", true)?,
      None => return Err(DependencyError::MissingDestination),
    };
    let source = match record.get("source") {
      Some(value) => parse_path(value, "source", false)?,
      None => RelPath::root(),
    };

    if has_job {
      let job = JobId::parse(string_field(record, "job")?)?;
      let query = match record.get("query") {
        Some(value) => Some(string_field_value(value, "query")?.to_string()),
        None => None,
      };
      return Ok(Dependency::Job(JobDependency {
        job,
        source,
        destination,
        query,
      }));
    }

    if has_repo {
      let repository = string_field(record, "repository")?.to_string();
      let commit = match record.get("commit") {
        Some(value) => string_field_value(value, "commit")?.to_ascii_lowercase(),
        None => return Err(DependencyError::MissingCommit),
      };
      return Ok(Dependency::Git(GitDependency {
        repository,
        commit,
        source,
        destination,
      }));
    }

    if has_query {
      let query = string_field(record, "query")?.to_string();
      return Ok(Dependency::Query(QueryDependency {
        query,
        source,
        destination,
      }));
    }

    Err(DependencyError::Unrecognized)
  }

  /// The manifest record for this dependency, including provenance keys.
  pub fn to_value(&self) -> Value {
    let mut record = Map::new();
    match self {
      Dependency::Job(dep) => {
        record.insert("job".into(), Value::String(dep.job.to_string()));
        record.insert("source".into(), Value::String(dep.source.as_str().into()));
        record.insert("destination".into(), Value::String(dep.destination.as_str().into()));
        if let Some(query) = &dep.query {
          record.insert("query".into(), Value::String(query.clone()));
        }
      }
      Dependency::Git(dep) => {
        record.insert("repository".into(), Value::String(dep.repository.clone()));
        record.insert("commit".into(), Value::String(dep.commit.clone()));
        record.insert("source".into(), Value::String(dep.source.as_str().into()));
        record.insert("destination".into(), Value::String(dep.destination.as_str().into()));
      }
      Dependency::Query(dep) => {
        record.insert("query".into(), Value::String(dep.query.clone()));
        record.insert("source".into(), Value::String(dep.source.as_str().into()));
        record.insert("destination".into(), Value::String(dep.destination.as_str().into()));
      }
    }
    Value::Object(record)
  }

  /// The record that participates in hashing: `query` stripped.
  ///
  /// Fails on unresolved dependencies; queries must be expanded and git refs
  /// pinned before a job can be hashed.
  pub fn hashed_value(&self) -> Result<Value, DependencyError> {
    match self {
      Dependency::Query(dep) => Err(DependencyError::Unresolved {
        destination: dep.destination.to_string(),
      }),
      Dependency::Git(dep) if !dep.is_pinned() => Err(DependencyError::Unresolved {
        destination: dep.destination.to_string(),
      }),
      Dependency::Job(_) | Dependency::Git(_) => {
        let mut value = self.to_value();
        if let Value::Object(record) = &mut value {
          record.remove("query");
        }
        Ok(value)
      }
    }
  }

  /// The `(destination, digest)` entry this dependency contributes to the
  /// job's entry list.
  pub fn hash_entry(&self) -> Result<(String, String), DependencyError> {
    let encoded = canonical::encode(&self.hashed_value()?)?;
    Ok((self.destination().to_string(), hash::hash_bytes(encoded.as_bytes())))
  }

  pub fn destination(&self) -> &RelPath {
    match self {
      Dependency::Job(dep) => &dep.destination,
      Dependency::Git(dep) => &dep.destination,
      Dependency::Query(dep) => &dep.destination,
    }
  }

  /// Whether this record references a concrete job or commit.
  pub fn is_resolved(&self) -> bool {
    match self {
      Dependency::Job(_) => true,
      Dependency::Git(dep) => dep.is_pinned(),
      Dependency::Query(_) => false,
    }
  }
}

fn string_field<'a>(record: &'a Map<String, Value>, key: &'static str) -> Result<&'a str, DependencyError> {
  string_field_value(&record[key], key)
}

fn string_field_value<'a>(value: &'a Value, key: &'static str) -> Result<&'a str, DependencyError> {
  value.as_str().ok_or(DependencyError::NotAString { key })
}

fn parse_path(value: &Value, key: &'static str, non_empty: bool) -> Result<RelPath, DependencyError> {
  let text = string_field_value(value, key)?;
  let parsed = if non_empty {
    RelPath::parse_non_empty(text)
  } else {
    RelPath::parse(text)
  };
  parsed.map_err(|source| DependencyError::Path { key, source })
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn record(value: Value) -> Map<String, Value> {
    match value {
      Value::Object(map) => map,
      _ => panic!("expected object"),
    }
  }

  fn sample_job_id() -> String {
    hash::hash_bytes(b"dependency target")
  }

  #[test]
  fn parses_job_dependency_with_defaults() {
    let id = sample_job_id();
    let dep = Dependency::from_value(&record(json!({"job": id, "destination": "data"}))).unwrap();
    match &dep {
      Dependency::Job(job) => {
        assert_eq!(job.job.as_str(), id);
        assert!(job.source.is_empty());
        assert_eq!(job.destination.as_str(), "data");
        assert!(job.query.is_none());
      }
      other => panic!("expected job dependency, got {other:?}"),
    }
    assert!(dep.is_resolved());
  }

  #[test]
  fn parses_git_dependency() {
    let dep = Dependency::from_value(&record(json!({
      "repository": "https://github.com/o/r.git",
      "commit": "main",
      "destination": "src",
    })))
    .unwrap();
    assert!(!dep.is_resolved());

    let pinned = Dependency::from_value(&record(json!({
      "repository": "https://github.com/o/r.git",
      "commit": "a".repeat(40),
      "destination": "src",
    })))
    .unwrap();
    assert!(pinned.is_resolved());
  }

  #[test]
  fn parses_query_dependency() {
    let dep = Dependency::from_value(&record(json!({"query": "#data", "destination": "data"}))).unwrap();
    assert!(!dep.is_resolved());
    assert!(dep.hash_entry().is_err());
  }

  #[test]
  fn rejects_mixed_and_malformed_records() {
    let id = sample_job_id();
    assert!(matches!(
      Dependency::from_value(&record(json!({"job": id, "repository": "x", "destination": "d"}))),
      Err(DependencyError::MixedKinds("job", "repository"))
    ));
    assert!(matches!(
      Dependency::from_value(&record(json!({"job": id}))),
      Err(DependencyError::MissingDestination)
    ));
    assert!(matches!(
      Dependency::from_value(&record(json!({"repository": "x", "destination": "d"}))),
      Err(DependencyError::MissingCommit)
    ));
    assert!(matches!(
      Dependency::from_value(&record(json!({"destination": "d"}))),
      Err(DependencyError::Unrecognized)
    ));
    assert!(matches!(
      Dependency::from_value(&record(json!({"job": id, "destination": "../d"}))),
      Err(DependencyError::Path { key: "destination", .. })
    ));
    assert!(matches!(
      Dependency::from_value(&record(json!({"job": "not-a-job-id", "destination": "d"}))),
      Err(DependencyError::JobId(_))
    ));
  }

  #[test]
  fn query_never_changes_the_hash_entry() {
    let id = sample_job_id();
    let plain = Dependency::from_value(&record(json!({"job": id, "destination": "data"}))).unwrap();
    let with_query =
      Dependency::from_value(&record(json!({"job": id, "destination": "data", "query": "#latest"}))).unwrap();
    let other_query =
      Dependency::from_value(&record(json!({"job": id, "destination": "data", "query": "#tag=v1"}))).unwrap();

    assert_eq!(plain.hash_entry().unwrap(), with_query.hash_entry().unwrap());
    assert_eq!(with_query.hash_entry().unwrap(), other_query.hash_entry().unwrap());
  }

  #[test]
  fn every_identity_field_changes_the_hash_entry() {
    let id = sample_job_id();
    let base = Dependency::from_value(&record(json!({"job": id, "source": "output", "destination": "data"}))).unwrap();
    let other_id = hash::hash_bytes(b"another target");

    let variants = [
      json!({"job": other_id, "source": "output", "destination": "data"}),
      json!({"job": id, "source": "model", "destination": "data"}),
      json!({"job": id, "source": "output", "destination": "inputs"}),
    ];
    for variant in variants {
      let dep = Dependency::from_value(&record(variant)).unwrap();
      assert_ne!(base.hash_entry().unwrap().1, dep.hash_entry().unwrap().1);
    }
  }

  #[test]
  fn git_identity_fields_change_the_hash_entry() {
    let commit = "c".repeat(40);
    let base = Dependency::from_value(&record(json!({
      "repository": "https://github.com/o/r.git",
      "commit": commit,
      "destination": "src",
    })))
    .unwrap();

    let other_repo = Dependency::from_value(&record(json!({
      "repository": "https://github.com/o/other.git",
      "commit": commit,
      "destination": "src",
    })))
    .unwrap();
    let other_commit = Dependency::from_value(&record(json!({
      "repository": "https://github.com/o/r.git",
      "commit": "d".repeat(40),
      "destination": "src",
    })))
    .unwrap();

    assert_ne!(base.hash_entry().unwrap().1, other_repo.hash_entry().unwrap().1);
    assert_ne!(base.hash_entry().unwrap().1, other_commit.hash_entry().unwrap().1);
  }

  #[test]
  fn record_roundtrip_preserves_query() {
    let id = sample_job_id();
    let dep = Dependency::from_value(&record(json!({
      "job": id,
      "destination": "data",
      "query": "#data #v1",
    })))
    .unwrap();

    let value = dep.to_value();
    let reparsed = Dependency::from_value(&record(value)).unwrap();
    assert_eq!(dep, reparsed);
  }
}
