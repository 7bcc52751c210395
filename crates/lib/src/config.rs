//! The job manifest model.
//!
//! A manifest is the `r3.yaml` document inside a job: an ordered mapping
//! with the recognized keys `dependencies`, `ignore`, `environment`,
//! `commands`, `parameters`, plus `files` and `timestamp` in the committed
//! form. Unknown keys are preserved (and participate in the job hash, so
//! readers within a format major version agree on identity).
//!
//! Loading converts YAML to the internal value tree, rejecting what has no
//! canonical form: non-string mapping keys, fractional numbers, YAML tags.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::consts::CONFIG_FILE;
use crate::dependency::{Dependency, DependencyError};

/// Manifest keys that never participate in the job hash.
const UNHASHED_KEYS: [&str; 3] = ["ignore", "files", "timestamp"];

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("invalid YAML in {path}: {source}")]
  Yaml {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },
  #[error("{path}: document must be a mapping")]
  NotAMapping { path: PathBuf },
  #[error("{path}: mapping keys must be strings at `{key}`")]
  NonStringKey { path: PathBuf, key: String },
  #[error("{path}: fractional number at `{key}`; use an integer or a string")]
  FractionalNumber { path: PathBuf, key: String },
  #[error("{path}: unsupported YAML tag at `{key}`")]
  Tagged { path: PathBuf, key: String },
  #[error("{path}: `{key}` must be {expected}")]
  Type {
    path: PathBuf,
    key: String,
    expected: &'static str,
  },
  #[error("{path}: dependency {index}: {source}")]
  Dependency {
    path: PathBuf,
    index: usize,
    #[source]
    source: DependencyError,
  },
  #[error("{path}: invalid ignore pattern `{pattern}`: {source}")]
  IgnorePattern {
    path: PathBuf,
    pattern: String,
    #[source]
    source: Box<ignore::Error>,
  },
  #[error("{path}: ignore patterns must not match hashed file `{file}`")]
  IgnoredHashedFile { path: PathBuf, file: String },
  #[error("{path}: ignore patterns must not match dependency destination `{destination}`")]
  IgnoredDestination { path: PathBuf, destination: String },
}

/// A parsed and validated job manifest.
#[derive(Debug, Clone)]
pub struct JobConfig {
  doc: Map<String, Value>,
  dependencies: Vec<Dependency>,
  ignore: Vec<String>,
  origin: PathBuf,
}

impl JobConfig {
  /// Load the manifest of a staged or committed job directory.
  ///
  /// A missing `r3.yaml` yields an empty manifest, so a bare directory of
  /// files is a valid staged job.
  pub fn load(job_dir: &Path) -> Result<Self, ConfigError> {
    let path = job_dir.join(CONFIG_FILE);
    match std::fs::read_to_string(&path) {
      Ok(text) => Self::from_yaml_str(&text, &path),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Self::from_document(Map::new(), path),
      Err(e) => Err(ConfigError::Read { path, source: e }),
    }
  }

  /// Parse a manifest from YAML text. `origin` is used in error messages.
  pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| ConfigError::Yaml {
      path: origin.to_path_buf(),
      source: e,
    })?;

    let value = convert(yaml, "", origin)?;
    match value {
      Value::Object(map) => Self::from_document(map, origin.to_path_buf()),
      Value::Null => Self::from_document(Map::new(), origin.to_path_buf()),
      _ => Err(ConfigError::NotAMapping {
        path: origin.to_path_buf(),
      }),
    }
  }

  fn from_document(mut doc: Map<String, Value>, origin: PathBuf) -> Result<Self, ConfigError> {
    let dependencies = match doc.get("dependencies") {
      None => Vec::new(),
      Some(Value::Array(records)) => {
        let mut deps = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
          let map = record.as_object().ok_or_else(|| ConfigError::Type {
            path: origin.clone(),
            key: format!("dependencies[{index}]"),
            expected: "a mapping",
          })?;
          let dep = Dependency::from_value(map).map_err(|source| ConfigError::Dependency {
            path: origin.clone(),
            index,
            source,
          })?;
          deps.push(dep);
        }
        deps
      }
      Some(_) => {
        return Err(ConfigError::Type {
          path: origin,
          key: "dependencies".into(),
          expected: "a list of mappings",
        });
      }
    };

    let ignore = match doc.get("ignore") {
      None => Vec::new(),
      Some(Value::Array(items)) => {
        let mut patterns = Vec::with_capacity(items.len());
        for item in items {
          let pattern = item.as_str().ok_or_else(|| ConfigError::Type {
            path: origin.clone(),
            key: "ignore".into(),
            expected: "a list of strings",
          })?;
          patterns.push(pattern.to_string());
        }
        patterns
      }
      Some(_) => {
        return Err(ConfigError::Type {
          path: origin,
          key: "ignore".into(),
          expected: "a list of strings",
        });
      }
    };

    for key in ["environment", "commands", "parameters"] {
      if let Some(value) = doc.get(key) {
        if !value.is_object() {
          return Err(ConfigError::Type {
            path: origin,
            key: key.into(),
            expected: "a mapping",
          });
        }
      }
    }

    if let Some(value) = doc.get("files") {
      let map = value.as_object().ok_or_else(|| ConfigError::Type {
        path: origin.clone(),
        key: "files".into(),
        expected: "a mapping of path to digest",
      })?;
      for (file, digest) in map {
        if !digest.is_string() {
          return Err(ConfigError::Type {
            path: origin,
            key: format!("files.{file}"),
            expected: "a hex digest string",
          });
        }
      }
    }

    if let Some(value) = doc.get("timestamp") {
      if !value.is_string() {
        return Err(ConfigError::Type {
          path: origin,
          key: "timestamp".into(),
          expected: "an RFC 3339 string",
        });
      }
    }

    // Normalize: the dependency list is always materialized, with `source`
    // filled in, so the committed manifest is self-describing.
    doc.insert(
      "dependencies".into(),
      Value::Array(dependencies.iter().map(Dependency::to_value).collect()),
    );

    Ok(JobConfig {
      doc,
      dependencies,
      ignore,
      origin,
    })
  }

  pub fn origin(&self) -> &Path {
    &self.origin
  }

  pub fn dependencies(&self) -> &[Dependency] {
    &self.dependencies
  }

  /// Replace the dependency list, e.g. after query or ref resolution.
  pub fn set_dependencies(&mut self, dependencies: Vec<Dependency>) {
    self.doc.insert(
      "dependencies".into(),
      Value::Array(dependencies.iter().map(Dependency::to_value).collect()),
    );
    self.dependencies = dependencies;
  }

  pub fn ignore(&self) -> &[String] {
    &self.ignore
  }

  /// The `files` mapping, present in committed manifests.
  pub fn files(&self) -> Option<BTreeMap<String, String>> {
    let map = self.doc.get("files")?.as_object()?;
    Some(
      map
        .iter()
        .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
        .collect(),
    )
  }

  pub fn set_files(&mut self, files: &BTreeMap<String, String>) {
    let map: Map<String, Value> = files
      .iter()
      .map(|(k, v)| (k.clone(), Value::String(v.clone())))
      .collect();
    self.doc.insert("files".into(), Value::Object(map));
  }

  pub fn timestamp(&self) -> Option<&str> {
    self.doc.get("timestamp")?.as_str()
  }

  pub fn set_timestamp(&mut self, timestamp: &str) {
    self.doc.insert("timestamp".into(), Value::String(timestamp.into()));
  }

  /// The document subset that participates in the job hash: everything
  /// except the unhashed keys, with dependency records canonicalized
  /// (`query` stripped).
  pub fn hashed_view(&self) -> Result<Value, DependencyError> {
    let mut view = Map::new();
    for (key, value) in &self.doc {
      if UNHASHED_KEYS.contains(&key.as_str()) || key == "dependencies" {
        continue;
      }
      view.insert(key.clone(), value.clone());
    }

    let mut records = Vec::with_capacity(self.dependencies.len());
    for dep in &self.dependencies {
      records.push(dep.hashed_value()?);
    }
    view.insert("dependencies".into(), Value::Array(records));

    Ok(Value::Object(view))
  }

  pub fn document(&self) -> &Map<String, Value> {
    &self.doc
  }

  /// Serialize the manifest back to YAML for writing into a committed job.
  pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&Value::Object(self.doc.clone()))
  }
}

/// Convert a YAML value into the internal value tree.
fn convert(value: serde_yaml::Value, key_path: &str, origin: &Path) -> Result<Value, ConfigError> {
  match value {
    serde_yaml::Value::Null => Ok(Value::Null),
    serde_yaml::Value::Bool(b) => Ok(Value::Bool(b)),
    serde_yaml::Value::Number(n) => {
      if let Some(i) = n.as_i64() {
        Ok(Value::Number(i.into()))
      } else if let Some(u) = n.as_u64() {
        Ok(Value::Number(u.into()))
      } else {
        Err(ConfigError::FractionalNumber {
          path: origin.to_path_buf(),
          key: display_key(key_path),
        })
      }
    }
    serde_yaml::Value::String(s) => Ok(Value::String(s)),
    serde_yaml::Value::Sequence(items) => {
      let mut array = Vec::with_capacity(items.len());
      for (index, item) in items.into_iter().enumerate() {
        let child = format!("{key_path}[{index}]");
        array.push(convert(item, &child, origin)?);
      }
      Ok(Value::Array(array))
    }
    serde_yaml::Value::Mapping(mapping) => {
      let mut map = Map::new();
      for (key, value) in mapping {
        let key = match key {
          serde_yaml::Value::String(s) => s,
          other => {
            return Err(ConfigError::NonStringKey {
              path: origin.to_path_buf(),
              key: format!("{}{:?}", prefix(key_path), other),
            });
          }
        };
        let child = format!("{}{}", prefix(key_path), key);
        map.insert(key, convert(value, &child, origin)?);
      }
      Ok(Value::Object(map))
    }
    serde_yaml::Value::Tagged(_) => Err(ConfigError::Tagged {
      path: origin.to_path_buf(),
      key: display_key(key_path),
    }),
  }
}

fn prefix(key_path: &str) -> String {
  if key_path.is_empty() {
    String::new()
  } else {
    format!("{key_path}.")
  }
}

fn display_key(key_path: &str) -> String {
  if key_path.is_empty() {
    "<document>".to_string()
  } else {
    key_path.to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(text: &str) -> Result<JobConfig, ConfigError> {
    JobConfig::from_yaml_str(text, Path::new("r3.yaml"))
  }

  #[test]
  fn empty_manifest_is_valid() {
    let config = parse("").unwrap();
    assert!(config.dependencies().is_empty());
    assert!(config.ignore().is_empty());
    assert!(config.files().is_none());
  }

  #[test]
  fn parses_recognized_keys() {
    let config = parse(concat!(
      "parameters:\n",
      "  name: World\n",
      "commands:\n",
      "  run: python run.py\n",
      "ignore:\n",
      "  - \"/__pycache__\"\n",
    ))
    .unwrap();

    assert_eq!(config.ignore(), &["/__pycache__".to_string()]);
    assert!(config.document().contains_key("parameters"));
  }

  #[test]
  fn dependencies_are_parsed_and_normalized() {
    let id = crate::hash::hash_bytes(b"dep");
    let config = parse(&format!("dependencies:\n  - job: {id}\n    destination: data\n")).unwrap();

    assert_eq!(config.dependencies().len(), 1);
    // Normalization fills in the default source.
    let records = config.document()["dependencies"].as_array().unwrap();
    assert_eq!(records[0]["source"], Value::String(String::new()));
  }

  #[test]
  fn rejects_wrong_types() {
    assert!(matches!(parse("ignore: 5\n"), Err(ConfigError::Type { .. })));
    assert!(matches!(parse("ignore: [1, 2]\n"), Err(ConfigError::Type { .. })));
    assert!(matches!(parse("dependencies: data\n"), Err(ConfigError::Type { .. })));
    assert!(matches!(parse("environment: []\n"), Err(ConfigError::Type { .. })));
    assert!(matches!(parse("commands: run\n"), Err(ConfigError::Type { .. })));
  }

  #[test]
  fn rejects_fractional_numbers() {
    let err = parse("parameters:\n  rate: 0.5\n").unwrap_err();
    match err {
      ConfigError::FractionalNumber { key, .. } => assert_eq!(key, "parameters.rate"),
      other => panic!("expected FractionalNumber, got {other}"),
    }
  }

  #[test]
  fn rejects_non_string_keys() {
    assert!(matches!(
      parse("parameters:\n  1: one\n"),
      Err(ConfigError::NonStringKey { .. })
    ));
  }

  #[test]
  fn rejects_bad_dependency_record() {
    let err = parse("dependencies:\n  - destination: d\n").unwrap_err();
    assert!(matches!(err, ConfigError::Dependency { index: 0, .. }));
  }

  #[test]
  fn hashed_view_strips_unhashed_keys_and_query() {
    let id = crate::hash::hash_bytes(b"dep");
    let mut config = parse(&format!(
      concat!(
        "parameters:\n",
        "  name: World\n",
        "ignore:\n",
        "  - \"/tmp\"\n",
        "dependencies:\n",
        "  - job: {}\n",
        "    destination: data\n",
        "    query: \"#latest\"\n",
      ),
      id
    ))
    .unwrap();
    config.set_timestamp("2026-08-02T00:00:00Z");
    config.set_files(&BTreeMap::from([("run.py".to_string(), "0".repeat(64))]));

    let view = config.hashed_view().unwrap();
    let view = view.as_object().unwrap();
    assert!(view.contains_key("parameters"));
    assert!(!view.contains_key("ignore"));
    assert!(!view.contains_key("files"));
    assert!(!view.contains_key("timestamp"));

    let dep = view["dependencies"].as_array().unwrap()[0].as_object().unwrap();
    assert!(!dep.contains_key("query"));
  }

  #[test]
  fn hashed_view_fails_on_unresolved_dependency() {
    let config = parse("dependencies:\n  - query: \"#data\"\n    destination: data\n").unwrap();
    assert!(config.hashed_view().is_err());
  }

  #[test]
  fn yaml_roundtrip_preserves_document() {
    let id = crate::hash::hash_bytes(b"dep");
    let config = parse(&format!(
      "parameters:\n  name: World\ndependencies:\n  - job: {id}\n    destination: data\n"
    ))
    .unwrap();

    let yaml = config.to_yaml().unwrap();
    let reparsed = JobConfig::from_yaml_str(&yaml, Path::new("r3.yaml")).unwrap();
    assert_eq!(config.document(), reparsed.document());
  }
}
