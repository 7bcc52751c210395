//! Ignore-pattern filtering for staged job trees.
//!
//! Patterns use gitignore semantics and are matched against paths relative
//! to the job root. Reserved paths (`r3.yaml`, `metadata.yaml`, `output/`)
//! are excluded from hashing before patterns apply, so patterns only ever
//! decide the fate of ordinary payload paths.

use std::path::Path;

use ::ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::config::{ConfigError, JobConfig};

/// A compiled set of ignore patterns rooted at a job directory.
#[derive(Debug)]
pub struct IgnoreSet {
  matcher: Gitignore,
}

impl IgnoreSet {
  /// Compile the manifest's ignore patterns for a job rooted at `root`.
  pub fn build(root: &Path, config: &JobConfig) -> Result<Self, ConfigError> {
    if config.ignore().is_empty() {
      return Ok(IgnoreSet {
        matcher: Gitignore::empty(),
      });
    }

    let mut builder = GitignoreBuilder::new(root);
    for pattern in config.ignore() {
      builder
        .add_line(None, pattern)
        .map_err(|e| ConfigError::IgnorePattern {
          path: config.origin().to_path_buf(),
          pattern: pattern.clone(),
          source: Box::new(e),
        })?;
    }
    let matcher = builder.build().map_err(|e| ConfigError::IgnorePattern {
      path: config.origin().to_path_buf(),
      pattern: config.ignore().join(", "),
      source: Box::new(e),
    })?;

    Ok(IgnoreSet { matcher })
  }

  /// Whether a path relative to the job root is ignored. Matches the path
  /// itself and any of its parent directories, like git does.
  pub fn matches(&self, relative: &str, is_dir: bool) -> bool {
    self
      .matcher
      .matched_path_or_any_parents(relative, is_dir)
      .is_ignore()
  }
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use super::*;

  fn ignore_set(patterns: &[&str]) -> IgnoreSet {
    let yaml = if patterns.is_empty() {
      String::new()
    } else {
      let items: Vec<String> = patterns.iter().map(|p| format!("  - \"{p}\"")).collect();
      format!("ignore:\n{}\n", items.join("\n"))
    };
    let config = JobConfig::from_yaml_str(&yaml, Path::new("r3.yaml")).unwrap();
    IgnoreSet::build(&PathBuf::from("/staged/job"), &config).unwrap()
  }

  #[test]
  fn empty_set_matches_nothing() {
    let set = ignore_set(&[]);
    assert!(!set.matches("run.py", false));
    assert!(!set.matches("data/input.csv", false));
  }

  #[test]
  fn anchored_directory_pattern() {
    let set = ignore_set(&["/__pycache__"]);
    assert!(set.matches("__pycache__", true));
    assert!(set.matches("__pycache__/x.pyc", false));
    assert!(!set.matches("src/__pycache__/x.pyc", false));
  }

  #[test]
  fn unanchored_pattern_matches_anywhere() {
    let set = ignore_set(&["*.pyc"]);
    assert!(set.matches("x.pyc", false));
    assert!(set.matches("deep/nested/x.pyc", false));
    assert!(!set.matches("x.py", false));
  }

  #[test]
  fn negation_rescues_a_path() {
    let set = ignore_set(&["*.log", "!keep.log"]);
    assert!(set.matches("run.log", false));
    assert!(!set.matches("keep.log", false));
  }

  #[test]
  fn invalid_pattern_is_a_config_error() {
    let config = JobConfig::from_yaml_str("ignore:\n  - \"a[\"\n", Path::new("r3.yaml")).unwrap();
    let result = IgnoreSet::build(&PathBuf::from("/staged/job"), &config);
    assert!(matches!(result, Err(ConfigError::IgnorePattern { .. })));
  }
}
