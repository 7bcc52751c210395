//! Slash-separated relative paths for manifest fields.
//!
//! Dependency `source`/`destination` values and `files` keys are stored as
//! forward-slash relative paths. Absolute paths and `.`/`..` segments are
//! rejected so a record can never escape its job root.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelPathError {
  #[error("path `{0}` must be relative")]
  Absolute(String),
  #[error("path `{0}` contains a `{1}` segment")]
  DotSegment(String, &'static str),
  #[error("path `{0}` contains an empty segment")]
  EmptySegment(String),
  #[error("path `{0}` contains a backslash; use `/` as the separator")]
  Backslash(String),
  #[error("path must not be empty")]
  Empty,
}

/// A validated relative path. May be empty, meaning "the whole item".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelPath(String);

impl RelPath {
  /// The empty path, referring to the item root.
  pub fn root() -> Self {
    RelPath(String::new())
  }

  pub fn parse(s: &str) -> Result<Self, RelPathError> {
    if s.is_empty() || s == "." {
      return Ok(RelPath::root());
    }
    if s.contains('\\') {
      return Err(RelPathError::Backslash(s.to_string()));
    }
    if s.starts_with('/') {
      return Err(RelPathError::Absolute(s.to_string()));
    }
    let trimmed = s.strip_suffix('/').unwrap_or(s);
    for segment in trimmed.split('/') {
      match segment {
        "" => return Err(RelPathError::EmptySegment(s.to_string())),
        "." => return Err(RelPathError::DotSegment(s.to_string(), ".")),
        ".." => return Err(RelPathError::DotSegment(s.to_string(), "..")),
        _ => {}
      }
    }
    Ok(RelPath(trimmed.to_string()))
  }

  /// Like [`RelPath::parse`], but rejects the empty path. Used for
  /// dependency destinations, which must name a concrete location.
  pub fn parse_non_empty(s: &str) -> Result<Self, RelPathError> {
    let path = Self::parse(s)?;
    if path.is_empty() {
      return Err(RelPathError::Empty);
    }
    Ok(path)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Join onto a base directory; the empty path yields the base itself.
  pub fn join_onto(&self, base: &Path) -> PathBuf {
    if self.is_empty() {
      base.to_path_buf()
    } else {
      base.join(&self.0)
    }
  }

  /// Append a further segment, e.g. a job id under an `all`-query base.
  pub fn join(&self, segment: &str) -> RelPath {
    if self.is_empty() {
      RelPath(segment.to_string())
    } else {
      RelPath(format!("{}/{}", self.0, segment))
    }
  }
}

impl std::fmt::Display for RelPath {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}
