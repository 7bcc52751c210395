//! SHA-256 hashing and the job identifier type.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a job identifier in hex characters.
pub const JOB_ID_LEN: usize = 64;

/// A content-addressed job identifier.
///
/// The identifier is the lowercase hex SHA-256 digest of the job's hashed
/// inputs. Parsing rejects anything that is not exactly 64 lowercase hex
/// characters, which also rejects identifiers from pre-release repositories
/// that keyed jobs by UUID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid job id `{0}`: expected {JOB_ID_LEN} lowercase hex characters")]
pub struct InvalidJobId(pub String);

impl JobId {
  pub fn parse(s: &str) -> Result<Self, InvalidJobId> {
    if s.len() == JOB_ID_LEN && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
      Ok(JobId(s.to_string()))
    } else {
      Err(InvalidJobId(s.to_string()))
    }
  }

  /// Wraps a digest produced by [`hash_bytes`] or [`hash_file`].
  pub(crate) fn from_digest(digest: String) -> Self {
    debug_assert_eq!(digest.len(), JOB_ID_LEN);
    JobId(digest)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for JobId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl TryFrom<String> for JobId {
  type Error = InvalidJobId;

  fn try_from(s: String) -> Result<Self, Self::Error> {
    JobId::parse(&s)
  }
}

impl From<JobId> for String {
  fn from(id: JobId) -> String {
    id.0
  }
}

/// Compute the SHA-256 digest of a file's contents as lowercase hex.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
  let file = File::open(path)?;
  let mut reader = BufReader::new(file);
  let mut hasher = Sha256::new();

  let mut buffer = [0u8; 65536];
  loop {
    let bytes_read = reader.read(&mut buffer)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(hex::encode(hasher.finalize()))
}

/// Compute the SHA-256 digest of a byte slice as lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data);
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use std::fs;

  use tempfile::TempDir;

  use super::*;

  #[test]
  fn hash_bytes_known_vector() {
    assert_eq!(
      hash_bytes(b"hello world"),
      "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
    );
  }

  #[test]
  fn hash_file_matches_hash_bytes() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("data.txt");
    fs::write(&path, b"hello world").unwrap();

    assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"hello world"));
  }

  #[test]
  fn hash_empty_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("empty");
    fs::write(&path, b"").unwrap();

    assert_eq!(
      hash_file(&path).unwrap(),
      "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
  }

  #[test]
  fn job_id_roundtrip() {
    let digest = hash_bytes(b"some job");
    let id = JobId::parse(&digest).unwrap();
    assert_eq!(id.as_str(), digest);
    assert_eq!(id.to_string(), digest);
  }

  #[test]
  fn job_id_rejects_uuid() {
    assert!(JobId::parse("123e4567-e89b-12d3-a456-426614174000").is_err());
  }

  #[test]
  fn job_id_rejects_uppercase_and_short() {
    let digest = hash_bytes(b"x").to_uppercase();
    assert!(JobId::parse(&digest).is_err());
    assert!(JobId::parse("abc123").is_err());
  }
}
