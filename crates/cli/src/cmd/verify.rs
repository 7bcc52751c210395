//! Implementation of the `r3 verify` command.

use std::path::Path;

use anyhow::{Context, Result};

use r3_lib::{JobId, Repository};

use crate::output::{print_success, truncate_hash};

pub fn cmd_verify(id: &str, repository: &Path) -> Result<()> {
  let id = JobId::parse(id).context("Invalid job id")?;
  let repo = Repository::open(repository)?;
  repo.verify(&id)?;

  print_success(&format!("Job {} is intact", truncate_hash(id.as_str())));
  Ok(())
}
