//! Implementation of the `r3 remove` command.

use std::path::Path;

use anyhow::{Context, Result};

use r3_lib::{JobId, Repository};

use crate::output::{print_success, truncate_hash};

pub fn cmd_remove(id: &str, repository: &Path) -> Result<()> {
  let id = JobId::parse(id).context("Invalid job id")?;
  let repo = Repository::open(repository)?;
  repo.remove(&id)?;

  print_success(&format!("Removed job {}", truncate_hash(id.as_str())));
  Ok(())
}
