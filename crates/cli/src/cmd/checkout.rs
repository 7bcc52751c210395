//! Implementation of the `r3 checkout` command.

use std::path::Path;

use anyhow::{Context, Result};

use r3_lib::{JobId, Repository};

use crate::output::{print_success, truncate_hash};

pub fn cmd_checkout(id: &str, dst: &Path, repository: &Path) -> Result<()> {
  let id = JobId::parse(id).context("Invalid job id")?;
  let repo = Repository::open(repository)?;
  repo.checkout(&id, dst)?;

  print_success(&format!(
    "Checked out {} into {}",
    truncate_hash(id.as_str()),
    dst.display()
  ));
  Ok(())
}
