//! Implementation of the `r3 pull` command.
//!
//! Fetches new history into the cached bare clone for a repository URL.
//! The update is refused if it would lose any commit pinned by a job.

use std::path::Path;

use anyhow::Result;

use r3_lib::Repository;

use crate::output::print_success;

pub fn cmd_pull(url: &str, repository: &Path) -> Result<()> {
  let repo = Repository::open(repository)?;
  repo.pull(url)?;

  print_success(&format!("Updated {url}"));
  Ok(())
}
