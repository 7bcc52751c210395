//! Implementation of the `r3 rebuild-index` command.
//!
//! The index is a derived cache; this drops it and rescans `jobs/`. Needed
//! after editing a job's `metadata.yaml` by hand, or whenever the cache is
//! suspected stale.

use std::path::Path;

use anyhow::Result;

use r3_lib::Repository;

use crate::output::print_success;

pub fn cmd_rebuild_index(repository: &Path) -> Result<()> {
  let repo = Repository::open(repository)?;
  let count = repo.rebuild_index()?;

  print_success(&format!("Indexed {count} jobs"));
  Ok(())
}
