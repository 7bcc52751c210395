//! Implementation of the `r3 init` command.

use std::path::Path;

use anyhow::Result;

use r3_lib::Repository;

use crate::output::print_success;

/// Create a new repository at the given path.
///
/// # Errors
///
/// Fails if the path exists already or cannot be created.
pub fn cmd_init(path: &Path) -> Result<()> {
  let repository = Repository::init(path)?;
  print_success(&format!("Initialized empty repository at {}", repository.root().display()));
  Ok(())
}
