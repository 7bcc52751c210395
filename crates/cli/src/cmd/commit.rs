//! Implementation of the `r3 commit` command.
//!
//! Resolves the staged job's dependencies, computes its content-addressed
//! identity, and places it into the repository. Committing content that is
//! already present reports the existing id and succeeds.

use std::path::Path;

use anyhow::Result;

use r3_lib::Repository;
use r3_lib::resolver::QuerySelect;

use crate::output::{print_info, print_success};

pub fn cmd_commit(src: &Path, repository: &Path, latest: bool, all: bool) -> Result<()> {
  let select = if all {
    QuerySelect::All
  } else if latest {
    QuerySelect::Latest
  } else {
    QuerySelect::One
  };

  let repo = Repository::open(repository)?;
  let receipt = repo.commit_with(src, select)?;

  if receipt.already_present {
    print_info(&format!("Job exists already: {}", receipt.id));
  } else {
    print_success(&format!("Committed job {}", receipt.id));
  }
  println!("{}", receipt.id);
  Ok(())
}
