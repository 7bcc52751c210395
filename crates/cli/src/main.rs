//! r3: the command-line interface to R3 repositories.
//!
//! Provides the `r3` command with subcommands:
//! - `r3 init <path>` - create a repository
//! - `r3 commit <src> [<repository>]` - commit a staged job
//! - `r3 checkout <id> <dst> [<repository>]` - materialize a job
//! - `r3 verify <id> [<repository>]` - check a job against its id
//! - `r3 remove <id> [<repository>]` - remove an unreferenced job
//! - `r3 pull <url> [<repository>]` - update a cached git repository
//! - `r3 rebuild-index [<repository>]` - rebuild the derived cache
//!
//! The repository path defaults to `$R3_REPOSITORY`. Exit codes: 0 on
//! success, 1 on user errors (config, dependencies, resolution), 2 on
//! integrity failures, 3 on I/O and lock failures.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use r3_lib::RepositoryError;
use r3_lib::builder::BuildError;
use r3_lib::checkout::CheckoutError;
use r3_lib::store::StoreError;
use r3_lib::store::git::GitError;

mod cmd;
mod output;

#[derive(Parser)]
#[command(name = "r3")]
#[command(version, about = "Content-addressed repository for reproducible research jobs")]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Create a new repository
  Init {
    /// Path for the new repository; must not exist yet
    path: PathBuf,
  },

  /// Commit a staged job directory
  Commit {
    /// Staged job directory
    src: PathBuf,
    /// Repository path
    #[arg(env = "R3_REPOSITORY")]
    repository: PathBuf,
    /// Resolve a query matching several jobs to the most recent one
    #[arg(long, conflicts_with = "all")]
    latest: bool,
    /// Resolve a query to every matching job
    #[arg(long)]
    all: bool,
  },

  /// Check out a committed job into a working directory
  Checkout {
    /// Job identifier
    id: String,
    /// Target directory; must not exist yet
    dst: PathBuf,
    /// Repository path
    #[arg(env = "R3_REPOSITORY")]
    repository: PathBuf,
  },

  /// Verify a committed job against its identifier
  Verify {
    /// Job identifier
    id: String,
    /// Repository path
    #[arg(env = "R3_REPOSITORY")]
    repository: PathBuf,
  },

  /// Remove a committed job that no other job depends on
  Remove {
    /// Job identifier
    id: String,
    /// Repository path
    #[arg(env = "R3_REPOSITORY")]
    repository: PathBuf,
  },

  /// Fetch new history for a cached git repository
  Pull {
    /// Repository URL as written in job manifests
    url: String,
    /// Repository path
    #[arg(env = "R3_REPOSITORY")]
    repository: PathBuf,
  },

  /// Rebuild the derived job index from the store
  RebuildIndex {
    /// Repository path
    #[arg(env = "R3_REPOSITORY")]
    repository: PathBuf,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
  FmtSubscriber::builder()
    .with_max_level(level)
    .with_target(false)
    .without_time()
    .init();

  let result = match cli.command {
    Commands::Init { path } => cmd::cmd_init(&path),
    Commands::Commit {
      src,
      repository,
      latest,
      all,
    } => cmd::cmd_commit(&src, &repository, latest, all),
    Commands::Checkout { id, dst, repository } => cmd::cmd_checkout(&id, &dst, &repository),
    Commands::Verify { id, repository } => cmd::cmd_verify(&id, &repository),
    Commands::Remove { id, repository } => cmd::cmd_remove(&id, &repository),
    Commands::Pull { url, repository } => cmd::cmd_pull(&url, &repository),
    Commands::RebuildIndex { repository } => cmd::cmd_rebuild_index(&repository),
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      output::print_error(&format!("{err:#}"));
      ExitCode::from(exit_code(&err))
    }
  }
}

/// Map an error chain to the documented exit codes: 1 for user errors,
/// 2 for integrity failures, 3 for I/O, lock, and everything external.
fn exit_code(err: &anyhow::Error) -> u8 {
  if err.downcast_ref::<r3_lib::hash::InvalidJobId>().is_some() {
    return 1;
  }
  let Some(repo_err) = err.downcast_ref::<RepositoryError>() else {
    return 3;
  };

  match repo_err {
    RepositoryError::NotFound(_)
    | RepositoryError::NotADirectory(_)
    | RepositoryError::MissingMarker(_)
    | RepositoryError::AlreadyExists(_)
    | RepositoryError::Version { .. }
    | RepositoryError::Config(_)
    | RepositoryError::Resolve(_) => 1,

    RepositoryError::Build(build) => match build {
      BuildError::Walk { .. } | BuildError::HashFile { .. } => 3,
      _ => 1,
    },

    RepositoryError::Store(store) => match store {
      StoreError::Integrity { .. } => 2,
      StoreError::JobNotFound(_) | StoreError::JobReferenced { .. } | StoreError::Config(_) => 1,
      _ => 3,
    },

    RepositoryError::Checkout(checkout) => match checkout {
      CheckoutError::Io { .. } | CheckoutError::Git(_) => 3,
      _ => 1,
    },

    RepositoryError::Git(git) => match git {
      GitError::Url(_) | GitError::MissingCommit { .. } | GitError::RefNotFound { .. } => 1,
      GitError::PinnedCommitLost { .. } => 2,
      _ => 3,
    },

    RepositoryError::Lock(_) | RepositoryError::Index(_) | RepositoryError::Io { .. } => 3,
  }
}
