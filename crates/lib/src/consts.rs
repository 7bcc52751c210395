//! Repository-wide constants.

use std::time::Duration;

/// Format version written into the repository marker.
pub const FORMAT_VERSION: &str = "1.0.0";

/// File name of the repository marker and of job manifests.
pub const CONFIG_FILE: &str = "r3.yaml";

/// File name of the mutable per-job metadata document.
pub const METADATA_FILE: &str = "metadata.yaml";

/// Name of the mutable output directory inside a job.
pub const OUTPUT_DIR: &str = "output";

/// Directory holding committed jobs.
pub const JOBS_DIR: &str = "jobs";

/// Directory holding bare git clones.
pub const GIT_DIR: &str = "git";

/// Directory holding per-commit checkouts of git dependencies, nested
/// inside [`GIT_DIR`].
pub const GIT_CHECKOUTS_DIR: &str = ".checkouts";

/// File name of the derived index cache.
pub const INDEX_FILE: &str = "index.yaml";

/// Prefix of staging directories created inside `jobs/` during commit.
pub const STAGING_PREFIX: &str = ".staging-";

/// Namespace of the lightweight tags that pin git commits against GC.
pub const TAG_NAMESPACE: &str = "r3/";

/// Staging directories older than this are swept on repository open.
pub const STAGING_MAX_AGE: Duration = Duration::from_secs(3600);

/// How long lock acquisition waits before giving up.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
