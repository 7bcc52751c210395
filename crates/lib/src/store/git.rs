//! The git cache: bare clones, commit pinning, and per-commit checkouts.
//!
//! Every git dependency's repository is mirrored as a bare clone under
//! `git/<normalized-url>/` inside the repository. Commits referenced by
//! committed jobs are pinned with a lightweight tag `r3/<job-id>` so no
//! fetch or GC can prune them. Checkout materializes a detached working
//! tree per commit under `git/.checkouts/<commit>/`, cloned from the local
//! bare cache, and jobs symlink into it.
//!
//! All network access happens by invoking the system git client. A per-URL
//! lock file serializes mutations of each clone.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info};

use crate::consts::{GIT_CHECKOUTS_DIR, GIT_DIR, TAG_NAMESPACE};
use crate::hash::JobId;
use crate::repo_lock::{LockMode, RepoLock, RepoLockError};

#[derive(Debug, Error)]
pub enum GitError {
  #[error("unrecognized git url `{0}`")]
  Url(String),

  #[error("failed to run git: {0}")]
  Spawn(#[source] io::Error),

  #[error("git {args} failed: {stderr}")]
  Command { args: String, stderr: String },

  #[error("commit `{commit}` is not reachable in `{url}`")]
  MissingCommit { url: String, commit: String },

  #[error("cannot resolve `{reference}` in `{url}`")]
  RefNotFound { url: String, reference: String },

  #[error("update would lose pinned commit `{commit}` (tag `{tag}`)")]
  PinnedCommitLost { tag: String, commit: String },

  #[error(transparent)]
  Lock(#[from] RepoLockError),

  #[error("failed to {action} {path}: {source}")]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Normalize a repository URL to the `host/owner/name` form keying the
/// `git/` subtree. Accepts `https://`, `http://`, `ssh://`, `file://`,
/// `git@host:path`, and scheme-less forms; a trailing `.git` is dropped.
pub fn normalize_url(url: &str) -> Result<String, GitError> {
  let mut rest: String = if let Some(scp) = url.strip_prefix("git@") {
    scp.replacen(':', "/", 1)
  } else {
    url
      .strip_prefix("https://")
      .or_else(|| url.strip_prefix("http://"))
      .or_else(|| url.strip_prefix("ssh://"))
      .or_else(|| url.strip_prefix("file://"))
      .unwrap_or(url)
      .trim_start_matches("git@")
      .to_string()
  };
  if let Some(stripped) = rest.strip_suffix(".git") {
    rest = stripped.to_string();
  }

  let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
  if segments.len() < 2 || segments.iter().any(|s| *s == "." || *s == "..") {
    return Err(GitError::Url(url.to_string()));
  }
  Ok(segments.join("/"))
}

/// Manages the `git/` subtree of a repository.
pub struct GitCache {
  root: PathBuf,
}

impl GitCache {
  pub fn new(root: &Path) -> Self {
    GitCache {
      root: root.to_path_buf(),
    }
  }

  /// The bare clone directory for a repository URL.
  pub fn clone_dir(&self, url: &str) -> Result<PathBuf, GitError> {
    Ok(self.root.join(GIT_DIR).join(normalize_url(url)?))
  }

  /// Ensure the bare clone holds `commit`, cloning and fetching as needed.
  pub fn ensure_commit(&self, url: &str, commit: &str) -> Result<(), GitError> {
    let clone = self.clone_dir(url)?;
    let _lock = self.lock(&clone)?;
    self.ensure_clone(url, &clone)?;

    if !self.commit_exists(&clone, commit)? {
      self.fetch(&clone)?;
      if !self.commit_exists(&clone, commit)? {
        return Err(GitError::MissingCommit {
          url: url.to_string(),
          commit: commit.to_string(),
        });
      }
    }
    Ok(())
  }

  /// Resolve a symbolic ref (branch or tag) to a full commit id, fetching
  /// and retrying once if the ref is unknown locally.
  pub fn resolve_ref(&self, url: &str, reference: &str) -> Result<String, GitError> {
    let clone = self.clone_dir(url)?;
    let _lock = self.lock(&clone)?;
    self.ensure_clone(url, &clone)?;

    let spec = format!("{reference}^{{commit}}");
    if let Some(commit) = self.try_rev_parse(&clone, &spec)? {
      return Ok(commit);
    }
    self.fetch(&clone)?;
    match self.try_rev_parse(&clone, &spec)? {
      Some(commit) => Ok(commit),
      None => Err(GitError::RefNotFound {
        url: url.to_string(),
        reference: reference.to_string(),
      }),
    }
  }

  /// Pin a commit against GC with the lightweight tag `r3/<job-id>`.
  pub fn pin(&self, url: &str, commit: &str, id: &JobId) -> Result<(), GitError> {
    let clone = self.clone_dir(url)?;
    let _lock = self.lock(&clone)?;
    let tag = format!("{TAG_NAMESPACE}{id}");
    git(Some(&clone), &["tag", "-f", tag.as_str(), commit])?;
    debug!(tag = %tag, commit, "pinned commit");
    Ok(())
  }

  /// Drop a job's pin tags from every clone. Best-effort: a clone that
  /// never held the tag is skipped silently.
  pub fn drop_pins(&self, id: &JobId) -> Result<(), GitError> {
    let tag = format!("{TAG_NAMESPACE}{id}");
    for clone in self.clones()? {
      let _lock = self.lock(&clone)?;
      if self.tag_exists(&clone, &tag)? {
        git(Some(&clone), &["tag", "-d", tag.as_str()])?;
        debug!(tag = %tag, clone = %clone.display(), "dropped pin");
      }
    }
    Ok(())
  }

  /// Fetch new history into a clone, refusing updates that would lose any
  /// pinned commit.
  pub fn pull(&self, url: &str) -> Result<(), GitError> {
    let clone = self.clone_dir(url)?;
    let _lock = self.lock(&clone)?;
    self.ensure_clone(url, &clone)?;
    self.fetch(&clone)?;

    for (tag, commit) in self.pin_tags(&clone)? {
      if !self.commit_exists(&clone, &commit)? {
        return Err(GitError::PinnedCommitLost { tag, commit });
      }
    }
    info!(url, "updated git cache");
    Ok(())
  }

  /// Materialize (or reuse) a detached working tree for a commit under
  /// `git/.checkouts/<commit>/`.
  pub fn commit_checkout(&self, url: &str, commit: &str) -> Result<PathBuf, GitError> {
    let checkout = self.root.join(GIT_DIR).join(GIT_CHECKOUTS_DIR).join(commit);
    if checkout.exists() {
      return Ok(checkout);
    }

    let clone = self.clone_dir(url)?;
    let _lock = self.lock(&clone)?;
    if checkout.exists() {
      return Ok(checkout);
    }

    let parent = checkout.parent().expect("checkout path has a parent");
    std::fs::create_dir_all(parent).map_err(|e| GitError::Io {
      action: "create",
      path: parent.to_path_buf(),
      source: e,
    })?;

    // Clone from the local bare cache into a temporary sibling, detach at
    // the pinned commit, then publish with an atomic rename. A local clone
    // hardlinks objects, so this stays cheap.
    let staging = parent.join(format!(".tmp-{}", nonce()));
    let clone_str = clone.display().to_string();
    let staging_str = staging.display().to_string();
    git(None, &["clone", "--quiet", clone_str.as_str(), staging_str.as_str()])?;
    git(Some(&staging), &["checkout", "--quiet", "--detach", commit])?;

    match std::fs::rename(&staging, &checkout) {
      Ok(()) => Ok(checkout),
      Err(_) if checkout.exists() => {
        // Lost a race against another checkout of the same commit.
        let _ = std::fs::remove_dir_all(&staging);
        Ok(checkout)
      }
      Err(e) => {
        let _ = std::fs::remove_dir_all(&staging);
        Err(GitError::Io {
          action: "rename",
          path: checkout,
          source: e,
        })
      }
    }
  }

  fn lock(&self, clone: &Path) -> Result<RepoLock, GitError> {
    let lock_path = clone.with_extension("lock");
    if let Some(parent) = lock_path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| GitError::Io {
        action: "create",
        path: parent.to_path_buf(),
        source: e,
      })?;
    }
    Ok(RepoLock::acquire_at(
      lock_path,
      LockMode::Exclusive,
      "git",
      Duration::from_secs(600),
    )?)
  }

  fn ensure_clone(&self, url: &str, clone: &Path) -> Result<(), GitError> {
    if clone.join("HEAD").exists() {
      return Ok(());
    }
    if let Some(parent) = clone.parent() {
      std::fs::create_dir_all(parent).map_err(|e| GitError::Io {
        action: "create",
        path: parent.to_path_buf(),
        source: e,
      })?;
    }
    info!(url, clone = %clone.display(), "creating bare clone");
    let clone_str = clone.display().to_string();
    git(None, &["clone", "--quiet", "--bare", url, clone_str.as_str()])?;
    Ok(())
  }

  fn fetch(&self, clone: &Path) -> Result<(), GitError> {
    debug!(clone = %clone.display(), "fetching");
    git(Some(clone), &["fetch", "--quiet", "origin", "+refs/*:refs/*"])?;
    Ok(())
  }

  fn commit_exists(&self, clone: &Path, commit: &str) -> Result<bool, GitError> {
    let spec = format!("{commit}^{{commit}}");
    git_status(Some(clone), &["cat-file", "-e", spec.as_str()])
  }

  fn tag_exists(&self, clone: &Path, tag: &str) -> Result<bool, GitError> {
    let refname = format!("refs/tags/{tag}");
    git_status(
      Some(clone),
      &["show-ref", "--verify", "--quiet", refname.as_str()],
    )
  }

  fn try_rev_parse(&self, clone: &Path, spec: &str) -> Result<Option<String>, GitError> {
    let mut cmd = Command::new("git");
    cmd.current_dir(clone).args(["rev-parse", "--verify", "--quiet", spec]);
    let output = cmd.output().map_err(GitError::Spawn)?;
    if output.status.success() {
      Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    } else {
      Ok(None)
    }
  }

  /// The `(tag, commit)` pairs of every `r3/*` pin in a clone.
  fn pin_tags(&self, clone: &Path) -> Result<Vec<(String, String)>, GitError> {
    let pattern = format!("refs/tags/{}", TAG_NAMESPACE.trim_end_matches('/'));
    let listing = git(
      Some(clone),
      &["for-each-ref", "--format=%(refname:short) %(objectname)", pattern.as_str()],
    )?;

    let mut pins = Vec::new();
    for line in listing.lines() {
      if let Some((tag, commit)) = line.split_once(' ') {
        pins.push((tag.to_string(), commit.to_string()));
      }
    }
    Ok(pins)
  }

  /// Every bare clone under `git/`, i.e. directories containing a HEAD.
  fn clones(&self) -> Result<Vec<PathBuf>, GitError> {
    let git_root = self.root.join(GIT_DIR);
    if !git_root.exists() {
      return Ok(Vec::new());
    }

    let mut clones = Vec::new();
    let mut iter = walkdir::WalkDir::new(&git_root).min_depth(1).into_iter();
    while let Some(entry) = iter.next() {
      let entry = entry.map_err(|e| GitError::Io {
        action: "walk",
        path: git_root.clone(),
        source: io::Error::other(e),
      })?;
      let name = entry.file_name().to_string_lossy();
      if name == GIT_CHECKOUTS_DIR {
        iter.skip_current_dir();
        continue;
      }
      if entry.file_type().is_dir() && entry.path().join("HEAD").exists() {
        clones.push(entry.path().to_path_buf());
        iter.skip_current_dir();
      }
    }
    Ok(clones)
  }
}

fn git(current_dir: Option<&Path>, args: &[&str]) -> Result<String, GitError> {
  let mut cmd = Command::new("git");
  if let Some(dir) = current_dir {
    cmd.current_dir(dir);
  }
  cmd.args(args);
  let output = cmd.output().map_err(GitError::Spawn)?;
  if !output.status.success() {
    return Err(GitError::Command {
      args: args.join(" "),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }
  Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run git for a yes/no answer: exit 0 is `true`, any failure is `false`.
fn git_status(current_dir: Option<&Path>, args: &[&str]) -> Result<bool, GitError> {
  let mut cmd = Command::new("git");
  if let Some(dir) = current_dir {
    cmd.current_dir(dir);
  }
  cmd.args(args);
  let output = cmd.output().map_err(GitError::Spawn)?;
  Ok(output.status.success())
}

fn nonce() -> String {
  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_nanos();
  format!("{}-{}", std::process::id(), nanos)
}
