//! Dependency resolution ahead of hashing.
//!
//! Two rewrites happen before a job can be committed:
//!
//! 1. **Query expansion.** A `query` record names jobs by `#tag` terms;
//!    the index answers with concrete job ids. The original query text is
//!    kept on the resolved record for provenance but never enters the hash.
//! 2. **Git ref pinning.** A git record whose `commit` is a branch or tag
//!    name is resolved against the bare clone (fetching once on a miss)
//!    and rewritten to the full object id.

use thiserror::Error;

use crate::dependency::{Dependency, JobDependency};
use crate::index::{Index, IndexError};
use crate::store::git::{GitCache, GitError};

/// How a query maps to jobs when more than one matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuerySelect {
  /// Exactly one job must match; several matches are ambiguous.
  #[default]
  One,
  /// The most recently committed match wins.
  Latest,
  /// Every match becomes a dependency, checked out under
  /// `<destination>/<job-id>`.
  All,
}

#[derive(Debug, Error)]
pub enum ResolveError {
  #[error("no job matches query `{0}`")]
  DependencyNotFound(String),

  #[error("query `{query}` matches {count} jobs; request latest or all semantics to disambiguate")]
  AmbiguousDependency { query: String, count: usize },

  #[error("invalid query `{0}`: expected whitespace-separated `#tag` terms")]
  InvalidQuery(String),

  #[error("cannot resolve ref `{reference}` in `{repository}`")]
  RefResolution {
    repository: String,
    reference: String,
    #[source]
    source: GitError,
  },

  #[error("missing dependency: job `{0}` is not in the repository")]
  MissingJob(crate::hash::JobId),

  #[error(transparent)]
  Git(#[from] GitError),

  #[error(transparent)]
  Index(#[from] IndexError),
}

/// Resolve every dependency to a concrete job id or pinned commit.
pub fn resolve_dependencies(
  dependencies: &[Dependency],
  index: &Index,
  git: &GitCache,
  select: QuerySelect,
) -> Result<Vec<Dependency>, ResolveError> {
  let mut resolved = Vec::with_capacity(dependencies.len());
  for dep in dependencies {
    match dep {
      Dependency::Job(_) => resolved.push(dep.clone()),
      Dependency::Git(git_dep) => {
        if git_dep.is_pinned() {
          resolved.push(dep.clone());
        } else {
          let commit = git
            .resolve_ref(&git_dep.repository, &git_dep.commit)
            .map_err(|source| ResolveError::RefResolution {
              repository: git_dep.repository.clone(),
              reference: git_dep.commit.clone(),
              source,
            })?;
          let mut pinned = git_dep.clone();
          pinned.commit = commit;
          resolved.push(Dependency::Git(pinned));
        }
      }
      Dependency::Query(query_dep) => {
        let tags = parse_query(&query_dep.query)?;
        let mut matches = index.find(&tags)?;

        match select {
          QuerySelect::One => {
            if matches.is_empty() {
              return Err(ResolveError::DependencyNotFound(query_dep.query.clone()));
            }
            if matches.len() > 1 {
              return Err(ResolveError::AmbiguousDependency {
                query: query_dep.query.clone(),
                count: matches.len(),
              });
            }
            resolved.push(Dependency::Job(JobDependency {
              job: matches.remove(0).0,
              source: query_dep.source.clone(),
              destination: query_dep.destination.clone(),
              query: Some(query_dep.query.clone()),
            }));
          }
          QuerySelect::Latest => {
            // `find` returns matches ordered by commit time; the newest
            // is last.
            let (job, _) = matches
              .pop()
              .ok_or_else(|| ResolveError::DependencyNotFound(query_dep.query.clone()))?;
            resolved.push(Dependency::Job(JobDependency {
              job,
              source: query_dep.source.clone(),
              destination: query_dep.destination.clone(),
              query: Some(query_dep.query.clone()),
            }));
          }
          QuerySelect::All => {
            if matches.is_empty() {
              return Err(ResolveError::DependencyNotFound(query_dep.query.clone()));
            }
            for (job, _) in matches {
              // Each match gets its own directory named by job id; a
              // shared destination would collide.
              let destination = query_dep.destination.join(job.as_str());
              resolved.push(Dependency::Job(JobDependency {
                job,
                source: query_dep.source.clone(),
                destination,
                query: Some(query_dep.query.clone()),
              }));
            }
          }
        }
      }
    }
  }
  Ok(resolved)
}

/// Split a query into its tag terms: whitespace-separated words, each
/// starting with `#`.
fn parse_query(query: &str) -> Result<Vec<String>, ResolveError> {
  let terms: Vec<&str> = query.split_whitespace().collect();
  if terms.is_empty() || !terms.iter().all(|t| t.starts_with('#') && t.len() > 1) {
    return Err(ResolveError::InvalidQuery(query.to_string()));
  }
  Ok(terms.iter().map(|t| t[1..].to_string()).collect())
}
