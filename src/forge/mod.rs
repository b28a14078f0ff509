//! The forge client: a thin, idempotent wrapper around the forge's REST API.
//!
//! The controller and constructor talk to the forge exclusively through the
//! [`ForgeClient`] trait, so they can be driven against an in-memory fake in
//! tests. The production implementation ([`OctocrabForge`]) wraps octocrab
//! with retry and transient/permanent error categorization.

pub mod client;
pub mod error;
pub mod retry;
pub mod types;

pub use client::OctocrabForge;
pub use error::ForgeError;
pub use retry::{RetryConfig, retry_with_backoff};
pub use types::{
    ChecksOutcome, CombinedState, CommitData, CompareData, ContextStatus, MergeOutcome, PrData,
    PrState, ReviewData, ReviewVerdict, StatusSummary,
};

use async_trait::async_trait;

use crate::types::{PrNumber, RepoId, Sha};

/// The forge capabilities the merge queue needs.
///
/// Every call is idempotent from the queue's point of view: operations either
/// commit a ref/commit/comment or fail without local state change, and the
/// poller re-drives anything abandoned mid-flight.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// Reads a PR's metadata.
    async fn pr_info(&self, repo: &RepoId, pr: PrNumber) -> Result<PrData, ForgeError>;

    /// Lists all reviews on a PR.
    async fn list_reviews(&self, repo: &RepoId, pr: PrNumber)
    -> Result<Vec<ReviewData>, ForgeError>;

    /// Reads the combined commit status at a SHA.
    async fn combined_status(&self, repo: &RepoId, sha: &Sha) -> Result<StatusSummary, ForgeError>;

    /// Lists check-run conclusions at a SHA, as status-like contexts.
    async fn check_runs(&self, repo: &RepoId, sha: &Sha) -> Result<Vec<ContextStatus>, ForgeError>;

    /// Resolves a branch name to the commit it points at.
    async fn branch_sha(&self, repo: &RepoId, branch: &str) -> Result<Sha, ForgeError>;

    /// Creates a branch pointing at `sha`.
    async fn create_branch(&self, repo: &RepoId, branch: &str, sha: &Sha)
    -> Result<(), ForgeError>;

    /// Force-updates a branch to `sha`, creating it if necessary.
    async fn force_update_branch(
        &self,
        repo: &RepoId,
        branch: &str,
        sha: &Sha,
    ) -> Result<(), ForgeError>;

    /// Fast-forwards a branch to `sha` with a non-forced ref update.
    ///
    /// Fails with [`ForgeError::NotFastForward`] if `sha` does not descend
    /// from the branch's current tip.
    async fn fast_forward_branch(
        &self,
        repo: &RepoId,
        branch: &str,
        sha: &Sha,
    ) -> Result<(), ForgeError>;

    /// Deletes a branch. Deleting a branch that does not exist is not an error.
    async fn delete_branch(&self, repo: &RepoId, branch: &str) -> Result<(), ForgeError>;

    /// Performs a server-side merge of `head` into `branch`.
    async fn merge_into_branch(
        &self,
        repo: &RepoId,
        branch: &str,
        head: &Sha,
        message: &str,
    ) -> Result<MergeOutcome, ForgeError>;

    /// Reads a commit (tree, parents, message).
    async fn get_commit(&self, repo: &RepoId, sha: &Sha) -> Result<CommitData, ForgeError>;

    /// Creates a commit object from a tree and parent list. Returns its SHA.
    async fn create_commit(
        &self,
        repo: &RepoId,
        message: &str,
        tree: &Sha,
        parents: &[Sha],
    ) -> Result<Sha, ForgeError>;

    /// Three-dot compare: commits reachable from `head` but not from the
    /// merge base with `base`, plus how far `head` is behind `base`.
    async fn compare(&self, repo: &RepoId, base: &Sha, head: &Sha)
    -> Result<CompareData, ForgeError>;

    /// Posts a comment on a PR.
    async fn post_comment(
        &self,
        repo: &RepoId,
        pr: PrNumber,
        body: &str,
    ) -> Result<(), ForgeError>;
}
