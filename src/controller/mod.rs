//! The merge-queue controller: the coupled state machines of PR rows and
//! merge attempts.
//!
//! The controller owns every store write. Webhook handlers and the poller
//! never mutate rows directly; they invoke the entry points here. Each
//! sub-operation commits its writes in a single store transaction, and every
//! write that follows a forge call re-checks the state it read before the
//! call (optimistic concurrency) - a concurrent cancel simply wins.
//!
//! Transient forge errors are never retried locally beyond the client's
//! built-in backoff: the operation exits, state is left as persisted, and the
//! next poll re-drives it. The poller is the retry.

mod admission;
mod poll;
mod testing;


use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{QueueConfig, Timeouts};
use crate::forge::{ForgeClient, ForgeError, PrData, PrState};
use crate::readiness::{self, Readiness};
use crate::store::{Store, StoreError};
use crate::types::{PrNumber, PrQueueState, PrRecord, RepoId, Sha};

/// Errors from controller operations.
///
/// These are logged and dropped by the event router and the poller; the
/// persisted state is always consistent when one of these surfaces, so the
/// next poll picks the operation back up.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("forge error: {0}")]
    Forge(#[from] ForgeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Why a PR is being cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// An explicit cancel command from a user.
    Command,
    /// The PR's head branch was pushed, invalidating the frozen head.
    HeadMoved,
    /// The PR was closed on the forge.
    Closed,
}

/// The merge-queue controller.
pub struct Controller {
    store: Arc<Store>,
    forge: Arc<dyn ForgeClient>,
    config: Arc<QueueConfig>,
    timeouts: Timeouts,
}

enum RequestOutcome {
    AlreadyQueued,
    Inserted,
}

enum CancelOutcome {
    NotQueued,
    Removed {
        /// Staging branch to delete because the attempt was removed or became
        /// unsound (demoted while its staging commit was in flight or under
        /// test).
        staging_to_delete: Option<String>,
    },
}

enum StatusTarget {
    /// The SHA is an attempt's staging commit.
    Staging(crate::types::AttemptId),
    /// The SHA is (or may be) the head of these requested PRs.
    PrHeads(Vec<PrNumber>),
}

impl Controller {
    /// Creates a controller with the default timeout table.
    pub fn new(store: Arc<Store>, forge: Arc<dyn ForgeClient>, config: Arc<QueueConfig>) -> Self {
        Controller {
            store,
            forge,
            config,
            timeouts: Timeouts::default(),
        }
    }

    /// Overrides the timeout table (used by tests).
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Handles a merge command on a PR.
    ///
    /// Records the PR's current head and inserts the row: `Queued` if the PR
    /// is ready, `Requested` otherwise. User errors (closed PR, disallowed
    /// base branch, already queued) are reported as comments and change no
    /// state.
    pub async fn request(&self, repo: &RepoId, pr: PrNumber) -> Result<(), ControllerError> {
        info!(repo = %repo, pr = %pr, "merge requested");
        let data = self.forge.pr_info(repo, pr).await?;

        if data.state == PrState::Closed {
            self.forge
                .post_comment(repo, pr, "Refusing to merge: this PR is closed.")
                .await?;
            return Ok(());
        }

        let cfg = self.config.repo(repo);
        if !cfg.branch_allowed(&data.base_ref) {
            self.forge
                .post_comment(
                    repo,
                    pr,
                    &format!(
                        "Refusing to merge: base branch `{}` is not on the merge allow-list.",
                        data.base_ref
                    ),
                )
                .await?;
            return Ok(());
        }

        let readiness = self.snapshot_readiness(repo, &data).await?;
        let now = Utc::now();
        let head = data.head_sha.clone();
        let head_ref = data.head_ref.clone();

        let outcome = self
            .store
            .transact(repo, |state| {
                if state.prs.contains_key(&pr) {
                    return RequestOutcome::AlreadyQueued;
                }
                let seq = state.alloc_seq();
                let pr_state = if readiness.is_ready() {
                    PrQueueState::Queued
                } else {
                    PrQueueState::Requested
                };
                state
                    .prs
                    .insert(pr, PrRecord::new(pr, head, head_ref, pr_state, seq, now));
                RequestOutcome::Inserted
            })
            .await?;

        match (outcome, readiness) {
            (RequestOutcome::AlreadyQueued, _) => {
                self.forge
                    .post_comment(repo, pr, "This PR is already in the merge queue.")
                    .await?;
            }
            (RequestOutcome::Inserted, Readiness::Ready) => {
                info!(repo = %repo, pr = %pr, "PR queued");
                self.forge
                    .post_comment(
                        repo,
                        pr,
                        &format!(
                            "Queued for merge at {}. It will land with the next batch.",
                            data.head_sha.abbrev()
                        ),
                    )
                    .await?;
                self.construct(repo, now).await?;
            }
            (RequestOutcome::Inserted, Readiness::NotReady(reason)) => {
                info!(repo = %repo, pr = %pr, reason = %reason, "PR requested but not ready");
                self.forge
                    .post_comment(
                        repo,
                        pr,
                        &format!(
                            "This PR cannot be merged yet. It will be merged automatically \
                             once the following is resolved:\n- {}",
                            reason
                        ),
                    )
                    .await?;
            }
        }

        Ok(())
    }

    /// Re-evaluates a `Requested` PR after a review or status change.
    ///
    /// No-op unless the row is still `Requested`. If the head moved since the
    /// merge command, the row is deleted and the user must re-request: the
    /// stored row reasons about a commit that no longer exists, and silently
    /// adopting the new head would merge code nobody confirmed.
    pub async fn initiate(&self, repo: &RepoId, pr: PrNumber) -> Result<(), ControllerError> {
        debug!(repo = %repo, pr = %pr, "re-evaluating requested PR");
        let data = self.forge.pr_info(repo, pr).await?;

        if data.state == PrState::Closed {
            self.store
                .transact(repo, |state| {
                    if state
                        .prs
                        .get(&pr)
                        .is_some_and(|r| r.state == PrQueueState::Requested)
                    {
                        state.prs.remove(&pr);
                    }
                })
                .await?;
            return Ok(());
        }

        let stored = self
            .store
            .read(repo, |state| {
                state.prs.get(&pr).map(|r| (r.state, r.head.clone()))
            })
            .await;
        let Some((PrQueueState::Requested, stored_head)) = stored else {
            return Ok(());
        };

        if stored_head != data.head_sha {
            let removed = self
                .store
                .transact(repo, |state| match state.prs.get(&pr) {
                    Some(r) if r.state == PrQueueState::Requested && r.head == stored_head => {
                        state.prs.remove(&pr);
                        true
                    }
                    _ => false,
                })
                .await?;
            if removed {
                info!(repo = %repo, pr = %pr, "head moved while requested; dropping row");
                self.forge
                    .post_comment(
                        repo,
                        pr,
                        "The merge request was dropped because new commits were pushed. \
                         Please re-request once the new head is ready.",
                    )
                    .await?;
            }
            return Ok(());
        }

        let readiness = self.snapshot_readiness(repo, &data).await?;
        if !readiness.is_ready() {
            debug!(repo = %repo, pr = %pr, "still not ready");
            return Ok(());
        }

        let now = Utc::now();
        let queued = self
            .store
            .transact(repo, |state| match state.prs.get_mut(&pr) {
                Some(r) if r.state == PrQueueState::Requested && r.head == data.head_sha => {
                    r.detach(PrQueueState::Queued, now);
                    true
                }
                _ => false,
            })
            .await?;

        if queued {
            info!(repo = %repo, pr = %pr, "PR queued");
            self.construct(repo, now).await?;
        }
        Ok(())
    }

    /// Removes a PR from the queue.
    ///
    /// Cancelling a `Merging` PR makes its attempt unsound (the staging
    /// commit no longer reflects the batch), so the attempt is demoted to
    /// split, its siblings move with it, and the staging ref is discarded -
    /// which also aborts any in-flight test.
    pub async fn cancel(
        &self,
        repo: &RepoId,
        pr: PrNumber,
        reason: CancelReason,
    ) -> Result<(), ControllerError> {
        info!(repo = %repo, pr = %pr, reason = ?reason, "cancelling");
        let now = Utc::now();

        let outcome = self
            .store
            .transact(repo, |state| {
                let Some(record) = state.prs.remove(&pr) else {
                    return CancelOutcome::NotQueued;
                };

                let mut staging_to_delete = None;
                if let Some(id) = record.attempt.clone() {
                    let siblings: Vec<PrNumber> = state
                        .prs_in_attempt(&id)
                        .iter()
                        .map(|p| p.number)
                        .collect();

                    if siblings.is_empty() {
                        if let Some(attempt) = state.attempts.remove(&id) {
                            staging_to_delete = Some(attempt.staging_branch());
                        }
                    } else if record.state == PrQueueState::Merging {
                        if let Some(attempt) = state.attempts.get_mut(&id) {
                            staging_to_delete = Some(attempt.staging_branch());
                            attempt.transition(crate::types::AttemptState::Split, now);
                            attempt.base = None;
                            attempt.staging = None;
                        }
                        for sibling in siblings {
                            if let Some(r) = state.prs.get_mut(&sibling) {
                                r.attach(PrQueueState::Split, id.clone(), now);
                            }
                        }
                    }
                    // A cancelled Split PR with remaining siblings leaves the
                    // attempt as-is.
                }

                CancelOutcome::Removed { staging_to_delete }
            })
            .await?;

        match outcome {
            CancelOutcome::NotQueued => {
                if reason == CancelReason::Command {
                    self.forge
                        .post_comment(repo, pr, "This PR is not in the merge queue.")
                        .await?;
                }
            }
            CancelOutcome::Removed { staging_to_delete } => {
                if let Some(branch) = staging_to_delete {
                    self.forge.delete_branch(repo, &branch).await?;
                }
                match reason {
                    CancelReason::Command => {
                        self.forge
                            .post_comment(repo, pr, "Removed from the merge queue.")
                            .await?;
                    }
                    CancelReason::HeadMoved => {
                        self.forge
                            .post_comment(
                                repo,
                                pr,
                                "Merge cancelled: new commits were pushed to the PR.",
                            )
                            .await?;
                    }
                    CancelReason::Closed => {}
                }
            }
        }

        Ok(())
    }

    /// Routes a status/check event by its commit SHA.
    ///
    /// A SHA matching an attempt's staging commit drives the test phase; any
    /// other SHA may be the head of a requested PR whose pre-status changed.
    pub async fn status_changed(&self, repo: &RepoId, sha: &Sha) -> Result<(), ControllerError> {
        let target = self
            .store
            .read(repo, |state| {
                if let Some(attempt) = state.attempt_by_staging(sha) {
                    StatusTarget::Staging(attempt.id.clone())
                } else {
                    StatusTarget::PrHeads(
                        state
                            .prs
                            .values()
                            .filter(|p| p.state == PrQueueState::Requested && p.head == *sha)
                            .map(|p| p.number)
                            .collect(),
                    )
                }
            })
            .await;

        match target {
            StatusTarget::Staging(id) => self.test(repo, &id).await,
            StatusTarget::PrHeads(prs) => {
                for pr in prs {
                    self.initiate(repo, pr).await?;
                }
                Ok(())
            }
        }
    }

    /// Handles a push to a branch: cancels any queued PR whose head branch it is.
    pub async fn branch_pushed(&self, repo: &RepoId, branch: &str) -> Result<(), ControllerError> {
        let prs: Vec<PrNumber> = self
            .store
            .read(repo, |state| {
                state
                    .prs
                    .values()
                    .filter(|p| p.head_ref == branch)
                    .map(|p| p.number)
                    .collect()
            })
            .await;

        for pr in prs {
            self.cancel(repo, pr, CancelReason::HeadMoved).await?;
        }
        Ok(())
    }

    /// Fetches reviews and status for a PR and evaluates readiness at its head.
    async fn snapshot_readiness(
        &self,
        repo: &RepoId,
        data: &PrData,
    ) -> Result<Readiness, ForgeError> {
        let cfg = self.config.repo(repo);
        let reviews = self.forge.list_reviews(repo, data.number).await?;
        let mut status = self.forge.combined_status(repo, &data.head_sha).await?;
        if cfg.include_check_runs {
            status.merge_check_runs(self.forge.check_runs(repo, &data.head_sha).await?);
        }
        Ok(readiness::evaluate(data, &reviews, &status, cfg))
    }
}
