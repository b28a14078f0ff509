//! The `Test` and `Complete` operations.
//!
//! Test aggregates CI on the staging commit: green promotes the attempt to
//! success and completes it; red either rejects a lone PR or bisects the
//! batch into two split attempts (stable halves by admission order), which
//! keeps the worst case at ~log2(N) test rounds plus one round per actually
//! bad PR.
//!
//! Complete fast-forwards the target branch to the tested staging commit with
//! a compare-and-set against the recorded merge base. If the target moved
//! (someone pushed directly), the batch is NOT rebuilt on the new tip behind
//! CI's back: the PRs go back to queued, the attempt is dropped, and
//! admission starts over - green CI on the exact landed tree is the whole
//! point of the queue.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::forge::{ChecksOutcome, ForgeError};
use crate::types::{AttemptId, AttemptState, MergeAttempt, PrNumber, PrQueueState, RepoId, Sha};

use super::{Controller, ControllerError};

enum TestFailure {
    /// The attempt was no longer testing; nothing to do.
    Skipped,
    /// Single-PR batch rejected outright.
    Rejected {
        pr: Option<PrNumber>,
        staging_branch: String,
    },
    /// Batch bisected into two split attempts.
    Bisected { staging_branch: String },
}

impl Controller {
    /// Re-reads CI on an attempt's staging commit and settles the outcome.
    ///
    /// Idempotent: ignores attempts that are not testing, and re-running on
    /// unchanged status reaches the same end state. This is also the crash
    /// recovery path for status webhooks lost while the bot was down.
    pub async fn test(&self, repo: &RepoId, id: &AttemptId) -> Result<(), ControllerError> {
        let info = self
            .store
            .read(repo, |state| {
                state
                    .attempts
                    .get(id)
                    .map(|a| (a.state, a.staging.clone()))
            })
            .await;
        let Some((AttemptState::Testing, Some(staging))) = info else {
            return Ok(());
        };

        let cfg = self.config.repo(repo);
        let mut status = self.forge.combined_status(repo, &staging).await?;
        if cfg.include_check_runs {
            status.merge_check_runs(self.forge.check_runs(repo, &staging).await?);
        }

        match status.aggregate(&cfg.required_contexts) {
            ChecksOutcome::Pending => Ok(()),

            ChecksOutcome::Green => {
                let now = Utc::now();
                let promoted = self
                    .store
                    .transact(repo, |state| match state.attempts.get_mut(id) {
                        Some(a)
                            if a.state == AttemptState::Testing
                                && a.staging.as_ref() == Some(&staging) =>
                        {
                            a.transition(AttemptState::Success, now);
                            true
                        }
                        _ => false,
                    })
                    .await?;

                if promoted {
                    info!(repo = %repo, attempt = %id, staging = %staging.abbrev(), "CI green on staging");
                    self.complete(repo, id).await
                } else {
                    Ok(())
                }
            }

            ChecksOutcome::Red => {
                info!(repo = %repo, attempt = %id, staging = %staging.abbrev(), "CI red on staging");
                let now = Utc::now();
                let outcome = self
                    .store
                    .transact(repo, |state| bisect_or_reject(state, repo, id, now))
                    .await?;

                match outcome {
                    TestFailure::Skipped => Ok(()),
                    TestFailure::Rejected { pr, staging_branch } => {
                        self.forge.delete_branch(repo, &staging_branch).await?;
                        if let Some(pr) = pr {
                            self.forge
                                .post_comment(
                                    repo,
                                    pr,
                                    "CI failed on the staging commit for this PR; it was \
                                     removed from the merge queue.",
                                )
                                .await?;
                        }
                        self.construct(repo, now).await
                    }
                    TestFailure::Bisected { staging_branch } => {
                        self.forge.delete_branch(repo, &staging_branch).await?;
                        self.construct(repo, now).await
                    }
                }
            }
        }
    }

    /// Fast-forwards the target branch to a successful attempt's staging
    /// commit, then retires the attempt and its PRs.
    pub async fn complete(&self, repo: &RepoId, id: &AttemptId) -> Result<(), ControllerError> {
        let info = self
            .store
            .read(repo, |state| {
                state.attempts.get(id).map(|a| {
                    (
                        a.state,
                        a.staging.clone(),
                        a.base.clone(),
                        a.target_branch.clone(),
                    )
                })
            })
            .await;
        let Some((AttemptState::Success, Some(staging), Some(base), Some(target))) = info else {
            return Ok(());
        };

        let now = Utc::now();
        let tip = self.forge.branch_sha(repo, &target).await?;

        if tip == staging {
            // Already fast-forwarded; we crashed before cleanup. Finish it.
            return self.finalize_success(repo, id, &staging, now).await;
        }

        if tip != base {
            return self.reset_after_race(repo, id, &target, now).await;
        }

        // Last re-read before the point of no return: a cancel that landed
        // while we were reading the target tip demotes the attempt, and its
        // staging commit must not reach the target branch.
        let still_success = self
            .store
            .read(repo, |state| {
                state
                    .attempts
                    .get(id)
                    .is_some_and(|a| a.state == AttemptState::Success)
            })
            .await;
        if !still_success {
            return Ok(());
        }

        match self.forge.fast_forward_branch(repo, &target, &staging).await {
            Ok(()) => {
                info!(repo = %repo, attempt = %id, target, staging = %staging.abbrev(), "target fast-forwarded");
                self.finalize_success(repo, id, &staging, now).await
            }
            Err(ForgeError::NotFastForward { .. }) => {
                self.reset_after_race(repo, id, &target, now).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the attempt and its PR rows after a successful fast-forward,
    /// reports the merge, and drains the queue.
    async fn finalize_success(
        &self,
        repo: &RepoId,
        id: &AttemptId,
        staging: &Sha,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let members = self
            .store
            .transact(repo, |state| {
                match state.attempts.get(id) {
                    Some(a) if a.state == AttemptState::Success => {}
                    _ => return None,
                }
                let members: Vec<PrNumber> = state
                    .prs_in_attempt(id)
                    .iter()
                    .map(|p| p.number)
                    .collect();
                for pr in &members {
                    state.prs.remove(pr);
                }
                state.attempts.remove(id);
                Some(members)
            })
            .await?;

        let Some(members) = members else {
            return Ok(());
        };

        self.forge.delete_branch(repo, &id.staging_branch()).await?;
        for pr in &members {
            self.forge
                .post_comment(
                    repo,
                    *pr,
                    &format!("Merged: the target branch now includes this PR (as {}).", staging.abbrev()),
                )
                .await?;
        }

        info!(repo = %repo, attempt = %id, merged = members.len(), "batch merged");
        self.construct(repo, now).await
    }

    /// The target branch moved underneath us: put the batch back in the queue
    /// and let admission start over on the new tip.
    async fn reset_after_race(
        &self,
        repo: &RepoId,
        id: &AttemptId,
        target: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let reset = self
            .store
            .transact(repo, |state| {
                match state.attempts.get(id) {
                    Some(a) if a.state == AttemptState::Success => {}
                    _ => return false,
                }
                let members: Vec<PrNumber> = state
                    .prs_in_attempt(id)
                    .iter()
                    .map(|p| p.number)
                    .collect();
                for pr in members {
                    if let Some(record) = state.prs.get_mut(&pr) {
                        record.detach(PrQueueState::Queued, now);
                    }
                }
                state.attempts.remove(id);
                true
            })
            .await?;

        if reset {
            warn!(
                repo = %repo,
                attempt = %id,
                target,
                "target branch moved during completion; re-queueing batch"
            );
            self.forge.delete_branch(repo, &id.staging_branch()).await?;
            self.construct(repo, now).await?;
        }
        Ok(())
    }
}

/// The red-CI transaction: reject a lone PR or split the batch in half.
fn bisect_or_reject(
    state: &mut crate::store::RepoState,
    repo: &RepoId,
    id: &AttemptId,
    now: DateTime<Utc>,
) -> TestFailure {
    match state.attempts.get(id) {
        Some(a) if a.state == AttemptState::Testing => {}
        _ => return TestFailure::Skipped,
    }
    let staging_branch = id.staging_branch();

    let members: Vec<PrNumber> = state
        .prs_in_attempt(id)
        .iter()
        .map(|p| p.number)
        .collect();

    if members.len() <= 1 {
        for pr in &members {
            state.prs.remove(pr);
        }
        state.attempts.remove(id);
        return TestFailure::Rejected {
            pr: members.first().copied(),
            staging_branch,
        };
    }

    let mid = members.len().div_ceil(2);
    let (first, second) = members.split_at(mid);

    for half in [first, second] {
        let half_id = AttemptId::generate();
        let mut attempt = MergeAttempt::new(half_id.clone(), repo.clone(), now);
        attempt.transition(AttemptState::Split, now);
        state.attempts.insert(half_id.clone(), attempt);
        for pr in half {
            if let Some(record) = state.prs.get_mut(pr) {
                record.attach(PrQueueState::Split, half_id.clone(), now);
            }
        }
    }
    state.attempts.remove(id);

    TestFailure::Bisected { staging_branch }
}
