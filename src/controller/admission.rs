//! Admission and batching: the `Construct` operation.
//!
//! Admission is a single store transaction: it checks that no attempt is in
//! flight, adopts an existing split attempt if one is waiting, or gathers the
//! highest-priority bucket of queued PRs into a fresh attempt - unless the
//! oldest of them is younger than the debounce window, which is the only
//! intentional delay in the queue (it lets more PRs coalesce into one batch).
//!
//! All forge work happens after the admission transaction commits. Every
//! subsequent write re-checks that the attempt is still `Constructing`; if a
//! concurrent cancel demoted or deleted it, the build is abandoned and its
//! staging commit discarded.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::constructor::{self, Constructed};
use crate::store::RepoState;
use crate::types::{
    AttemptId, AttemptState, MergeAttempt, PrNumber, PrQueueState, RepoId, Sha,
};

use super::{Controller, ControllerError};

enum Admission {
    /// A non-split attempt is already in flight.
    Busy,
    /// Nothing to admit.
    Idle,
    /// Queued PRs exist but the debounce window has not elapsed.
    Debounced,
    /// A batch was admitted (fresh or adopted from a split attempt).
    Batch {
        id: AttemptId,
        batch: Vec<(PrNumber, Sha)>,
    },
}

enum BuildOutcome {
    /// The attempt advanced to testing; admission stops (it is the active
    /// attempt now).
    Testing,
    /// A concurrent cancel won; nothing left to do.
    Abandoned,
    /// A single-PR batch conflicted and was rejected; keep draining.
    Rejected,
    /// A multi-PR batch conflicted and was split; re-admit the smaller set.
    SplitOff,
}

impl Controller {
    /// Drives admission until an attempt is in flight or nothing is admissible.
    ///
    /// Safe to call at any time from any trigger; serialization comes from
    /// the store's per-repo transactions plus the in-transaction check that
    /// no active attempt exists.
    pub async fn construct(&self, repo: &RepoId, now: DateTime<Utc>) -> Result<(), ControllerError> {
        loop {
            let debounce = self.timeouts.debounce;
            let admission = self
                .store
                .transact(repo, |state| admit(state, repo, now, debounce))
                .await?;

            let (id, batch) = match admission {
                Admission::Busy => {
                    debug!(repo = %repo, "not constructing: an attempt is already in flight");
                    return Ok(());
                }
                Admission::Idle => return Ok(()),
                Admission::Debounced => {
                    debug!(repo = %repo, "not constructing: waiting for more PRs to coalesce");
                    return Ok(());
                }
                Admission::Batch { id, batch } => (id, batch),
            };

            info!(repo = %repo, attempt = %id, batch = batch.len(), "admitted batch");

            match self.build(repo, &id, &batch, now).await? {
                BuildOutcome::Testing | BuildOutcome::Abandoned => return Ok(()),
                BuildOutcome::Rejected | BuildOutcome::SplitOff => continue,
            }
        }
    }

    /// Builds the staging commit for an admitted batch and settles the outcome.
    async fn build(
        &self,
        repo: &RepoId,
        id: &AttemptId,
        batch: &[(PrNumber, Sha)],
        now: DateTime<Utc>,
    ) -> Result<BuildOutcome, ControllerError> {
        let Some((first_pr, _)) = batch.first() else {
            return Ok(BuildOutcome::Abandoned);
        };

        // The batch shares one base branch; read it off the first member.
        let info = self.forge.pr_info(repo, *first_pr).await?;
        let target = info.base_ref;
        let base = self.forge.branch_sha(repo, &target).await?;

        // Record the merge base under a re-read guard before building.
        let target_clone = target.clone();
        let base_clone = base.clone();
        let recorded = self
            .store
            .transact(repo, |state| match state.attempts.get_mut(id) {
                Some(a) if a.state == AttemptState::Constructing => {
                    a.target_branch = Some(target_clone);
                    a.base = Some(base_clone);
                    true
                }
                _ => false,
            })
            .await?;
        if !recorded {
            return Ok(BuildOutcome::Abandoned);
        }

        let strategy = self.config.repo(repo).strategy;
        let outcome =
            constructor::construct(self.forge.as_ref(), repo, id, &base, batch, strategy).await?;

        match outcome {
            Constructed::Ok(staging) => {
                let staging_branch = id.staging_branch();
                self.forge
                    .force_update_branch(repo, &staging_branch, &staging)
                    .await?;

                let staging_clone = staging.clone();
                let promoted = self
                    .store
                    .transact(repo, |state| match state.attempts.get_mut(id) {
                        Some(a) if a.state == AttemptState::Constructing => {
                            a.staging = Some(staging_clone);
                            a.transition(AttemptState::Testing, now);
                            true
                        }
                        _ => false,
                    })
                    .await?;

                if promoted {
                    info!(
                        repo = %repo,
                        attempt = %id,
                        staging = %staging.abbrev(),
                        "staging commit built; waiting for CI"
                    );
                    Ok(BuildOutcome::Testing)
                } else {
                    // Cancelled while we were building; the staging commit no
                    // longer corresponds to any batch.
                    info!(repo = %repo, attempt = %id, "attempt cancelled mid-build; discarding staging commit");
                    self.forge.delete_branch(repo, &staging_branch).await?;
                    Ok(BuildOutcome::Abandoned)
                }
            }

            Constructed::Conflict(conflicting) if batch.len() == 1 => {
                let pr = batch[0].0;
                debug_assert_eq!(conflicting, vec![pr]);

                let removed = self
                    .store
                    .transact(repo, |state| {
                        match state.attempts.get(id) {
                            Some(a) if a.state == AttemptState::Constructing => {}
                            _ => return false,
                        }
                        state.attempts.remove(id);
                        state.prs.remove(&pr);
                        true
                    })
                    .await?;

                if removed {
                    info!(repo = %repo, pr = %pr, "PR conflicts on its own; rejecting");
                    self.forge
                        .post_comment(
                            repo,
                            pr,
                            "This PR cannot be merged cleanly into the target branch and was \
                             removed from the merge queue. Rebase and re-request.",
                        )
                        .await?;
                }
                Ok(BuildOutcome::Rejected)
            }

            Constructed::Conflict(conflicting) => {
                let split_id = AttemptId::generate();
                let conflict_set: HashSet<PrNumber> = conflicting.iter().copied().collect();

                let moved = self
                    .store
                    .transact(repo, |state| {
                        match state.attempts.get_mut(id) {
                            Some(a) if a.state == AttemptState::Constructing => {
                                a.transition(AttemptState::Split, now);
                                a.base = None;
                                a.staging = None;
                            }
                            _ => return false,
                        }

                        let members: Vec<PrNumber> = state
                            .prs_in_attempt(id)
                            .iter()
                            .map(|p| p.number)
                            .collect();

                        let mut split =
                            MergeAttempt::new(split_id.clone(), repo.clone(), now);
                        split.transition(AttemptState::Split, now);
                        state.attempts.insert(split_id.clone(), split);

                        for pr in members {
                            let Some(record) = state.prs.get_mut(&pr) else {
                                continue;
                            };
                            if conflict_set.contains(&pr) {
                                record.attach(PrQueueState::Split, split_id.clone(), now);
                            } else {
                                record.attach(PrQueueState::Split, id.clone(), now);
                            }
                        }

                        // Either side may have ended up empty (whole batch
                        // conflicted, or a conflicting PR was cancelled
                        // concurrently); empty split attempts are garbage.
                        if state.prs_in_attempt(id).is_empty() {
                            state.attempts.remove(id);
                        }
                        if state.prs_in_attempt(&split_id).is_empty() {
                            state.attempts.remove(&split_id);
                        }
                        true
                    })
                    .await?;

                if moved {
                    info!(
                        repo = %repo,
                        attempt = %id,
                        conflicting = conflicting.len(),
                        "conflicting PRs split off; re-admitting the rest"
                    );
                    for pr in &conflicting {
                        self.forge
                            .post_comment(
                                repo,
                                *pr,
                                "This PR conflicts with the target branch or with another \
                                 queued PR. It will be retried separately.",
                            )
                            .await?;
                    }
                }
                Ok(BuildOutcome::SplitOff)
            }
        }
    }
}

/// The admission transaction. Runs under the repo lock.
fn admit(
    state: &mut RepoState,
    repo: &RepoId,
    now: DateTime<Utc>,
    debounce: chrono::Duration,
) -> Admission {
    if state.active_attempt().is_some() {
        return Admission::Busy;
    }

    // Resume a split attempt before admitting anything new; earliest-queued
    // work first, so a batch demoted by a conflict resumes ahead of the
    // conflicting PRs that were split off it.
    let split_id = state
        .split_attempts()
        .min_by_key(|a| {
            state
                .prs_in_attempt(&a.id)
                .first()
                .map(|p| p.enqueued_seq)
                .unwrap_or(u64::MAX)
        })
        .map(|a| a.id.clone());
    if let Some(id) = split_id {
        let batch: Vec<(PrNumber, Sha)> = state
            .prs_in_attempt(&id)
            .iter()
            .map(|p| (p.number, p.head.clone()))
            .collect();
        if let Some(attempt) = state.attempts.get_mut(&id) {
            attempt.transition(AttemptState::Constructing, now);
            attempt.base = None;
            attempt.staging = None;
        }
        for (pr, _) in &batch {
            if let Some(record) = state.prs.get_mut(pr) {
                record.attach(PrQueueState::Merging, id.clone(), now);
            }
        }
        return Admission::Batch { id, batch };
    }

    let queued: Vec<&crate::types::PrRecord> = state
        .prs
        .values()
        .filter(|p| p.state == PrQueueState::Queued)
        .collect();
    if queued.is_empty() {
        return Admission::Idle;
    }

    // Highest-priority non-empty bucket; absent priority is the default bucket.
    let top = queued
        .iter()
        .map(|p| p.priority.unwrap_or(0))
        .max()
        .unwrap_or(0);
    let mut bucket: Vec<(PrNumber, Sha, DateTime<Utc>, u64)> = queued
        .into_iter()
        .filter(|p| p.priority.unwrap_or(0) == top)
        .map(|p| (p.number, p.head.clone(), p.updated_at, p.enqueued_seq))
        .collect();
    bucket.sort_by_key(|(_, _, _, seq)| *seq);

    // Give additional PRs a chance to coalesce before opening an attempt.
    if let Some(oldest) = bucket.iter().map(|(_, _, at, _)| *at).min()
        && now - oldest < debounce
    {
        return Admission::Debounced;
    }

    let id = AttemptId::generate();
    state
        .attempts
        .insert(id.clone(), MergeAttempt::new(id.clone(), repo.clone(), now));

    let batch: Vec<(PrNumber, Sha)> = bucket
        .iter()
        .map(|(pr, head, _, _)| (*pr, head.clone()))
        .collect();
    for (pr, _) in &batch {
        if let Some(record) = state.prs.get_mut(pr) {
            record.attach(PrQueueState::Merging, id.clone(), now);
        }
    }

    Admission::Batch { id, batch }
}
