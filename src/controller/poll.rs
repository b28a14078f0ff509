//! The `Poll` operation: timeouts and crash recovery.
//!
//! The poller is the idempotent retry layer. Every tick it purges rows whose
//! state timeout has elapsed, then re-enters whichever phase the persisted
//! state implies: requested rows are re-evaluated, queued and split rows feed
//! admission, testing attempts re-read CI (recovering missed webhooks), and
//! successful attempts re-try completion (recovering a crash between the
//! green verdict and the fast-forward).

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::types::{AttemptId, AttemptState, PrNumber, PrQueueState, RepoId};

use super::{Controller, ControllerError};

impl Controller {
    /// One poll tick for one repository.
    pub async fn poll(&self, repo: &RepoId, now: DateTime<Utc>) -> Result<(), ControllerError> {
        debug!(repo = %repo, "poll tick");
        self.expire(repo, now).await?;

        let snapshot = self.store.read(repo, |state| state.clone()).await;

        for pr in snapshot.prs.values() {
            if pr.state == PrQueueState::Requested
                && let Err(e) = self.initiate(repo, pr.number).await
            {
                warn!(repo = %repo, pr = %pr.number, error = %e, "poll: initiate failed");
            }
        }

        for attempt in snapshot.attempts.values() {
            let result = match attempt.state {
                AttemptState::Testing => self.test(repo, &attempt.id).await,
                AttemptState::Success => self.complete(repo, &attempt.id).await,
                AttemptState::Constructing | AttemptState::Split => Ok(()),
            };
            if let Err(e) = result {
                warn!(repo = %repo, attempt = %attempt.id, error = %e, "poll: attempt re-drive failed");
            }
        }

        let needs_construct = snapshot
            .prs
            .values()
            .any(|p| p.state == PrQueueState::Queued)
            || snapshot
                .attempts
                .values()
                .any(|a| a.state == AttemptState::Split);
        if needs_construct
            && let Err(e) = self.construct(repo, now).await
        {
            warn!(repo = %repo, error = %e, "poll: construct failed");
        }

        Ok(())
    }

    /// Purges rows whose state timeout has elapsed.
    ///
    /// A timed-out attempt takes its whole batch with it; a timed-out PR that
    /// belongs to an attempt likewise purges the attempt and its siblings
    /// (their fates are tied to the shared staging commit).
    async fn expire(&self, repo: &RepoId, now: DateTime<Utc>) -> Result<(), ControllerError> {
        let attempts: Vec<(AttemptId, AttemptState, DateTime<Utc>)> = self
            .store
            .read(repo, |state| {
                state
                    .attempts
                    .values()
                    .map(|a| (a.id.clone(), a.state, a.updated_at))
                    .collect()
            })
            .await;

        for (id, state, updated_at) in attempts {
            let limit = match state {
                AttemptState::Constructing => self.timeouts.constructing,
                AttemptState::Testing => self.timeouts.testing,
                AttemptState::Success => self.timeouts.success,
                AttemptState::Split => self.timeouts.split_attempt,
            };
            if now - updated_at > limit {
                warn!(repo = %repo, attempt = %id, state = state.name(), "attempt timed out");
                self.purge_attempt(repo, &id, state.name()).await?;
            }
        }

        let prs: Vec<(PrNumber, PrQueueState, Option<AttemptId>, DateTime<Utc>)> = self
            .store
            .read(repo, |state| {
                state
                    .prs
                    .values()
                    .map(|p| (p.number, p.state, p.attempt.clone(), p.updated_at))
                    .collect()
            })
            .await;

        for (pr, state, attempt, updated_at) in prs {
            let limit = match state {
                PrQueueState::Requested => self.timeouts.requested,
                PrQueueState::Queued => self.timeouts.queued,
                PrQueueState::Merging => self.timeouts.merging,
                PrQueueState::Split => self.timeouts.split_pr,
            };
            if now - updated_at > limit {
                warn!(repo = %repo, pr = %pr, state = state.name(), "PR timed out");
                match attempt {
                    Some(id) => self.purge_attempt(repo, &id, state.name()).await?,
                    None => self.purge_pr(repo, pr, state.name()).await?,
                }
            }
        }

        Ok(())
    }

    /// Deletes an attempt and every PR attached to it, with a timeout report.
    async fn purge_attempt(
        &self,
        repo: &RepoId,
        id: &AttemptId,
        state_name: &str,
    ) -> Result<(), ControllerError> {
        let purged = self
            .store
            .transact(repo, |state| {
                let attempt = state.attempts.remove(id)?;
                let members: Vec<PrNumber> = state
                    .prs_in_attempt(id)
                    .iter()
                    .map(|p| p.number)
                    .collect();
                for pr in &members {
                    state.prs.remove(pr);
                }
                Some((attempt.staging_branch(), members))
            })
            .await?;

        let Some((staging_branch, members)) = purged else {
            return Ok(());
        };

        self.forge.delete_branch(repo, &staging_branch).await?;
        for pr in members {
            self.forge
                .post_comment(repo, pr, &timeout_report(state_name))
                .await?;
        }
        Ok(())
    }

    /// Deletes a detached PR row with a timeout report.
    async fn purge_pr(
        &self,
        repo: &RepoId,
        pr: PrNumber,
        state_name: &str,
    ) -> Result<(), ControllerError> {
        let removed = self
            .store
            .transact(repo, |state| state.prs.remove(&pr).is_some())
            .await?;
        if removed {
            self.forge
                .post_comment(repo, pr, &timeout_report(state_name))
                .await?;
        }
        Ok(())
    }
}

fn timeout_report(state_name: &str) -> String {
    format!(
        "The merge timed out while {} and the PR was removed from the queue. \
         Comment the merge command again to retry.",
        state_name
    )
}
