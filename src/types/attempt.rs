//! The persisted merge attempt and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AttemptId, RepoId, Sha};

/// Where a merge attempt is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// The candidate merge commit is being built on the scratch branch.
    Constructing,

    /// The staging branch points at the candidate commit; waiting for CI.
    Testing,

    /// CI passed on the staging commit; waiting to fast-forward the target.
    Success,

    /// Demoted after a conflict, test failure, or cancellation. Holds its PR
    /// set until the next admission pass picks it up.
    Split,
}

impl AttemptState {
    /// True for the states that exclude any other active attempt in the repo.
    ///
    /// Per repository, at most one attempt may be in an active state at a
    /// time; any number of `Split` attempts may coexist.
    pub fn is_active(&self) -> bool {
        !matches!(self, AttemptState::Split)
    }

    /// Name for logging/display.
    pub fn name(&self) -> &'static str {
        match self {
            AttemptState::Constructing => "constructing",
            AttemptState::Testing => "testing",
            AttemptState::Success => "success",
            AttemptState::Split => "split",
        }
    }
}

/// A persisted merge attempt.
///
/// Created when a batch of queued PRs is admitted; deleted on success,
/// single-PR failure, emptying of a split, or timeout. The attempt owns the
/// staging ref `staging-<id>` for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeAttempt {
    /// Globally unique id; also determines the staging branch name.
    pub id: AttemptId,

    /// The repository this attempt belongs to.
    pub repo: RepoId,

    /// Current state.
    pub state: AttemptState,

    /// The branch being merged into. Recorded when construction starts so
    /// completion knows which ref to fast-forward.
    pub target_branch: Option<String>,

    /// The target tip used as the merge base. Completion fast-forwards only
    /// if the target still points here.
    pub base: Option<Sha>,

    /// The staging commit under test. Set on the Constructing -> Testing
    /// transition; Test and Complete must observe this exact SHA.
    pub staging: Option<Sha>,

    /// When the attempt last changed state. Drives the poller's timeouts.
    pub updated_at: DateTime<Utc>,
}

impl MergeAttempt {
    /// Creates a fresh attempt in `Constructing`, stamped `now`.
    pub fn new(id: AttemptId, repo: RepoId, now: DateTime<Utc>) -> Self {
        MergeAttempt {
            id,
            repo,
            state: AttemptState::Constructing,
            target_branch: None,
            base: None,
            staging: None,
            updated_at: now,
        }
    }

    /// The staging branch owned by this attempt.
    pub fn staging_branch(&self) -> String {
        self.id.staging_branch()
    }

    /// Transitions to a new state, stamping the timestamp.
    pub fn transition(&mut self, state: AttemptState, now: DateTime<Utc>) {
        self.state = state;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(AttemptState::Constructing.is_active());
        assert!(AttemptState::Testing.is_active());
        assert!(AttemptState::Success.is_active());
        assert!(!AttemptState::Split.is_active());
    }

    #[test]
    fn staging_branch_derives_from_id() {
        let attempt = MergeAttempt::new(
            AttemptId::new("deadbeef"),
            RepoId::new("octocat", "hello-world"),
            Utc::now(),
        );
        assert_eq!(attempt.staging_branch(), "staging-deadbeef");
    }
}
