//! The persisted pull request row and its queue lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AttemptId, PrNumber, Sha};

/// Where a queued PR is in its lifecycle.
///
/// A row exists only between the merge command and the terminal outcome
/// (merged, cancelled, rejected, or timed out); there is no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrQueueState {
    /// A merge was requested but the PR is not ready yet (missing approval,
    /// pending pre-status, draft). Re-evaluated on review/status webhooks
    /// and on every poll tick.
    Requested,

    /// Ready to merge; waiting to be admitted into a merge attempt.
    Queued,

    /// Part of an active merge attempt (constructing or testing).
    Merging,

    /// Part of a split attempt waiting to be re-constructed.
    Split,
}

impl PrQueueState {
    /// Returns true if the PR is attached to a merge attempt in this state.
    ///
    /// `attempt` must be `Some` exactly when this returns true.
    pub fn has_attempt(&self) -> bool {
        matches!(self, PrQueueState::Merging | PrQueueState::Split)
    }

    /// Name for logging/display.
    pub fn name(&self) -> &'static str {
        match self {
            PrQueueState::Requested => "requested",
            PrQueueState::Queued => "queued",
            PrQueueState::Merging => "merging",
            PrQueueState::Split => "split",
        }
    }
}

/// A persisted pull request row.
///
/// Keyed by `(RepoId, PrNumber)` in the store. The head commit is captured
/// when the merge command arrives and frozen from `Queued` onward; a push to
/// the branch cancels the row rather than advancing the head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrRecord {
    /// The PR number.
    pub number: PrNumber,

    /// The head commit the bot observed and is reasoning about.
    pub head: Sha,

    /// The PR's head branch name. Used to map push events back to the row.
    pub head_ref: String,

    /// Current queue state.
    pub state: PrQueueState,

    /// The attempt this PR belongs to. Present iff state is Merging or Split.
    pub attempt: Option<AttemptId>,

    /// When the row last changed state. Drives the poller's timeouts.
    pub updated_at: DateTime<Utc>,

    /// Admission priority bucket. `None` is the default bucket.
    pub priority: Option<i64>,

    /// Per-repo monotonic insertion order. The bisection partition and batch
    /// ordering are stable with respect to this.
    pub enqueued_seq: u64,
}

impl PrRecord {
    /// Creates a fresh row in the given state, stamped `now`.
    pub fn new(
        number: PrNumber,
        head: Sha,
        head_ref: impl Into<String>,
        state: PrQueueState,
        enqueued_seq: u64,
        now: DateTime<Utc>,
    ) -> Self {
        PrRecord {
            number,
            head,
            head_ref: head_ref.into(),
            state,
            attempt: None,
            updated_at: now,
            priority: None,
            enqueued_seq,
        }
    }

    /// Transitions the row into an attempt-attached state.
    pub fn attach(&mut self, state: PrQueueState, attempt: AttemptId, now: DateTime<Utc>) {
        debug_assert!(state.has_attempt());
        self.state = state;
        self.attempt = Some(attempt);
        self.updated_at = now;
    }

    /// Transitions the row back to a detached state, dropping the attempt link.
    pub fn detach(&mut self, state: PrQueueState, now: DateTime<Utc>) {
        debug_assert!(!state.has_attempt());
        self.state = state;
        self.attempt = None;
        self.updated_at = now;
    }
}
