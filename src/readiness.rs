//! The readiness evaluator: decides whether a PR may enter the queue.
//!
//! Readiness is the conjunction of open + non-draft + allowed base branch +
//! approved-at-head + pre-status-green. Everything is evaluated at one exact
//! head commit: approvals and statuses for any other commit are discarded, so
//! a re-pushed branch can never ride on stale approvals.
//!
//! The evaluator is a pure function of forge data; the controller fetches the
//! inputs and calls [`evaluate`].

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::RepoConfig;
use crate::forge::{ChecksOutcome, PrData, PrState, ReviewData, ReviewVerdict, StatusSummary};
use crate::types::Sha;

/// Why a PR is not ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotReadyReason {
    /// The PR is closed (or merged).
    Closed,
    /// The PR is marked as a draft.
    Draft,
    /// The base branch is not on the allow-list. This never resolves on its
    /// own, so it is reported as an error at request time.
    BranchNotAllowed,
    /// No approving review at the head commit.
    AwaitingReview,
    /// The latest review from some reviewer at the head commit requests changes.
    ChangesRequested,
    /// Pre-status checks have not finished at the head commit.
    AwaitingStatus,
    /// Pre-status checks failed at the head commit.
    StatusFailed,
}

impl NotReadyReason {
    /// A short human-readable description for PR comments.
    pub fn describe(&self) -> &'static str {
        match self {
            NotReadyReason::Closed => "the PR is closed",
            NotReadyReason::Draft => "the PR is marked as a draft",
            NotReadyReason::BranchNotAllowed => "the base branch is not on the merge allow-list",
            NotReadyReason::AwaitingReview => "an approving review is required",
            NotReadyReason::ChangesRequested => "a reviewer has requested changes",
            NotReadyReason::AwaitingStatus => "status checks have not finished",
            NotReadyReason::StatusFailed => "status checks failed",
        }
    }
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// The evaluator's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(NotReadyReason),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// How the approval rule came out at a specific commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Approval {
    Approved,
    ChangesRequested,
    Missing,
}

/// Applies the approval rule at `head`.
///
/// Reviews for any other commit are discarded; for each distinct reviewer
/// only the latest remaining review counts. Any surviving CHANGES_REQUESTED
/// vetoes; otherwise at least one surviving APPROVED approves.
fn approval_at(head: &Sha, reviews: &[ReviewData]) -> Approval {
    // Reviews arrive in submission order, so a plain insert keeps the latest.
    let mut latest: HashMap<&str, ReviewVerdict> = HashMap::new();
    for review in reviews {
        if review.commit_id.as_ref() != Some(head) {
            continue;
        }
        latest.insert(review.reviewer.as_str(), review.verdict);
    }

    if latest
        .values()
        .any(|v| *v == ReviewVerdict::ChangesRequested)
    {
        Approval::ChangesRequested
    } else if latest.values().any(|v| *v == ReviewVerdict::Approved) {
        Approval::Approved
    } else {
        Approval::Missing
    }
}

/// Evaluates readiness of a PR at its current head commit.
pub fn evaluate(
    pr: &PrData,
    reviews: &[ReviewData],
    status: &StatusSummary,
    config: &RepoConfig,
) -> Readiness {
    if pr.state == PrState::Closed {
        return Readiness::NotReady(NotReadyReason::Closed);
    }
    if pr.is_draft {
        return Readiness::NotReady(NotReadyReason::Draft);
    }
    if !config.branch_allowed(&pr.base_ref) {
        return Readiness::NotReady(NotReadyReason::BranchNotAllowed);
    }

    match approval_at(&pr.head_sha, reviews) {
        Approval::ChangesRequested => {
            return Readiness::NotReady(NotReadyReason::ChangesRequested);
        }
        Approval::Missing => return Readiness::NotReady(NotReadyReason::AwaitingReview),
        Approval::Approved => {}
    }

    match status.aggregate(&config.required_contexts) {
        ChecksOutcome::Green => Readiness::Ready,
        ChecksOutcome::Pending => Readiness::NotReady(NotReadyReason::AwaitingStatus),
        ChecksOutcome::Red => Readiness::NotReady(NotReadyReason::StatusFailed),
    }
}
