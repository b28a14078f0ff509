//! Data returned by the forge API, reduced to what the queue needs.

use serde::{Deserialize, Serialize};

use crate::types::{PrNumber, Sha};

/// Whether a PR is open or closed. Merged PRs report as closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
}

/// PR metadata as read from the forge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrData {
    /// The PR number.
    pub number: PrNumber,
    /// The current head SHA.
    pub head_sha: Sha,
    /// The head branch name.
    pub head_ref: String,
    /// The base branch name.
    pub base_ref: String,
    /// Open or closed.
    pub state: PrState,
    /// Whether the PR is a draft.
    pub is_draft: bool,
}

/// The verdict a single review carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewVerdict {
    Approved,
    ChangesRequested,
    Commented,
    Dismissed,
    Pending,
}

/// A single PR review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewData {
    /// The reviewer's login.
    pub reviewer: String,
    /// The review verdict.
    pub verdict: ReviewVerdict,
    /// The commit the review was submitted against, when the forge reports it.
    pub commit_id: Option<Sha>,
}

/// State of a single status context or check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Success,
    Pending,
    Failure,
    Error,
}

/// One named status context (or check run) at a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStatus {
    /// The context name (e.g., "ci/build").
    pub context: String,
    /// The latest state reported for this context.
    pub state: CheckState,
}

/// The forge's combined rollup of a commit's statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinedState {
    Success,
    Pending,
    Failure,
}

/// The combined status of a commit plus the per-context breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    /// The forge's overall rollup across all contexts.
    pub state: CombinedState,
    /// Per-context states (latest per context).
    pub contexts: Vec<ContextStatus>,
}

/// The aggregate verdict over a commit's checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksOutcome {
    /// Every required check succeeded.
    Green,
    /// At least one required check failed or errored.
    Red,
    /// Some required check has not reported yet.
    Pending,
}

impl StatusSummary {
    /// Aggregates this summary against a list of required contexts.
    ///
    /// With an empty `required` list, the forge's combined rollup decides.
    /// Otherwise only the named contexts count: a missing context is pending,
    /// a failed or errored one is red, and all-success is green.
    pub fn aggregate(&self, required: &[String]) -> ChecksOutcome {
        if required.is_empty() {
            return match self.state {
                CombinedState::Success => ChecksOutcome::Green,
                CombinedState::Pending => ChecksOutcome::Pending,
                CombinedState::Failure => ChecksOutcome::Red,
            };
        }

        let mut all_green = true;
        for name in required {
            match self.contexts.iter().find(|c| &c.context == name) {
                Some(ctx) => match ctx.state {
                    CheckState::Failure | CheckState::Error => return ChecksOutcome::Red,
                    CheckState::Pending => all_green = false,
                    CheckState::Success => {}
                },
                None => all_green = false,
            }
        }

        if all_green {
            ChecksOutcome::Green
        } else {
            ChecksOutcome::Pending
        }
    }

    /// Merges check-run conclusions into the per-context breakdown.
    ///
    /// Check runs and commit statuses share one namespace for aggregation
    /// purposes; a check run with the same name as a status context replaces
    /// it. The combined rollup is recomputed from the merged set.
    pub fn merge_check_runs(&mut self, check_runs: Vec<ContextStatus>) {
        for run in check_runs {
            match self.contexts.iter_mut().find(|c| c.context == run.context) {
                Some(existing) => existing.state = run.state,
                None => self.contexts.push(run),
            }
        }

        // With no contexts at all there is nothing to roll up; keep the
        // forge's verdict (an empty commit status reads as pending).
        if self.contexts.is_empty() {
            return;
        }

        self.state = if self
            .contexts
            .iter()
            .any(|c| matches!(c.state, CheckState::Failure | CheckState::Error))
        {
            CombinedState::Failure
        } else if self.contexts.iter().any(|c| c.state == CheckState::Pending) {
            CombinedState::Pending
        } else {
            CombinedState::Success
        };
    }
}

/// One commit as reported by the forge's git data API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitData {
    /// The commit SHA.
    pub sha: Sha,
    /// The tree SHA of this commit.
    pub tree: Sha,
    /// Parent commit SHAs.
    pub parents: Vec<Sha>,
    /// The commit message.
    pub message: String,
}

impl CommitData {
    /// Returns true if this commit has more than one parent.
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

/// Result of a three-dot compare between two commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareData {
    /// Commits `head` has that the merge base does not, oldest first.
    pub commits: Vec<CommitData>,
    /// How many commits `head` is behind `base`.
    pub behind_by: u64,
}

/// Result of a server-side merge into a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The merge commit created on the branch.
    Merged(Sha),
    /// The head was already contained in the branch; nothing was created.
    AlreadyMerged,
    /// The merge could not be performed cleanly.
    Conflict,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(state: CombinedState, contexts: &[(&str, CheckState)]) -> StatusSummary {
        StatusSummary {
            state,
            contexts: contexts
                .iter()
                .map(|(name, state)| ContextStatus {
                    context: name.to_string(),
                    state: *state,
                })
                .collect(),
        }
    }

    #[test]
    fn empty_required_uses_combined_rollup() {
        let s = summary(CombinedState::Success, &[("other", CheckState::Failure)]);
        assert_eq!(s.aggregate(&[]), ChecksOutcome::Green);

        let s = summary(CombinedState::Failure, &[]);
        assert_eq!(s.aggregate(&[]), ChecksOutcome::Red);

        let s = summary(CombinedState::Pending, &[]);
        assert_eq!(s.aggregate(&[]), ChecksOutcome::Pending);
    }

    #[test]
    fn required_contexts_only_those_count() {
        let required = vec!["ci/build".to_string(), "ci/test".to_string()];

        // An unrelated failure does not matter
        let s = summary(
            CombinedState::Failure,
            &[
                ("ci/build", CheckState::Success),
                ("ci/test", CheckState::Success),
                ("lint", CheckState::Failure),
            ],
        );
        assert_eq!(s.aggregate(&required), ChecksOutcome::Green);

        // A required failure is red even while another is pending
        let s = summary(
            CombinedState::Pending,
            &[
                ("ci/build", CheckState::Pending),
                ("ci/test", CheckState::Failure),
            ],
        );
        assert_eq!(s.aggregate(&required), ChecksOutcome::Red);

        // A missing required context is pending
        let s = summary(CombinedState::Success, &[("ci/build", CheckState::Success)]);
        assert_eq!(s.aggregate(&required), ChecksOutcome::Pending);
    }

    #[test]
    fn merge_check_runs_replaces_and_recomputes() {
        let mut s = summary(
            CombinedState::Success,
            &[("ci/build", CheckState::Success)],
        );
        s.merge_check_runs(vec![
            ContextStatus {
                context: "ci/build".to_string(),
                state: CheckState::Failure,
            },
            ContextStatus {
                context: "analyze".to_string(),
                state: CheckState::Success,
            },
        ]);

        assert_eq!(s.state, CombinedState::Failure);
        assert_eq!(s.contexts.len(), 2);
    }

    #[test]
    fn merge_check_runs_keeps_verdict_when_nothing_reported() {
        let mut s = summary(CombinedState::Pending, &[]);
        s.merge_check_runs(vec![]);
        assert_eq!(s.state, CombinedState::Pending);
    }

    #[test]
    fn is_merge_detects_parent_count() {
        let single = CommitData {
            sha: Sha::parse("a".repeat(40)).unwrap(),
            tree: Sha::parse("b".repeat(40)).unwrap(),
            parents: vec![Sha::parse("c".repeat(40)).unwrap()],
            message: "one".to_string(),
        };
        assert!(!single.is_merge());

        let merge = CommitData {
            parents: vec![
                Sha::parse("c".repeat(40)).unwrap(),
                Sha::parse("d".repeat(40)).unwrap(),
            ],
            ..single
        };
        assert!(merge.is_merge());
    }
}
