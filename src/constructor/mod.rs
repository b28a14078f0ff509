//! The merge constructor: builds the candidate staging commit for a batch.
//!
//! Given the target branch tip, an ordered batch of PRs, and a strategy, the
//! constructor produces either the SHA of a staging commit whose tree is the
//! batch merged onto the tip, or the non-empty list of PRs that could not be
//! merged cleanly.
//!
//! All strategies share one skeleton: start a scratch branch at the base
//! commit, fold each PR in via the forge's server-side merge, and on a merge
//! conflict record the offending PR, reset the scratch branch to the last
//! good tip, and continue (so one pass finds every conflicting PR). The
//! strategies differ only in how the final commit's tree and parent list are
//! assembled from the folded result.
//!
//! The constructor never touches the target branch and never touches the
//! attempt's staging ref; it returns a commit SHA and the controller decides
//! what to point where. The scratch branch is deleted on every exit path.

mod cherry_pick;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::forge::{ForgeClient, ForgeError, MergeOutcome};
use crate::types::{AttemptId, PrNumber, RepoId, Sha};

/// How the staging commit is assembled from a folded batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Sequential merges; the staging commit is the last merge commit.
    Merge,

    /// Sequential merges, then one synthesized commit whose tree is the
    /// folded tip and whose parents are the base followed by the PR heads.
    Octopus,

    /// One synthesized single-parent commit per PR, chained on a rolling
    /// squashed tip.
    Squash,

    /// One final single-parent commit whose tree is the folded tip and whose
    /// parent is the base.
    BatchSquash,

    /// Replays each PR's feature commits one by one onto a rolling tip.
    /// PRs containing merge commits are rejected.
    CherryPick,

    /// Permitted only for a single PR whose head already contains the base;
    /// the staging commit is the PR head itself.
    FastForward,
}

/// The constructor's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constructed {
    /// The staging commit was built.
    Ok(Sha),
    /// These PRs could not be folded in cleanly. Never empty.
    Conflict(Vec<PrNumber>),
}

/// Builds the staging commit for `batch` on top of `base`.
///
/// On a clean build returns `Constructed::Ok(staging_sha)`; if any PR cannot
/// be merged returns `Constructed::Conflict` naming every offender found in
/// this pass. Forge errors abort the invocation; the scratch branch is
/// cleaned up in all cases and the next poll re-drives the attempt.
pub async fn construct(
    forge: &dyn ForgeClient,
    repo: &RepoId,
    attempt: &AttemptId,
    base: &Sha,
    batch: &[(PrNumber, Sha)],
    strategy: MergeStrategy,
) -> Result<Constructed, ForgeError> {
    debug!(
        repo = %repo,
        attempt = %attempt,
        base = %base.abbrev(),
        batch = batch.len(),
        strategy = ?strategy,
        "constructing staging commit"
    );

    match strategy {
        // Strategies that never need a scratch branch
        MergeStrategy::CherryPick => cherry_pick::construct(forge, repo, base, batch).await,
        MergeStrategy::FastForward => construct_fast_forward(forge, repo, base, batch).await,

        // Fold-based strategies
        MergeStrategy::Merge | MergeStrategy::Octopus | MergeStrategy::Squash
        | MergeStrategy::BatchSquash => {
            let scratch = attempt.scratch_branch();
            forge.force_update_branch(repo, &scratch, base).await?;

            let result = fold_and_materialize(forge, repo, &scratch, base, batch, strategy).await;

            // The scratch branch is scoped to this invocation; delete it on
            // every exit path, but never let cleanup mask a build error.
            if let Err(e) = forge.delete_branch(repo, &scratch).await {
                warn!(repo = %repo, scratch, error = %e, "failed to delete scratch branch");
            }

            result
        }
    }
}

/// Folds the batch onto the scratch branch, then assembles the final commit.
async fn fold_and_materialize(
    forge: &dyn ForgeClient,
    repo: &RepoId,
    scratch: &str,
    base: &Sha,
    batch: &[(PrNumber, Sha)],
    strategy: MergeStrategy,
) -> Result<Constructed, ForgeError> {
    let mut tip = base.clone();
    let mut squashed_tip = base.clone();
    let mut merged: Vec<(PrNumber, Sha)> = Vec::new();
    let mut conflicts: Vec<PrNumber> = Vec::new();

    for (pr, head) in batch {
        let message = format!("Merge {} into merge queue staging", pr);
        match forge.merge_into_branch(repo, scratch, head, &message).await? {
            MergeOutcome::Merged(sha) => {
                tip = sha;
                merged.push((*pr, head.clone()));
            }
            MergeOutcome::AlreadyMerged => {
                // The head is already contained in the folded tip
                merged.push((*pr, head.clone()));
            }
            MergeOutcome::Conflict => {
                info!(repo = %repo, pr = %pr, "PR conflicts during fold");
                conflicts.push(*pr);
                // Reset the scratch branch to the last good state and keep
                // folding, so one pass names every offender.
                forge.force_update_branch(repo, scratch, &tip).await?;
                continue;
            }
        }

        if strategy == MergeStrategy::Squash {
            // Collapse the merge result into a single-parent commit on the
            // rolling squashed tip. The folded scratch tip carries the
            // cumulative tree.
            let commit = forge.get_commit(repo, &tip).await?;
            squashed_tip = forge
                .create_commit(
                    repo,
                    &format!("{} (squashed)", pr),
                    &commit.tree,
                    std::slice::from_ref(&squashed_tip),
                )
                .await?;
        }
    }

    if !conflicts.is_empty() {
        return Ok(Constructed::Conflict(conflicts));
    }

    match strategy {
        MergeStrategy::Merge => Ok(Constructed::Ok(tip)),

        MergeStrategy::Squash => Ok(Constructed::Ok(squashed_tip)),

        MergeStrategy::Octopus => {
            let commit = forge.get_commit(repo, &tip).await?;
            let mut parents = Vec::with_capacity(merged.len() + 1);
            parents.push(base.clone());
            parents.extend(merged.iter().map(|(_, head)| head.clone()));
            let message = octopus_message(&merged);
            let sha = forge
                .create_commit(repo, &message, &commit.tree, &parents)
                .await?;
            Ok(Constructed::Ok(sha))
        }

        MergeStrategy::BatchSquash => {
            let commit = forge.get_commit(repo, &tip).await?;
            let message = format!(
                "Merge queue batch of {} PRs: {}",
                merged.len(),
                join_pr_numbers(&merged)
            );
            let sha = forge
                .create_commit(repo, &message, &commit.tree, std::slice::from_ref(base))
                .await?;
            Ok(Constructed::Ok(sha))
        }

        MergeStrategy::CherryPick | MergeStrategy::FastForward => {
            unreachable!("handled before folding")
        }
    }
}

/// Fast-forward strategy: a single PR whose head already contains the base.
async fn construct_fast_forward(
    forge: &dyn ForgeClient,
    repo: &RepoId,
    base: &Sha,
    batch: &[(PrNumber, Sha)],
) -> Result<Constructed, ForgeError> {
    let [(pr, head)] = batch else {
        // A multi-PR batch can never fast-forward; reject the whole batch so
        // admission retries them individually.
        return Ok(Constructed::Conflict(
            batch.iter().map(|(pr, _)| *pr).collect(),
        ));
    };

    let compare = forge.compare(repo, base, head).await?;
    if compare.behind_by == 0 {
        Ok(Constructed::Ok(head.clone()))
    } else {
        Ok(Constructed::Conflict(vec![*pr]))
    }
}

fn join_pr_numbers(merged: &[(PrNumber, Sha)]) -> String {
    merged
        .iter()
        .map(|(pr, _)| pr.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn octopus_message(merged: &[(PrNumber, Sha)]) -> String {
    format!("Merge {} into merge queue staging", join_pr_numbers(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockForge, sha};

    fn repo() -> RepoId {
        RepoId::new("octocat", "hello-world")
    }

    fn attempt() -> AttemptId {
        AttemptId::new("t1")
    }

    /// Sets up a forge with `main` at a base commit and one commit per PR head.
    fn forge_with_heads(heads: &[Sha]) -> (MockForge, Sha) {
        let forge = MockForge::new();
        let base = sha(0x100);
        forge.add_root_commit(&base);
        forge.set_branch("main", &base);
        for head in heads {
            forge.add_commit(head, &base);
        }
        (forge, base)
    }

    #[tokio::test]
    async fn merge_strategy_builds_sequential_merges() {
        let heads = vec![sha(1), sha(2)];
        let (forge, base) = forge_with_heads(&heads);
        let batch = vec![(PrNumber(1), heads[0].clone()), (PrNumber(2), heads[1].clone())];

        let result = construct(&forge, &repo(), &attempt(), &base, &batch, MergeStrategy::Merge)
            .await
            .unwrap();

        let Constructed::Ok(staging) = result else {
            panic!("expected clean construction");
        };
        // The staging commit contains both heads and descends from base
        assert!(forge.commit_contains(&staging, &heads[0]));
        assert!(forge.commit_contains(&staging, &heads[1]));
        assert!(forge.descends_from(&staging, &base));
        // Scratch branch cleaned up
        assert!(forge.branch("staging-t1-wip").is_none());
    }

    #[tokio::test]
    async fn conflicting_pr_is_reported_and_rest_still_folds() {
        let heads = vec![sha(1), sha(2), sha(3)];
        let (forge, base) = forge_with_heads(&heads);
        // PR #2 conflicts with PR #1's changes
        forge.add_conflict(&heads[0], &heads[1]);

        let batch = vec![
            (PrNumber(1), heads[0].clone()),
            (PrNumber(2), heads[1].clone()),
            (PrNumber(3), heads[2].clone()),
        ];

        let result = construct(&forge, &repo(), &attempt(), &base, &batch, MergeStrategy::Merge)
            .await
            .unwrap();

        assert_eq!(result, Constructed::Conflict(vec![PrNumber(2)]));
        assert!(forge.branch("staging-t1-wip").is_none());
    }

    #[tokio::test]
    async fn all_conflicting_prs_named_in_one_pass() {
        let heads = vec![sha(1), sha(2), sha(3)];
        let (forge, base) = forge_with_heads(&heads);
        forge.add_conflict(&heads[0], &heads[1]);
        forge.add_conflict(&heads[0], &heads[2]);

        let batch = vec![
            (PrNumber(1), heads[0].clone()),
            (PrNumber(2), heads[1].clone()),
            (PrNumber(3), heads[2].clone()),
        ];

        let result = construct(&forge, &repo(), &attempt(), &base, &batch, MergeStrategy::Merge)
            .await
            .unwrap();

        assert_eq!(result, Constructed::Conflict(vec![PrNumber(2), PrNumber(3)]));
    }

    #[tokio::test]
    async fn octopus_parents_are_base_then_heads() {
        let heads = vec![sha(1), sha(2)];
        let (forge, base) = forge_with_heads(&heads);
        let batch = vec![(PrNumber(1), heads[0].clone()), (PrNumber(2), heads[1].clone())];

        let result = construct(
            &forge,
            &repo(),
            &attempt(),
            &base,
            &batch,
            MergeStrategy::Octopus,
        )
        .await
        .unwrap();

        let Constructed::Ok(staging) = result else {
            panic!("expected clean construction");
        };
        let commit = forge.get_commit_sync(&staging);
        assert_eq!(commit.parents, vec![base, heads[0].clone(), heads[1].clone()]);
    }

    #[tokio::test]
    async fn squash_builds_single_parent_chain() {
        let heads = vec![sha(1), sha(2)];
        let (forge, base) = forge_with_heads(&heads);
        let batch = vec![(PrNumber(1), heads[0].clone()), (PrNumber(2), heads[1].clone())];

        let result = construct(
            &forge,
            &repo(),
            &attempt(),
            &base,
            &batch,
            MergeStrategy::Squash,
        )
        .await
        .unwrap();

        let Constructed::Ok(staging) = result else {
            panic!("expected clean construction");
        };
        // Walk the chain: staging -> squash(#1) -> base, single parent each
        let last = forge.get_commit_sync(&staging);
        assert_eq!(last.parents.len(), 1);
        let first = forge.get_commit_sync(&last.parents[0]);
        assert_eq!(first.parents, vec![base]);
    }

    #[tokio::test]
    async fn batch_squash_single_commit_on_base() {
        let heads = vec![sha(1), sha(2)];
        let (forge, base) = forge_with_heads(&heads);
        let batch = vec![(PrNumber(1), heads[0].clone()), (PrNumber(2), heads[1].clone())];

        let result = construct(
            &forge,
            &repo(),
            &attempt(),
            &base,
            &batch,
            MergeStrategy::BatchSquash,
        )
        .await
        .unwrap();

        let Constructed::Ok(staging) = result else {
            panic!("expected clean construction");
        };
        let commit = forge.get_commit_sync(&staging);
        assert_eq!(commit.parents, vec![base]);
    }

    #[tokio::test]
    async fn fast_forward_accepts_descendant_head() {
        let forge = MockForge::new();
        let base = sha(0x100);
        let head = sha(1);
        forge.add_root_commit(&base);
        // head descends from base
        forge.add_commit(&head, &base);
        forge.set_branch("main", &base);
        forge.set_compare(&base, &head, 0, vec![]);

        let batch = vec![(PrNumber(1), head.clone())];
        let result = construct(
            &forge,
            &repo(),
            &attempt(),
            &base,
            &batch,
            MergeStrategy::FastForward,
        )
        .await
        .unwrap();

        assert_eq!(result, Constructed::Ok(head));
    }

    #[tokio::test]
    async fn fast_forward_rejects_stale_head() {
        let forge = MockForge::new();
        let base = sha(0x100);
        let head = sha(1);
        forge.add_root_commit(&base);
        forge.add_commit(&head, &base);
        forge.set_compare(&base, &head, 2, vec![]);

        let batch = vec![(PrNumber(1), head.clone())];
        let result = construct(
            &forge,
            &repo(),
            &attempt(),
            &base,
            &batch,
            MergeStrategy::FastForward,
        )
        .await
        .unwrap();

        assert_eq!(result, Constructed::Conflict(vec![PrNumber(1)]));
    }

    #[tokio::test]
    async fn fast_forward_rejects_multi_pr_batch() {
        let heads = vec![sha(1), sha(2)];
        let (forge, base) = forge_with_heads(&heads);

        let batch = vec![(PrNumber(1), heads[0].clone()), (PrNumber(2), heads[1].clone())];
        let result = construct(
            &forge,
            &repo(),
            &attempt(),
            &base,
            &batch,
            MergeStrategy::FastForward,
        )
        .await
        .unwrap();

        assert_eq!(result, Constructed::Conflict(vec![PrNumber(1), PrNumber(2)]));
    }
}
