//! Cherry-pick strategy: replay feature commits one by one onto the base.
//!
//! For each PR the forge's three-dot compare enumerates the feature commits
//! (commits reachable from the head but not from the merge base). PRs whose
//! ranges contain merge commits are rejected - there is no faithful linear
//! replay for them. The surviving commits are topologically sorted across the
//! whole batch and replayed by creating, for each one, a commit with the
//! original tree and the rolling tip as sole parent.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::forge::{CommitData, ForgeClient, ForgeError};
use crate::types::{PrNumber, RepoId, Sha};

use super::Constructed;

pub(super) async fn construct(
    forge: &dyn ForgeClient,
    repo: &RepoId,
    base: &Sha,
    batch: &[(PrNumber, Sha)],
) -> Result<Constructed, ForgeError> {
    let mut commits: Vec<CommitData> = Vec::new();
    let mut rejected: Vec<PrNumber> = Vec::new();

    for (pr, head) in batch {
        let compare = forge.compare(repo, base, head).await?;
        if compare.commits.iter().any(CommitData::is_merge) {
            debug!(repo = %repo, pr = %pr, "rejecting PR with merge commits from cherry-pick");
            rejected.push(*pr);
            continue;
        }
        commits.extend(compare.commits);
    }

    if !rejected.is_empty() {
        return Ok(Constructed::Conflict(rejected));
    }

    let ordered = toposort(commits);

    let mut tip = base.clone();
    for commit in &ordered {
        tip = forge
            .create_commit(repo, &commit.message, &commit.tree, std::slice::from_ref(&tip))
            .await?;
    }

    Ok(Constructed::Ok(tip))
}

/// Topologically sorts commits so every parent precedes its children,
/// deduplicating commits that appear in more than one PR's range.
///
/// Only parent edges within the set matter; ties are broken by the original
/// enumeration order, so independent PRs replay in batch order.
fn toposort(commits: Vec<CommitData>) -> Vec<CommitData> {
    // Dedupe, keeping first occurrence order
    let mut seen: HashSet<Sha> = HashSet::new();
    let mut unique: Vec<CommitData> = Vec::new();
    for commit in commits {
        if seen.insert(commit.sha.clone()) {
            unique.push(commit);
        }
    }

    let index: HashMap<Sha, usize> = unique
        .iter()
        .enumerate()
        .map(|(i, c)| (c.sha.clone(), i))
        .collect();

    // Kahn's algorithm over in-set parent edges
    let mut in_degree = vec![0usize; unique.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); unique.len()];
    for (i, commit) in unique.iter().enumerate() {
        for parent in &commit.parents {
            if let Some(&p) = index.get(parent) {
                in_degree[i] += 1;
                children[p].push(i);
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..unique.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order: Vec<usize> = Vec::with_capacity(unique.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &child in &children[i] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                queue.push_back(child);
            }
        }
    }

    // Non-merge commit ranges cannot form cycles; keep any leftovers in
    // enumeration order rather than dropping them.
    if order.len() < unique.len() {
        let placed: HashSet<usize> = order.iter().copied().collect();
        order.extend((0..unique.len()).filter(|i| !placed.contains(i)));
    }

    let mut by_index: Vec<Option<CommitData>> = unique.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| by_index[i].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constructor::MergeStrategy;
    use crate::test_utils::{MockForge, sha};
    use crate::types::AttemptId;

    fn commit(n: u64, parents: &[Sha]) -> CommitData {
        CommitData {
            sha: sha(n),
            tree: sha(n + 0x1000),
            parents: parents.to_vec(),
            message: format!("commit {}", n),
        }
    }

    #[test]
    fn toposort_keeps_linear_chains_in_order() {
        let a = commit(1, &[sha(0x100)]);
        let b = commit(2, &[sha(1)]);
        let c = commit(3, &[sha(2)]);

        let sorted = toposort(vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(sorted, vec![a, b, c]);
    }

    #[test]
    fn toposort_orders_parents_before_children_across_prs() {
        // PR ranges enumerated child-before-parent across lists
        let parent = commit(1, &[sha(0x100)]);
        let child = commit(2, &[sha(1)]);

        let sorted = toposort(vec![child.clone(), parent.clone()]);
        assert_eq!(sorted, vec![parent, child]);
    }

    #[test]
    fn toposort_dedupes_shared_commits() {
        let shared = commit(1, &[sha(0x100)]);
        let on_top = commit(2, &[sha(1)]);

        let sorted = toposort(vec![shared.clone(), shared.clone(), on_top.clone()]);
        assert_eq!(sorted, vec![shared, on_top]);
    }

    #[tokio::test]
    async fn replays_commits_onto_rolling_tip() {
        let forge = MockForge::new();
        let repo = RepoId::new("octocat", "hello-world");
        let base = sha(0x100);
        forge.add_root_commit(&base);

        let head_a = sha(1);
        let head_b = sha(2);
        forge.add_commit(&head_a, &base);
        forge.add_commit(&head_b, &base);
        forge.set_compare(&base, &head_a, 0, vec![commit(1, &[base.clone()])]);
        forge.set_compare(&base, &head_b, 0, vec![commit(2, &[base.clone()])]);

        let batch = vec![(PrNumber(1), head_a), (PrNumber(2), head_b)];
        let result = crate::constructor::construct(
            &forge,
            &repo,
            &AttemptId::new("t1"),
            &base,
            &batch,
            MergeStrategy::CherryPick,
        )
        .await
        .unwrap();

        let Constructed::Ok(staging) = result else {
            panic!("expected clean construction");
        };
        // Two replayed commits chained on base
        let second = forge.get_commit_sync(&staging);
        assert_eq!(second.parents.len(), 1);
        let first = forge.get_commit_sync(&second.parents[0]);
        assert_eq!(first.parents, vec![base]);
    }

    #[tokio::test]
    async fn rejects_prs_containing_merge_commits() {
        let forge = MockForge::new();
        let repo = RepoId::new("octocat", "hello-world");
        let base = sha(0x100);
        forge.add_root_commit(&base);

        let head_a = sha(1);
        let head_b = sha(2);
        forge.add_commit(&head_a, &base);
        forge.add_commit(&head_b, &base);
        forge.set_compare(&base, &head_a, 0, vec![commit(1, &[base.clone()])]);
        // PR #2's range contains a merge commit
        forge.set_compare(
            &base,
            &head_b,
            0,
            vec![CommitData {
                sha: sha(2),
                tree: sha(0x1002),
                parents: vec![base.clone(), sha(9)],
                message: "merge main".to_string(),
            }],
        );

        let batch = vec![(PrNumber(1), head_a), (PrNumber(2), head_b)];
        let result = crate::constructor::construct(
            &forge,
            &repo,
            &AttemptId::new("t1"),
            &base,
            &batch,
            MergeStrategy::CherryPick,
        )
        .await
        .unwrap();

        assert_eq!(result, Constructed::Conflict(vec![PrNumber(2)]));
    }
}
