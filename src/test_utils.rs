//! Shared test utilities: an in-memory forge fake and small fixture helpers.
//!
//! [`MockForge`] models just enough of a forge for the queue: branches are
//! pointers into a synthetic commit graph, each commit knows which PR heads
//! it contains, and conflicts are declared per head pair. Server-side merges,
//! commit creation, compares, statuses, reviews, and comments all operate on
//! that model, so controller scenarios can run end to end without a network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::forge::{
    CombinedState, CommitData, CompareData, ContextStatus, ForgeClient, ForgeError, MergeOutcome,
    PrData, PrState, ReviewData, ReviewVerdict, StatusSummary,
};
use crate::types::{PrNumber, RepoId, Sha};

/// Builds a deterministic SHA from a small integer.
pub fn sha(n: u64) -> Sha {
    Sha::parse(format!("{:040x}", n)).expect("generated sha is valid")
}

#[derive(Default)]
struct ForgeInner {
    prs: HashMap<PrNumber, PrData>,
    reviews: HashMap<PrNumber, Vec<ReviewData>>,
    statuses: HashMap<Sha, StatusSummary>,
    check_runs: HashMap<Sha, Vec<ContextStatus>>,
    branches: HashMap<String, Sha>,
    commits: HashMap<Sha, CommitData>,
    /// Which PR heads each commit transitively contains.
    contents: HashMap<Sha, HashSet<Sha>>,
    /// Unordered head pairs that cannot be merged together.
    conflicts: HashSet<(Sha, Sha)>,
    /// Heads that conflict with anything (even the bare base).
    conflicts_with_base: HashSet<Sha>,
    compares: HashMap<(Sha, Sha), CompareData>,
    comments: Vec<(PrNumber, String)>,
    counter: u64,
}

impl ForgeInner {
    fn next_sha(&mut self) -> Sha {
        self.counter += 1;
        sha(0xf0_0000 + self.counter)
    }

    fn contents_of(&self, commit: &Sha) -> HashSet<Sha> {
        self.contents.get(commit).cloned().unwrap_or_default()
    }

    fn conflicts_between(&self, folded: &HashSet<Sha>, head: &Sha) -> bool {
        if self.conflicts_with_base.contains(head) {
            return true;
        }
        folded.iter().any(|h| {
            self.conflicts.contains(&(h.clone(), head.clone()))
                || self.conflicts.contains(&(head.clone(), h.clone()))
        })
    }

    fn descends_from(&self, commit: &Sha, ancestor: &Sha) -> bool {
        let mut queue = VecDeque::from([commit.clone()]);
        let mut visited = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if &current == ancestor {
                return true;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&current) {
                queue.extend(commit.parents.iter().cloned());
            }
        }
        false
    }
}

/// An in-memory [`ForgeClient`] for tests.
#[derive(Default)]
pub struct MockForge {
    inner: Mutex<ForgeInner>,
}

impl MockForge {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Fixture setup ────────────────────────────────────────────────────────

    /// Adds a parentless commit (a branch root).
    pub fn add_root_commit(&self, sha: &Sha) {
        let mut inner = self.inner.lock().unwrap();
        inner.commits.insert(
            sha.clone(),
            CommitData {
                sha: sha.clone(),
                tree: derive_tree(sha),
                parents: vec![],
                message: "root".to_string(),
            },
        );
        inner.contents.insert(sha.clone(), HashSet::new());
    }

    /// Adds a commit on top of `parent`. The commit counts as containing itself.
    pub fn add_commit(&self, sha: &Sha, parent: &Sha) {
        let mut inner = self.inner.lock().unwrap();
        let mut contents = inner.contents_of(parent);
        contents.insert(sha.clone());
        inner.commits.insert(
            sha.clone(),
            CommitData {
                sha: sha.clone(),
                tree: derive_tree(sha),
                parents: vec![parent.clone()],
                message: format!("commit {}", sha.abbrev()),
            },
        );
        inner.contents.insert(sha.clone(), contents);
    }

    /// Points a branch at a commit.
    pub fn set_branch(&self, name: &str, sha: &Sha) {
        self.inner
            .lock()
            .unwrap()
            .branches
            .insert(name.to_string(), sha.clone());
    }

    /// Declares that two PR heads cannot be merged together.
    pub fn add_conflict(&self, a: &Sha, b: &Sha) {
        self.inner
            .lock()
            .unwrap()
            .conflicts
            .insert((a.clone(), b.clone()));
    }

    /// Declares that a head conflicts with the base branch itself.
    pub fn add_conflict_with_base(&self, head: &Sha) {
        self.inner
            .lock()
            .unwrap()
            .conflicts_with_base
            .insert(head.clone());
    }

    /// Scripts a compare result for `(base, head)`.
    pub fn set_compare(&self, base: &Sha, head: &Sha, behind_by: u64, commits: Vec<CommitData>) {
        self.inner.lock().unwrap().compares.insert(
            (base.clone(), head.clone()),
            CompareData { behind_by, commits },
        );
    }

    /// Registers an open PR. The head commit must be added separately.
    pub fn add_open_pr(&self, number: PrNumber, head: &Sha, head_ref: &str, base_ref: &str) {
        self.inner.lock().unwrap().prs.insert(
            number,
            PrData {
                number,
                head_sha: head.clone(),
                head_ref: head_ref.to_string(),
                base_ref: base_ref.to_string(),
                state: PrState::Open,
                is_draft: false,
            },
        );
    }

    /// Marks a PR closed.
    pub fn close_pr(&self, number: PrNumber) {
        if let Some(pr) = self.inner.lock().unwrap().prs.get_mut(&number) {
            pr.state = PrState::Closed;
        }
    }

    /// Marks a PR as a draft (or not).
    pub fn set_draft(&self, number: PrNumber, draft: bool) {
        if let Some(pr) = self.inner.lock().unwrap().prs.get_mut(&number) {
            pr.is_draft = draft;
        }
    }

    /// Simulates a push: moves the PR's head.
    pub fn set_pr_head(&self, number: PrNumber, head: &Sha) {
        if let Some(pr) = self.inner.lock().unwrap().prs.get_mut(&number) {
            pr.head_sha = head.clone();
        }
    }

    /// Records an approving review at the PR's current head.
    pub fn approve(&self, number: PrNumber, reviewer: &str) {
        let mut inner = self.inner.lock().unwrap();
        let commit = inner.prs.get(&number).map(|pr| pr.head_sha.clone());
        inner.reviews.entry(number).or_default().push(ReviewData {
            reviewer: reviewer.to_string(),
            verdict: ReviewVerdict::Approved,
            commit_id: commit,
        });
    }

    /// Records a changes-requested review at the PR's current head.
    pub fn request_changes(&self, number: PrNumber, reviewer: &str) {
        let mut inner = self.inner.lock().unwrap();
        let commit = inner.prs.get(&number).map(|pr| pr.head_sha.clone());
        inner.reviews.entry(number).or_default().push(ReviewData {
            reviewer: reviewer.to_string(),
            verdict: ReviewVerdict::ChangesRequested,
            commit_id: commit,
        });
    }

    /// Sets the combined status at a commit (no per-context breakdown).
    pub fn set_status(&self, sha: &Sha, state: CombinedState) {
        self.inner.lock().unwrap().statuses.insert(
            sha.clone(),
            StatusSummary {
                state,
                contexts: Vec::new(),
            },
        );
    }

    // ─── Inspection ───────────────────────────────────────────────────────────

    /// Current tip of a branch, if it exists.
    pub fn branch(&self, name: &str) -> Option<Sha> {
        self.inner.lock().unwrap().branches.get(name).cloned()
    }

    /// True if `commit` contains the changes of PR head `head`.
    pub fn commit_contains(&self, commit: &Sha, head: &Sha) -> bool {
        self.inner.lock().unwrap().contents_of(commit).contains(head)
    }

    /// True if `commit` descends from `ancestor` via parent links.
    pub fn descends_from(&self, commit: &Sha, ancestor: &Sha) -> bool {
        self.inner.lock().unwrap().descends_from(commit, ancestor)
    }

    /// Synchronous commit lookup for assertions.
    pub fn get_commit_sync(&self, sha: &Sha) -> CommitData {
        self.inner
            .lock()
            .unwrap()
            .commits
            .get(sha)
            .cloned()
            .expect("commit exists")
    }

    /// All comments posted so far, in order.
    pub fn comments(&self) -> Vec<(PrNumber, String)> {
        self.inner.lock().unwrap().comments.clone()
    }

    /// Comments posted on one PR, in order.
    pub fn comments_for(&self, number: PrNumber) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .comments
            .iter()
            .filter(|(pr, _)| *pr == number)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl ForgeClient for MockForge {
    async fn pr_info(&self, _repo: &RepoId, pr: PrNumber) -> Result<PrData, ForgeError> {
        self.inner
            .lock()
            .unwrap()
            .prs
            .get(&pr)
            .cloned()
            .ok_or_else(|| ForgeError::Refused {
                status: 404,
                message: format!("PR {} not found", pr),
            })
    }

    async fn list_reviews(
        &self,
        _repo: &RepoId,
        pr: PrNumber,
    ) -> Result<Vec<ReviewData>, ForgeError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .reviews
            .get(&pr)
            .cloned()
            .unwrap_or_default())
    }

    async fn combined_status(
        &self,
        _repo: &RepoId,
        sha: &Sha,
    ) -> Result<StatusSummary, ForgeError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .statuses
            .get(sha)
            .cloned()
            .unwrap_or(StatusSummary {
                state: CombinedState::Pending,
                contexts: Vec::new(),
            }))
    }

    async fn check_runs(
        &self,
        _repo: &RepoId,
        sha: &Sha,
    ) -> Result<Vec<ContextStatus>, ForgeError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .check_runs
            .get(sha)
            .cloned()
            .unwrap_or_default())
    }

    async fn branch_sha(&self, _repo: &RepoId, branch: &str) -> Result<Sha, ForgeError> {
        self.inner
            .lock()
            .unwrap()
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| ForgeError::Refused {
                status: 404,
                message: format!("branch {} not found", branch),
            })
    }

    async fn create_branch(
        &self,
        _repo: &RepoId,
        branch: &str,
        sha: &Sha,
    ) -> Result<(), ForgeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.branches.contains_key(branch) {
            return Err(ForgeError::Refused {
                status: 422,
                message: format!("branch {} already exists", branch),
            });
        }
        inner.branches.insert(branch.to_string(), sha.clone());
        Ok(())
    }

    async fn force_update_branch(
        &self,
        _repo: &RepoId,
        branch: &str,
        sha: &Sha,
    ) -> Result<(), ForgeError> {
        self.inner
            .lock()
            .unwrap()
            .branches
            .insert(branch.to_string(), sha.clone());
        Ok(())
    }

    async fn fast_forward_branch(
        &self,
        _repo: &RepoId,
        branch: &str,
        sha: &Sha,
    ) -> Result<(), ForgeError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(current) = inner.branches.get(branch).cloned() else {
            return Err(ForgeError::Refused {
                status: 404,
                message: format!("branch {} not found", branch),
            });
        };
        if current == *sha {
            return Ok(());
        }
        if !inner.descends_from(sha, &current) {
            return Err(ForgeError::NotFastForward {
                branch: branch.to_string(),
                message: "not a fast forward".to_string(),
            });
        }
        inner.branches.insert(branch.to_string(), sha.clone());
        Ok(())
    }

    async fn delete_branch(&self, _repo: &RepoId, branch: &str) -> Result<(), ForgeError> {
        self.inner.lock().unwrap().branches.remove(branch);
        Ok(())
    }

    async fn merge_into_branch(
        &self,
        _repo: &RepoId,
        branch: &str,
        head: &Sha,
        message: &str,
    ) -> Result<MergeOutcome, ForgeError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(tip) = inner.branches.get(branch).cloned() else {
            return Err(ForgeError::Refused {
                status: 404,
                message: format!("branch {} not found", branch),
            });
        };

        let folded = inner.contents_of(&tip);
        if folded.contains(head) {
            return Ok(MergeOutcome::AlreadyMerged);
        }
        if inner.conflicts_between(&folded, head) {
            return Ok(MergeOutcome::Conflict);
        }

        let merge_sha = inner.next_sha();
        let mut contents = folded;
        contents.extend(inner.contents_of(head));
        contents.insert(head.clone());
        inner.commits.insert(
            merge_sha.clone(),
            CommitData {
                sha: merge_sha.clone(),
                tree: derive_tree(&merge_sha),
                parents: vec![tip, head.clone()],
                message: message.to_string(),
            },
        );
        inner.contents.insert(merge_sha.clone(), contents);
        inner.branches.insert(branch.to_string(), merge_sha.clone());
        Ok(MergeOutcome::Merged(merge_sha))
    }

    async fn get_commit(&self, _repo: &RepoId, sha: &Sha) -> Result<CommitData, ForgeError> {
        self.inner
            .lock()
            .unwrap()
            .commits
            .get(sha)
            .cloned()
            .ok_or_else(|| ForgeError::Refused {
                status: 404,
                message: format!("commit {} not found", sha),
            })
    }

    async fn create_commit(
        &self,
        _repo: &RepoId,
        message: &str,
        tree: &Sha,
        parents: &[Sha],
    ) -> Result<Sha, ForgeError> {
        let mut inner = self.inner.lock().unwrap();
        let new_sha = inner.next_sha();
        let mut contents = HashSet::new();
        for parent in parents {
            contents.extend(inner.contents_of(parent));
        }
        inner.commits.insert(
            new_sha.clone(),
            CommitData {
                sha: new_sha.clone(),
                tree: tree.clone(),
                parents: parents.to_vec(),
                message: message.to_string(),
            },
        );
        inner.contents.insert(new_sha.clone(), contents);
        Ok(new_sha)
    }

    async fn compare(
        &self,
        _repo: &RepoId,
        base: &Sha,
        head: &Sha,
    ) -> Result<CompareData, ForgeError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .compares
            .get(&(base.clone(), head.clone()))
            .cloned()
            .unwrap_or(CompareData {
                behind_by: 0,
                commits: Vec::new(),
            }))
    }

    async fn post_comment(
        &self,
        _repo: &RepoId,
        pr: PrNumber,
        body: &str,
    ) -> Result<(), ForgeError> {
        self.inner
            .lock()
            .unwrap()
            .comments
            .push((pr, body.to_string()));
        Ok(())
    }
}

fn derive_tree(sha: &Sha) -> Sha {
    // Any deterministic distinct value works as a tree id in the fake
    let reversed: String = sha.to_hex().chars().rev().collect();
    Sha::parse(reversed).expect("reversed hex is a sha")
}
