//! Transactional persistence for the two queue entities.
//!
//! The store keeps one [`RepoState`] per repository: the PR rows and merge
//! attempts of that repo, plus a monotonic admission sequence. State lives in
//! memory behind a per-repo async mutex and is persisted as an atomic JSON
//! snapshot after every committed transaction.
//!
//! # Transactions
//!
//! A transaction is a synchronous closure run under the repo's lock against a
//! working copy of the state. If the closure completes and the resulting
//! state passes invariant validation, the snapshot is written and the copy
//! committed; otherwise the original state is kept. Because the lock spans
//! the whole closure, transactions are serialized per repository - which is
//! exactly the serialization scope the controller needs, since no two active
//! merge attempts may coexist in one repo anyway.
//!
//! Forge API calls must never happen inside a transaction; callers re-check
//! state with a fresh transaction after every await point instead.

pub mod snapshot;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::types::{AttemptId, AttemptState, MergeAttempt, PrNumber, PrRecord, RepoId};

pub use snapshot::{SnapshotError, load_snapshot, save_snapshot_atomic};

/// A violation of the store's structural invariants.
///
/// These indicate programmer error in a transaction closure, never bad
/// external input; the offending transaction is rolled back.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    /// More than one attempt outside the split state.
    #[error("{count} active merge attempts coexist (at most one allowed)")]
    MultipleActiveAttempts { count: usize },

    /// A merging/split PR points at an attempt that does not exist.
    #[error("PR {pr} references missing attempt {attempt}")]
    DanglingAttemptRef { pr: PrNumber, attempt: AttemptId },

    /// A merging/split PR has no attempt reference.
    #[error("PR {pr} is attached to no attempt")]
    MissingAttemptRef { pr: PrNumber },

    /// A requested/queued PR carries an attempt reference.
    #[error("PR {pr} should not reference an attempt")]
    UnexpectedAttemptRef { pr: PrNumber },

    /// A split attempt with no PRs was left behind instead of being deleted.
    #[error("split attempt {attempt} has no PRs")]
    EmptySplitAttempt { attempt: AttemptId },
}

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Snapshot IO or serialization failed; the transaction did not commit.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// A transaction closure produced an invalid state; it was rolled back.
    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    /// IO error while scanning the state directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The persisted queue state of one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoState {
    /// Schema version for forward-compatible migrations.
    pub schema_version: u32,

    /// PR rows, keyed by number.
    pub prs: BTreeMap<PrNumber, PrRecord>,

    /// Merge attempts, keyed by id.
    pub attempts: BTreeMap<AttemptId, MergeAttempt>,

    /// Next admission sequence number (monotonic per repo).
    pub next_seq: u64,
}

impl Default for RepoState {
    fn default() -> Self {
        Self::new()
    }
}

impl RepoState {
    /// Creates an empty repo state.
    pub fn new() -> Self {
        RepoState {
            schema_version: snapshot::SCHEMA_VERSION,
            prs: BTreeMap::new(),
            attempts: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Allocates the next admission sequence number.
    pub fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// The repo's active (non-split) attempt, if any. Invariant: at most one.
    pub fn active_attempt(&self) -> Option<&MergeAttempt> {
        self.attempts.values().find(|a| a.state.is_active())
    }

    /// All split attempts, in id order.
    pub fn split_attempts(&self) -> impl Iterator<Item = &MergeAttempt> {
        self.attempts
            .values()
            .filter(|a| a.state == AttemptState::Split)
    }

    /// The PRs attached to an attempt, in admission order.
    pub fn prs_in_attempt(&self, attempt: &AttemptId) -> Vec<&PrRecord> {
        let mut prs: Vec<&PrRecord> = self
            .prs
            .values()
            .filter(|pr| pr.attempt.as_ref() == Some(attempt))
            .collect();
        prs.sort_by_key(|pr| pr.enqueued_seq);
        prs
    }

    /// The attempt whose staging commit is `sha`, if any.
    pub fn attempt_by_staging(&self, sha: &crate::types::Sha) -> Option<&MergeAttempt> {
        self.attempts
            .values()
            .find(|a| a.staging.as_ref() == Some(sha))
    }

    /// Checks the structural invariants that must hold after every committed
    /// transaction.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        let active = self.attempts.values().filter(|a| a.state.is_active()).count();
        if active > 1 {
            return Err(InvariantViolation::MultipleActiveAttempts { count: active });
        }

        for pr in self.prs.values() {
            match (&pr.attempt, pr.state.has_attempt()) {
                (Some(attempt), true) => {
                    if !self.attempts.contains_key(attempt) {
                        return Err(InvariantViolation::DanglingAttemptRef {
                            pr: pr.number,
                            attempt: attempt.clone(),
                        });
                    }
                }
                (None, true) => {
                    return Err(InvariantViolation::MissingAttemptRef { pr: pr.number });
                }
                (Some(_), false) => {
                    return Err(InvariantViolation::UnexpectedAttemptRef { pr: pr.number });
                }
                (None, false) => {}
            }
        }

        for attempt in self.split_attempts() {
            if self.prs_in_attempt(&attempt.id).is_empty() {
                return Err(InvariantViolation::EmptySplitAttempt {
                    attempt: attempt.id.clone(),
                });
            }
        }

        Ok(())
    }
}

/// The store: all repos' queue state, durably snapshotted.
pub struct Store {
    state_dir: PathBuf,
    repos: Mutex<HashMap<RepoId, Arc<Mutex<RepoState>>>>,
}

impl Store {
    /// Opens the store, preloading every repo snapshot found under `state_dir`.
    ///
    /// Layout: `<state_dir>/<owner>/<repo>/queue.json`.
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let state_dir = state_dir.into();
        let mut repos = HashMap::new();

        if state_dir.exists() {
            for owner_entry in std::fs::read_dir(&state_dir)? {
                let owner_entry = owner_entry?;
                if !owner_entry.file_type()?.is_dir() {
                    continue;
                }
                let owner = owner_entry.file_name().to_string_lossy().into_owned();

                for repo_entry in std::fs::read_dir(owner_entry.path())? {
                    let repo_entry = repo_entry?;
                    if !repo_entry.file_type()?.is_dir() {
                        continue;
                    }
                    let repo = repo_entry.file_name().to_string_lossy().into_owned();

                    let path = repo_entry.path().join("queue.json");
                    if let Some(state) = load_snapshot(&path)? {
                        let repo_id = RepoId::new(&owner, &repo);
                        tracing::info!(
                            repo = %repo_id,
                            prs = state.prs.len(),
                            attempts = state.attempts.len(),
                            "loaded repo state"
                        );
                        repos.insert(repo_id, Arc::new(Mutex::new(state)));
                    }
                }
            }
        }

        Ok(Store {
            state_dir,
            repos: Mutex::new(repos),
        })
    }

    fn snapshot_path(&self, repo: &RepoId) -> PathBuf {
        self.state_dir
            .join(&repo.owner)
            .join(&repo.repo)
            .join("queue.json")
    }

    async fn entry(&self, repo: &RepoId) -> Arc<Mutex<RepoState>> {
        let mut repos = self.repos.lock().await;
        repos
            .entry(repo.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RepoState::new())))
            .clone()
    }

    /// Runs a transaction against a repo's state.
    ///
    /// The closure mutates a working copy; on return the result is validated
    /// against the structural invariants and snapshotted to disk before the
    /// commit becomes visible. On validation or IO failure the state is left
    /// untouched.
    pub async fn transact<R>(
        &self,
        repo: &RepoId,
        f: impl FnOnce(&mut RepoState) -> R,
    ) -> Result<R, StoreError> {
        let entry = self.entry(repo).await;
        let mut state = entry.lock().await;

        let mut working = state.clone();
        let result = f(&mut working);

        if working != *state {
            working.validate()?;
            save_snapshot_atomic(&self.snapshot_path(repo), &working)?;
            *state = working;
        }

        Ok(result)
    }

    /// Reads a repo's state without mutating it.
    ///
    /// An untracked repo reads as empty; reading does not start tracking it.
    pub async fn read<R>(&self, repo: &RepoId, f: impl FnOnce(&RepoState) -> R) -> R {
        let entry = {
            let repos = self.repos.lock().await;
            repos.get(repo).cloned()
        };
        match entry {
            Some(entry) => {
                let state = entry.lock().await;
                f(&state)
            }
            None => f(&RepoState::new()),
        }
    }

    /// Returns true if the store tracks state for this repo.
    pub async fn contains(&self, repo: &RepoId) -> bool {
        let repos = self.repos.lock().await;
        repos.contains_key(repo)
    }

    /// All repos the store currently tracks.
    pub async fn repos(&self) -> Vec<RepoId> {
        let repos = self.repos.lock().await;
        repos.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sha;
    use crate::types::PrQueueState;
    use chrono::Utc;
    use tempfile::tempdir;

    fn pr(number: u64, state: PrQueueState, attempt: Option<AttemptId>, seq: u64) -> PrRecord {
        let mut record = PrRecord::new(
            PrNumber(number),
            sha(number),
            format!("feature-{}", number),
            state,
            seq,
            Utc::now(),
        );
        record.attempt = attempt;
        record
    }

    fn attempt(id: &str, repo: &RepoId, state: AttemptState) -> MergeAttempt {
        let mut a = MergeAttempt::new(AttemptId::new(id), repo.clone(), Utc::now());
        a.state = state;
        a
    }

    fn repo() -> RepoId {
        RepoId::new("octocat", "hello-world")
    }

    #[test]
    fn empty_state_is_valid() {
        assert_eq!(RepoState::new().validate(), Ok(()));
    }

    #[test]
    fn two_active_attempts_rejected() {
        let mut state = RepoState::new();
        let r = repo();
        state
            .attempts
            .insert(AttemptId::new("a"), attempt("a", &r, AttemptState::Constructing));
        state
            .attempts
            .insert(AttemptId::new("b"), attempt("b", &r, AttemptState::Testing));

        assert!(matches!(
            state.validate(),
            Err(InvariantViolation::MultipleActiveAttempts { count: 2 })
        ));
    }

    #[test]
    fn active_plus_splits_allowed() {
        let mut state = RepoState::new();
        let r = repo();
        state
            .attempts
            .insert(AttemptId::new("a"), attempt("a", &r, AttemptState::Testing));
        state
            .attempts
            .insert(AttemptId::new("b"), attempt("b", &r, AttemptState::Split));
        state
            .attempts
            .insert(AttemptId::new("c"), attempt("c", &r, AttemptState::Split));
        state.prs.insert(
            PrNumber(1),
            pr(1, PrQueueState::Merging, Some(AttemptId::new("a")), 0),
        );
        state.prs.insert(
            PrNumber(2),
            pr(2, PrQueueState::Split, Some(AttemptId::new("b")), 1),
        );
        state.prs.insert(
            PrNumber(3),
            pr(3, PrQueueState::Split, Some(AttemptId::new("c")), 2),
        );

        assert_eq!(state.validate(), Ok(()));
    }

    #[test]
    fn merging_pr_without_attempt_rejected() {
        let mut state = RepoState::new();
        state
            .prs
            .insert(PrNumber(1), pr(1, PrQueueState::Merging, None, 0));

        assert!(matches!(
            state.validate(),
            Err(InvariantViolation::MissingAttemptRef { .. })
        ));
    }

    #[test]
    fn dangling_attempt_ref_rejected() {
        let mut state = RepoState::new();
        state.prs.insert(
            PrNumber(1),
            pr(1, PrQueueState::Merging, Some(AttemptId::new("gone")), 0),
        );

        assert!(matches!(
            state.validate(),
            Err(InvariantViolation::DanglingAttemptRef { .. })
        ));
    }

    #[test]
    fn queued_pr_with_attempt_rejected() {
        let mut state = RepoState::new();
        state.prs.insert(
            PrNumber(1),
            pr(1, PrQueueState::Queued, Some(AttemptId::new("a")), 0),
        );

        assert!(matches!(
            state.validate(),
            Err(InvariantViolation::UnexpectedAttemptRef { .. })
        ));
    }

    #[test]
    fn empty_split_rejected() {
        let mut state = RepoState::new();
        let r = repo();
        state
            .attempts
            .insert(AttemptId::new("a"), attempt("a", &r, AttemptState::Split));

        assert!(matches!(
            state.validate(),
            Err(InvariantViolation::EmptySplitAttempt { .. })
        ));
    }

    #[test]
    fn prs_in_attempt_sorted_by_admission_order() {
        let mut state = RepoState::new();
        let r = repo();
        let id = AttemptId::new("a");
        state
            .attempts
            .insert(id.clone(), attempt("a", &r, AttemptState::Testing));
        state.prs.insert(
            PrNumber(9),
            pr(9, PrQueueState::Merging, Some(id.clone()), 0),
        );
        state.prs.insert(
            PrNumber(2),
            pr(2, PrQueueState::Merging, Some(id.clone()), 1),
        );

        let ordered: Vec<PrNumber> = state
            .prs_in_attempt(&id)
            .iter()
            .map(|p| p.number)
            .collect();
        assert_eq!(ordered, vec![PrNumber(9), PrNumber(2)]);
    }

    #[tokio::test]
    async fn transact_commits_and_persists() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let r = repo();

        store
            .transact(&r, |state| {
                let seq = state.alloc_seq();
                state.prs.insert(
                    PrNumber(1),
                    pr(1, PrQueueState::Queued, None, seq),
                );
            })
            .await
            .unwrap();

        // Visible in memory
        let count = store.read(&r, |state| state.prs.len()).await;
        assert_eq!(count, 1);

        // Visible after reopening from disk
        let reopened = Store::open(dir.path()).unwrap();
        let count = reopened.read(&r, |state| state.prs.len()).await;
        assert_eq!(count, 1);
        assert_eq!(reopened.repos().await, vec![r]);
    }

    #[tokio::test]
    async fn invalid_transaction_rolls_back() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let r = repo();

        let result = store
            .transact(&r, |state| {
                state
                    .prs
                    .insert(PrNumber(1), pr(1, PrQueueState::Merging, None, 0));
            })
            .await;
        assert!(matches!(result, Err(StoreError::Invariant(_))));

        // Nothing committed
        let count = store.read(&r, |state| state.prs.len()).await;
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn read_only_transaction_does_not_write_snapshot() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let r = repo();

        store.transact(&r, |_state| ()).await.unwrap();
        assert!(!dir.path().join("octocat").exists());
    }
}
