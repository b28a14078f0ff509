//! Octocrab-backed implementation of [`ForgeClient`].
//!
//! Uses the REST API directly (via octocrab's generic HTTP methods) for the
//! git-data endpoints octocrab has no typed wrappers for: refs, raw commits,
//! server-side merges, and compares. Every call goes through
//! [`retry_with_backoff`], so transient failures are absorbed here and the
//! caller only sees errors the poller has to handle.

use async_trait::async_trait;
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};

use crate::types::{PrNumber, RepoId, Sha};

use super::error::ForgeError;
use super::retry::{RetryConfig, retry_with_backoff};
use super::types::{
    CheckState, CombinedState, CommitData, CompareData, ContextStatus, MergeOutcome, PrData,
    PrState, ReviewData, ReviewVerdict, StatusSummary,
};
use super::ForgeClient;

/// A forge client backed by octocrab.
#[derive(Clone)]
pub struct OctocrabForge {
    client: Octocrab,
    retry: RetryConfig,
}

impl OctocrabForge {
    /// Creates a client from a pre-configured octocrab instance.
    pub fn new(client: Octocrab) -> Self {
        Self {
            client,
            retry: RetryConfig::DEFAULT,
        }
    }

    /// Creates a client from a personal access token.
    pub fn from_token(token: impl Into<String>) -> Result<Self, octocrab::Error> {
        let client = Octocrab::builder().personal_token(token.into()).build()?;
        Ok(Self::new(client))
    }

    /// Overrides the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl std::fmt::Debug for OctocrabForge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OctocrabForge").finish_non_exhaustive()
    }
}

// ─── Wire Payloads ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PullPayload {
    number: u64,
    state: String,
    draft: Option<bool>,
    head: BranchTipPayload,
    base: BranchRefPayload,
}

#[derive(Debug, Deserialize)]
struct BranchTipPayload {
    sha: String,
    #[serde(rename = "ref")]
    ref_field: String,
}

#[derive(Debug, Deserialize)]
struct BranchRefPayload {
    #[serde(rename = "ref")]
    ref_field: String,
}

#[derive(Debug, Deserialize)]
struct ReviewPayload {
    user: Option<UserPayload>,
    state: String,
    commit_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    login: String,
}

#[derive(Debug, Deserialize)]
struct CombinedStatusPayload {
    state: String,
    statuses: Vec<StatusPayload>,
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    context: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct CheckRunsPayload {
    check_runs: Vec<CheckRunPayload>,
}

#[derive(Debug, Deserialize)]
struct CheckRunPayload {
    name: String,
    status: String,
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefPayload {
    object: RefObjectPayload,
}

#[derive(Debug, Deserialize)]
struct RefObjectPayload {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GitCommitPayload {
    sha: String,
    tree: TreePayload,
    parents: Vec<ParentPayload>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct TreePayload {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ParentPayload {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ComparePayload {
    behind_by: u64,
    commits: Vec<CompareCommitPayload>,
}

#[derive(Debug, Deserialize)]
struct CompareCommitPayload {
    sha: String,
    parents: Vec<ParentPayload>,
    commit: CompareCommitDetailPayload,
}

#[derive(Debug, Deserialize)]
struct CompareCommitDetailPayload {
    message: String,
    tree: TreePayload,
}

#[derive(Debug, Deserialize)]
struct MergePayload {
    sha: String,
}

// ─── Conversions ──────────────────────────────────────────────────────────────

fn parse_sha(s: &str, what: &str) -> Result<Sha, ForgeError> {
    Sha::parse(s).map_err(|e| ForgeError::malformed(format!("invalid {} SHA: {}", what, e)))
}

fn parse_review_verdict(state: &str) -> ReviewVerdict {
    match state.to_uppercase().as_str() {
        "APPROVED" => ReviewVerdict::Approved,
        "CHANGES_REQUESTED" => ReviewVerdict::ChangesRequested,
        "COMMENTED" => ReviewVerdict::Commented,
        "DISMISSED" => ReviewVerdict::Dismissed,
        other => {
            tracing::debug!(state = other, "unrecognized review state, treating as pending");
            ReviewVerdict::Pending
        }
    }
}

fn parse_check_state(state: &str) -> CheckState {
    match state {
        "success" => CheckState::Success,
        "pending" => CheckState::Pending,
        "failure" => CheckState::Failure,
        _ => CheckState::Error,
    }
}

fn parse_combined_state(state: &str) -> CombinedState {
    match state {
        "success" => CombinedState::Success,
        "pending" => CombinedState::Pending,
        _ => CombinedState::Failure,
    }
}

fn convert_git_commit(payload: GitCommitPayload) -> Result<CommitData, ForgeError> {
    Ok(CommitData {
        sha: parse_sha(&payload.sha, "commit")?,
        tree: parse_sha(&payload.tree.sha, "tree")?,
        parents: payload
            .parents
            .iter()
            .map(|p| parse_sha(&p.sha, "parent"))
            .collect::<Result<_, _>>()?,
        message: payload.message,
    })
}

/// Detects octocrab errors caused by an empty (HTTP 204) response body.
///
/// The merges endpoint answers 204 when the head is already contained in the
/// base branch; octocrab then fails to deserialize the empty body.
fn is_empty_body_error(err: &octocrab::Error) -> bool {
    matches!(
        err,
        octocrab::Error::Json { .. } | octocrab::Error::Serde { .. }
    )
}

#[async_trait]
impl ForgeClient for OctocrabForge {
    async fn pr_info(&self, repo: &RepoId, pr: PrNumber) -> Result<PrData, ForgeError> {
        let route = format!("/repos/{}/{}/pulls/{}", repo.owner, repo.repo, pr.0);
        let payload: PullPayload = retry_with_backoff(self.retry, || async {
            self.client
                .get(&route, None::<&()>)
                .await
                .map_err(ForgeError::classify)
        })
        .await?;

        Ok(PrData {
            number: PrNumber(payload.number),
            head_sha: parse_sha(&payload.head.sha, "head")?,
            head_ref: payload.head.ref_field,
            base_ref: payload.base.ref_field,
            state: if payload.state == "open" {
                PrState::Open
            } else {
                PrState::Closed
            },
            is_draft: payload.draft.unwrap_or(false),
        })
    }

    async fn list_reviews(
        &self,
        repo: &RepoId,
        pr: PrNumber,
    ) -> Result<Vec<ReviewData>, ForgeError> {
        let mut page = 1u32;
        let mut reviews = Vec::new();

        loop {
            let route = format!(
                "/repos/{}/{}/pulls/{}/reviews?per_page=100&page={}",
                repo.owner, repo.repo, pr.0, page
            );
            let batch: Vec<ReviewPayload> = retry_with_backoff(self.retry, || async {
                self.client
                    .get(&route, None::<&()>)
                    .await
                    .map_err(ForgeError::classify)
            })
            .await?;

            let is_last_page = batch.len() < 100;
            for review in batch {
                let Some(user) = review.user else {
                    continue;
                };
                let commit_id = match review.commit_id.as_deref() {
                    Some(sha) => Some(parse_sha(sha, "review commit")?),
                    None => None,
                };
                reviews.push(ReviewData {
                    reviewer: user.login,
                    verdict: parse_review_verdict(&review.state),
                    commit_id,
                });
            }

            if is_last_page {
                break;
            }
            page += 1;
        }

        Ok(reviews)
    }

    async fn combined_status(
        &self,
        repo: &RepoId,
        sha: &Sha,
    ) -> Result<StatusSummary, ForgeError> {
        let route = format!(
            "/repos/{}/{}/commits/{}/status",
            repo.owner, repo.repo, sha
        );
        let payload: CombinedStatusPayload = retry_with_backoff(self.retry, || async {
            self.client
                .get(&route, None::<&()>)
                .await
                .map_err(ForgeError::classify)
        })
        .await?;

        Ok(StatusSummary {
            state: parse_combined_state(&payload.state),
            contexts: payload
                .statuses
                .into_iter()
                .map(|s| ContextStatus {
                    context: s.context,
                    state: parse_check_state(&s.state),
                })
                .collect(),
        })
    }

    async fn check_runs(
        &self,
        repo: &RepoId,
        sha: &Sha,
    ) -> Result<Vec<ContextStatus>, ForgeError> {
        let route = format!(
            "/repos/{}/{}/commits/{}/check-runs?per_page=100",
            repo.owner, repo.repo, sha
        );
        let payload: CheckRunsPayload = retry_with_backoff(self.retry, || async {
            self.client
                .get(&route, None::<&()>)
                .await
                .map_err(ForgeError::classify)
        })
        .await?;

        Ok(payload
            .check_runs
            .into_iter()
            .map(|run| ContextStatus {
                context: run.name,
                state: if run.status != "completed" {
                    CheckState::Pending
                } else {
                    match run.conclusion.as_deref() {
                        Some("success") | Some("neutral") | Some("skipped") => CheckState::Success,
                        Some("failure") | Some("timed_out") | Some("action_required") => {
                            CheckState::Failure
                        }
                        _ => CheckState::Error,
                    }
                },
            })
            .collect())
    }

    async fn branch_sha(&self, repo: &RepoId, branch: &str) -> Result<Sha, ForgeError> {
        let route = format!(
            "/repos/{}/{}/git/ref/heads/{}",
            repo.owner, repo.repo, branch
        );
        let payload: RefPayload = retry_with_backoff(self.retry, || async {
            self.client
                .get(&route, None::<&()>)
                .await
                .map_err(ForgeError::classify)
        })
        .await?;

        parse_sha(&payload.object.sha, "branch tip")
    }

    async fn create_branch(
        &self,
        repo: &RepoId,
        branch: &str,
        sha: &Sha,
    ) -> Result<(), ForgeError> {
        #[derive(Serialize)]
        struct CreateRefRequest {
            #[serde(rename = "ref")]
            ref_field: String,
            sha: String,
        }

        let route = format!("/repos/{}/{}/git/refs", repo.owner, repo.repo);
        let request = CreateRefRequest {
            ref_field: format!("refs/heads/{}", branch),
            sha: sha.to_hex(),
        };

        retry_with_backoff(self.retry, || async {
            self.client
                .post::<_, RefPayload>(&route, Some(&request))
                .await
                .map_err(ForgeError::classify)
        })
        .await?;
        Ok(())
    }

    async fn force_update_branch(
        &self,
        repo: &RepoId,
        branch: &str,
        sha: &Sha,
    ) -> Result<(), ForgeError> {
        match self.update_ref(repo, branch, sha, true).await {
            Ok(()) => Ok(()),
            // A missing ref cannot be force-updated; create it instead
            Err(e) if matches!(e.status(), Some(404 | 422)) => {
                self.create_branch(repo, branch, sha).await
            }
            Err(e) => Err(e),
        }
    }

    async fn fast_forward_branch(
        &self,
        repo: &RepoId,
        branch: &str,
        sha: &Sha,
    ) -> Result<(), ForgeError> {
        match self.update_ref(repo, branch, sha, false).await {
            Ok(()) => Ok(()),
            Err(e) if e.status() == Some(422) => Err(ForgeError::NotFastForward {
                branch: branch.to_string(),
                message: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn delete_branch(&self, repo: &RepoId, branch: &str) -> Result<(), ForgeError> {
        // DELETE returns 204 No Content on success; use _delete for the raw
        // response since the body is empty and cannot be parsed as JSON.
        let route = format!(
            "/repos/{}/{}/git/refs/heads/{}",
            repo.owner, repo.repo, branch
        );

        let response = self
            .client
            ._delete(&route, None::<&()>)
            .await
            .map_err(ForgeError::classify)?;

        let status = response.status();
        // 404 / 422 mean the ref is already gone
        if status.is_success() || status.as_u16() == 404 || status.as_u16() == 422 {
            Ok(())
        } else {
            Err(ForgeError::Refused {
                status: status.as_u16(),
                message: format!("could not delete branch {}", branch),
            })
        }
    }

    async fn merge_into_branch(
        &self,
        repo: &RepoId,
        branch: &str,
        head: &Sha,
        message: &str,
    ) -> Result<MergeOutcome, ForgeError> {
        #[derive(Serialize)]
        struct MergeRequest<'a> {
            base: &'a str,
            head: String,
            commit_message: &'a str,
        }

        let route = format!("/repos/{}/{}/merges", repo.owner, repo.repo);
        let request = MergeRequest {
            base: branch,
            head: head.to_hex(),
            commit_message: message,
        };

        let result = retry_with_backoff(self.retry, || async {
            match self
                .client
                .post::<_, MergePayload>(&route, Some(&request))
                .await
            {
                Ok(payload) => Ok(Some(payload)),
                // 204 No Content: head already contained in base
                Err(e) if is_empty_body_error(&e) => Ok(None),
                Err(e) => Err(ForgeError::classify(e)),
            }
        })
        .await;

        match result {
            Ok(Some(payload)) => Ok(MergeOutcome::Merged(parse_sha(&payload.sha, "merge")?)),
            Ok(None) => Ok(MergeOutcome::AlreadyMerged),
            // 409 Conflict: the merge cannot be performed cleanly
            Err(e) if e.status() == Some(409) => Ok(MergeOutcome::Conflict),
            Err(e) => Err(e),
        }
    }

    async fn get_commit(&self, repo: &RepoId, sha: &Sha) -> Result<CommitData, ForgeError> {
        let route = format!(
            "/repos/{}/{}/git/commits/{}",
            repo.owner, repo.repo, sha
        );
        let payload: GitCommitPayload = retry_with_backoff(self.retry, || async {
            self.client
                .get(&route, None::<&()>)
                .await
                .map_err(ForgeError::classify)
        })
        .await?;

        convert_git_commit(payload)
    }

    async fn create_commit(
        &self,
        repo: &RepoId,
        message: &str,
        tree: &Sha,
        parents: &[Sha],
    ) -> Result<Sha, ForgeError> {
        #[derive(Serialize)]
        struct CreateCommitRequest<'a> {
            message: &'a str,
            tree: String,
            parents: Vec<String>,
        }

        let route = format!("/repos/{}/{}/git/commits", repo.owner, repo.repo);
        let request = CreateCommitRequest {
            message,
            tree: tree.to_hex(),
            parents: parents.iter().map(Sha::to_hex).collect(),
        };

        let payload: GitCommitPayload = retry_with_backoff(self.retry, || async {
            self.client
                .post(&route, Some(&request))
                .await
                .map_err(ForgeError::classify)
        })
        .await?;

        parse_sha(&payload.sha, "created commit")
    }

    async fn compare(
        &self,
        repo: &RepoId,
        base: &Sha,
        head: &Sha,
    ) -> Result<CompareData, ForgeError> {
        let route = format!(
            "/repos/{}/{}/compare/{}...{}",
            repo.owner, repo.repo, base, head
        );
        let payload: ComparePayload = retry_with_backoff(self.retry, || async {
            self.client
                .get(&route, None::<&()>)
                .await
                .map_err(ForgeError::classify)
        })
        .await?;

        Ok(CompareData {
            behind_by: payload.behind_by,
            commits: payload
                .commits
                .into_iter()
                .map(|c| {
                    Ok(CommitData {
                        sha: parse_sha(&c.sha, "compare commit")?,
                        tree: parse_sha(&c.commit.tree.sha, "compare tree")?,
                        parents: c
                            .parents
                            .iter()
                            .map(|p| parse_sha(&p.sha, "compare parent"))
                            .collect::<Result<_, _>>()?,
                        message: c.commit.message,
                    })
                })
                .collect::<Result<_, ForgeError>>()?,
        })
    }

    async fn post_comment(
        &self,
        repo: &RepoId,
        pr: PrNumber,
        body: &str,
    ) -> Result<(), ForgeError> {
        #[derive(Serialize)]
        struct CommentRequest<'a> {
            body: &'a str,
        }

        let route = format!(
            "/repos/{}/{}/issues/{}/comments",
            repo.owner, repo.repo, pr.0
        );
        let request = CommentRequest { body };

        retry_with_backoff(self.retry, || async {
            self.client
                .post::<_, serde_json::Value>(&route, Some(&request))
                .await
                .map_err(ForgeError::classify)
        })
        .await?;
        Ok(())
    }
}

impl OctocrabForge {
    /// Updates `refs/heads/<branch>` to `sha` via PATCH.
    async fn update_ref(
        &self,
        repo: &RepoId,
        branch: &str,
        sha: &Sha,
        force: bool,
    ) -> Result<(), ForgeError> {
        #[derive(Serialize)]
        struct UpdateRefRequest {
            sha: String,
            force: bool,
        }

        let route = format!(
            "/repos/{}/{}/git/refs/heads/{}",
            repo.owner, repo.repo, branch
        );
        let request = UpdateRefRequest {
            sha: sha.to_hex(),
            force,
        };

        retry_with_backoff(self.retry, || async {
            self.client
                .patch::<RefPayload, _, _>(&route, Some(&request))
                .await
                .map_err(ForgeError::classify)
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_verdict_parsing() {
        assert_eq!(parse_review_verdict("APPROVED"), ReviewVerdict::Approved);
        assert_eq!(parse_review_verdict("approved"), ReviewVerdict::Approved);
        assert_eq!(
            parse_review_verdict("CHANGES_REQUESTED"),
            ReviewVerdict::ChangesRequested
        );
        assert_eq!(parse_review_verdict("COMMENTED"), ReviewVerdict::Commented);
        assert_eq!(parse_review_verdict("mystery"), ReviewVerdict::Pending);
    }

    #[test]
    fn check_state_parsing() {
        assert_eq!(parse_check_state("success"), CheckState::Success);
        assert_eq!(parse_check_state("pending"), CheckState::Pending);
        assert_eq!(parse_check_state("failure"), CheckState::Failure);
        assert_eq!(parse_check_state("error"), CheckState::Error);
    }

    #[test]
    fn combined_state_parsing() {
        assert_eq!(parse_combined_state("success"), CombinedState::Success);
        assert_eq!(parse_combined_state("pending"), CombinedState::Pending);
        assert_eq!(parse_combined_state("failure"), CombinedState::Failure);
    }
}
