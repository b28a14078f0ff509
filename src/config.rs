//! Configuration for the merge-queue bot.
//!
//! Global settings (listen address, state directory, secrets) come from the
//! environment. Per-repository behavior (target branch allow-list, merge
//! strategy, required status contexts) comes from an optional JSON config
//! file; repositories without an entry use the defaults.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constructor::MergeStrategy;
use crate::types::RepoId;

/// Default bot name for command parsing.
pub const DEFAULT_BOT_NAME: &str = "merge-queue";

/// Errors loading the per-repo configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-repository behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Base branches PRs may be queued against.
    pub allowed_branches: Vec<String>,

    /// How the staging commit is assembled.
    pub strategy: MergeStrategy,

    /// Status contexts that gate admission and decide test outcomes.
    /// Empty means the forge's combined rollup decides.
    pub required_contexts: Vec<String>,

    /// Whether check-run conclusions count toward commit status.
    pub include_check_runs: bool,

    /// The mention name the bot answers to.
    pub bot_name: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        RepoConfig {
            allowed_branches: vec!["main".to_string()],
            strategy: MergeStrategy::Merge,
            required_contexts: Vec::new(),
            include_check_runs: false,
            bot_name: DEFAULT_BOT_NAME.to_string(),
        }
    }
}

impl RepoConfig {
    /// Returns true if PRs targeting `branch` may be queued.
    pub fn branch_allowed(&self, branch: &str) -> bool {
        self.allowed_branches.iter().any(|b| b == branch)
    }
}

/// The full per-repo configuration table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Defaults applied to repositories without an explicit entry.
    pub default: RepoConfig,

    /// Per-repo overrides, keyed by "owner/repo".
    pub repos: HashMap<String, RepoConfig>,
}

impl QueueConfig {
    /// Loads the configuration table from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolves the configuration for a repository.
    pub fn repo(&self, repo: &RepoId) -> &RepoConfig {
        self.repos
            .get(&format!("{}/{}", repo.owner, repo.repo))
            .unwrap_or(&self.default)
    }
}

/// The poller's authoritative timeout table.
///
/// Timeouts are enforced only by the poller, never by per-request deadlines,
/// so the system tolerates arbitrary webhook delays.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// PR waiting for pre-status/review.
    pub requested: Duration,
    /// PR waiting for admission.
    pub queued: Duration,
    /// PR inside an active attempt.
    pub merging: Duration,
    /// PR inside a split attempt.
    pub split_pr: Duration,
    /// Attempt building its staging commit.
    pub constructing: Duration,
    /// Attempt waiting for CI on staging.
    pub testing: Duration,
    /// Attempt waiting to fast-forward the target.
    pub success: Duration,
    /// Split attempt waiting for re-admission.
    pub split_attempt: Duration,
    /// How long the oldest queued PR must wait before an attempt is created,
    /// giving additional PRs a chance to coalesce into one batch.
    pub debounce: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            requested: Duration::hours(1),
            queued: Duration::hours(24),
            merging: Duration::hours(24),
            split_pr: Duration::hours(24),
            constructing: Duration::minutes(15),
            testing: Duration::hours(1),
            success: Duration::minutes(15),
            split_attempt: Duration::hours(24),
            debounce: Duration::minutes(10),
        }
    }
}

/// Global settings for the binary, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub listen_addr: SocketAddr,

    /// Directory for persisted queue state.
    pub state_dir: PathBuf,

    /// Secret for verifying webhook signatures.
    pub webhook_secret: Vec<u8>,

    /// Personal access token for the forge API.
    pub forge_token: Option<String>,

    /// Optional path to the per-repo configuration file.
    pub repo_config_path: Option<PathBuf>,

    /// How often the poller re-drives persisted state.
    pub poll_period: std::time::Duration,
}

impl Config {
    /// Reads settings from the environment; anything unset falls back to a
    /// development default.
    pub fn from_env() -> Self {
        let webhook_secret = match env_string("WEBHOOK_SECRET") {
            Some(secret) => secret.into_bytes(),
            None => {
                tracing::warn!(
                    "no WEBHOOK_SECRET configured; deliveries signed by a real forge will be rejected"
                );
                Vec::new()
            }
        };

        Config {
            listen_addr: env_parsed("LISTEN_ADDR")
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000))),
            state_dir: env_string("STATE_DIR")
                .map_or_else(|| PathBuf::from("./data/state"), PathBuf::from),
            webhook_secret,
            forge_token: env_string("FORGE_TOKEN"),
            repo_config_path: env_string("REPO_CONFIG").map(PathBuf::from),
            poll_period: env_parsed("POLL_PERIOD_SECS")
                .map_or(std::time::Duration::from_secs(600), std::time::Duration::from_secs),
        }
    }
}

/// Reads one environment variable as a string; unset or non-UTF8 is `None`.
fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Reads and parses one environment variable; unset and unparsable both fall
/// through to the caller's default.
fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name)?.parse().ok()
}
