//! Normalized inbound events.
//!
//! The raw webhook payloads from the forge are parsed down to the handful of
//! signals the controller cares about. Everything else is dropped at the
//! parsing stage.

use crate::commands::Command;
use crate::types::{PrNumber, Sha};

/// A normalized signal for the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A bot command was issued in a PR comment.
    Command { pr: PrNumber, command: Command },

    /// The PR was closed (or merged externally).
    PrClosed { pr: PrNumber },

    /// The PR's head moved (a `synchronize` action).
    HeadPushed { pr: PrNumber },

    /// A review was submitted; the PR may have become ready.
    ReviewSubmitted { pr: PrNumber },

    /// A status or check result landed at a commit. The SHA decides whether
    /// this drives an attempt's test phase or a requested PR's pre-status.
    StatusChanged { sha: Sha },

    /// A branch was pushed; any queued PR with this head branch is stale.
    BranchPushed { branch: String },
}
