//! Core domain types for the merge-queue bot.
//!
//! This module contains the fundamental types used throughout the application,
//! designed to encode invariants via the type system.

pub mod attempt;
pub mod ids;
pub mod pr;

// Re-export commonly used types at the module level
pub use attempt::{AttemptState, MergeAttempt};
pub use ids::{AttemptId, PrNumber, RepoId, Sha, ShaParseError};
pub use pr::{PrQueueState, PrRecord};
