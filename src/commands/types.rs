//! Bot command types.

/// A command addressed to the bot in a PR comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Queue this PR for merging.
    Merge,
    /// Remove this PR from the queue.
    Cancel,
}
