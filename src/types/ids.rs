//! Identifier types for the queue's domain.
//!
//! Wrapping raw integers and strings in dedicated types keeps PR numbers,
//! attempt ids, and commit ids from being confused for one another. The
//! commit id additionally enforces well-formedness at the boundary: it is
//! decoded to raw bytes on entry, so two spellings of the same commit can
//! never compare unequal anywhere downstream.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A pull request number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrNumber(pub u64);

impl fmt::Display for PrNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A repository, addressed as owner plus name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub repo: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        RepoId {
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Why a string was rejected as a commit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShaParseError {
    #[error("commit id must be 40 hex digits, got {0} characters")]
    WrongLength(usize),
    #[error("commit id contains non-hex characters")]
    NotHex,
}

/// A full git commit id, held as its 20 raw bytes.
///
/// Parsing accepts either hex case; everything the queue stores, compares,
/// or hashes is the decoded form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha([u8; 20]);

impl Sha {
    /// Decodes a 40-digit hex string.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, ShaParseError> {
        let input = input.as_ref();
        if input.len() != 40 {
            return Err(ShaParseError::WrongLength(input.len()));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(input, &mut bytes).map_err(|_| ShaParseError::NotHex)?;
        Ok(Sha(bytes))
    }

    /// The full 40-digit lowercase hex form, as the forge API wants it.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// A 10-digit abbreviation for log lines and PR comments.
    pub fn abbrev(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha({})", self.abbrev())
    }
}

impl Serialize for Sha {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Sha {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Sha::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// The opaque identifier of a merge attempt.
///
/// Attempt ids are globally unique. The attempt's staging branch name is a
/// deterministic function of the id, so the id is all that needs to be
/// persisted to find (and clean up) the staging ref.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(String);

impl AttemptId {
    /// Generates a fresh, globally unique attempt id.
    pub fn generate() -> Self {
        AttemptId(uuid::Uuid::new_v4().to_string())
    }

    /// Wraps an existing id string (used when loading persisted state and in tests).
    pub fn new(s: impl Into<String>) -> Self {
        AttemptId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The staging branch owned by this attempt.
    ///
    /// The ref is exclusively owned by the attempt until the attempt reaches a
    /// terminal state, at which point it is deleted.
    pub fn staging_branch(&self) -> String {
        format!("staging-{}", self.0)
    }

    /// The scratch branch used while folding PRs into the candidate merge.
    ///
    /// Scoped to a single constructor invocation and deleted on every exit path.
    pub fn scratch_branch(&self) -> String {
        format!("staging-{}-wip", self.0)
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
