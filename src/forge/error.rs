//! Forge API failure classification.
//!
//! The queue needs exactly one decision out of a failed forge call: is it
//! worth retrying inside the call, or should the operation bail out and let
//! the poller re-drive it from persisted state? The variants below encode
//! that decision directly, plus the one failure the controller handles
//! specially: a non-forced ref update that was refused because the target
//! branch moved, which means "re-construct on the new tip", never "retry".

use thiserror::Error;

/// A failed forge call, classified by what the caller should do about it.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// The forge asked us to slow down (429, or 403 with a rate-limit body).
    #[error("rate limited by the forge: {message}")]
    RateLimited { message: String },

    /// The forge failed on its side (5xx). Worth another try after a pause.
    #[error("forge unavailable (HTTP {status}): {message}")]
    Unavailable { status: u16, message: String },

    /// The request never completed (connect, DNS, timeout).
    #[error("network failure reaching the forge: {message}")]
    Network { message: String },

    /// The forge understood the request and said no (4xx: missing PR or
    /// branch, bad credentials, validation failure). Retrying changes nothing.
    #[error("forge refused the request (HTTP {status}): {message}")]
    Refused { status: u16, message: String },

    /// A non-forced ref update was rejected: the branch tip is no longer an
    /// ancestor of the commit being pushed. The batch must be rebuilt on the
    /// new tip, so this is handled by the controller, not by retrying.
    #[error("updating {branch} was not a fast-forward: {message}")]
    NotFastForward { branch: String, message: String },

    /// The forge answered with something the queue cannot use: a malformed
    /// commit id, a missing field, an unparsable body.
    #[error("unusable forge response: {message}")]
    Malformed { message: String },
}

impl ForgeError {
    /// True if an immediate in-call retry has a chance of succeeding.
    ///
    /// Everything else exits the current operation; the poller picks the
    /// work back up from the store on its next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ForgeError::RateLimited { .. }
                | ForgeError::Unavailable { .. }
                | ForgeError::Network { .. }
        )
    }

    /// The HTTP status the forge answered with, when there was an answer.
    pub fn status(&self) -> Option<u16> {
        match self {
            ForgeError::Unavailable { status, .. } | ForgeError::Refused { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Builds a `Malformed` error.
    pub fn malformed(message: impl Into<String>) -> Self {
        ForgeError::Malformed {
            message: message.into(),
        }
    }

    /// Classifies an octocrab error.
    ///
    /// Errors that carry an HTTP status are sorted by it; deserialization
    /// failures mean the response body was unusable; anything else never got
    /// a usable answer and counts as a network failure.
    pub fn classify(err: octocrab::Error) -> Self {
        match err {
            octocrab::Error::GitHub { source, .. } => {
                let status = source.status_code.as_u16();
                let message = source.message;
                if status == 429 || (status == 403 && mentions_rate_limit(&message)) {
                    ForgeError::RateLimited { message }
                } else if (500..600).contains(&status) {
                    ForgeError::Unavailable { status, message }
                } else {
                    ForgeError::Refused { status, message }
                }
            }
            octocrab::Error::Json { .. } | octocrab::Error::Serde { .. } => ForgeError::Malformed {
                message: err.to_string(),
            },
            other => ForgeError::Network {
                message: other.to_string(),
            },
        }
    }
}

/// A 403 body that is secondary rate limiting rather than a permissions
/// problem. The forge does not give this a dedicated status code.
fn mentions_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit") || lower.contains("abuse")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refused(status: u16) -> ForgeError {
        ForgeError::Refused {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn only_rate_limit_upstream_and_network_are_transient() {
        assert!(
            ForgeError::RateLimited {
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            ForgeError::Unavailable {
                status: 502,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            ForgeError::Network {
                message: String::new()
            }
            .is_transient()
        );

        assert!(!refused(404).is_transient());
        assert!(
            !ForgeError::NotFastForward {
                branch: "main".to_string(),
                message: String::new()
            }
            .is_transient()
        );
        assert!(!ForgeError::malformed("bad sha").is_transient());
    }

    #[test]
    fn status_is_exposed_where_it_exists() {
        assert_eq!(refused(409).status(), Some(409));
        assert_eq!(
            ForgeError::Unavailable {
                status: 503,
                message: String::new()
            }
            .status(),
            Some(503)
        );
        assert_eq!(
            ForgeError::Network {
                message: String::new()
            }
            .status(),
            None
        );
        assert_eq!(ForgeError::malformed("x").status(), None);
    }

    #[test]
    fn secondary_rate_limit_bodies_are_recognized() {
        assert!(mentions_rate_limit("You have exceeded a secondary rate limit"));
        assert!(mentions_rate_limit("abuse detection triggered"));
        assert!(!mentions_rate_limit("Resource not accessible by integration"));
    }

    #[test]
    fn not_fast_forward_names_the_branch() {
        let err = ForgeError::NotFastForward {
            branch: "main".to_string(),
            message: "update is not a fast-forward".to_string(),
        };
        assert!(err.to_string().contains("main"));
        assert_eq!(err.status(), None);
    }
}
