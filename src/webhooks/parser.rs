//! Parses raw webhook payloads into normalized [`QueueEvent`]s.
//!
//! Parsing is tolerant by design: event types and actions the queue does not
//! care about yield an empty event list, not an error. Errors are reserved
//! for payloads that claim to be relevant but are structurally broken.

use serde_json::Value;
use thiserror::Error;

use crate::commands::parse_command;
use crate::types::{PrNumber, Sha};

use super::events::QueueEvent;

/// Errors from webhook payload parsing.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("missing field {0} in {1} payload")]
    MissingField(&'static str, &'static str),

    #[error("invalid commit SHA in {0} payload: {1}")]
    InvalidSha(&'static str, crate::types::ShaParseError),
}

/// Parses one webhook delivery into zero or more normalized events.
pub fn parse_webhook(
    event_type: &str,
    payload: &Value,
    bot_name: &str,
) -> Result<Vec<QueueEvent>, ParseError> {
    match event_type {
        "pull_request" => parse_pull_request(payload),
        "issue_comment" => parse_issue_comment(payload, bot_name),
        "pull_request_review" => parse_review(payload),
        "status" => parse_status(payload),
        "check_suite" => parse_check(payload, "check_suite"),
        "check_run" => parse_check(payload, "check_run"),
        "push" => parse_push(payload),
        _ => Ok(Vec::new()),
    }
}

fn action(payload: &Value) -> Option<&str> {
    payload.get("action").and_then(Value::as_str)
}

fn pr_number(payload: &Value, event: &'static str) -> Result<PrNumber, ParseError> {
    payload
        .get("pull_request")
        .and_then(|pr| pr.get("number"))
        .and_then(Value::as_u64)
        .map(PrNumber)
        .ok_or(ParseError::MissingField("pull_request.number", event))
}

fn parse_pull_request(payload: &Value) -> Result<Vec<QueueEvent>, ParseError> {
    let pr = pr_number(payload, "pull_request")?;
    Ok(match action(payload) {
        Some("closed") => vec![QueueEvent::PrClosed { pr }],
        Some("synchronize") => vec![QueueEvent::HeadPushed { pr }],
        _ => Vec::new(),
    })
}

fn parse_issue_comment(payload: &Value, bot_name: &str) -> Result<Vec<QueueEvent>, ParseError> {
    // Only fresh comments count; edits of old comments are not commands
    if action(payload) != Some("created") {
        return Ok(Vec::new());
    }

    let issue = payload
        .get("issue")
        .ok_or(ParseError::MissingField("issue", "issue_comment"))?;

    // Comments on plain issues (no pull_request key) are not PR commands
    if issue.get("pull_request").is_none() {
        return Ok(Vec::new());
    }

    let pr = issue
        .get("number")
        .and_then(Value::as_u64)
        .map(PrNumber)
        .ok_or(ParseError::MissingField("issue.number", "issue_comment"))?;

    let body = payload
        .get("comment")
        .and_then(|c| c.get("body"))
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField("comment.body", "issue_comment"))?;

    Ok(match parse_command(body, bot_name) {
        Some(command) => vec![QueueEvent::Command { pr, command }],
        None => Vec::new(),
    })
}

fn parse_review(payload: &Value) -> Result<Vec<QueueEvent>, ParseError> {
    if action(payload) != Some("submitted") {
        return Ok(Vec::new());
    }
    let pr = pr_number(payload, "pull_request_review")?;
    Ok(vec![QueueEvent::ReviewSubmitted { pr }])
}

fn parse_status(payload: &Value) -> Result<Vec<QueueEvent>, ParseError> {
    let sha_str = payload
        .get("sha")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField("sha", "status"))?;
    let sha = Sha::parse(sha_str).map_err(|e| ParseError::InvalidSha("status", e))?;
    Ok(vec![QueueEvent::StatusChanged { sha }])
}

fn parse_check(payload: &Value, event: &'static str) -> Result<Vec<QueueEvent>, ParseError> {
    // Only completed runs/suites change the aggregate verdict
    if action(payload) != Some("completed") {
        return Ok(Vec::new());
    }
    let sha_str = payload
        .get(event)
        .and_then(|c| c.get("head_sha"))
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField("head_sha", event))?;
    let sha = Sha::parse(sha_str).map_err(|e| ParseError::InvalidSha(event, e))?;
    Ok(vec![QueueEvent::StatusChanged { sha }])
}

fn parse_push(payload: &Value) -> Result<Vec<QueueEvent>, ParseError> {
    let git_ref = payload
        .get("ref")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField("ref", "push"))?;

    // Tag pushes and other refs are irrelevant
    Ok(match git_ref.strip_prefix("refs/heads/") {
        Some(branch) => vec![QueueEvent::BranchPushed {
            branch: branch.to_string(),
        }],
        None => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::test_utils::sha;
    use serde_json::json;

    const BOT: &str = "merge-queue";

    #[test]
    fn merge_command_in_pr_comment() {
        let payload = json!({
            "action": "created",
            "issue": { "number": 42, "pull_request": {} },
            "comment": { "body": "@merge-queue merge" }
        });
        let events = parse_webhook("issue_comment", &payload, BOT).unwrap();
        assert_eq!(
            events,
            vec![QueueEvent::Command {
                pr: PrNumber(42),
                command: Command::Merge
            }]
        );
    }

    #[test]
    fn comment_on_plain_issue_is_ignored() {
        let payload = json!({
            "action": "created",
            "issue": { "number": 42 },
            "comment": { "body": "@merge-queue merge" }
        });
        let events = parse_webhook("issue_comment", &payload, BOT).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn edited_comment_is_ignored() {
        let payload = json!({
            "action": "edited",
            "issue": { "number": 42, "pull_request": {} },
            "comment": { "body": "@merge-queue merge" }
        });
        let events = parse_webhook("issue_comment", &payload, BOT).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn pr_closed_and_synchronize() {
        let closed = json!({ "action": "closed", "pull_request": { "number": 7 } });
        assert_eq!(
            parse_webhook("pull_request", &closed, BOT).unwrap(),
            vec![QueueEvent::PrClosed { pr: PrNumber(7) }]
        );

        let sync = json!({ "action": "synchronize", "pull_request": { "number": 7 } });
        assert_eq!(
            parse_webhook("pull_request", &sync, BOT).unwrap(),
            vec![QueueEvent::HeadPushed { pr: PrNumber(7) }]
        );

        let opened = json!({ "action": "opened", "pull_request": { "number": 7 } });
        assert!(parse_webhook("pull_request", &opened, BOT).unwrap().is_empty());
    }

    #[test]
    fn review_submitted() {
        let payload = json!({
            "action": "submitted",
            "pull_request": { "number": 3 },
            "review": { "state": "approved" }
        });
        assert_eq!(
            parse_webhook("pull_request_review", &payload, BOT).unwrap(),
            vec![QueueEvent::ReviewSubmitted { pr: PrNumber(3) }]
        );
    }

    #[test]
    fn status_carries_the_sha() {
        let head = sha(0xab);
        let payload = json!({ "sha": head.to_hex(), "state": "success" });
        assert_eq!(
            parse_webhook("status", &payload, BOT).unwrap(),
            vec![QueueEvent::StatusChanged { sha: head }]
        );
    }

    #[test]
    fn completed_check_run_maps_to_status_changed() {
        let head = sha(0xcd);
        let payload = json!({
            "action": "completed",
            "check_run": { "head_sha": head.to_hex() }
        });
        assert_eq!(
            parse_webhook("check_run", &payload, BOT).unwrap(),
            vec![QueueEvent::StatusChanged { sha: head }]
        );

        let in_progress = json!({
            "action": "created",
            "check_run": { "head_sha": head.to_hex() }
        });
        assert!(parse_webhook("check_run", &in_progress, BOT).unwrap().is_empty());
    }

    #[test]
    fn branch_push_extracts_branch_name() {
        let payload = json!({ "ref": "refs/heads/feature-1" });
        assert_eq!(
            parse_webhook("push", &payload, BOT).unwrap(),
            vec![QueueEvent::BranchPushed {
                branch: "feature-1".to_string()
            }]
        );

        let tag = json!({ "ref": "refs/tags/v1.0" });
        assert!(parse_webhook("push", &tag, BOT).unwrap().is_empty());
    }

    #[test]
    fn unknown_event_type_is_ignored() {
        let payload = json!({ "anything": true });
        assert!(parse_webhook("workflow_job", &payload, BOT).unwrap().is_empty());
    }

    #[test]
    fn invalid_status_sha_is_an_error() {
        let payload = json!({ "sha": "not-a-sha" });
        assert!(parse_webhook("status", &payload, BOT).is_err());
    }
}
