//! Webhook endpoint handler.
//!
//! Accepts webhook deliveries, validates signatures, normalizes the payload,
//! and hands the events to the controller before returning 202 Accepted.
//! The controller work is fire-and-forget: anything lost between the 202 and
//! the commit is re-driven from persisted state by the next poll tick.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::RepoId;
use crate::webhooks::{ParseError, handle_event, parse_webhook};

use super::AppState;

/// Header name for the forge event type.
const HEADER_EVENT: &str = "x-github-event";
/// Header name for the delivery ID.
const HEADER_DELIVERY: &str = "x-github-delivery";
/// Header name for the payload signature.
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

/// Errors that can occur when accepting a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Missing required header.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    /// Invalid signature.
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid JSON body.
    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Missing repository information in payload.
    #[error("missing repository information in payload")]
    MissingRepository,

    /// Structurally broken payload for a relevant event type.
    #[error("malformed payload: {0}")]
    Malformed(#[from] ParseError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// Webhook handler.
///
/// # Response
///
/// - 202 Accepted: delivery verified and handed to the controller
/// - 400 Bad Request: missing header, invalid JSON, or malformed payload
/// - 401 Unauthorized: invalid signature
pub async fn webhook_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let event_type = get_header(&headers, HEADER_EVENT)?;
    let delivery_id = get_header(&headers, HEADER_DELIVERY)?;
    let signature_header = get_header(&headers, HEADER_SIGNATURE)?;

    debug!(
        delivery_id = %delivery_id,
        event_type = %event_type,
        "received webhook"
    );

    // Verify the signature before any parsing or further work.
    if !app_state.webhook_secret().verify(&body, &signature_header) {
        warn!(delivery_id = %delivery_id, "invalid webhook signature");
        return Err(WebhookError::InvalidSignature);
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)?;
    let (owner, repo) = extract_repository(&payload)?;
    let repo = RepoId::new(owner, repo);

    let bot_name = app_state.config().repo(&repo).bot_name.clone();
    let events = parse_webhook(&event_type, &payload, &bot_name)?;

    if events.is_empty() {
        debug!(delivery_id = %delivery_id, "no queue events in delivery");
        return Ok((StatusCode::ACCEPTED, "Accepted"));
    }

    info!(
        delivery_id = %delivery_id,
        repo = %repo,
        event_type = %event_type,
        events = events.len(),
        "dispatching webhook events"
    );

    // Fire-and-forget: don't block the 202 on controller work. The poller
    // re-drives anything that fails here.
    let controller = app_state.controller();
    tokio::spawn(async move {
        for event in events {
            if let Err(e) = handle_event(&controller, &repo, event).await {
                warn!(repo = %repo, error = %e, "webhook event handling failed");
            }
        }
    });

    Ok((StatusCode::ACCEPTED, "Accepted"))
}

/// Extracts a required header value as a string.
fn get_header(headers: &HeaderMap, name: &'static str) -> Result<String, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or(WebhookError::MissingHeader(name))
}

/// Extracts repository owner and name from a webhook payload.
fn extract_repository(body: &serde_json::Value) -> Result<(String, String), WebhookError> {
    let repository = body
        .get("repository")
        .ok_or(WebhookError::MissingRepository)?;

    let owner = repository
        .get("owner")
        .and_then(|o| o.get("login"))
        .and_then(|l| l.as_str())
        .ok_or(WebhookError::MissingRepository)?;

    let name = repository
        .get("name")
        .and_then(|n| n.as_str())
        .ok_or(WebhookError::MissingRepository)?;

    Ok((owner.to_string(), name.to_string()))
}
