//! The event router: maps normalized events onto controller entry points.

use tracing::debug;

use crate::commands::Command;
use crate::controller::{CancelReason, Controller, ControllerError};
use crate::types::RepoId;

use super::events::QueueEvent;

/// Dispatches one normalized event to the controller.
///
/// Handlers never touch the store directly; every state change goes through
/// a controller entry point.
pub async fn handle_event(
    controller: &Controller,
    repo: &RepoId,
    event: QueueEvent,
) -> Result<(), ControllerError> {
    debug!(repo = %repo, event = ?event, "handling event");
    match event {
        QueueEvent::Command {
            pr,
            command: Command::Merge,
        } => controller.request(repo, pr).await,

        QueueEvent::Command {
            pr,
            command: Command::Cancel,
        } => controller.cancel(repo, pr, CancelReason::Command).await,

        QueueEvent::PrClosed { pr } => controller.cancel(repo, pr, CancelReason::Closed).await,

        QueueEvent::HeadPushed { pr } => {
            controller.cancel(repo, pr, CancelReason::HeadMoved).await
        }

        QueueEvent::ReviewSubmitted { pr } => controller.initiate(repo, pr).await,

        QueueEvent::StatusChanged { sha } => controller.status_changed(repo, &sha).await,

        QueueEvent::BranchPushed { branch } => controller.branch_pushed(repo, &branch).await,
    }
}
