//! The background poll loop.
//!
//! Every tick, each tracked repository gets one `Controller::poll` pass:
//! timeouts are enforced and any operation abandoned mid-flight (crash,
//! transient forge error, lost webhook) is re-driven from persisted state.
//! This loop is the system's only retry mechanism.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::Controller;
use crate::store::Store;

/// Runs the poll loop until the cancellation token fires.
pub async fn run(
    controller: Arc<Controller>,
    store: Arc<Store>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(period_secs = period.as_secs(), "poller started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("poller shutting down");
                return;
            }
            _ = interval.tick() => {
                let repos = store.repos().await;
                debug!(repos = repos.len(), "poll tick");
                for repo in repos {
                    if let Err(e) = controller.poll(&repo, Utc::now()).await {
                        warn!(repo = %repo, error = %e, "poll failed; will retry next tick");
                    }
                }
            }
        }
    }
}
