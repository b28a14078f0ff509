//! Merge Queue Bot - main entry point.
//!
//! Runs the HTTP server that accepts forge webhooks and the background
//! poller that enforces timeouts and recovers abandoned operations.

use std::sync::Arc;

use merge_queue::config::{Config, QueueConfig};
use merge_queue::controller::Controller;
use merge_queue::forge::{ForgeClient, OctocrabForge};
use merge_queue::server::{AppState, build_router};
use merge_queue::store::Store;
use merge_queue::poller;
use merge_queue::webhooks::WebhookSecret;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "merge_queue=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    let queue_config = match &config.repo_config_path {
        Some(path) => match QueueConfig::load(path) {
            Ok(qc) => qc,
            Err(e) => {
                tracing::error!(error = %e, "failed to load repo config");
                std::process::exit(1);
            }
        },
        None => QueueConfig::default(),
    };

    let forge: Arc<dyn ForgeClient> = match &config.forge_token {
        Some(token) => match OctocrabForge::from_token(token.clone()) {
            Ok(forge) => Arc::new(forge),
            Err(e) => {
                tracing::error!(error = %e, "failed to build forge client");
                std::process::exit(1);
            }
        },
        None => {
            tracing::error!("FORGE_TOKEN not set; the bot cannot talk to the forge");
            std::process::exit(1);
        }
    };

    let store = match Store::open(&config.state_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "failed to open state store");
            std::process::exit(1);
        }
    };

    tracing::info!(
        state_dir = %config.state_dir.display(),
        poll_period_secs = config.poll_period.as_secs(),
        "starting merge queue bot"
    );

    let queue_config = Arc::new(queue_config);
    let controller = Arc::new(Controller::new(
        store.clone(),
        forge,
        queue_config.clone(),
    ));

    let shutdown = CancellationToken::new();
    let poller_handle = tokio::spawn(poller::run(
        controller.clone(),
        store.clone(),
        config.poll_period,
        shutdown.clone(),
    ));

    let app_state = AppState::new(
        controller,
        store,
        queue_config,
        WebhookSecret::new(config.webhook_secret),
    );
    let app = build_router(app_state);

    tracing::info!("listening on {}", config.listen_addr);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .expect("server failed");

    shutdown.cancel();
    let _ = poller_handle.await;
}
