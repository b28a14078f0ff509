//! HTTP server for the merge-queue bot.
//!
//! - `POST /webhook` - accepts webhook deliveries (202 Accepted)
//! - `GET /api/v1/repos/{owner}/{repo}/state` - repository queue state as JSON
//! - `GET /health` - 200 if the server is running

use std::sync::Arc;

use crate::config::QueueConfig;
use crate::controller::Controller;
use crate::store::Store;
use crate::webhooks::WebhookSecret;

pub mod health;
pub mod state;
pub mod webhook;

pub use health::health_handler;
pub use state::state_handler;
pub use webhook::webhook_handler;

/// Shared application state, passed to handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    controller: Arc<Controller>,
    store: Arc<Store>,
    config: Arc<QueueConfig>,
    webhook_secret: WebhookSecret,
}

impl AppState {
    /// Creates a new `AppState`.
    pub fn new(
        controller: Arc<Controller>,
        store: Arc<Store>,
        config: Arc<QueueConfig>,
        webhook_secret: WebhookSecret,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                controller,
                store,
                config,
                webhook_secret,
            }),
        }
    }

    pub fn controller(&self) -> Arc<Controller> {
        self.inner.controller.clone()
    }

    pub fn store(&self) -> Arc<Store> {
        self.inner.store.clone()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn webhook_secret(&self) -> &WebhookSecret {
        &self.inner.webhook_secret
    }
}

/// Builds the axum router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/api/v1/repos/{owner}/{repo}/state", get(state_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::forge::CombinedState;
    use crate::store::RepoState;
    use crate::test_utils::{MockForge, sha};
    use crate::types::{PrNumber, RepoId};

    struct TestServer {
        app_state: AppState,
        forge: Arc<MockForge>,
        store: Arc<Store>,
        _dir: tempfile::TempDir,
    }

    fn test_server(secret: &[u8]) -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let forge = Arc::new(MockForge::new());
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let config = Arc::new(QueueConfig::default());
        let controller = Arc::new(Controller::new(
            store.clone(),
            forge.clone(),
            config.clone(),
        ));
        let app_state = AppState::new(
            controller,
            store.clone(),
            config,
            WebhookSecret::new(secret.to_vec()),
        );
        TestServer {
            app_state,
            forge,
            store,
            _dir: dir,
        }
    }

    fn webhook_request(
        secret: &[u8],
        event_type: &str,
        delivery_id: &str,
        body: &serde_json::Value,
    ) -> Request<Body> {
        let body_bytes = serde_json::to_vec(body).unwrap();
        let signature_header = WebhookSecret::new(secret.to_vec()).sign(&body_bytes);

        Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .header("x-github-event", event_type)
            .header("x-github-delivery", delivery_id)
            .header("x-hub-signature-256", signature_header)
            .body(Body::from(body_bytes))
            .unwrap()
    }

    fn comment_payload(pr: u64, body: &str) -> serde_json::Value {
        json!({
            "action": "created",
            "issue": { "number": pr, "pull_request": {} },
            "comment": { "body": body },
            "repository": {
                "name": "hello-world",
                "owner": { "login": "octocat" }
            }
        })
    }

    #[tokio::test]
    async fn health_returns_200() {
        let server = test_server(b"secret");
        let app = build_router(server.app_state.clone());

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn webhook_with_valid_signature_is_accepted_and_handled() {
        let secret = b"test-secret";
        let server = test_server(secret);

        // A ready PR so the merge command queues it
        let base = sha(0x100);
        let head = sha(1);
        server.forge.add_root_commit(&base);
        server.forge.add_commit(&head, &base);
        server.forge.set_branch("main", &base);
        server
            .forge
            .add_open_pr(PrNumber(1), &head, "feature-1", "main");
        server.forge.approve(PrNumber(1), "alice");
        server.forge.set_status(&head, CombinedState::Success);

        let app = build_router(server.app_state.clone());
        let request = webhook_request(
            secret,
            "issue_comment",
            "550e8400-e29b-41d4-a716-446655440000",
            &comment_payload(1, "@merge-queue merge"),
        );
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        // Handling is fire-and-forget; wait for the row to appear
        let repo = RepoId::new("octocat", "hello-world");
        let mut queued = false;
        for _ in 0..100 {
            if server
                .store
                .read(&repo, |s| s.prs.contains_key(&PrNumber(1)))
                .await
            {
                queued = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queued, "merge command should insert the PR row");
    }

    #[tokio::test]
    async fn webhook_with_invalid_signature_is_rejected() {
        let server = test_server(b"correct-secret");
        let app = build_router(server.app_state.clone());

        let request = webhook_request(
            b"wrong-secret",
            "issue_comment",
            "550e8400-e29b-41d4-a716-446655440001",
            &comment_payload(1, "@merge-queue merge"),
        );
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn webhook_missing_event_header_is_rejected() {
        let secret = b"secret";
        let server = test_server(secret);
        let app = build_router(server.app_state.clone());

        let body = comment_payload(1, "@merge-queue merge");
        let body_bytes = serde_json::to_vec(&body).unwrap();
        let signature_header = WebhookSecret::new(secret.to_vec()).sign(&body_bytes);

        let request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("x-github-delivery", "550e8400-e29b-41d4-a716-446655440002")
            .header("x-hub-signature-256", signature_header)
            .body(Body::from(body_bytes))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_missing_repository_is_rejected() {
        let secret = b"secret";
        let server = test_server(secret);
        let app = build_router(server.app_state.clone());

        let request = webhook_request(
            secret,
            "pull_request",
            "550e8400-e29b-41d4-a716-446655440003",
            &json!({ "action": "opened" }),
        );
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn state_endpoint_returns_404_for_untracked_repo() {
        let server = test_server(b"secret");
        let app = build_router(server.app_state.clone());

        let request = Request::builder()
            .uri("/api/v1/repos/nonexistent/repo/state")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn state_endpoint_returns_tracked_state() {
        let server = test_server(b"secret");
        let repo = RepoId::new("octocat", "hello-world");

        // Seed some state
        server
            .store
            .transact(&repo, |state| {
                state.alloc_seq();
            })
            .await
            .unwrap();

        let app = build_router(server.app_state.clone());
        let request = Request::builder()
            .uri("/api/v1/repos/octocat/hello-world/state")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: RepoState = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.next_seq, 1);
    }
}
