use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use revloop_agent::ReviewOrchestrator;
use revloop_core::config::GatewayConfig;
use revloop_core::event::EventBus;
use revloop_core::types::ReviewEvent;

use crate::routes;
use crate::state::AppState;

/// Build the review API router over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route(
            "/api/reviews",
            get(routes::list_reviews).post(routes::start_review),
        )
        .route(
            "/api/reviews/{id}",
            get(routes::get_review).delete(routes::discard_review),
        )
        .route("/api/reviews/{id}/decision", post(routes::submit_decision))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP gateway built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    orchestrator: Arc<ReviewOrchestrator>,
    event_bus: Arc<EventBus>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        orchestrator: Arc<ReviewOrchestrator>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            event_bus,
        }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            orchestrator: self.orchestrator.clone(),
        });

        spawn_event_logger(self.event_bus.clone(), shutdown.clone());
        if let Some(ttl) = self.orchestrator.session_ttl_secs() {
            spawn_expiry_sweeper(self.orchestrator.clone(), ttl, shutdown.clone());
        }

        let app = router(state);
        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

fn spawn_event_logger(event_bus: Arc<EventBus>, cancel: CancellationToken) {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(ReviewEvent::GenerationFailed { session_id, error }) => {
                        warn!(session_id = %session_id, error = %error, "Generation failed");
                    }
                    Ok(event) => debug!(?event, "Review event"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Event logger lagged");
                    }
                    Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
    });
}

/// Periodically drop sessions idle past their TTL.
fn spawn_expiry_sweeper(orchestrator: Arc<ReviewOrchestrator>, ttl_secs: u64, cancel: CancellationToken) {
    let period = Duration::from_secs(ttl_secs.clamp(1, 300));
    info!(interval_secs = period.as_secs(), "Session expiry sweeper started");
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = cancel.cancelled() => break,
            }
            if let Err(e) = orchestrator.purge_expired().await {
                warn!(error = %e, "Session purge failed");
            }
        }
    });
}
