use std::sync::Arc;

use revloop_agent::ReviewOrchestrator;

/// Shared application state for axum handlers.
pub struct AppState {
    pub orchestrator: Arc<ReviewOrchestrator>,
}
