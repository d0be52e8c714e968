use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::routes;
use crate::state::AppState;

/// Routes over shared state, without binding a socket.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Progress channels
        .route("/ws/{channel}", get(routes::ws_handler))
        // REST API
        .route("/api/health", get(routes::health))
        .route("/api/simulate", post(routes::simulate))
        .route("/api/compare", post(routes::compare))
        .route("/api/sessions/{id}", get(routes::get_session))
        .route("/api/comparisons/{id}", get(routes::get_comparison))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

/// WebSocket + HTTP gateway server built on axum.
pub struct GatewayServer {
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Serve until `shutdown` fires; background runs are cancelled with it.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = router(self.state.clone());

        let listener = TcpListener::bind(&self.state.config.bind).await?;
        info!(bind = %self.state.config.bind, "Gateway listening");

        let runs = self.state.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                runs.cancel();
            })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
