//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::MonitorConfig;
use crate::db::Store;
use crate::scheduler::TickStatus;
use crate::tracker::ActivityLedger;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: MonitorConfig,
    pub store: Arc<Store>,
    pub ledger: Arc<ActivityLedger>,
    pub status: TickStatus,
}

/// Read-only status server.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: MonitorConfig, store: Arc<Store>, ledger: Arc<ActivityLedger>, status: TickStatus) -> Self {
        Self {
            state: AppState {
                config,
                store,
                ledger,
                status,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            // Dashboard
            .route("/", get(handlers::handle_dashboard))
            // API endpoints
            .route("/api/devices", get(handlers::handle_get_devices))
            .route("/api/events", get(handlers::handle_get_events))
            .route("/api/report", get(handlers::handle_report))
            .route("/api/status", get(handlers::handle_status))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
