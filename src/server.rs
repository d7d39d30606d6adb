use crate::handlers::{allow, get_limit, health_check, metrics, set_limit, SharedState};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tokio::signal;

/// Routes of the admission service.
pub fn create_app(state: SharedState) -> Router {
    Router::new()
        .route("/allow", get(allow))
        .route("/limit", get(get_limit).put(set_limit))
        .route("/metrics", get(metrics))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

pub struct Server {
    app: Router,
    addr: SocketAddr,
}

impl Server {
    pub fn new(state: SharedState, addr: SocketAddr) -> Self {
        Self {
            app: create_app(state),
            addr,
        }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        tracing::info!("Sliding window server listening on {}", self.addr);
        tracing::info!("Admission endpoint available at /allow");

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
