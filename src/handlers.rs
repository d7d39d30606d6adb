use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{LimiterError, LimiterResult};
use crate::health::HealthChecker;
use crate::limiter::Limiter;
use crate::metrics::MetricsCollector;

/// Shared application state
pub type SharedState = Arc<AppState>;

pub struct NamedLimiter {
    pub name: String,
    pub limiter: Arc<Limiter>,
}

/// Limiters cooperating on one resource, plus what the endpoints report on.
pub struct AppState {
    pub resource: String,
    pub limiters: Vec<NamedLimiter>,
    pub metrics: MetricsCollector,
    pub health: HealthChecker,
    next: AtomicUsize,
}

impl AppState {
    pub fn new(
        resource: impl Into<String>,
        limiters: Vec<NamedLimiter>,
        health: HealthChecker,
    ) -> LimiterResult<Self> {
        if limiters.is_empty() {
            return Err(LimiterError::Configuration(
                "at least one limiter is required".to_string(),
            ));
        }

        Ok(Self {
            resource: resource.into(),
            limiters,
            metrics: MetricsCollector::new(),
            health,
            next: AtomicUsize::new(0),
        })
    }

    /// Picks limiters round-robin.
    fn next_limiter(&self) -> &NamedLimiter {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.limiters.len();
        &self.limiters[i]
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AllowResponse {
    pub resource: String,
    pub limiter: String,
    pub allowed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LimitRequest {
    pub limit: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LimitResponse {
    pub resource: String,
    pub limit: i64,
    pub size_ms: u64,
}

/// Admits one event through the next limiter
pub async fn allow(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, LimiterError> {
    let picked = state.next_limiter();
    let limiter = picked.limiter.clone();

    // A blocking synchronizer may wait on the datastore.
    let allowed = tokio::task::spawn_blocking(move || limiter.allow())
        .await
        .map_err(|e| LimiterError::Internal(format!("admission task failed: {}", e)))?;

    state.metrics.record(&picked.name, allowed).await;

    let status = if allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    Ok((
        status,
        Json(AllowResponse {
            resource: state.resource.clone(),
            limiter: picked.name.clone(),
            allowed,
        }),
    ))
}

/// Current limit shared by all limiters
pub async fn get_limit(State(state): State<SharedState>) -> impl IntoResponse {
    let limiter = &state.limiters[0].limiter;

    Json(LimitResponse {
        resource: state.resource.clone(),
        limit: limiter.limit(),
        size_ms: limiter.size().as_millis() as u64,
    })
}

/// Applies a new limit to every limiter
pub async fn set_limit(
    State(state): State<SharedState>,
    Json(payload): Json<LimitRequest>,
) -> Result<impl IntoResponse, LimiterError> {
    if payload.limit < 1 {
        return Err(LimiterError::ValidationError(
            "Limit must be at least 1".to_string(),
        ));
    }

    for named in &state.limiters {
        named.limiter.set_limit(payload.limit);
    }
    tracing::info!(resource = %state.resource, limit = payload.limit, "limit updated");

    Ok(get_limit(State(state)).await)
}

/// Admission counters per limiter
pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.metrics.report(&state.resource).await)
}

/// Health check endpoint
pub async fn health_check(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, LimiterError> {
    // Pinging Redis is a blocking call.
    let status = tokio::task::spawn_blocking(move || state.health.check_health())
        .await
        .map_err(|e| LimiterError::Internal(format!("health check failed: {}", e)))?;

    Ok(Json(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use crate::window::LocalWindow;
    use std::time::Duration;

    fn named(name: &str) -> NamedLimiter {
        let (limiter, _stop) = Limiter::new(Duration::from_secs(1), 5, LocalWindow::boxed).unwrap();
        NamedLimiter {
            name: name.to_string(),
            limiter: Arc::new(limiter),
        }
    }

    fn health() -> HealthChecker {
        HealthChecker::new(Arc::new(MemoryDatastore::new()))
    }

    #[test]
    fn test_app_state_requires_limiters() {
        assert!(AppState::new("test", Vec::new(), health()).is_err());
    }

    #[test]
    fn test_round_robin() {
        let state = AppState::new("test", vec![named("lim-0"), named("lim-1")], health()).unwrap();
        let picked: Vec<_> = (0..4).map(|_| state.next_limiter().name.clone()).collect();
        assert_eq!(picked, ["lim-0", "lim-1", "lim-0", "lim-1"]);
    }
}
