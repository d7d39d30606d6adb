use std::sync::Arc;
use std::time::{Instant, SystemTime};
use serde::{Deserialize, Serialize};

use crate::datastore::Datastore;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub datastore: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker {
    store: Arc<dyn Datastore>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store }
    }

    /// Limiters keep admitting locally while the datastore is down, so an
    /// unreachable datastore only degrades the service.
    pub fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME)
            .unwrap_or_default()
            .as_secs();

        let datastore_status = self.check_datastore();

        let overall_status = if datastore_status.status == "healthy" {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now.duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            dependencies: DependencyStatus {
                datastore: datastore_status,
            },
        }
    }

    fn check_datastore(&self) -> ServiceStatus {
        let start = Instant::now();
        let result = self.store.ping();
        let response_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => ServiceStatus {
                status: "healthy".to_string(),
                response_time_ms,
                error: None,
            },
            Err(e) => ServiceStatus {
                status: "unavailable".to_string(),
                response_time_ms,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use crate::error::{LimiterError, LimiterResult};

    struct DownDatastore;

    impl Datastore for DownDatastore {
        fn add(&self, _key: &str, _start: i64, _delta: i64) -> LimiterResult<i64> {
            Err(LimiterError::Datastore("down".to_string()))
        }

        fn get(&self, _key: &str, _start: i64) -> LimiterResult<i64> {
            Err(LimiterError::Datastore("down".to_string()))
        }

        fn ping(&self) -> LimiterResult<()> {
            Err(LimiterError::Datastore("down".to_string()))
        }
    }

    #[test]
    fn test_healthy_with_memory_datastore() {
        let checker = HealthChecker::new(Arc::new(MemoryDatastore::new()));
        let status = checker.check_health();
        assert_eq!(status.status, "healthy");
        assert!(status.dependencies.datastore.error.is_none());
        assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_degraded_when_datastore_unreachable() {
        let checker = HealthChecker::new(Arc::new(DownDatastore));
        let status = checker.check_health();
        assert_eq!(status.status, "degraded");
        assert_eq!(status.dependencies.datastore.status, "unavailable");
        assert_eq!(
            status.dependencies.datastore.error.as_deref(),
            Some("Datastore error: down")
        );
    }

    #[test]
    fn test_health_status_serialization() {
        let checker = HealthChecker::new(Arc::new(MemoryDatastore::new()));
        let json = serde_json::to_string(&checker.check_health()).unwrap();
        assert!(json.contains("\"datastore\""));
        assert!(json.contains("healthy"));
    }
}
