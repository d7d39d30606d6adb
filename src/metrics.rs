use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Admission counters for one limiter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub rejected_requests: u64,
}

impl AdmissionMetrics {
    fn record(&mut self, allowed: bool) {
        self.total_requests += 1;
        if allowed {
            self.allowed_requests += 1;
        } else {
            self.rejected_requests += 1;
        }
    }

    fn merge(&mut self, other: &AdmissionMetrics) {
        self.total_requests += other.total_requests;
        self.allowed_requests += other.allowed_requests;
        self.rejected_requests += other.rejected_requests;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub resource: String,
    pub limiters: BTreeMap<String, AdmissionMetrics>,
    pub total: AdmissionMetrics,
}

/// Collects admission decisions per limiter.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    limiter_metrics: Arc<RwLock<BTreeMap<String, AdmissionMetrics>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, limiter: &str, allowed: bool) {
        let mut metrics = self.limiter_metrics.write().await;
        metrics.entry(limiter.to_string()).or_default().record(allowed);
    }

    pub async fn get_limiter_metrics(&self, limiter: &str) -> Option<AdmissionMetrics> {
        let metrics = self.limiter_metrics.read().await;
        metrics.get(limiter).cloned()
    }

    pub async fn report(&self, resource: &str) -> MetricsReport {
        let metrics = self.limiter_metrics.read().await;
        let mut total = AdmissionMetrics::default();
        for limiter_metrics in metrics.values() {
            total.merge(limiter_metrics);
        }

        MetricsReport {
            resource: resource.to_string(),
            limiters: metrics.clone(),
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_report() {
        let collector = MetricsCollector::new();
        collector.record("lim-0", true).await;
        collector.record("lim-0", false).await;
        collector.record("lim-1", true).await;

        let lim0 = collector.get_limiter_metrics("lim-0").await.unwrap();
        assert_eq!(lim0.total_requests, 2);
        assert_eq!(lim0.allowed_requests, 1);
        assert_eq!(lim0.rejected_requests, 1);
        assert!(collector.get_limiter_metrics("lim-2").await.is_none());

        let report = collector.report("test").await;
        assert_eq!(report.resource, "test");
        assert_eq!(report.limiters.len(), 2);
        assert_eq!(
            report.total,
            AdmissionMetrics {
                total_requests: 3,
                allowed_requests: 2,
                rejected_requests: 1,
            }
        );
    }
}
