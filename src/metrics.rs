use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::LazyLock;
use thiserror::Error;

pub static METRICS_ACCOUNTS: LazyLock<AccountsMetrics> = LazyLock::new(AccountsMetrics::default);

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(String),
}

#[derive(Debug, Clone)]
pub struct AccountsMetrics {
    pub creates: IntCounterVec,
    pub deletions: IntCounterVec,
}

impl Default for AccountsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountsMetrics {
    pub fn new() -> Self {
        AccountsMetrics {
            creates: IntCounterVec::new(
                Opts::new(
                    "account_creates",
                    "Counts account registrations by kind: new, re-registration or recently-deleted",
                ),
                &["type"],
            )
            .unwrap(),
            deletions: IntCounterVec::new(
                Opts::new(
                    "account_deletions",
                    "Counts account deletions by country code and reason",
                ),
                &["country_code", "reason"],
            )
            .unwrap(),
        }
    }

    pub fn inc_create(&self, kind: &str) {
        let counter = match self.creates.get_metric_with_label_values(&[kind]) {
            Ok(counter) => counter,
            Err(e) => {
                tracing::error!("Failed to build create metric: {e}");
                return;
            }
        };

        counter.inc();
    }

    pub fn inc_delete(&self, country_code: &str, reason: &str) {
        let counter = match self
            .deletions
            .get_metric_with_label_values(&[country_code, reason])
        {
            Ok(counter) => counter,
            Err(e) => {
                tracing::error!("Failed to build delete metric: {e}");
                return;
            }
        };

        counter.inc();
    }

    pub fn gather_metrics(&self) -> Result<String, MetricsError> {
        let r = Registry::new();

        r.register(Box::new(self.creates.clone()))
            .map_err(|e| MetricsError::Prometheus(e.to_string()))?;
        r.register(Box::new(self.deletions.clone()))
            .map_err(|e| MetricsError::Prometheus(e.to_string()))?;

        let encoder = TextEncoder::new();
        let metric_families = r.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::Prometheus(e.to_string()))?;

        String::from_utf8(buffer).map_err(|e| MetricsError::Prometheus(e.to_string()))
    }
}
