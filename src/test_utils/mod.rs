use std::sync::{Arc, Mutex};

pub mod cache;
pub mod collaborators;
pub mod database;
pub mod deleted;
pub mod harness;
pub mod user;

pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Shared, ordered record of side effects across the fakes, so tests can
/// assert cross-service ordering (e.g. the durable row outliving the secure
/// deletions).
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == event)
    }
}
