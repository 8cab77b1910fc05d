use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use anyhow::Result;
use async_trait::async_trait;

use crate::managers::account_cache::CacheBackend;

/// Cache backend over a plain map; TTLs are accepted and ignored.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCacheBackend {
    entries: Arc<Mutex<HashMap<String, String>>>,
    set_calls: Arc<AtomicUsize>,
}

impl InMemoryCacheBackend {
    pub fn entries(&self) -> HashMap<String, String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::Relaxed)
    }

    pub fn put(&self, key: String, value: String) {
        self.entries.lock().unwrap().insert(key, value);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn set_all(&self, entries: Vec<(String, String)>, _ttl_secs: u64) -> Result<()> {
        self.set_calls.fetch_add(1, Ordering::Relaxed);
        let mut map = self.entries.lock().unwrap();
        for (key, value) in entries {
            map.insert(key, value);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn del(&self, keys: Vec<String>) -> Result<()> {
        let mut map = self.entries.lock().unwrap();
        for key in keys {
            map.remove(&key);
        }
        Ok(())
    }
}
