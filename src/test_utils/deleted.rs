use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::{account::Aci, managers::deleted_accounts_manager::DeletedAccountsStore};

/// Tombstone + lease store over plain maps; tombstones never expire.
#[derive(Debug, Default)]
pub struct InMemoryDeletedAccountsStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    tombstones: HashMap<String, Aci>,
    locks: HashSet<String>,
}

#[async_trait]
impl DeletedAccountsStore for InMemoryDeletedAccountsStore {
    async fn try_lock(&self, number: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().locks.insert(number.to_owned()))
    }

    async fn unlock(&self, number: &str) -> Result<()> {
        self.inner.lock().unwrap().locks.remove(number);
        Ok(())
    }

    async fn put(&self, number: &str, aci: Aci) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .tombstones
            .insert(number.to_owned(), aci);
        Ok(())
    }

    async fn get(&self, number: &str) -> Result<Option<Aci>> {
        Ok(self.inner.lock().unwrap().tombstones.get(number).copied())
    }

    async fn remove(&self, number: &str) -> Result<()> {
        self.inner.lock().unwrap().tombstones.remove(number);
        Ok(())
    }
}
