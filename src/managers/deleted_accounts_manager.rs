use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use deadpool_redis::{Config, Runtime};
use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::{account::Aci, error::AccountsError, storage::redis};

/// Long enough to cover a typical re-registration after an account is
/// deleted; afterwards the ACI is no longer offered back.
pub const TOMBSTONE_TTL_SECS: u64 = 4 * 60 * 60;

const LEASE_TTL_SECS: u64 = 60;
const LEASE_WAIT: Duration = Duration::from_secs(10);
const LEASE_POLL: Duration = Duration::from_millis(50);

/// Tombstone + lease storage for recently deleted accounts, keyed by phone
/// number.
#[async_trait]
pub trait DeletedAccountsStore: Send + Sync + 'static {
    async fn try_lock(&self, number: &str) -> Result<bool>;
    async fn unlock(&self, number: &str) -> Result<()>;
    async fn put(&self, number: &str, aci: Aci) -> Result<()>;
    async fn get(&self, number: &str) -> Result<Option<Aci>>;
    async fn remove(&self, number: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RedisDeletedAccountsStore {
    pool: deadpool_redis::Pool,
}

impl RedisDeletedAccountsStore {
    pub fn connect() -> Self {
        let _ = dotenv::dotenv();
        let redis_url = std::env::var("REDIS_URL").expect("Unable to read REDIS_URL .env var");
        let redis_config = Config::from_url(redis_url);
        let redis_pool: deadpool_redis::Pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .expect("Failed to create connection pool");
        Self { pool: redis_pool }
    }

    fn tombstone_key(number: &str) -> String {
        format!("deleted_account::{}", number)
    }

    fn lock_key(number: &str) -> String {
        format!("deleted_account_lock::{}", number)
    }
}

#[async_trait]
impl DeletedAccountsStore for RedisDeletedAccountsStore {
    async fn try_lock(&self, number: &str) -> Result<bool> {
        let connection = self.pool.get().await?;
        redis::try_acquire_lock(connection, &Self::lock_key(number), LEASE_TTL_SECS).await
    }

    async fn unlock(&self, number: &str) -> Result<()> {
        let connection = self.pool.get().await?;
        redis::release_lock(connection, &Self::lock_key(number)).await
    }

    async fn put(&self, number: &str, aci: Aci) -> Result<()> {
        let connection = self.pool.get().await?;
        redis::set_all_with_ttl(
            connection,
            vec![(Self::tombstone_key(number), aci.to_string())],
            TOMBSTONE_TTL_SECS,
        )
        .await
    }

    async fn get(&self, number: &str) -> Result<Option<Aci>> {
        let connection = self.pool.get().await?;
        let value = redis::get(connection, &Self::tombstone_key(number)).await?;
        Ok(value.and_then(|aci| match aci.parse() {
            Ok(aci) => Some(aci),
            Err(e) => {
                warn!("Dropping unparsable tombstone for {number}: {e}");
                None
            }
        }))
    }

    async fn remove(&self, number: &str) -> Result<()> {
        let connection = self.pool.get().await?;
        redis::del(connection, vec![Self::tombstone_key(number)]).await
    }
}

/// Per-phone-number exclusive sections around create, delete and number
/// changes. Remembers the ACI of a recently deleted account and offers it
/// back on re-registration so identity survives a delete/register cycle.
#[derive(Clone)]
pub struct DeletedAccountsManager {
    store: Arc<dyn DeletedAccountsStore>,
    lease_timeout: Duration,
}

impl DeletedAccountsManager {
    pub fn new(store: Arc<dyn DeletedAccountsStore>) -> Self {
        Self {
            store,
            lease_timeout: LEASE_WAIT,
        }
    }

    pub fn with_lease_timeout(store: Arc<dyn DeletedAccountsStore>, lease_timeout: Duration) -> Self {
        Self {
            store,
            lease_timeout,
        }
    }

    /// Exclusive section for `create`: consumes any tombstone for `number`
    /// and hands the recently deleted ACI (if any) to `f`.
    pub async fn lock_and_take<F, Fut, R>(&self, number: &str, f: F) -> Result<R, AccountsError>
    where
        F: FnOnce(Option<Aci>) -> Fut,
        Fut: Future<Output = Result<R, AccountsError>>,
    {
        self.acquire_all(&[number]).await?;
        let out = async {
            let recently_deleted = self.store.get(number).await?;
            if recently_deleted.is_some() {
                self.store.remove(number).await?;
            }
            f(recently_deleted).await
        }
        .await;
        self.release_all(&[number]).await;
        out
    }

    /// Exclusive section for `delete`: stores the ACI returned by `f` as the
    /// tombstone for `number`.
    pub async fn lock_and_put<F, Fut>(&self, number: &str, f: F) -> Result<Aci, AccountsError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Aci, AccountsError>>,
    {
        self.acquire_all(&[number]).await?;
        let out = async {
            let aci = f().await?;
            self.store.put(number, aci).await?;
            Ok(aci)
        }
        .await;
        self.release_all(&[number]).await;
        out
    }

    /// Cross-number exclusive section for `change_number`. Leases are taken
    /// in sorted order so two concurrent changes between the same pair of
    /// numbers cannot deadlock. `f` receives the tombstone for `new_number`
    /// and returns the displaced ACI (if any), which is tombstoned under
    /// `new_number` — the number that account actually held.
    pub async fn lock_and_update<F, Fut, R>(
        &self,
        old_number: &str,
        new_number: &str,
        f: F,
    ) -> Result<R, AccountsError>
    where
        F: FnOnce(Option<Aci>) -> Fut,
        Fut: Future<Output = Result<(R, Option<Aci>), AccountsError>>,
    {
        let mut keys = vec![old_number, new_number];
        keys.sort_unstable();
        keys.dedup();

        self.acquire_all(&keys).await?;
        let out = async {
            let deleted_new = self.store.get(new_number).await?;
            let (value, displaced) = f(deleted_new).await?;
            if let Some(aci) = displaced {
                self.store.put(new_number, aci).await?;
            }
            Ok(value)
        }
        .await;
        self.release_all(&keys).await;
        out
    }

    async fn acquire_all(&self, numbers: &[&str]) -> Result<(), AccountsError> {
        let deadline = Instant::now() + self.lease_timeout;
        let mut held: Vec<&str> = Vec::new();

        for number in numbers {
            loop {
                match self.store.try_lock(number).await {
                    Ok(true) => {
                        held.push(number);
                        break;
                    }
                    Ok(false) => {
                        if Instant::now() >= deadline {
                            self.release_all(&held).await;
                            return Err(AccountsError::Interrupted);
                        }
                        sleep(LEASE_POLL).await;
                    }
                    Err(e) => {
                        self.release_all(&held).await;
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    async fn release_all(&self, numbers: &[&str]) {
        for number in numbers {
            if let Err(e) = self.store.unlock(number).await {
                warn!("Failed to release lease on {number}: {e:#}");
            }
        }
    }
}

#[cfg(test)]
pub mod deleted_accounts_manager_tests {
    use super::*;
    use crate::test_utils::deleted::InMemoryDeletedAccountsStore;

    fn connect() -> (DeletedAccountsManager, Arc<InMemoryDeletedAccountsStore>) {
        let store = Arc::new(InMemoryDeletedAccountsStore::default());
        (DeletedAccountsManager::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_lock_and_take_consumes_tombstone() {
        let (manager, store) = connect();
        let aci = Aci::new_random();
        store.put("+15550100", aci).await.unwrap();

        let first = manager
            .lock_and_take("+15550100", |deleted| async move { Ok(deleted) })
            .await
            .unwrap();
        let second = manager
            .lock_and_take("+15550100", |deleted| async move { Ok(deleted) })
            .await
            .unwrap();

        assert_eq!(first, Some(aci));
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn test_lock_and_put_stores_tombstone() {
        let (manager, store) = connect();
        let aci = Aci::new_random();

        manager
            .lock_and_put("+15550100", || async move { Ok(aci) })
            .await
            .unwrap();

        assert_eq!(store.get("+15550100").await.unwrap(), Some(aci));
    }

    #[tokio::test]
    async fn test_section_is_exclusive() {
        let (manager, store) = connect();

        manager
            .lock_and_take("+15550100", |_| {
                let store = store.clone();
                async move {
                    assert!(!store.try_lock("+15550100").await.unwrap());
                    Ok(())
                }
            })
            .await
            .unwrap();

        // released after the section
        assert!(store.try_lock("+15550100").await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_is_released_when_the_section_fails() {
        let (manager, store) = connect();

        let out: Result<(), AccountsError> = manager
            .lock_and_take("+15550100", |_| async move {
                Err(AccountsError::Interrupted)
            })
            .await;

        assert!(matches!(out, Err(AccountsError::Interrupted)));
        assert!(store.try_lock("+15550100").await.unwrap());
    }

    #[tokio::test]
    async fn test_contended_lease_times_out_as_interrupted() {
        let store = Arc::new(InMemoryDeletedAccountsStore::default());
        let manager = DeletedAccountsManager::with_lease_timeout(
            store.clone(),
            Duration::from_millis(120),
        );

        assert!(store.try_lock("+15550100").await.unwrap());

        let out = manager
            .lock_and_take("+15550100", |_| async move { Ok(()) })
            .await;

        assert!(matches!(out, Err(AccountsError::Interrupted)));
    }

    #[tokio::test]
    async fn test_lock_and_update_reads_new_and_tombstones_old() {
        let (manager, store) = connect();
        let deleted_new = Aci::new_random();
        let displaced = Aci::new_random();
        store.put("+15550200", deleted_new).await.unwrap();

        let observed = manager
            .lock_and_update("+15550100", "+15550200", |deleted| async move {
                Ok((deleted, Some(displaced)))
            })
            .await
            .unwrap();

        assert_eq!(observed, Some(deleted_new));
        assert_eq!(store.get("+15550200").await.unwrap(), Some(displaced));
        assert_eq!(store.get("+15550100").await.unwrap(), None);
    }
}
