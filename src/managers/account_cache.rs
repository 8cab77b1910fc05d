use anyhow::Result;
use async_trait::async_trait;
use deadpool_redis::{Config, Runtime};
use tracing::warn;

use crate::{
    account::{Account, Aci, Pni},
    error::AccountsError,
    storage::redis,
};

/// Entries live two days; the durable store is authoritative and repopulates
/// on miss.
pub const ACCOUNT_CACHE_TTL_SECS: u64 = 2 * 24 * 60 * 60;

/// Narrow key-value contract the account cache needs: TTL'd multi-key set,
/// point get, multi-key delete.
#[async_trait]
pub trait CacheBackend: Clone + Send + Sync + 'static {
    async fn set_all(&self, entries: Vec<(String, String)>, ttl_secs: u64) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn del(&self, keys: Vec<String>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RedisCacheBackend {
    pool: deadpool_redis::Pool,
}

impl RedisCacheBackend {
    pub fn connect() -> Self {
        let _ = dotenv::dotenv();
        let redis_url = std::env::var("REDIS_URL").expect("Unable to read REDIS_URL .env var");
        let redis_config = Config::from_url(redis_url);
        let redis_pool: deadpool_redis::Pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .expect("Failed to create connection pool");
        Self { pool: redis_pool }
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn set_all(&self, entries: Vec<(String, String)>, ttl_secs: u64) -> Result<()> {
        let connection = self.pool.get().await?;
        redis::set_all_with_ttl(connection, entries, ttl_secs).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let connection = self.pool.get().await?;
        redis::get(connection, key).await
    }

    async fn del(&self, keys: Vec<String>) -> Result<()> {
        let connection = self.pool.get().await?;
        redis::del(connection, keys).await
    }
}

/// Write-through cache of the JSON-encoded account plus one mapping entry
/// per secondary key. Transport failures degrade to a miss and never fail
/// the enclosing operation; an encode failure is a programming bug and
/// surfaces.
#[derive(Debug, Clone)]
pub struct AccountCache<B>
where
    B: CacheBackend,
{
    backend: B,
    ttl_secs: u64,
}

impl<B> AccountCache<B>
where
    B: CacheBackend,
{
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            ttl_secs: ACCOUNT_CACHE_TTL_SECS,
        }
    }

    pub fn account_key(aci: &Aci) -> String {
        format!("Account3::{}", aci)
    }

    pub fn map_key(part: &str) -> String {
        format!("AccountMap::{}", part)
    }

    pub async fn write(&self, account: &Account) -> Result<(), AccountsError> {
        let body = serde_json::to_string(account)?;
        let aci = account.aci.to_string();

        let mut entries = vec![
            (Self::account_key(&account.aci), body),
            (Self::map_key(&account.number), aci.clone()),
            (Self::map_key(&account.pni.to_string()), aci.clone()),
        ];
        if let Some(username) = &account.username {
            entries.push((Self::map_key(username), aci));
        }

        if let Err(e) = self.backend.set_all(entries, self.ttl_secs).await {
            warn!("Failed to cache account {}: {e:#}", account.aci);
        }
        Ok(())
    }

    /// Deletes the entries computed from `account`. Must be called with the
    /// pre-image of any secondary key about to change; the new value cannot
    /// derive the old key.
    pub async fn invalidate(&self, account: &Account) {
        let mut keys = vec![
            Self::account_key(&account.aci),
            Self::map_key(&account.number),
            Self::map_key(&account.pni.to_string()),
        ];
        if let Some(username) = &account.username {
            keys.push(Self::map_key(username));
        }

        if let Err(e) = self.backend.del(keys).await {
            warn!("Failed to invalidate cache for account {}: {e:#}", account.aci);
        }
    }

    pub async fn get_by_aci(&self, aci: &Aci) -> Option<Account> {
        let body = match self.backend.get(&Self::account_key(aci)).await {
            Ok(body) => body?,
            Err(e) => {
                warn!("Cache read failed for account {aci}: {e:#}");
                return None;
            }
        };

        match serde_json::from_str(&body) {
            Ok(account) => Some(account),
            Err(e) => {
                warn!("Dropping undecodable cache entry for account {aci}: {e}");
                None
            }
        }
    }

    pub async fn get_by_number(&self, number: &str) -> Option<Account> {
        self.get_by_secondary(number).await
    }

    pub async fn get_by_pni(&self, pni: &Pni) -> Option<Account> {
        self.get_by_secondary(&pni.to_string()).await
    }

    pub async fn get_by_username(&self, username: &str) -> Option<Account> {
        self.get_by_secondary(username).await
    }

    async fn get_by_secondary(&self, part: &str) -> Option<Account> {
        let mapped = match self.backend.get(&Self::map_key(part)).await {
            Ok(mapped) => mapped?,
            Err(e) => {
                warn!("Cache read failed for key {part}: {e:#}");
                return None;
            }
        };

        let aci = match mapped.parse::<Aci>() {
            Ok(aci) => aci,
            Err(e) => {
                warn!("Dropping unparsable cache mapping for key {part}: {e}");
                return None;
            }
        };

        self.get_by_aci(&aci).await
    }
}
