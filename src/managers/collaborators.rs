use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    account::{Account, Aci, Pni, ServiceId},
    validators::UsernameValidator,
};

/// Downstream worker that propagates discoverability state to the
/// contact-discovery service. `delete_account` must be idempotent.
#[async_trait]
pub trait DirectoryQueue: Send + Sync {
    async fn delete_account(&self, account: &Account) -> Result<()>;
    async fn refresh_account(&self, account: &Account) -> Result<()>;
    async fn change_phone_number(
        &self,
        account: &Account,
        old_number: &str,
        new_number: &str,
    ) -> Result<()>;
}

#[async_trait]
pub trait SecureStorageClient: Send + Sync {
    async fn delete_stored_data(&self, aci: &Aci) -> Result<()>;
}

#[async_trait]
pub trait SecureBackupClient: Send + Sync {
    async fn delete_backups(&self, aci: &Aci) -> Result<()>;
}

#[async_trait]
pub trait MessagesManager: Send + Sync {
    async fn clear(&self, service_id: &ServiceId) -> Result<()>;
}

#[async_trait]
pub trait KeyManager: Send + Sync {
    async fn delete_keys(&self, service_id: &ServiceId) -> Result<()>;
}

#[async_trait]
pub trait ProfilesManager: Send + Sync {
    async fn delete_all(&self, aci: &Aci) -> Result<()>;
}

/// Pending verification codes for numbers mid-registration.
#[async_trait]
pub trait PendingAccountsManager: Send + Sync {
    async fn remove(&self, number: &str) -> Result<()>;
}

/// Username reservations are account-scoped: a name reserved to the asking
/// account is not "reserved" from its point of view.
#[async_trait]
pub trait ReservedUsernames: Send + Sync {
    async fn is_reserved(&self, canonical: &str, aci: &Aci) -> Result<bool>;
}

#[async_trait]
pub trait ClientPresenceManager: Send + Sync {
    async fn disconnect_presence(&self, aci: &Aci, device_id: u32) -> Result<()>;
}

/// Allocates and resolves phone-number identifiers. Total: the first request
/// for a number allocates its PNI.
#[async_trait]
pub trait PhoneNumberIdentifiers: Send + Sync {
    async fn pni_for(&self, number: &str) -> Result<Pni>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The collaborator handles the coordinator fans out to. Everything here is
/// owned by other subsystems; the coordinator only calls the narrow
/// contracts above.
#[derive(Clone)]
pub struct ExternalServices {
    pub phone_number_identifiers: Arc<dyn PhoneNumberIdentifiers>,
    pub directory_queue: Arc<dyn DirectoryQueue>,
    pub secure_storage: Arc<dyn SecureStorageClient>,
    pub secure_backup: Arc<dyn SecureBackupClient>,
    pub messages_manager: Arc<dyn MessagesManager>,
    pub key_manager: Arc<dyn KeyManager>,
    pub profiles_manager: Arc<dyn ProfilesManager>,
    pub pending_accounts: Arc<dyn PendingAccountsManager>,
    pub reserved_usernames: Arc<dyn ReservedUsernames>,
    pub username_validator: Arc<dyn UsernameValidator>,
    pub presence_manager: Arc<dyn ClientPresenceManager>,
    pub clock: Arc<dyn Clock>,
}
