use std::backtrace::Backtrace;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::{
    account::{Account, AccountAttributes, AccountBadge, Aci, Device, Pni, ServiceId},
    error::AccountsError,
    managers::{
        account_cache::{AccountCache, CacheBackend},
        collaborators::ExternalServices,
        deleted_accounts_manager::DeletedAccountsManager,
    },
    metrics::METRICS_ACCOUNTS,
    storage::database::AccountsDatabase,
    validators::country_code,
};

const MAX_UPDATE_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionReason {
    AdminDeleted,
    Expired,
    UserRequest,
}

impl DeletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionReason::AdminDeleted => "admin",
            DeletionReason::Expired => "expired",
            DeletionReason::UserRequest => "user-request",
        }
    }
}

/// Which durable write the optimistic update engine performs on each
/// attempt. The store mutates the account in place on success, so the
/// detached clone the engine returns already reflects the write.
pub(crate) enum PersistOp<'a> {
    Update,
    ChangeNumber { number: &'a str, pni: Pni },
    SetUsername(&'a str),
    ClearUsername,
}

async fn persist<T>(
    db: &T,
    account: &mut Account,
    op: &PersistOp<'_>,
) -> Result<(), AccountsError>
where
    T: AccountsDatabase,
{
    match op {
        PersistOp::Update => db.update_account(account).await,
        PersistOp::ChangeNumber { number, pni } => db.change_number(account, number, *pni).await,
        PersistOp::SetUsername(username) => db.set_username(account, username).await,
        PersistOp::ClearUsername => db.clear_username(account).await,
    }
}

/// Runs `mutator` and the selected durable write under bounded
/// retry-on-contention. On success the caller's object is marked stale and a
/// detached clone is returned; on contention the caller's object is reloaded
/// from the store and the mutator re-applied. If the mutator reports nothing
/// left to change, the current copy is returned without a write.
pub(crate) async fn update_with_retries<T, F>(
    db: &T,
    account: &mut Account,
    mut mutator: F,
    op: PersistOp<'_>,
) -> Result<Account, AccountsError>
where
    T: AccountsDatabase,
    F: FnMut(&mut Account) -> bool,
{
    if !mutator(account) {
        return Ok(account.clone());
    }

    let aci = account.aci;
    let mut attempts = 0;
    loop {
        match persist(db, account, &op).await {
            Ok(()) => {
                let updated = account.clone();
                account.mark_stale();
                return Ok(updated);
            }
            Err(AccountsError::Contested) => {
                attempts += 1;
                if attempts >= MAX_UPDATE_ATTEMPTS {
                    return Err(AccountsError::RetryLimitExceeded);
                }

                *account = db
                    .get_by_account_identifier(&aci)
                    .await?
                    .ok_or_else(|| anyhow!("account {aci} disappeared during update"))?;
                if !mutator(account) {
                    return Ok(account.clone());
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// The lifecycle coordinator: single authority for creating, mutating,
/// renumbering, looking up and deleting accounts. Mutations go through the
/// durable store first, then the cache; cross-identifier transitions are
/// serialized by the deleted-accounts gate.
pub struct AccountManager<T, B>
where
    T: AccountsDatabase,
    B: CacheBackend,
{
    db: T,
    cache: AccountCache<B>,
    deleted_accounts: DeletedAccountsManager,
    services: ExternalServices,
}

impl<T, B> Clone for AccountManager<T, B>
where
    T: AccountsDatabase,
    B: CacheBackend,
{
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            cache: self.cache.clone(),
            deleted_accounts: self.deleted_accounts.clone(),
            services: self.services.clone(),
        }
    }
}

impl<T, B> AccountManager<T, B>
where
    T: AccountsDatabase,
    B: CacheBackend,
{
    pub fn new(
        db: T,
        cache: AccountCache<B>,
        deleted_accounts: DeletedAccountsManager,
        services: ExternalServices,
    ) -> Self {
        Self {
            db,
            cache,
            deleted_accounts,
            services,
        }
    }

    /// Registers an account for `number`. A recently deleted account for the
    /// same number gets its old ACI back; registering over a live account
    /// adopts that account's ACI and clears the displaced residue.
    pub async fn create(
        &self,
        number: &str,
        password: &str,
        user_agent: &str,
        attributes: AccountAttributes,
        badges: Vec<AccountBadge>,
    ) -> Result<Account, AccountsError> {
        self.deleted_accounts
            .lock_and_take(number, |recently_deleted| async move {
                let pni = self.services.phone_number_identifiers.pni_for(number).await?;
                let now = self.services.clock.now();
                let primary_device = Device::primary(password, user_agent, &attributes, now);

                let aci = recently_deleted.unwrap_or_else(Aci::new_random);
                let mut account =
                    Account::new(aci, pni, number, primary_device, &attributes, badges, now);

                let original_aci = account.aci;
                let freshly_inserted = self.db.create_account(&mut account).await?;
                let actual_aci = account.aci;

                self.cache.write(&account).await?;
                self.services.pending_accounts.remove(number).await?;

                let kind = if freshly_inserted {
                    if recently_deleted.is_some() {
                        "recently-deleted"
                    } else {
                        "new"
                    }
                } else if original_aci != actual_aci {
                    // Displaced a live registration: its residue is still
                    // around and belongs to nobody now.
                    self.clear_residue(&actual_aci).await;
                    "re-registration"
                } else {
                    "recently-deleted"
                };
                METRICS_ACCOUNTS.inc_create(kind);

                if !account.discoverable_by_phone_number {
                    self.services.directory_queue.delete_account(&account).await?;
                }

                Ok(account)
            })
            .await
    }

    /// Moves `account` to `new_number`, deleting any live account already
    /// holding it. The caller's object is marked stale; the returned copy is
    /// the one to keep using.
    pub async fn change_number(
        &self,
        account: &mut Account,
        new_number: &str,
    ) -> Result<Account, AccountsError> {
        if account.number == new_number {
            return Ok(account.clone());
        }

        let old_number = account.number.clone();
        let old_for_queue = old_number.clone();

        self.deleted_accounts
            .lock_and_update(&old_number, new_number, |deleted_new_aci| async move {
                self.cache.invalidate(account).await;

                let displaced = match self.db.get_by_e164(new_number).await? {
                    Some(existing) => {
                        self.delete_account_inner(&existing).await?;
                        self.services.directory_queue.delete_account(&existing).await?;
                        Some(existing.aci)
                    }
                    None => deleted_new_aci,
                };

                let pni = self
                    .services
                    .phone_number_identifiers
                    .pni_for(new_number)
                    .await?;
                let updated = update_with_retries(
                    &self.db,
                    account,
                    |_| true,
                    PersistOp::ChangeNumber {
                        number: new_number,
                        pni,
                    },
                )
                .await?;

                self.services
                    .directory_queue
                    .change_phone_number(&updated, &old_for_queue, new_number)
                    .await?;
                self.cache.write(&updated).await?;

                Ok((updated, displaced))
            })
            .await
    }

    /// Assigns the canonical form of `requested` to the account.
    /// `UsernameNotAvailable` if it is reserved for or held by someone else.
    pub async fn set_username(
        &self,
        account: &mut Account,
        requested: &str,
    ) -> Result<Account, AccountsError> {
        let canonical = self.services.username_validator.canonical(requested);
        if account.username.as_deref() == Some(canonical.as_str()) {
            return Ok(account.clone());
        }

        if self
            .services
            .reserved_usernames
            .is_reserved(&canonical, &account.aci)
            .await?
        {
            return Err(AccountsError::UsernameNotAvailable);
        }

        self.cache.invalidate(account).await;
        update_with_retries(&self.db, account, |_| true, PersistOp::SetUsername(&canonical)).await
    }

    pub async fn clear_username(&self, account: &mut Account) -> Result<Account, AccountsError> {
        self.cache.invalidate(account).await;
        update_with_retries(
            &self.db,
            account,
            |a| a.username.is_some(),
            PersistOp::ClearUsername,
        )
        .await
    }

    /// General-purpose mutation. `updater` must not touch `number`, `pni` or
    /// `username`; those have dedicated operations and a violation here is
    /// logged, not honored as an error.
    pub async fn update<F>(
        &self,
        account: &mut Account,
        updater: F,
    ) -> Result<Account, AccountsError>
    where
        F: FnMut(&mut Account) -> bool,
    {
        let was_visible = account.should_be_visible_in_directory();
        let identifiers = (
            account.number.clone(),
            account.pni,
            account.username.clone(),
        );

        self.cache.invalidate(account).await;
        let updated = update_with_retries(&self.db, account, updater, PersistOp::Update).await?;

        if (updated.number.clone(), updated.pni, updated.username.clone()) != identifiers {
            error!(
                account = %updated.aci,
                backtrace = %Backtrace::force_capture(),
                "update() changed number, pni or username; those fields have dedicated operations"
            );
        }

        self.cache.write(&updated).await?;

        if updated.should_be_visible_in_directory() != was_visible {
            self.services.directory_queue.refresh_account(&updated).await?;
        }

        Ok(updated)
    }

    pub async fn update_device<F>(
        &self,
        account: &mut Account,
        device_id: u32,
        mut device_updater: F,
    ) -> Result<Account, AccountsError>
    where
        F: FnMut(&mut Device),
    {
        self.update(account, move |a| {
            if let Some(device) = a.device_mut(device_id) {
                device_updater(device);
            }
            true
        })
        .await
    }

    /// Skips the write when the stored timestamp is already as fresh, which
    /// keeps a busy device from contending with itself.
    pub async fn update_device_last_seen(
        &self,
        account: &mut Account,
        device_id: u32,
        last_seen: DateTime<Utc>,
    ) -> Result<Account, AccountsError> {
        self.update(account, move |a| match a.device_mut(device_id) {
            Some(device) if device.last_seen < last_seen => {
                device.last_seen = last_seen;
                true
            }
            _ => false,
        })
        .await
    }

    pub async fn get_by_account_identifier(
        &self,
        aci: &Aci,
    ) -> Result<Option<Account>, AccountsError> {
        if let Some(account) = self.cache.get_by_aci(aci).await {
            return Ok(Some(account));
        }
        let found = self.db.get_by_account_identifier(aci).await?;
        if let Some(account) = &found {
            self.cache.write(account).await?;
        }
        Ok(found)
    }

    pub async fn get_by_e164(&self, number: &str) -> Result<Option<Account>, AccountsError> {
        if let Some(account) = self.cache.get_by_number(number).await {
            return Ok(Some(account));
        }
        let found = self.db.get_by_e164(number).await?;
        if let Some(account) = &found {
            self.cache.write(account).await?;
        }
        Ok(found)
    }

    pub async fn get_by_phone_number_identifier(
        &self,
        pni: &Pni,
    ) -> Result<Option<Account>, AccountsError> {
        if let Some(account) = self.cache.get_by_pni(pni).await {
            return Ok(Some(account));
        }
        let found = self.db.get_by_phone_number_identifier(pni).await?;
        if let Some(account) = &found {
            self.cache.write(account).await?;
        }
        Ok(found)
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<Account>, AccountsError> {
        if let Some(account) = self.cache.get_by_username(username).await {
            return Ok(Some(account));
        }
        let found = self.db.get_by_username(username).await?;
        if let Some(account) = &found {
            self.cache.write(account).await?;
        }
        Ok(found)
    }

    pub async fn get_all_from_start(&self, count: u32) -> Result<Vec<Account>, AccountsError> {
        self.db.get_all_from_start(count).await
    }

    pub async fn get_all_from(
        &self,
        cursor: &Aci,
        count: u32,
    ) -> Result<Vec<Account>, AccountsError> {
        self.db.get_all_from(cursor, count).await
    }

    /// Deletes the account and tombstones its ACI under its number so a
    /// re-registration within the tombstone window gets the same identity.
    pub async fn delete_account(
        &self,
        account: &Account,
        reason: DeletionReason,
    ) -> Result<(), AccountsError> {
        let number = account.number.clone();
        self.deleted_accounts
            .lock_and_put(&number, || async move {
                self.delete_account_inner(account).await?;
                self.services.directory_queue.delete_account(account).await?;
                Ok(account.aci)
            })
            .await?;

        METRICS_ACCOUNTS.inc_delete(country_code(&account.number), reason.as_str());
        Ok(())
    }

    /// Fan-out deletion. The secure-storage and secure-backup deletions must
    /// both have finished before the durable row goes away, so a crashed
    /// delete stays retryable; everything downstream of the row is
    /// best-effort.
    async fn delete_account_inner(&self, account: &Account) -> Result<(), AccountsError> {
        let aci = account.aci;

        let secure_storage = self.services.secure_storage.clone();
        let storage_deletion =
            tokio::spawn(async move { secure_storage.delete_stored_data(&aci).await });
        let secure_backup = self.services.secure_backup.clone();
        let backup_deletion =
            tokio::spawn(async move { secure_backup.delete_backups(&aci).await });

        if let Err(e) = self.services.profiles_manager.delete_all(&aci).await {
            warn!("Failed to delete profiles for {aci}: {e:#}");
        }
        for service_id in [ServiceId::Aci(aci), ServiceId::Pni(account.pni)] {
            if let Err(e) = self.services.key_manager.delete_keys(&service_id).await {
                warn!("Failed to delete keys for {service_id}: {e:#}");
            }
            if let Err(e) = self.services.messages_manager.clear(&service_id).await {
                warn!("Failed to clear messages for {service_id}: {e:#}");
            }
        }

        storage_deletion
            .await
            .map_err(|e| anyhow!("secure storage deletion task failed: {e}"))??;
        backup_deletion
            .await
            .map_err(|e| anyhow!("secure backup deletion task failed: {e}"))??;

        self.db.delete_account(&aci).await?;
        self.cache.invalidate(account).await;

        for device in &account.devices {
            if let Err(e) = self
                .services
                .presence_manager
                .disconnect_presence(&aci, device.device_id)
                .await
            {
                debug!(
                    "Failed to disconnect presence for {aci}.{}: {e:#}",
                    device.device_id
                );
            }
        }

        Ok(())
    }

    async fn clear_residue(&self, aci: &Aci) {
        if let Err(e) = self.services.profiles_manager.delete_all(aci).await {
            warn!("Failed to delete displaced profiles for {aci}: {e:#}");
        }
        if let Err(e) = self
            .services
            .key_manager
            .delete_keys(&ServiceId::Aci(*aci))
            .await
        {
            warn!("Failed to delete displaced keys for {aci}: {e:#}");
        }
        if let Err(e) = self
            .services
            .messages_manager
            .clear(&ServiceId::Aci(*aci))
            .await
        {
            warn!("Failed to clear displaced messages for {aci}: {e:#}");
        }
    }
}

#[cfg(test)]
pub mod account_manager_tests {
    use super::*;
    use crate::{
        account::PRIMARY_DEVICE_ID,
        managers::deleted_accounts_manager::DeletedAccountsStore,
        test_utils::{
            harness::{test_harness, test_harness_with_secure_delays, TestHarness},
            user::test_attributes,
        },
    };
    use serial_test::serial;
    use std::time::Duration;

    async fn register(harness: &TestHarness, number: &str, password: &str) -> Account {
        harness
            .manager
            .create(number, password, "test-agent", test_attributes(), Vec::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    #[serial]
    async fn test_create_new_account() {
        let harness = test_harness();
        let created_before = METRICS_ACCOUNTS.creates.with_label_values(&["new"]).get();

        let account = register(&harness, "+15550100", "pw").await;

        assert_eq!(account.number, "+15550100");
        assert_eq!(account.primary_device().unwrap().registration_id, 42);

        // the PNI came from the directory
        let pni = harness.services.phone_number_identifiers.pni_for("+15550100").await.unwrap();
        assert_eq!(account.pni, pni);

        // a single cache write covering every key
        assert_eq!(harness.cache.set_calls(), 1);
        let entries = harness.cache.entries();
        assert!(entries.contains_key(&format!("Account3::{}", account.aci)));
        assert_eq!(
            entries.get("AccountMap::+15550100"),
            Some(&account.aci.to_string())
        );
        assert_eq!(
            entries.get(&format!("AccountMap::{}", account.pni)),
            Some(&account.aci.to_string())
        );

        // fresh registration leaves no residue to clear
        assert!(harness.keys.deleted().is_empty());
        assert!(harness.messages.cleared().is_empty());
        assert!(harness.profiles.deleted().is_empty());

        assert_eq!(harness.pending.removed(), vec!["+15550100".to_owned()]);
        assert_eq!(
            METRICS_ACCOUNTS.creates.with_label_values(&["new"]).get(),
            created_before + 1
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_create_reregistration_of_live_account() {
        let harness = test_harness();
        let first = register(&harness, "+15550100", "pw").await;
        let created_before = METRICS_ACCOUNTS
            .creates
            .with_label_values(&["re-registration"])
            .get();

        let second = register(&harness, "+15550100", "pw2").await;

        assert_eq!(second.aci, first.aci);
        assert_eq!(second.primary_device().unwrap().auth_token, "pw2");

        // the displaced registration's residue is cleared exactly once
        assert_eq!(harness.keys.deleted(), vec![ServiceId::Aci(first.aci)]);
        assert_eq!(harness.messages.cleared(), vec![ServiceId::Aci(first.aci)]);
        assert_eq!(harness.profiles.deleted(), vec![first.aci]);

        assert_eq!(
            METRICS_ACCOUNTS
                .creates
                .with_label_values(&["re-registration"])
                .get(),
            created_before + 1
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_create_recently_deleted_account() {
        let harness = test_harness();
        let tombstoned = Aci::new_random();
        harness.deleted.put("+15550100", tombstoned).await.unwrap();
        let created_before = METRICS_ACCOUNTS
            .creates
            .with_label_values(&["recently-deleted"])
            .get();

        let account = register(&harness, "+15550100", "pw").await;

        assert_eq!(account.aci, tombstoned);
        assert!(harness.keys.deleted().is_empty());
        assert!(harness.messages.cleared().is_empty());
        assert!(harness.profiles.deleted().is_empty());
        assert_eq!(
            METRICS_ACCOUNTS
                .creates
                .with_label_values(&["recently-deleted"])
                .get(),
            created_before + 1
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_create_undiscoverable_tells_directory() {
        let harness = test_harness();
        let mut attributes = test_attributes();
        attributes.discoverable_by_phone_number = false;

        let account = harness
            .manager
            .create("+15550100", "pw", "test-agent", attributes, Vec::new())
            .await
            .unwrap();

        assert_eq!(
            harness.directory.events(),
            vec![format!("delete:{}", account.aci)]
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_create_interrupted_when_lease_is_held() {
        let harness = test_harness();
        let gated = AccountManager::new(
            harness.db.clone(),
            AccountCache::new(harness.cache.clone()),
            DeletedAccountsManager::with_lease_timeout(
                harness.deleted.clone(),
                Duration::from_millis(100),
            ),
            harness.services.clone(),
        );

        assert!(harness.deleted.try_lock("+15550100").await.unwrap());

        let result = gated
            .create("+15550100", "pw", "test-agent", test_attributes(), Vec::new())
            .await;

        assert!(matches!(result, Err(AccountsError::Interrupted)));
        assert!(harness
            .db
            .get_by_e164("+15550100")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    #[serial]
    async fn test_change_number_displaces_live_account() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;
        let displaced = register(&harness, "+15550200", "pw").await;
        let old_pni = account.pni;

        let updated = harness
            .manager
            .change_number(&mut account, "+15550200")
            .await
            .unwrap();

        assert_eq!(updated.aci, account.aci);
        assert_eq!(updated.number, "+15550200");
        assert_ne!(updated.pni, old_pni);
        assert!(account.is_stale());

        // the displaced account is gone, tombstoned under the number it held
        assert!(harness
            .db
            .get_by_account_identifier(&displaced.aci)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            harness.deleted.get("+15550200").await.unwrap(),
            Some(displaced.aci)
        );

        assert_eq!(
            harness.directory.events(),
            vec![
                format!("delete:{}", displaced.aci),
                format!("change-number:{}:+15550100:+15550200", updated.aci),
            ]
        );

        // cache holds the account under the new number only
        let entries = harness.cache.entries();
        assert_eq!(
            entries.get("AccountMap::+15550200"),
            Some(&updated.aci.to_string())
        );
        assert!(!entries.contains_key("AccountMap::+15550100"));
        assert!(!entries.contains_key(&format!("Account3::{}", displaced.aci)));

        assert!(harness
            .manager
            .get_by_e164("+15550100")
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            harness
                .manager
                .get_by_e164("+15550200")
                .await
                .unwrap()
                .unwrap()
                .aci,
            updated.aci
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_change_number_to_same_number_is_a_noop() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;

        let unchanged = harness
            .manager
            .change_number(&mut account, "+15550100")
            .await
            .unwrap();

        assert!(!account.is_stale());
        assert_eq!(unchanged.version, account.version);
        assert!(harness.directory.events().is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_change_number_keeps_existing_tombstone_for_new_number() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;
        let ghost = Aci::new_random();
        harness.deleted.put("+15550200", ghost).await.unwrap();

        harness
            .manager
            .change_number(&mut account, "+15550200")
            .await
            .unwrap();

        assert_eq!(harness.deleted.get("+15550200").await.unwrap(), Some(ghost));
        assert!(harness
            .directory
            .events()
            .iter()
            .all(|event| !event.starts_with("delete:")));
    }

    #[tokio::test]
    #[serial]
    async fn test_set_username_round_trip() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;

        let updated = harness
            .manager
            .set_username(&mut account, " Ada ")
            .await
            .unwrap();

        assert_eq!(updated.username.as_deref(), Some("ada"));
        assert!(account.is_stale());
        assert!(!updated.is_stale());

        let found = harness.manager.get_by_username("ada").await.unwrap().unwrap();
        assert_eq!(found.aci, updated.aci);
    }

    #[tokio::test]
    #[serial]
    async fn test_set_username_is_a_noop_when_unchanged() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;
        let mut current = harness
            .manager
            .set_username(&mut account, "ada")
            .await
            .unwrap();
        let version = current.version;

        let unchanged = harness
            .manager
            .set_username(&mut current, "ADA")
            .await
            .unwrap();

        assert_eq!(unchanged.version, version);
        assert!(!current.is_stale());
    }

    #[tokio::test]
    #[serial]
    async fn test_set_username_rejects_reservation_for_other_account() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;
        harness.reserved.reserve("ada", Aci::new_random());

        let result = harness.manager.set_username(&mut account, "ada").await;
        assert!(matches!(result, Err(AccountsError::UsernameNotAvailable)));

        // a reservation held by the asking account is not a conflict
        harness.reserved.reserve("lovelace", account.aci);
        let updated = harness
            .manager
            .set_username(&mut account, "lovelace")
            .await
            .unwrap();
        assert_eq!(updated.username.as_deref(), Some("lovelace"));
    }

    #[tokio::test]
    #[serial]
    async fn test_set_username_rejects_name_held_by_other_account() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;
        let mut other = register(&harness, "+15550200", "pw").await;
        harness.manager.set_username(&mut other, "ada").await.unwrap();

        let result = harness.manager.set_username(&mut account, "ada").await;
        assert!(matches!(result, Err(AccountsError::UsernameNotAvailable)));
    }

    #[tokio::test]
    #[serial]
    async fn test_clear_username() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;
        let mut current = harness
            .manager
            .set_username(&mut account, "ada")
            .await
            .unwrap();

        let mut cleared = harness.manager.clear_username(&mut current).await.unwrap();
        assert_eq!(cleared.username, None);
        assert!(harness.manager.get_by_username("ada").await.unwrap().is_none());

        // clearing an account without a username writes nothing
        let version = cleared.version;
        let unchanged = harness.manager.clear_username(&mut cleared).await.unwrap();
        assert_eq!(unchanged.version, version);
        assert!(!cleared.is_stale());
    }

    #[tokio::test]
    #[serial]
    async fn test_update_returns_fresh_copy_and_marks_stale() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;
        let version = account.version;

        let updated = harness
            .manager
            .update(&mut account, |a| {
                a.unrestricted_unidentified_access = true;
                true
            })
            .await
            .unwrap();

        assert!(account.is_stale());
        assert!(!updated.is_stale());
        assert!(updated.unrestricted_unidentified_access);
        assert_eq!(updated.version, version + 1);

        // the cache reflects the post-state
        let cached = harness
            .manager
            .get_by_account_identifier(&updated.aci)
            .await
            .unwrap()
            .unwrap();
        assert!(cached.unrestricted_unidentified_access);
    }

    #[tokio::test]
    #[serial]
    async fn test_update_without_changes_writes_nothing() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;
        let version = account.version;

        let unchanged = harness.manager.update(&mut account, |_| false).await.unwrap();

        assert!(!account.is_stale());
        assert_eq!(unchanged.version, version);
    }

    #[tokio::test]
    #[serial]
    async fn test_concurrent_updates_converge() {
        let harness = test_harness();
        let created = register(&harness, "+15550100", "pw").await;
        let mut first = harness
            .manager
            .get_by_account_identifier(&created.aci)
            .await
            .unwrap()
            .unwrap();
        let mut second = first.clone();

        let updated_first = harness
            .manager
            .update(&mut first, |a| {
                a.registration_lock = Some("lock".to_owned());
                true
            })
            .await
            .unwrap();

        // the second writer held a now-outdated copy; it must retry against
        // the refetched state and keep the first writer's change
        let updated_second = harness
            .manager
            .update(&mut second, |a| {
                a.unrestricted_unidentified_access = true;
                true
            })
            .await
            .unwrap();

        assert_eq!(updated_second.registration_lock.as_deref(), Some("lock"));
        assert!(updated_second.unrestricted_unidentified_access);
        assert_eq!(updated_second.version, updated_first.version + 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_update_gives_up_after_retry_limit() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;
        harness.db.force_contested(10);

        let result = harness
            .manager
            .update(&mut account, |a| {
                a.unrestricted_unidentified_access = true;
                true
            })
            .await;

        assert!(matches!(result, Err(AccountsError::RetryLimitExceeded)));
        assert_eq!(harness.db.remaining_forced_contested(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_update_notifies_directory_only_on_visibility_edge() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;

        let mut hidden = harness
            .manager
            .update(&mut account, |a| {
                a.discoverable_by_phone_number = false;
                true
            })
            .await
            .unwrap();
        assert_eq!(
            harness.directory.events(),
            vec![format!("refresh:{}", hidden.aci)]
        );

        // a mutation that leaves visibility alone stays quiet
        harness
            .manager
            .update(&mut hidden, |a| {
                a.registration_lock = Some("lock".to_owned());
                true
            })
            .await
            .unwrap();
        assert_eq!(harness.directory.events().len(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_update_survives_identifier_violation() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;

        // forbidden through update(), logged rather than raised
        let updated = harness
            .manager
            .update(&mut account, |a| {
                a.username = Some("smuggled".to_owned());
                true
            })
            .await
            .unwrap();

        assert_eq!(updated.username.as_deref(), Some("smuggled"));
    }

    #[tokio::test]
    #[serial]
    async fn test_update_device_applies_device_mutation() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;

        let updated = harness
            .manager
            .update_device(&mut account, PRIMARY_DEVICE_ID, |device| {
                device.name = Some("renamed".to_owned());
            })
            .await
            .unwrap();

        assert_eq!(
            updated.primary_device().unwrap().name.as_deref(),
            Some("renamed")
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_update_device_last_seen_skips_older_timestamps() {
        let harness = test_harness();
        let mut account = register(&harness, "+15550100", "pw").await;
        let seen = account.primary_device().unwrap().last_seen;
        let version = account.version;

        let unchanged = harness
            .manager
            .update_device_last_seen(
                &mut account,
                PRIMARY_DEVICE_ID,
                seen - chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(unchanged.version, version);
        assert!(!account.is_stale());

        let later = seen + chrono::Duration::hours(1);
        let updated = harness
            .manager
            .update_device_last_seen(&mut account, PRIMARY_DEVICE_ID, later)
            .await
            .unwrap();
        assert_eq!(updated.version, version + 1);
        assert_eq!(updated.primary_device().unwrap().last_seen, later);
    }

    #[tokio::test]
    #[serial]
    async fn test_lookups_read_through_and_repopulate_cache() {
        let harness = test_harness();
        let account = register(&harness, "+15550100", "pw").await;

        harness.cache.clear();
        let by_number = harness
            .manager
            .get_by_e164("+15550100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_number.aci, account.aci);
        assert!(!harness.cache.entries().is_empty());

        harness.cache.clear();
        assert!(harness
            .manager
            .get_by_account_identifier(&account.aci)
            .await
            .unwrap()
            .is_some());
        assert!(harness
            .manager
            .get_by_phone_number_identifier(&account.pni)
            .await
            .unwrap()
            .is_some());
        assert!(harness
            .manager
            .get_by_e164("+15550999")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    #[serial]
    async fn test_crawler_pages_in_aci_order() {
        let harness = test_harness();
        register(&harness, "+15550100", "pw").await;
        register(&harness, "+15550200", "pw").await;
        register(&harness, "+15550300", "pw").await;

        let first_page = harness.manager.get_all_from_start(2).await.unwrap();
        assert_eq!(first_page.len(), 2);
        assert!(first_page[0].aci < first_page[1].aci);

        let rest = harness
            .manager
            .get_all_from(&first_page[1].aci, 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert!(first_page[1].aci < rest[0].aci);
    }

    #[tokio::test]
    #[serial]
    async fn test_delete_waits_for_secure_services() {
        let harness = test_harness_with_secure_delays(100, 200);
        let account = register(&harness, "+15550100", "pw").await;
        let deletions_before = METRICS_ACCOUNTS
            .deletions
            .with_label_values(&["1", "admin"])
            .get();

        harness
            .manager
            .delete_account(&account, DeletionReason::AdminDeleted)
            .await
            .unwrap();

        // the durable row outlives both secure-service deletions
        let storage_pos = harness.events.position("secure-storage-deleted").unwrap();
        let backup_pos = harness.events.position("secure-backup-deleted").unwrap();
        let row_pos = harness
            .events
            .position(&format!("row-deleted:{}", account.aci))
            .unwrap();
        assert!(storage_pos < backup_pos);
        assert!(backup_pos < row_pos);

        assert!(harness
            .db
            .get_by_account_identifier(&account.aci)
            .await
            .unwrap()
            .is_none());
        assert!(harness.cache.entries().is_empty());
        assert_eq!(
            harness.presence.disconnected(),
            vec![(account.aci, PRIMARY_DEVICE_ID)]
        );
        assert_eq!(
            harness.deleted.get("+15550100").await.unwrap(),
            Some(account.aci)
        );
        assert_eq!(
            METRICS_ACCOUNTS
                .deletions
                .with_label_values(&["1", "admin"])
                .get(),
            deletions_before + 1
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_delete_then_create_reclaims_the_aci() {
        let harness = test_harness();
        let account = register(&harness, "+15550100", "pw").await;

        harness
            .manager
            .delete_account(&account, DeletionReason::UserRequest)
            .await
            .unwrap();
        let residue_calls = harness.keys.deleted().len();

        let recreated = register(&harness, "+15550100", "pw2").await;

        assert_eq!(recreated.aci, account.aci);
        // recently-deleted path: residue was already cleared at delete time
        assert_eq!(harness.keys.deleted().len(), residue_calls);
    }
}
