use std::sync::Arc;

use crate::{
    managers::{
        account_cache::AccountCache,
        account_manager::AccountManager,
        collaborators::ExternalServices,
        deleted_accounts_manager::DeletedAccountsManager,
    },
    test_utils::{
        cache::InMemoryCacheBackend,
        collaborators::{
            DelayedSecureService, RecordingDirectoryQueue, RecordingKeyManager,
            RecordingMessagesManager, RecordingPendingAccounts, RecordingPresenceManager,
            RecordingProfilesManager, StaticReservedUsernames, TestClock,
        },
        database::InMemoryDatabase,
        deleted::InMemoryDeletedAccountsStore,
        EventLog,
    },
    validators::DefaultUsernameValidator,
};

/// A fully wired coordinator over in-memory fakes, with handles onto every
/// fake so tests can seed state and assert on side effects.
pub struct TestHarness {
    pub manager: AccountManager<InMemoryDatabase, InMemoryCacheBackend>,
    pub db: InMemoryDatabase,
    pub cache: InMemoryCacheBackend,
    pub deleted: Arc<InMemoryDeletedAccountsStore>,
    pub services: ExternalServices,
    pub events: EventLog,
    pub directory: Arc<RecordingDirectoryQueue>,
    pub messages: Arc<RecordingMessagesManager>,
    pub keys: Arc<RecordingKeyManager>,
    pub profiles: Arc<RecordingProfilesManager>,
    pub pending: Arc<RecordingPendingAccounts>,
    pub reserved: Arc<StaticReservedUsernames>,
    pub presence: Arc<RecordingPresenceManager>,
}

pub fn test_harness() -> TestHarness {
    test_harness_with_secure_delays(0, 0)
}

pub fn test_harness_with_secure_delays(storage_ms: u64, backup_ms: u64) -> TestHarness {
    crate::test_utils::init_logging();

    let events = EventLog::default();
    let db = InMemoryDatabase::with_events(events.clone());
    let cache = InMemoryCacheBackend::default();
    let deleted = Arc::new(InMemoryDeletedAccountsStore::default());

    let directory = Arc::new(RecordingDirectoryQueue::default());
    let messages = Arc::new(RecordingMessagesManager::default());
    let keys = Arc::new(RecordingKeyManager::default());
    let profiles = Arc::new(RecordingProfilesManager::default());
    let pending = Arc::new(RecordingPendingAccounts::default());
    let reserved = Arc::new(StaticReservedUsernames::default());
    let presence = Arc::new(RecordingPresenceManager::default());

    let services = ExternalServices {
        phone_number_identifiers: Arc::new(db.clone()),
        directory_queue: directory.clone(),
        secure_storage: Arc::new(DelayedSecureService::new(
            "secure-storage-deleted",
            storage_ms,
            events.clone(),
        )),
        secure_backup: Arc::new(DelayedSecureService::new(
            "secure-backup-deleted",
            backup_ms,
            events.clone(),
        )),
        messages_manager: messages.clone(),
        key_manager: keys.clone(),
        profiles_manager: profiles.clone(),
        pending_accounts: pending.clone(),
        reserved_usernames: reserved.clone(),
        username_validator: Arc::new(DefaultUsernameValidator),
        presence_manager: presence.clone(),
        clock: Arc::new(TestClock::default()),
    };

    let manager = AccountManager::new(
        db.clone(),
        AccountCache::new(cache.clone()),
        DeletedAccountsManager::new(deleted.clone()),
        services.clone(),
    );

    TestHarness {
        manager,
        db,
        cache,
        deleted,
        services,
        events,
        directory,
        messages,
        keys,
        profiles,
        pending,
        reserved,
        presence,
    }
}
