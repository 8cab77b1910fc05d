use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::{
    account::{Account, Aci, ServiceId},
    managers::collaborators::{
        ClientPresenceManager, Clock, DirectoryQueue, KeyManager, MessagesManager,
        PendingAccountsManager, ProfilesManager, ReservedUsernames, SecureBackupClient,
        SecureStorageClient,
    },
    test_utils::EventLog,
};

#[derive(Debug, Default)]
pub struct RecordingDirectoryQueue {
    events: Mutex<Vec<String>>,
}

impl RecordingDirectoryQueue {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl DirectoryQueue for RecordingDirectoryQueue {
    async fn delete_account(&self, account: &Account) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("delete:{}", account.aci));
        Ok(())
    }

    async fn refresh_account(&self, account: &Account) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("refresh:{}", account.aci));
        Ok(())
    }

    async fn change_phone_number(
        &self,
        account: &Account,
        old_number: &str,
        new_number: &str,
    ) -> Result<()> {
        self.events.lock().unwrap().push(format!(
            "change-number:{}:{}:{}",
            account.aci, old_number, new_number
        ));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingMessagesManager {
    cleared: Mutex<Vec<ServiceId>>,
}

impl RecordingMessagesManager {
    pub fn cleared(&self) -> Vec<ServiceId> {
        self.cleared.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagesManager for RecordingMessagesManager {
    async fn clear(&self, service_id: &ServiceId) -> Result<()> {
        self.cleared.lock().unwrap().push(*service_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingKeyManager {
    deleted: Mutex<Vec<ServiceId>>,
}

impl RecordingKeyManager {
    pub fn deleted(&self) -> Vec<ServiceId> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyManager for RecordingKeyManager {
    async fn delete_keys(&self, service_id: &ServiceId) -> Result<()> {
        self.deleted.lock().unwrap().push(*service_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingProfilesManager {
    deleted: Mutex<Vec<Aci>>,
}

impl RecordingProfilesManager {
    pub fn deleted(&self) -> Vec<Aci> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProfilesManager for RecordingProfilesManager {
    async fn delete_all(&self, aci: &Aci) -> Result<()> {
        self.deleted.lock().unwrap().push(*aci);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingPendingAccounts {
    removed: Mutex<Vec<String>>,
}

impl RecordingPendingAccounts {
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PendingAccountsManager for RecordingPendingAccounts {
    async fn remove(&self, number: &str) -> Result<()> {
        self.removed.lock().unwrap().push(number.to_owned());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StaticReservedUsernames {
    reserved: Mutex<HashMap<String, Aci>>,
}

impl StaticReservedUsernames {
    pub fn reserve(&self, canonical: &str, aci: Aci) {
        self.reserved
            .lock()
            .unwrap()
            .insert(canonical.to_owned(), aci);
    }
}

#[async_trait]
impl ReservedUsernames for StaticReservedUsernames {
    async fn is_reserved(&self, canonical: &str, aci: &Aci) -> Result<bool> {
        Ok(self
            .reserved
            .lock()
            .unwrap()
            .get(canonical)
            .is_some_and(|owner| owner != aci))
    }
}

#[derive(Debug, Default)]
pub struct RecordingPresenceManager {
    disconnected: Mutex<Vec<(Aci, u32)>>,
}

impl RecordingPresenceManager {
    pub fn disconnected(&self) -> Vec<(Aci, u32)> {
        self.disconnected.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientPresenceManager for RecordingPresenceManager {
    async fn disconnect_presence(&self, aci: &Aci, device_id: u32) -> Result<()> {
        self.disconnected.lock().unwrap().push((*aci, device_id));
        Ok(())
    }
}

/// Completes after a configurable delay, then records itself in the shared
/// event log. Used for both the secure-storage and secure-backup fakes.
#[derive(Debug)]
pub struct DelayedSecureService {
    label: &'static str,
    delay: Duration,
    events: EventLog,
}

impl DelayedSecureService {
    pub fn new(label: &'static str, delay_ms: u64, events: EventLog) -> Self {
        Self {
            label,
            delay: Duration::from_millis(delay_ms),
            events,
        }
    }

    async fn run(&self) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.events.push(self.label);
        Ok(())
    }
}

#[async_trait]
impl SecureStorageClient for DelayedSecureService {
    async fn delete_stored_data(&self, _aci: &Aci) -> Result<()> {
        self.run().await
    }
}

#[async_trait]
impl SecureBackupClient for DelayedSecureService {
    async fn delete_backups(&self, _aci: &Aci) -> Result<()> {
        self.run().await
    }
}

#[derive(Debug, Clone)]
pub struct TestClock {
    now: DateTime<Utc>,
}

impl Default for TestClock {
    fn default() -> Self {
        Self {
            now: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}
