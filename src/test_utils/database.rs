use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::{
    account::{Account, Aci, Pni},
    error::AccountsError,
    managers::collaborators::PhoneNumberIdentifiers,
    storage::database::AccountsDatabase,
    test_utils::EventLog,
};

/// Versioned in-memory stand-in for the durable account table, with a knob
/// to force contested writes.
#[derive(Clone, Default)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<State>>,
    events: EventLog,
    forced_contested: Arc<AtomicU32>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<Aci, Account>,
    pnis: HashMap<String, Pni>,
}

impl InMemoryDatabase {
    pub fn with_events(events: EventLog) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    /// The next `count` versioned writes fail as contested regardless of the
    /// version they carry.
    pub fn force_contested(&self, count: u32) {
        self.forced_contested.store(count, Ordering::Relaxed);
    }

    pub fn remaining_forced_contested(&self) -> u32 {
        self.forced_contested.load(Ordering::Relaxed)
    }

    fn take_forced_contested(&self) -> bool {
        self.forced_contested
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn guard_version(stored: &Account, account: &Account) -> Result<(), AccountsError> {
        if stored.version != account.version {
            return Err(AccountsError::Contested);
        }
        Ok(())
    }
}

#[async_trait]
impl AccountsDatabase for InMemoryDatabase {
    async fn create_account(&self, account: &mut Account) -> Result<bool, AccountsError> {
        let mut state = self.state.lock().unwrap();

        let existing = state
            .accounts
            .values()
            .find(|a| a.number == account.number)
            .map(|a| (a.aci, a.version));
        if let Some((aci, version)) = existing {
            account.aci = aci;
            account.version = version + 1;
            state.accounts.insert(account.aci, account.clone());
            return Ok(false);
        }

        state.accounts.insert(account.aci, account.clone());
        Ok(true)
    }

    async fn update_account(&self, account: &mut Account) -> Result<(), AccountsError> {
        if self.take_forced_contested() {
            return Err(AccountsError::Contested);
        }

        let mut state = self.state.lock().unwrap();
        let stored = state
            .accounts
            .get(&account.aci)
            .ok_or_else(|| anyhow!("update of unknown account {}", account.aci))?;
        Self::guard_version(stored, account)?;

        account.version += 1;
        state.accounts.insert(account.aci, account.clone());
        Ok(())
    }

    async fn change_number(
        &self,
        account: &mut Account,
        new_number: &str,
        new_pni: Pni,
    ) -> Result<(), AccountsError> {
        if self.take_forced_contested() {
            return Err(AccountsError::Contested);
        }

        let mut state = self.state.lock().unwrap();
        let stored = state
            .accounts
            .get(&account.aci)
            .ok_or_else(|| anyhow!("change_number of unknown account {}", account.aci))?;
        Self::guard_version(stored, account)?;

        account.number = new_number.to_owned();
        account.pni = new_pni;
        account.version += 1;
        state.accounts.insert(account.aci, account.clone());
        Ok(())
    }

    async fn set_username(
        &self,
        account: &mut Account,
        username: &str,
    ) -> Result<(), AccountsError> {
        if self.take_forced_contested() {
            return Err(AccountsError::Contested);
        }

        let mut state = self.state.lock().unwrap();
        let taken = state
            .accounts
            .values()
            .any(|a| a.aci != account.aci && a.username.as_deref() == Some(username));
        if taken {
            return Err(AccountsError::UsernameNotAvailable);
        }

        let stored = state
            .accounts
            .get(&account.aci)
            .ok_or_else(|| anyhow!("set_username of unknown account {}", account.aci))?;
        Self::guard_version(stored, account)?;

        account.username = Some(username.to_owned());
        account.version += 1;
        state.accounts.insert(account.aci, account.clone());
        Ok(())
    }

    async fn clear_username(&self, account: &mut Account) -> Result<(), AccountsError> {
        if self.take_forced_contested() {
            return Err(AccountsError::Contested);
        }

        let mut state = self.state.lock().unwrap();
        let stored = state
            .accounts
            .get(&account.aci)
            .ok_or_else(|| anyhow!("clear_username of unknown account {}", account.aci))?;
        Self::guard_version(stored, account)?;

        account.username = None;
        account.version += 1;
        state.accounts.insert(account.aci, account.clone());
        Ok(())
    }

    async fn get_by_account_identifier(
        &self,
        aci: &Aci,
    ) -> Result<Option<Account>, AccountsError> {
        Ok(self.state.lock().unwrap().accounts.get(aci).cloned())
    }

    async fn get_by_e164(&self, number: &str) -> Result<Option<Account>, AccountsError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .accounts
            .values()
            .find(|a| a.number == number)
            .cloned())
    }

    async fn get_by_phone_number_identifier(
        &self,
        pni: &Pni,
    ) -> Result<Option<Account>, AccountsError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .accounts
            .values()
            .find(|a| a.pni == *pni)
            .cloned())
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<Account>, AccountsError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .accounts
            .values()
            .find(|a| a.username.as_deref() == Some(username))
            .cloned())
    }

    async fn get_all_from_start(&self, count: u32) -> Result<Vec<Account>, AccountsError> {
        let state = self.state.lock().unwrap();
        let mut accounts: Vec<Account> = state.accounts.values().cloned().collect();
        accounts.sort_by_key(|a| a.aci);
        accounts.truncate(count as usize);
        Ok(accounts)
    }

    async fn get_all_from(&self, cursor: &Aci, count: u32) -> Result<Vec<Account>, AccountsError> {
        let state = self.state.lock().unwrap();
        let mut accounts: Vec<Account> = state
            .accounts
            .values()
            .filter(|a| a.aci > *cursor)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.aci);
        accounts.truncate(count as usize);
        Ok(accounts)
    }

    async fn delete_account(&self, aci: &Aci) -> Result<(), AccountsError> {
        self.state.lock().unwrap().accounts.remove(aci);
        self.events.push(format!("row-deleted:{aci}"));
        Ok(())
    }
}

#[async_trait]
impl PhoneNumberIdentifiers for InMemoryDatabase {
    async fn pni_for(&self, number: &str) -> Result<Pni> {
        let mut state = self.state.lock().unwrap();
        Ok(*state
            .pnis
            .entry(number.to_owned())
            .or_insert_with(Pni::new_random))
    }
}
