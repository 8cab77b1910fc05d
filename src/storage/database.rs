use async_trait::async_trait;

use crate::{
    account::{Account, Aci, Pni},
    error::AccountsError,
};

/// Contract of the durable account table. All writes that race with other
/// writers are versioned: a write conditioned on an outdated
/// `account.version` fails with [`AccountsError::Contested`] and bumps
/// nothing.
#[async_trait]
pub trait AccountsDatabase: Clone + Send + Sync + 'static {
    /// Inserts a new account. If a live record already holds
    /// `account.number`, that record is updated in place to carry the new
    /// credentials and devices instead, `account.aci` and `account.version`
    /// are rewritten to the existing record's, and `false` is returned.
    async fn create_account(&self, account: &mut Account) -> Result<bool, AccountsError>;

    /// Writes the record back conditioned on `account.version`; bumps the
    /// version on success.
    async fn update_account(&self, account: &mut Account) -> Result<(), AccountsError>;

    /// Atomically swaps `number` and `pni` together with their secondary
    /// index entries. Contested semantics as `update_account`.
    async fn change_number(
        &self,
        account: &mut Account,
        new_number: &str,
        new_pni: Pni,
    ) -> Result<(), AccountsError>;

    /// Atomically assigns the canonical username;
    /// [`AccountsError::UsernameNotAvailable`] if another live account
    /// holds it.
    async fn set_username(
        &self,
        account: &mut Account,
        username: &str,
    ) -> Result<(), AccountsError>;

    async fn clear_username(&self, account: &mut Account) -> Result<(), AccountsError>;

    async fn get_by_account_identifier(&self, aci: &Aci)
        -> Result<Option<Account>, AccountsError>;

    async fn get_by_e164(&self, number: &str) -> Result<Option<Account>, AccountsError>;

    async fn get_by_phone_number_identifier(
        &self,
        pni: &Pni,
    ) -> Result<Option<Account>, AccountsError>;

    async fn get_by_username(&self, username: &str) -> Result<Option<Account>, AccountsError>;

    /// First page of the crawler scan, ordered by `aci`.
    async fn get_all_from_start(&self, count: u32) -> Result<Vec<Account>, AccountsError>;

    /// Continuation of the crawler scan: accounts with `aci` strictly after
    /// `cursor`.
    async fn get_all_from(&self, cursor: &Aci, count: u32) -> Result<Vec<Account>, AccountsError>;

    /// Removes the row and all secondary index entries.
    async fn delete_account(&self, aci: &Aci) -> Result<(), AccountsError>;
}
