use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};

use crate::{
    account::{Account, Aci, Pni},
    error::AccountsError,
    managers::collaborators::PhoneNumberIdentifiers,
    storage::database::AccountsDatabase,
};

/// Durable account table plus the PNI allocation table (`schema.sql`). The
/// full record lives in the `data` column as JSON; the secondary-key columns
/// exist for their unique indexes and point lookups.
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub async fn connect(connection_str: String) -> Self {
        let _ = dotenv::dotenv();
        let db_url = std::env::var(&connection_str)
            .unwrap_or_else(|_| panic!("Unable to read {} .env var", connection_str));
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&db_url)
            .await
            .expect("Failed to connect to the database");
        Self { pool }
    }

    fn row_to_account(row: &PgRow) -> Result<Account, AccountsError> {
        let data: String = row.try_get("data")?;
        let version: i64 = row.try_get("version")?;
        let mut account: Account = serde_json::from_str(&data)?;
        account.version = version;
        Ok(account)
    }

    async fn fetch_account(
        &self,
        query: &str,
        key: &str,
    ) -> Result<Option<Account>, AccountsError> {
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_account).transpose()
    }
}

#[async_trait]
impl AccountsDatabase for PostgresDatabase {
    async fn create_account(&self, account: &mut Account) -> Result<bool, AccountsError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT aci, version FROM accounts WHERE number = $1 FOR UPDATE")
            .bind(&account.number)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = existing {
            // Number conflict: the live record keeps its identity and takes
            // on the new credentials and devices.
            let aci: String = row.try_get("aci")?;
            let version: i64 = row.try_get("version")?;
            account.aci = aci
                .parse()
                .map_err(|e| anyhow!("corrupt aci column for {}: {e}", account.number))?;
            account.version = version + 1;

            let data = serde_json::to_string(&*account)?;
            sqlx::query(
                "UPDATE accounts SET pni = $1, username = $2, version = $3, data = $4 WHERE aci = $5",
            )
            .bind(account.pni.to_string())
            .bind(&account.username)
            .bind(account.version)
            .bind(&data)
            .bind(account.aci.to_string())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(false);
        }

        let data = serde_json::to_string(&*account)?;
        sqlx::query(
            "INSERT INTO accounts (aci, number, pni, username, version, data) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(account.aci.to_string())
        .bind(&account.number)
        .bind(account.pni.to_string())
        .bind(&account.username)
        .bind(account.version)
        .bind(&data)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn update_account(&self, account: &mut Account) -> Result<(), AccountsError> {
        let previous = account.version;
        account.version += 1;
        let data = serde_json::to_string(&*account)?;

        let outcome = sqlx::query(
            "UPDATE accounts SET version = $1, data = $2 WHERE aci = $3 AND version = $4",
        )
        .bind(account.version)
        .bind(&data)
        .bind(account.aci.to_string())
        .bind(previous)
        .execute(&self.pool)
        .await;

        match outcome {
            Ok(done) if done.rows_affected() == 0 => {
                account.version = previous;
                Err(AccountsError::Contested)
            }
            Ok(_) => Ok(()),
            Err(e) => {
                account.version = previous;
                Err(e.into())
            }
        }
    }

    async fn change_number(
        &self,
        account: &mut Account,
        new_number: &str,
        new_pni: Pni,
    ) -> Result<(), AccountsError> {
        let previous_version = account.version;
        let previous_number = std::mem::replace(&mut account.number, new_number.to_owned());
        let previous_pni = std::mem::replace(&mut account.pni, new_pni);
        account.version += 1;
        let data = serde_json::to_string(&*account)?;

        let outcome = sqlx::query(
            "UPDATE accounts SET number = $1, pni = $2, version = $3, data = $4 \
             WHERE aci = $5 AND version = $6",
        )
        .bind(&account.number)
        .bind(account.pni.to_string())
        .bind(account.version)
        .bind(&data)
        .bind(account.aci.to_string())
        .bind(previous_version)
        .execute(&self.pool)
        .await;

        match outcome {
            Ok(done) if done.rows_affected() == 0 => {
                account.number = previous_number;
                account.pni = previous_pni;
                account.version = previous_version;
                Err(AccountsError::Contested)
            }
            Ok(_) => Ok(()),
            Err(e) => {
                account.number = previous_number;
                account.pni = previous_pni;
                account.version = previous_version;
                Err(e.into())
            }
        }
    }

    async fn set_username(
        &self,
        account: &mut Account,
        username: &str,
    ) -> Result<(), AccountsError> {
        let previous_version = account.version;
        let previous_username =
            std::mem::replace(&mut account.username, Some(username.to_owned()));
        account.version += 1;
        let data = serde_json::to_string(&*account)?;

        let outcome = sqlx::query(
            "UPDATE accounts SET username = $1, version = $2, data = $3 \
             WHERE aci = $4 AND version = $5",
        )
        .bind(username)
        .bind(account.version)
        .bind(&data)
        .bind(account.aci.to_string())
        .bind(previous_version)
        .execute(&self.pool)
        .await;

        match outcome {
            Ok(done) if done.rows_affected() == 0 => {
                account.username = previous_username;
                account.version = previous_version;
                Err(AccountsError::Contested)
            }
            Ok(_) => Ok(()),
            Err(e) => {
                account.username = previous_username;
                account.version = previous_version;
                if let sqlx::Error::Database(database_err) = &e {
                    if database_err.constraint() == Some("accounts_username_key") {
                        return Err(AccountsError::UsernameNotAvailable);
                    }
                }
                Err(e.into())
            }
        }
    }

    async fn clear_username(&self, account: &mut Account) -> Result<(), AccountsError> {
        let previous_version = account.version;
        let previous_username = account.username.take();
        account.version += 1;
        let data = serde_json::to_string(&*account)?;

        let outcome = sqlx::query(
            "UPDATE accounts SET username = NULL, version = $1, data = $2 \
             WHERE aci = $3 AND version = $4",
        )
        .bind(account.version)
        .bind(&data)
        .bind(account.aci.to_string())
        .bind(previous_version)
        .execute(&self.pool)
        .await;

        match outcome {
            Ok(done) if done.rows_affected() == 0 => {
                account.username = previous_username;
                account.version = previous_version;
                Err(AccountsError::Contested)
            }
            Ok(_) => Ok(()),
            Err(e) => {
                account.username = previous_username;
                account.version = previous_version;
                Err(e.into())
            }
        }
    }

    async fn get_by_account_identifier(
        &self,
        aci: &Aci,
    ) -> Result<Option<Account>, AccountsError> {
        self.fetch_account(
            "SELECT version, data FROM accounts WHERE aci = $1",
            &aci.to_string(),
        )
        .await
    }

    async fn get_by_e164(&self, number: &str) -> Result<Option<Account>, AccountsError> {
        self.fetch_account("SELECT version, data FROM accounts WHERE number = $1", number)
            .await
    }

    async fn get_by_phone_number_identifier(
        &self,
        pni: &Pni,
    ) -> Result<Option<Account>, AccountsError> {
        self.fetch_account(
            "SELECT version, data FROM accounts WHERE pni = $1",
            &pni.to_string(),
        )
        .await
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<Account>, AccountsError> {
        self.fetch_account(
            "SELECT version, data FROM accounts WHERE username = $1",
            username,
        )
        .await
    }

    async fn get_all_from_start(&self, count: u32) -> Result<Vec<Account>, AccountsError> {
        let rows = sqlx::query("SELECT version, data FROM accounts ORDER BY aci LIMIT $1")
            .bind(count as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_account).collect()
    }

    async fn get_all_from(&self, cursor: &Aci, count: u32) -> Result<Vec<Account>, AccountsError> {
        let rows = sqlx::query(
            "SELECT version, data FROM accounts WHERE aci > $1 ORDER BY aci LIMIT $2",
        )
        .bind(cursor.to_string())
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_account).collect()
    }

    async fn delete_account(&self, aci: &Aci) -> Result<(), AccountsError> {
        sqlx::query("DELETE FROM accounts WHERE aci = $1")
            .bind(aci.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PhoneNumberIdentifiers for PostgresDatabase {
    async fn pni_for(&self, number: &str) -> anyhow::Result<Pni> {
        let candidate = Pni::new_random();
        // The no-op DO UPDATE makes RETURNING yield the winning row whether
        // or not this call allocated it.
        let row = sqlx::query(
            "INSERT INTO phone_number_identifiers (number, pni) VALUES ($1, $2) \
             ON CONFLICT (number) DO UPDATE SET number = EXCLUDED.number RETURNING pni",
        )
        .bind(number)
        .bind(candidate.to_string())
        .fetch_one(&self.pool)
        .await?;

        let stored: String = row.try_get("pni")?;
        stored
            .parse()
            .map_err(|e| anyhow!("corrupt pni column for {number}: {e}"))
    }
}
