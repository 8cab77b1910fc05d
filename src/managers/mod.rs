pub mod account_cache;
pub mod account_manager;
pub mod collaborators;
pub mod deleted_accounts_manager;
