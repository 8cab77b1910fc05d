use std::fmt;
use std::str::FromStr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const PRIMARY_DEVICE_ID: u32 = 1;

/// Stable account identifier. Never reassigned after the account's first
/// persistence; re-registration hands the same value back to the same person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Aci(Uuid);

impl Aci {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for Aci {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for Aci {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for Aci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Phone-number identifier. Tracks the current phone number and changes with
/// it, unlike the [`Aci`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pni(Uuid);

impl Pni {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for Pni {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for Pni {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for Pni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Either identifier of an account, for collaborators that are told to drop
/// data for "an id" without caring which kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceId {
    Aci(Aci),
    Pni(Pni),
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceId::Aci(aci) => write!(f, "ACI:{}", aci),
            ServiceId::Pni(pni) => write!(f, "PNI:{}", pni),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    #[serde(default)]
    pub storage: bool,
    #[serde(default)]
    pub transfer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: u32,
    #[serde(default)]
    pub name: Option<String>,
    pub auth_token: String,
    pub registration_id: u32,
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
    pub fetches_messages: bool,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub created: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn primary(
        password: &str,
        user_agent: &str,
        attributes: &AccountAttributes,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: PRIMARY_DEVICE_ID,
            name: attributes.name.clone(),
            auth_token: password.to_owned(),
            registration_id: attributes.registration_id,
            capabilities: attributes.capabilities,
            fetches_messages: attributes.fetches_messages,
            user_agent: Some(user_agent.to_owned()),
            created: now,
            last_seen: now,
        }
    }
}

/// Registration-time attributes supplied by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountAttributes {
    pub fetches_messages: bool,
    pub registration_id: u32,
    pub name: Option<String>,
    pub capabilities: DeviceCapabilities,
    pub registration_lock: Option<String>,
    pub unidentified_access_key: Option<Vec<u8>>,
    pub unrestricted_unidentified_access: bool,
    pub discoverable_by_phone_number: bool,
}

impl Default for AccountAttributes {
    fn default() -> Self {
        Self {
            fetches_messages: false,
            registration_id: 0,
            name: None,
            capabilities: DeviceCapabilities::default(),
            registration_lock: None,
            unidentified_access_key: None,
            unrestricted_unidentified_access: false,
            discoverable_by_phone_number: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBadge {
    pub id: String,
    pub expiration: DateTime<Utc>,
    pub visible: bool,
}

fn default_true() -> bool {
    true
}

/// The in-memory account record. Readers of the cached JSON form must
/// tolerate fields they do not know, so every optional field carries a serde
/// default.
#[derive(Debug, Serialize, Deserialize)]
pub struct Account {
    pub aci: Aci,
    pub pni: Pni,
    pub number: String,
    #[serde(default)]
    pub username: Option<String>,
    pub devices: Vec<Device>,
    #[serde(default)]
    pub unidentified_access_key: Option<Vec<u8>>,
    #[serde(default)]
    pub unrestricted_unidentified_access: bool,
    #[serde(default)]
    pub registration_lock: Option<String>,
    #[serde(default = "default_true")]
    pub discoverable_by_phone_number: bool,
    #[serde(default)]
    pub badges: Vec<AccountBadge>,
    #[serde(default)]
    pub version: i64,
    pub created: DateTime<Utc>,
    #[serde(skip)]
    stale: Arc<AtomicBool>,
}

impl Account {
    pub fn new(
        aci: Aci,
        pni: Pni,
        number: &str,
        primary_device: Device,
        attributes: &AccountAttributes,
        badges: Vec<AccountBadge>,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            aci,
            pni,
            number: number.to_owned(),
            username: None,
            devices: vec![primary_device],
            unidentified_access_key: attributes.unidentified_access_key.clone(),
            unrestricted_unidentified_access: attributes.unrestricted_unidentified_access,
            registration_lock: attributes.registration_lock.clone(),
            discoverable_by_phone_number: attributes.discoverable_by_phone_number,
            badges,
            version: 0,
            created,
            stale: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn device(&self, device_id: u32) -> Option<&Device> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn device_mut(&mut self, device_id: u32) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.device_id == device_id)
    }

    pub fn primary_device(&self) -> Option<&Device> {
        self.device(PRIMARY_DEVICE_ID)
    }

    /// An account is enabled while it still has its primary device.
    pub fn is_enabled(&self) -> bool {
        self.primary_device().is_some()
    }

    pub fn should_be_visible_in_directory(&self) -> bool {
        self.discoverable_by_phone_number && self.is_enabled()
    }

    /// One-way flag: a successful mutation marks the caller's copy so that
    /// any later use of it is detectable as a bug.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Relaxed);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }
}

impl Clone for Account {
    // A clone is a detached copy: it never shares the stale flag with its
    // source and starts out not stale.
    fn clone(&self) -> Self {
        Self {
            aci: self.aci,
            pni: self.pni,
            number: self.number.clone(),
            username: self.username.clone(),
            devices: self.devices.clone(),
            unidentified_access_key: self.unidentified_access_key.clone(),
            unrestricted_unidentified_access: self.unrestricted_unidentified_access,
            registration_lock: self.registration_lock.clone(),
            discoverable_by_phone_number: self.discoverable_by_phone_number,
            badges: self.badges.clone(),
            version: self.version,
            created: self.created,
            stale: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[cfg(test)]
mod account_tests {
    use super::*;
    use crate::test_utils::user::{test_attributes, test_device};

    fn test_account(number: &str) -> Account {
        let attributes = test_attributes();
        Account::new(
            Aci::new_random(),
            Pni::new_random(),
            number,
            test_device(&attributes),
            &attributes,
            Vec::new(),
            Utc::now(),
        )
    }

    #[test]
    fn test_directory_visibility() {
        let mut account = test_account("+15550100");
        assert!(account.should_be_visible_in_directory());

        account.discoverable_by_phone_number = false;
        assert!(!account.should_be_visible_in_directory());

        account.discoverable_by_phone_number = true;
        account.devices.clear();
        assert!(!account.should_be_visible_in_directory());
    }

    #[test]
    fn test_mark_stale_is_one_way() {
        let account = test_account("+15550100");
        assert!(!account.is_stale());

        account.mark_stale();
        account.mark_stale();
        assert!(account.is_stale());
    }

    #[test]
    fn test_clone_detaches_stale_flag() {
        let account = test_account("+15550100");
        let copy = account.clone();

        account.mark_stale();
        assert!(account.is_stale());
        assert!(!copy.is_stale());
    }

    #[test]
    fn test_json_round_trip_resets_stale() {
        let account = test_account("+15550100");
        account.mark_stale();

        let body = serde_json::to_string(&account).unwrap();
        let decoded: Account = serde_json::from_str(&body).unwrap();

        assert_eq!(decoded.aci, account.aci);
        assert_eq!(decoded.number, account.number);
        assert!(!decoded.is_stale());
    }

    #[test]
    fn test_decode_tolerates_unknown_fields() {
        let account = test_account("+15550100");
        let mut body: serde_json::Value = serde_json::to_value(&account).unwrap();
        body["some_future_field"] = serde_json::json!({"nested": true});

        let decoded: Account = serde_json::from_value(body).unwrap();
        assert_eq!(decoded.aci, account.aci);
    }
}
