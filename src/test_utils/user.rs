use chrono::Utc;

use crate::account::{
    Account, AccountAttributes, Aci, Device, DeviceCapabilities, Pni,
};

pub fn test_attributes() -> AccountAttributes {
    AccountAttributes {
        fetches_messages: true,
        registration_id: 42,
        name: Some("test-device".to_owned()),
        capabilities: DeviceCapabilities::default(),
        registration_lock: None,
        unidentified_access_key: None,
        unrestricted_unidentified_access: false,
        discoverable_by_phone_number: true,
    }
}

pub fn test_device(attributes: &AccountAttributes) -> Device {
    Device::primary("password", "test-agent", attributes, Utc::now())
}

pub fn new_account(number: &str) -> Account {
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
