pub mod fake_ble;
pub mod fixtures;
