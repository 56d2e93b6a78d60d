//! Shared fixtures for the unit-test suite.

use std::sync::{Mutex, MutexGuard};

use crate::credentials::MemoryCredentialStore;
use crate::link_core::LinkCore;
use crate::link_message::LinkMessage;
use crate::ota::WifiInterface;
use crate::radio::MacAddress;
use crate::radio_device_mock::RadioDevice;
use crate::status::StatusRegistry;
use crate::{DeviceInfo, LinkConfig};

/// The mock time driver is process-global; tests that read or advance the
/// clock serialise on this lock so parallel test threads cannot disturb each
/// other's timelines.
static TIME_LOCK: Mutex<()> = Mutex::new(());

pub(crate) fn time_guard() -> MutexGuard<'static, ()> {
    TIME_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn advance(millis: u64) {
    embassy_time::MockDriver::get().advance(embassy_time::Duration::from_millis(millis));
}

pub(crate) const TRACKER_MAC: MacAddress = MacAddress::new([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);
pub(crate) const GATEWAY_MAC: MacAddress = MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
pub(crate) const SECURITY: [u8; 8] = [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7];

pub(crate) type TestCore = LinkCore<RadioDevice, MemoryCredentialStore, MockWifi, StatusRegistry>;

pub(crate) fn device_info() -> DeviceInfo {
    DeviceInfo {
        board_id: 7,
        mcu_id: 2,
        firmware_version: (1, 4, 2),
        firmware_date: crate::telemetry::firmware_date_code(2026, 8, 2),
    }
}

pub(crate) fn new_core() -> TestCore {
    LinkCore::new(
        RadioDevice::new(TRACKER_MAC),
        MemoryCredentialStore::new(),
        MockWifi::new(),
        StatusRegistry::new(),
        LinkConfig {
            device_info: device_info(),
            rng_seed: 0x5EED_1234,
        },
    )
}

pub(crate) fn new_core_with_store() -> TestCore {
    LinkCore::new(
        RadioDevice::new(TRACKER_MAC),
        MemoryCredentialStore::with_binding(GATEWAY_MAC, SECURITY),
        MockWifi::new(),
        StatusRegistry::new(),
        LinkConfig {
            device_info: device_info(),
            rng_seed: 0x5EED_5678,
        },
    )
}

pub(crate) fn encode(message: &LinkMessage) -> Vec<u8> {
    let mut buffer = [0u8; 256];
    let length = message.encode(&mut buffer).expect("test frame must encode");
    buffer[..length].to_vec()
}

/// Scriptable WiFi interface standing in for the platform's station-mode
/// stack during OTA tests.
pub(crate) struct MockWifi {
    pub join_request: Option<(String, String)>,
    pub joined: bool,
    pub udp_sent: Vec<([u8; 4], u16, Vec<u8>)>,
    pub disconnects: u32,
}

impl MockWifi {
    pub(crate) fn new() -> Self {
        MockWifi {
            join_request: None,
            joined: false,
            udp_sent: Vec::new(),
            disconnects: 0,
        }
    }
}

impl WifiInterface for MockWifi {
    fn begin_join(&mut self, ssid: &str, passphrase: &str) {
        self.join_request = Some((ssid.to_string(), passphrase.to_string()));
    }

    fn is_joined(&self) -> bool {
        self.joined
    }

    fn send_udp(&mut self, ip: [u8; 4], port: u16, payload: &[u8]) -> Result<(), ()> {
        self.udp_sent.push((ip, port, payload.to_vec()));
        Ok(())
    }

    fn disconnect(&mut self) {
        self.joined = false;
        self.disconnects += 1;
    }
}
