//! # Telemetry Module
//!
//! Builds the 16-byte binary telemetry frames carried inside `TrackerData`
//! wire frames, and schedules their emission while connected.
//!
//! ## Frame catalogue
//!
//! | Type | Content | Cadence |
//! |------|---------|---------|
//! | 0 | Device info: battery, voltage, temperature, board/MCU/IMU ids, firmware date+version | 250 ms |
//! | 1 | Orientation + acceleration, fixed point | rate-limited to the configured tracker rate, fresh data only |
//! | 3 | Status: gateway link state and indicator bits | 1 s |
//! | 4 | Orientation + magnetometer, fixed point | 200 ms, magnetometer-equipped primary only |
//!
//! ## Fixed-point packing
//!
//! Quaternion components scale by 32767 (±1 range), acceleration by 127
//! (±256 m/s²), magnetometer by 1023 (±32 G). All conversions saturate.
//!
//! ## Sensor slots
//!
//! Producers (the IMU drivers) push readings into the [`TelemetryHub`]'s
//! slots; the scheduler picks a primary slot (sticky while healthy, else the
//! lowest-index healthy one) and consumes its fresh flag with every type-1
//! frame.

use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::{DeviceInfo, MAX_SENSORS};

pub(crate) const TELEMETRY_FRAME_SIZE: usize = 16;

const DEVICE_INFO_INTERVAL: Duration = Duration::from_millis(250);
const STATUS_INTERVAL: Duration = Duration::from_millis(1000);
const QUAT_MAG_INTERVAL: Duration = Duration::from_millis(200);

/// Health of a sensor slot as reported by its driver.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SensorState {
    Ok,
    Offline,
    Error,
}

/// Magnetometer presence for the device-info frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MagStatus {
    NotSupported,
    Disabled,
    Enabled,
}

impl MagStatus {
    pub(crate) const fn encode(self) -> u8 {
        match self {
            MagStatus::NotSupported => 0,
            MagStatus::Disabled => 1,
            MagStatus::Enabled => 2,
        }
    }
}

/// Quaternion as ±1-range fixed point.
pub(crate) fn to_fixed_15(value: f32) -> i16 {
    (value * 32767.0) as i16
}

/// Acceleration as ±256 m/s² fixed point.
pub(crate) fn to_fixed_7(value: f32) -> i16 {
    (value * 127.0) as i16
}

/// Magnetometer as ±32 G fixed point.
pub(crate) fn to_fixed_10(value: f32) -> i16 {
    (value * 1023.0) as i16
}

/// Battery level byte: 0 when no battery is present, otherwise the
/// availability bit plus the percentage clamped to 100.
pub(crate) fn encode_battery_level(level: f32, present: bool) -> u8 {
    if !present {
        return 0;
    }
    let percentage = ((level * 100.0 + 0.5) as i32).clamp(0, 100) as u8;
    0x80 | percentage
}

/// Battery voltage in 10 mV steps offset by 2.45 V (range 2.45..5.00 V).
pub(crate) fn encode_battery_voltage(voltage: f32) -> u8 {
    let millivolts = (voltage * 1000.0 + 0.5) as i32;
    (millivolts / 10 - 245).clamp(0, 255) as u8
}

/// Temperature in 0.5 °C steps around 25 °C. 0 is reserved for "no data";
/// readings clamp into 1..=255 (-38.5 °C to +88.5 °C).
pub(crate) fn encode_temperature(temperature: Option<f32>) -> u8 {
    match temperature {
        None => 0,
        Some(t) => (((t - 25.0) * 2.0 + 128.5) as i32).clamp(1, 255) as u8,
    }
}

/// Pack a build date into the device-info wire format:
/// `((year-2020) & 0x7F) << 9 | (month & 0xF) << 5 | (day & 0x1F)`.
pub fn firmware_date_code(year: u16, month: u8, day: u8) -> u16 {
    ((year.saturating_sub(2020) & 0x7F) << 9) | ((month as u16 & 0x0F) << 5) | (day as u16 & 0x1F)
}

/// Inverse of [`firmware_date_code`].
pub fn firmware_date_parts(code: u16) -> (u16, u8, u8) {
    (2020 + ((code >> 9) & 0x7F), ((code >> 5) & 0x0F) as u8, (code & 0x1F) as u8)
}

#[derive(Clone, Copy)]
struct TelemetrySlot {
    state: SensorState,
    type_id: u8,
    mag: MagStatus,
    quat: [f32; 4],
    accel: [f32; 3],
    mag_reading: [f32; 3],
    temperature: f32,
    has_quat: bool,
    has_accel: bool,
    has_temp: bool,
    has_mag_reading: bool,
    fresh: bool,
}

impl TelemetrySlot {
    const fn empty() -> Self {
        TelemetrySlot {
            state: SensorState::Offline,
            type_id: 0,
            mag: MagStatus::NotSupported,
            quat: [0.0, 0.0, 0.0, 1.0],
            accel: [0.0; 3],
            mag_reading: [0.0; 3],
            temperature: 0.0,
            has_quat: false,
            has_accel: false,
            has_temp: false,
            has_mag_reading: false,
            fresh: false,
        }
    }
}

/// Per-slot sensor cache plus the emission scheduler.
pub struct TelemetryHub {
    slots: [TelemetrySlot; MAX_SENSORS],
    primary: Option<usize>,
    battery_voltage: f32,
    battery_level: f32,
    last_device_info: Option<Instant>,
    last_status: Option<Instant>,
    last_quat_accel: Option<Instant>,
    last_quat_mag: Option<Instant>,
}

impl TelemetryHub {
    pub(crate) fn new() -> Self {
        TelemetryHub {
            slots: [TelemetrySlot::empty(); MAX_SENSORS],
            primary: None,
            battery_voltage: 0.0,
            battery_level: 0.0,
            last_device_info: None,
            last_status: None,
            last_quat_accel: None,
            last_quat_mag: None,
        }
    }

    /// Report a slot's health, IMU type and magnetometer fit.
    pub fn set_slot_state(&mut self, slot: usize, state: SensorState, type_id: u8, mag: MagStatus) {
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.state = state;
            entry.type_id = type_id;
            entry.mag = mag;
        }
    }

    /// New orientation reading; marks the slot fresh for the next type-1
    /// frame. Quaternion order is `[x, y, z, w]`.
    pub fn update_rotation(&mut self, slot: usize, quat: [f32; 4]) {
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.quat = quat;
            entry.has_quat = true;
            entry.fresh = true;
        }
    }

    pub fn update_acceleration(&mut self, slot: usize, accel: [f32; 3]) {
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.accel = accel;
            entry.has_accel = true;
        }
    }

    pub fn update_temperature(&mut self, slot: usize, temperature: f32) {
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.temperature = temperature;
            entry.has_temp = true;
        }
    }

    pub fn update_magnetometer(&mut self, slot: usize, reading: [f32; 3]) {
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.mag_reading = reading;
            entry.has_mag_reading = true;
        }
    }

    pub fn update_battery(&mut self, voltage: f32, level: f32) {
        self.battery_voltage = voltage;
        self.battery_level = level;
    }

    pub fn primary_slot(&self) -> Option<usize> {
        self.primary
    }

    /// Keep the current primary while it reports healthy, otherwise fall
    /// back to the lowest-index healthy slot.
    fn select_primary(&mut self) -> Option<usize> {
        if let Some(current) = self.primary {
            if self.slots[current].state == SensorState::Ok {
                return Some(current);
            }
        }
        self.primary = self.slots.iter().position(|s| s.state == SensorState::Ok);
        self.primary
    }

    /// Collect the frames due this tick. Without a healthy sensor no
    /// telemetry is emitted at all.
    pub(crate) fn poll(
        &mut self,
        now: Instant,
        tracker_id: u8,
        tracker_rate_hz: u32,
        send_backoff: bool,
        server_connected: bool,
        status_bits: u8,
        info: &DeviceInfo,
    ) -> Vec<[u8; TELEMETRY_FRAME_SIZE], 4> {
        let mut frames = Vec::new();

        let Some(primary) = self.select_primary() else {
            return frames;
        };

        if due(self.last_device_info, DEVICE_INFO_INTERVAL, now) {
            self.last_device_info = Some(now);
            let _ = frames.push(self.build_device_info(tracker_id, info));
        }

        if due(self.last_status, STATUS_INTERVAL, now) {
            self.last_status = Some(now);
            let _ = frames.push(build_status(tracker_id, server_connected, status_bits));
        }

        let min_interval = Duration::from_micros(1_000_000 / tracker_rate_hz.max(1) as u64);
        let slot = &mut self.slots[primary];
        if slot.fresh
            && slot.has_quat
            && slot.has_accel
            && due(self.last_quat_accel, min_interval, now)
            && !send_backoff
        {
            self.last_quat_accel = Some(now);
            slot.fresh = false;
            let _ = frames.push(build_quat_accel(tracker_id, slot.quat, slot.accel));
        }

        let slot = &self.slots[primary];
        if slot.mag != MagStatus::NotSupported
            && slot.has_mag_reading
            && due(self.last_quat_mag, QUAT_MAG_INTERVAL, now)
        {
            self.last_quat_mag = Some(now);
            let _ = frames.push(build_quat_mag(tracker_id, slot.quat, slot.mag_reading));
        }

        frames
    }

    fn build_device_info(&self, tracker_id: u8, info: &DeviceInfo) -> [u8; TELEMETRY_FRAME_SIZE] {
        // Identity data always comes from slot 0, the board's built-in IMU.
        let slot0 = &self.slots[0];
        let battery_present = self.battery_voltage > 0.0;

        let mut frame = [0u8; TELEMETRY_FRAME_SIZE];
        frame[0] = 0;
        frame[1] = tracker_id;
        frame[2] = encode_battery_level(self.battery_level, battery_present);
        frame[3] = encode_battery_voltage(self.battery_voltage);
        frame[4] = encode_temperature(slot0.has_temp.then_some(slot0.temperature));
        frame[5] = info.board_id;
        frame[6] = info.mcu_id;
        frame[7] = 0; // reserved
        frame[8] = slot0.type_id;
        frame[9] = slot0.mag.encode();
        frame[10..12].copy_from_slice(&info.firmware_date.to_le_bytes());
        frame[12] = info.firmware_version.0;
        frame[13] = info.firmware_version.1;
        frame[14] = info.firmware_version.2;
        frame[15] = 0; // rssi, filled in by the receiver
        frame
    }
}

fn due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    last.map_or(true, |t| now - t >= interval)
}

fn build_status(tracker_id: u8, server_connected: bool, status_bits: u8) -> [u8; TELEMETRY_FRAME_SIZE] {
    let mut frame = [0u8; TELEMETRY_FRAME_SIZE];
    frame[0] = 3;
    frame[1] = tracker_id;
    frame[2] = server_connected as u8;
    frame[3] = status_bits;
    frame
}

fn build_quat_accel(tracker_id: u8, quat: [f32; 4], accel: [f32; 3]) -> [u8; TELEMETRY_FRAME_SIZE] {
    let mut frame = [0u8; TELEMETRY_FRAME_SIZE];
    frame[0] = 1;
    frame[1] = tracker_id;
    for (i, q) in quat.iter().enumerate() {
        frame[2 + i * 2..4 + i * 2].copy_from_slice(&to_fixed_15(*q).to_le_bytes());
    }
    for (i, a) in accel.iter().enumerate() {
        frame[10 + i * 2..12 + i * 2].copy_from_slice(&to_fixed_7(*a).to_le_bytes());
    }
    frame
}

fn build_quat_mag(tracker_id: u8, quat: [f32; 4], mag: [f32; 3]) -> [u8; TELEMETRY_FRAME_SIZE] {
    let mut frame = [0u8; TELEMETRY_FRAME_SIZE];
    frame[0] = 4;
    frame[1] = tracker_id;
    for (i, q) in quat.iter().enumerate() {
        frame[2 + i * 2..4 + i * 2].copy_from_slice(&to_fixed_15(*q).to_le_bytes());
    }
    for (i, m) in mag.iter().enumerate() {
        frame[10 + i * 2..12 + i * 2].copy_from_slice(&to_fixed_10(*m).to_le_bytes());
    }
    frame
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use embassy_time::MockDriver;

    fn advance(millis: u64) {
        MockDriver::get().advance(Duration::from_millis(millis));
    }

    fn info() -> DeviceInfo {
        DeviceInfo {
            board_id: 7,
            mcu_id: 2,
            firmware_version: (1, 4, 2),
            firmware_date: firmware_date_code(2026, 8, 2),
        }
    }

    fn hub_with_healthy_sensor() -> TelemetryHub {
        let mut hub = TelemetryHub::new();
        hub.set_slot_state(0, SensorState::Ok, 11, MagStatus::NotSupported);
        hub
    }

    #[test]
    fn fixed_point_saturates_at_the_limits() {
        assert_eq!(to_fixed_15(1.0), 32767);
        assert_eq!(to_fixed_15(-1.0), -32767);
        assert_eq!(to_fixed_15(2.5), 32767);
        assert_eq!(to_fixed_15(-2.5), -32767);
        assert_eq!(to_fixed_15(0.0), 0);

        assert_eq!(to_fixed_7(256.0), 32512);
        assert_eq!(to_fixed_7(1000.0), 32767);
        assert_eq!(to_fixed_7(-1000.0), -32768);

        assert_eq!(to_fixed_10(32.0), 32736);
        assert_eq!(to_fixed_10(100.0), 32767);
        assert_eq!(to_fixed_10(-100.0), -32768);
    }

    #[test]
    fn battery_encoding_sets_presence_bit() {
        assert_eq!(encode_battery_level(0.5, false), 0);
        assert_eq!(encode_battery_level(0.5, true), 0x80 | 50);
        assert_eq!(encode_battery_level(1.5, true), 0x80 | 100);
        assert_eq!(encode_battery_level(0.0, true), 0x80);
    }

    #[test]
    fn voltage_encoding_clips_to_range() {
        assert_eq!(encode_battery_voltage(2.45), 0);
        assert_eq!(encode_battery_voltage(1.0), 0);
        assert_eq!(encode_battery_voltage(3.70), 125);
        assert_eq!(encode_battery_voltage(5.00), 255);
        assert_eq!(encode_battery_voltage(9.99), 255);
    }

    #[test]
    fn temperature_encoding_reserves_zero_and_is_monotonic() {
        assert_eq!(encode_temperature(None), 0);
        assert_eq!(encode_temperature(Some(-100.0)), 1);
        assert_eq!(encode_temperature(Some(25.0)), 128);
        assert_eq!(encode_temperature(Some(200.0)), 255);

        let mut previous = 0u8;
        for i in 0..200 {
            let t = -40.0 + i as f32 * 0.65;
            let encoded = encode_temperature(Some(t));
            assert!(encoded >= previous, "temperature encoding must be monotonic");
            previous = encoded;
        }
    }

    #[test]
    fn firmware_date_roundtrips_over_the_full_range() {
        for year in [2020u16, 2021, 2077, 2147] {
            for month in 1..=12u8 {
                for day in [1u8, 15, 28, 31] {
                    let code = firmware_date_code(year, month, day);
                    assert_eq!(firmware_date_parts(code), (year, month, day));
                }
            }
        }
    }

    #[test]
    fn no_healthy_sensor_means_no_telemetry() {
        let _time = crate::test_support::time_guard();
        let mut hub = TelemetryHub::new();
        let frames = hub.poll(Instant::now(), 1, 100, false, true, 0, &info());
        assert!(frames.is_empty());
    }

    #[test]
    fn device_info_and_status_cadences() {
        let _time = crate::test_support::time_guard();
        let mut hub = hub_with_healthy_sensor();
        hub.update_battery(3.7, 0.82);
        hub.update_temperature(0, 31.0);

        let frames = hub.poll(Instant::now(), 3, 100, false, true, 0b100000, &info());
        assert_eq!(frames.len(), 2);
        let device_info = frames[0];
        assert_eq!(device_info[0], 0);
        assert_eq!(device_info[1], 3);
        assert_eq!(device_info[2], 0x80 | 82);
        assert_eq!(device_info[3], 125);
        assert_eq!(device_info[4], encode_temperature(Some(31.0)));
        assert_eq!(device_info[5], 7);
        assert_eq!(device_info[6], 2);
        assert_eq!(device_info[8], 11);
        assert_eq!(
            u16::from_le_bytes([device_info[10], device_info[11]]),
            firmware_date_code(2026, 8, 2)
        );
        assert_eq!(&device_info[12..15], &[1, 4, 2]);

        let status = frames[1];
        assert_eq!(status[0], 3);
        assert_eq!(status[2], 1);
        assert_eq!(status[3], 0b100000);
        assert_eq!(&status[4..15], &[0u8; 11]);

        // 250 ms later only the device-info frame is due again.
        advance(250);
        let frames = hub.poll(Instant::now(), 3, 100, false, true, 0, &info());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], 0);
    }

    #[test]
    fn quat_accel_consumes_the_fresh_flag_and_respects_rate() {
        let _time = crate::test_support::time_guard();
        let mut hub = hub_with_healthy_sensor();
        hub.update_rotation(0, [0.1, 0.2, 0.3, 0.9]);
        hub.update_acceleration(0, [0.0, 0.0, 9.8]);

        // 4 Hz tracker rate: one type-1 frame per 250 ms at most.
        let frames = hub.poll(Instant::now(), 1, 4, false, true, 0, &info());
        let quat_frame = frames.iter().find(|f| f[0] == 1).expect("type-1 frame expected");
        assert_eq!(
            i16::from_le_bytes([quat_frame[2], quat_frame[3]]),
            to_fixed_15(0.1)
        );
        assert_eq!(
            i16::from_le_bytes([quat_frame[14], quat_frame[15]]),
            to_fixed_7(9.8)
        );

        // Fresh flag consumed: no further type-1 frames without new data.
        advance(100);
        let frames = hub.poll(Instant::now(), 1, 4, false, true, 0, &info());
        assert!(frames.iter().all(|f| f[0] != 1));

        // New data inside the rate window is held back.
        hub.update_rotation(0, [0.0, 0.0, 0.0, 1.0]);
        advance(2);
        let frames = hub.poll(Instant::now(), 1, 4, false, true, 0, &info());
        assert!(frames.iter().all(|f| f[0] != 1));
        advance(148);
        let frames = hub.poll(Instant::now(), 1, 4, false, true, 0, &info());
        assert!(frames.iter().any(|f| f[0] == 1));
    }

    #[test]
    fn send_backoff_holds_quat_accel_frames() {
        let _time = crate::test_support::time_guard();
        let mut hub = hub_with_healthy_sensor();
        hub.update_rotation(0, [0.0, 0.0, 0.0, 1.0]);
        hub.update_acceleration(0, [0.0, 0.0, 0.0]);
        let frames = hub.poll(Instant::now(), 1, 100, true, true, 0, &info());
        assert!(frames.iter().all(|f| f[0] != 1));
        // Still fresh afterwards.
        let frames = hub.poll(Instant::now(), 1, 100, false, true, 0, &info());
        assert!(frames.iter().any(|f| f[0] == 1));
    }

    #[test]
    fn quat_mag_requires_a_magnetometer() {
        let _time = crate::test_support::time_guard();
        let mut hub = hub_with_healthy_sensor();
        hub.update_magnetometer(0, [0.5, -0.25, 0.0]);
        let frames = hub.poll(Instant::now(), 1, 100, false, true, 0, &info());
        assert!(frames.iter().all(|f| f[0] != 4));

        hub.set_slot_state(0, SensorState::Ok, 11, MagStatus::Enabled);
        advance(200);
        let frames = hub.poll(Instant::now(), 1, 100, false, true, 0, &info());
        let mag_frame = frames.iter().find(|f| f[0] == 4).expect("type-4 frame expected");
        assert_eq!(
            i16::from_le_bytes([mag_frame[10], mag_frame[11]]),
            to_fixed_10(0.5)
        );
    }

    #[test]
    fn primary_selection_is_sticky_until_failure() {
        let _time = crate::test_support::time_guard();
        let mut hub = TelemetryHub::new();
        hub.set_slot_state(1, SensorState::Ok, 5, MagStatus::NotSupported);
        hub.set_slot_state(2, SensorState::Ok, 5, MagStatus::NotSupported);
        let _ = hub.poll(Instant::now(), 1, 100, false, true, 0, &info());
        assert_eq!(hub.primary_slot(), Some(1));

        // Slot 0 coming online later does not steal the primary.
        hub.set_slot_state(0, SensorState::Ok, 5, MagStatus::NotSupported);
        let _ = hub.poll(Instant::now(), 1, 100, false, true, 0, &info());
        assert_eq!(hub.primary_slot(), Some(1));

        hub.set_slot_state(1, SensorState::Error, 5, MagStatus::NotSupported);
        let _ = hub.poll(Instant::now(), 1, 100, false, true, 0, &info());
        assert_eq!(hub.primary_slot(), Some(0));
    }
}
