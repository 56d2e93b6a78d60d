#![cfg_attr(not(feature = "std"), no_std)]

//! Wireless tracker link core.
//!
//! A peer-to-peer, connectionless-datagram protocol stack for small sensor
//! devices: discover a nearby gateway across RF channels, pair with it using
//! a shared secret, keep the link alive with bidirectional heartbeats, stream
//! compact fixed-point telemetry, and hand the device over to a firmware
//! updater on an authenticated command.
//!
//! The crate is platform-agnostic: the embedding firmware supplies the radio
//! driver, the credential store, the station-mode WiFi control used for the
//! update handoff, and a status sink, then owns a [`LinkCore`] and drives it
//! (directly, or through [`LinkRunner`]) from its executor.

#[cfg(all(feature = "std", feature = "embedded"))]
compile_error!("The std and embedded features are mutually exclusive");

pub mod credentials;
pub mod link_core;
pub mod link_message;
pub mod ota;
pub mod radio;
pub mod status;
pub mod telemetry;

mod channel_plan;
mod heartbeat;
mod send_queue;

#[cfg(any(test, feature = "radio-device-mock"))]
pub mod radio_device_mock;

#[cfg(all(test, feature = "std"))]
mod test_support;

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Ticker};

pub use credentials::{CredentialStore, MemoryCredentialStore};
pub use link_core::{LinkCore, LinkState};
pub use link_message::{LinkMessage, MessageType};
pub use ota::{OtaJoinCredentials, WifiInterface};
pub use radio::{MacAddress, RadioDriver, SendError};
pub use status::{StatusFlag, StatusRegistry, StatusSink};
pub use telemetry::{MagStatus, SensorState, TelemetryHub, firmware_date_code, firmware_date_parts};

// Hardware dependent constants, sized for the ESP-NOW class of datagram
// services this stack targets.
pub const MAX_DATAGRAM_SIZE: usize = 250;
pub const MAX_SENSORS: usize = 8;
pub const RX_DATAGRAM_QUEUE_SIZE: usize = 16;

pub const DEFAULT_TRACKER_RATE_HZ: u32 = 100;

/// Upkeep cadence of [`LinkRunner`]: 200 Hz keeps the send-queue spacing and
/// the protocol timers honest.
const UPKEEP_INTERVAL: Duration = Duration::from_millis(5);

/// A raw datagram as delivered by the radio's receive callback.
///
/// The callback context constructs one of these and `try_send`s it into the
/// RX queue; it must not parse, block or allocate there. Everything else
/// happens on the upkeep context.
pub struct ReceivedDatagram {
    pub source: MacAddress,
    pub length: usize,
    pub data: [u8; MAX_DATAGRAM_SIZE],
}

impl ReceivedDatagram {
    pub fn new(source: MacAddress, bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > MAX_DATAGRAM_SIZE {
            return None;
        }
        let mut data = [0u8; MAX_DATAGRAM_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(ReceivedDatagram {
            source,
            length: bytes.len(),
            data,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.length]
    }
}

pub type RxDatagramQueue = Channel<CriticalSectionRawMutex, ReceivedDatagram, RX_DATAGRAM_QUEUE_SIZE>;
pub type RxDatagramSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, ReceivedDatagram, RX_DATAGRAM_QUEUE_SIZE>;
pub type RxDatagramReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, ReceivedDatagram, RX_DATAGRAM_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static RX_DATAGRAM_QUEUE: RxDatagramQueue = Channel::new();

/// The statically allocated RX queue. The firmware hands its sender to the
/// radio receive callback and its receiver to the [`LinkRunner`].
#[cfg(feature = "embedded")]
pub fn rx_datagram_queue() -> &'static RxDatagramQueue {
    &RX_DATAGRAM_QUEUE
}

/// Host-side equivalent of [`rx_datagram_queue`], leaked to get the
/// `'static` lifetime the channel endpoints need.
#[cfg(feature = "std")]
pub fn rx_datagram_queue_std() -> &'static RxDatagramQueue {
    Box::leak(Box::new(Channel::new()))
}

/// Identity block sent in device-info telemetry frames.
#[derive(Clone, Copy)]
pub struct DeviceInfo {
    pub board_id: u8,
    pub mcu_id: u8,
    pub firmware_version: (u8, u8, u8),
    /// Packed build date, see [`firmware_date_code`].
    pub firmware_date: u16,
}

impl DeviceInfo {
    /// Build-derived identity: the firmware version comes from the package
    /// version, the build date from the build script.
    pub fn from_build(board_id: u8, mcu_id: u8) -> Self {
        DeviceInfo {
            board_id,
            mcu_id,
            firmware_version: (
                parse_or_zero(env!("CARGO_PKG_VERSION_MAJOR")),
                parse_or_zero(env!("CARGO_PKG_VERSION_MINOR")),
                parse_or_zero(env!("CARGO_PKG_VERSION_PATCH")),
            ),
            firmware_date: env!("TRACKER_BUILD_DATE_CODE").parse().unwrap_or(0),
        }
    }
}

fn parse_or_zero(value: &str) -> u8 {
    value.parse().unwrap_or(0)
}

/// Configuration handed to [`LinkCore::new`].
pub struct LinkConfig {
    pub device_info: DeviceInfo,
    /// Seed for the heartbeat sequence generator. Derive from a hardware
    /// entropy source where available.
    pub rng_seed: u64,
}

/// Drives a [`LinkCore`] from an async executor: one 200 Hz upkeep ticker,
/// interleaved with datagrams drained from the RX queue.
///
/// Executor tasks cannot be generic, so the firmware wraps [`run`] in its own
/// task for its concrete driver types:
///
/// ```rust,ignore
/// #[embassy_executor::task]
/// async fn link_task(runner: LinkRunner<Radio, NvsStore, Wifi, StatusManager>) -> ! {
///     runner.run().await
/// }
/// ```
///
/// [`run`]: LinkRunner::run
pub struct LinkRunner<R, C, W, S> {
    core: LinkCore<R, C, W, S>,
    rx: RxDatagramReceiver,
}

impl<R, C, W, S> LinkRunner<R, C, W, S>
where
    R: RadioDriver,
    C: CredentialStore,
    W: WifiInterface,
    S: StatusSink,
{
    pub fn new(core: LinkCore<R, C, W, S>, rx: RxDatagramReceiver) -> Self {
        LinkRunner { core, rx }
    }

    pub fn core(&self) -> &LinkCore<R, C, W, S> {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut LinkCore<R, C, W, S> {
        &mut self.core
    }

    pub async fn run(mut self) -> ! {
        self.core.setup();
        let mut ticker = Ticker::every(UPKEEP_INTERVAL);
        loop {
            match select(self.rx.receive(), ticker.next()).await {
                Either::First(datagram) => {
                    self.core.handle_datagram(datagram.source, datagram.bytes());
                }
                Either::Second(()) => {
                    self.core.upkeep();
                }
            }
        }
    }
}
