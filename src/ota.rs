//! Firmware-update handoff.
//!
//! After a validated `EnterOta` command the tracker leaves the datagram link,
//! joins the gateway's update network as a station and announces itself with
//! a 26-byte UDP datagram (`"OTAREQUEST"` followed by the 16 raw auth bytes)
//! until the updater takes over. Join credentials live only for the duration
//! of the session and are never persisted.

use embassy_time::{Duration, Instant};
use log::{Level, log};

use crate::link_message::{EnterOta, c_str};

const JOIN_TIMEOUT: Duration = Duration::from_secs(30);
const UPDATE_START_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) const OTA_REQUEST_LEN: usize = 26;

/// Infrastructure-mode WiFi control used only for the update handoff.
pub trait WifiInterface {
    /// Start joining the given network. Non-blocking; progress is observed
    /// through [`is_joined`](WifiInterface::is_joined).
    fn begin_join(&mut self, ssid: &str, passphrase: &str);

    fn is_joined(&self) -> bool;

    fn send_udp(&mut self, ip: [u8; 4], port: u16, payload: &[u8]) -> Result<(), ()>;

    /// Drop the association and return the radio to its previous mode.
    fn disconnect(&mut self);
}

/// Credentials captured from a validated `EnterOta` frame.
pub struct OtaJoinCredentials {
    pub auth: [u8; 16],
    pub ip: [u8; 4],
    pub port: u32,
    pub ssid: [u8; 33],
    pub passphrase: [u8; 65],
}

impl OtaJoinCredentials {
    pub(crate) fn from_message(message: &EnterOta) -> Self {
        OtaJoinCredentials {
            auth: message.auth,
            ip: message.ip,
            port: message.port,
            ssid: message.ssid,
            passphrase: message.passphrase,
        }
    }

    pub fn ssid_str(&self) -> &str {
        c_str(&self.ssid)
    }

    pub fn passphrase_str(&self) -> &str {
        c_str(&self.passphrase)
    }
}

/// The update announcement datagram: `"OTAREQUEST"` plus the raw auth token.
pub(crate) fn ota_request_frame(auth: &[u8; 16]) -> [u8; OTA_REQUEST_LEN] {
    let mut frame = [0u8; OTA_REQUEST_LEN];
    frame[..10].copy_from_slice(b"OTAREQUEST");
    frame[10..].copy_from_slice(auth);
    frame
}

pub(crate) enum OtaPoll {
    Pending,
    /// The session timed out; the caller re-initialises the datagram link.
    Abort,
}

pub(crate) struct OtaSession {
    credentials: OtaJoinCredentials,
    started_at: Instant,
    join_requested: bool,
    joined_at: Option<Instant>,
}

impl OtaSession {
    pub(crate) fn new(credentials: OtaJoinCredentials, now: Instant) -> Self {
        OtaSession {
            credentials,
            started_at: now,
            join_requested: false,
            joined_at: None,
        }
    }

    pub(crate) fn poll<W: WifiInterface>(&mut self, now: Instant, wifi: &mut W) -> OtaPoll {
        if !self.join_requested {
            log!(Level::Info, "Joining update network {}", self.credentials.ssid_str());
            wifi.begin_join(self.credentials.ssid_str(), self.credentials.passphrase_str());
            self.join_requested = true;
            return OtaPoll::Pending;
        }

        if wifi.is_joined() {
            let joined_at = *self.joined_at.get_or_insert(now);
            if now - joined_at > UPDATE_START_TIMEOUT {
                log!(Level::Warn, "Timed out waiting for the update to start");
                wifi.disconnect();
                return OtaPoll::Abort;
            }
            let frame = ota_request_frame(&self.credentials.auth);
            if wifi
                .send_udp(self.credentials.ip, self.credentials.port as u16, &frame)
                .is_err()
            {
                log!(Level::Debug, "Update announcement datagram failed");
            }
            OtaPoll::Pending
        } else if now - self.started_at > JOIN_TIMEOUT {
            log!(Level::Warn, "Joining the update network timed out");
            wifi.disconnect();
            OtaPoll::Abort
        } else {
            OtaPoll::Pending
        }
    }
}
