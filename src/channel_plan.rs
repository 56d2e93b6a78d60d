//! Scan-list and single-step channel hopping.
//!
//! The datagram service is channel-local, so discovery walks an ordered scan
//! list while reconnection probes adjacent channels around the gateway's last
//! known value. An explicit set is used only when the gateway assigns a
//! channel (announcement, handshake response).

use log::{Level, log};

use crate::radio::RadioDriver;

#[cfg(feature = "allow-14-channels")]
pub(crate) const SCAN_CHANNELS: [u8; 5] = [2, 5, 8, 11, 14];
#[cfg(not(feature = "allow-14-channels"))]
pub(crate) const SCAN_CHANNELS: [u8; 4] = [2, 5, 8, 11];

#[cfg(feature = "allow-14-channels")]
pub(crate) const MAX_CHANNEL: u8 = 14;
#[cfg(not(feature = "allow-14-channels"))]
pub(crate) const MAX_CHANNEL: u8 = 11;

pub(crate) struct ChannelPlan {
    cursor: usize,
}

impl ChannelPlan {
    pub(crate) fn new() -> Self {
        ChannelPlan { cursor: 0 }
    }

    pub(crate) fn reset(&mut self) {
        self.cursor = 0;
    }

    pub(crate) fn first_channel(&self) -> u8 {
        SCAN_CHANNELS[0]
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    /// Move to the next scan-list entry and tune the radio to it.
    pub(crate) fn advance_scan<R: RadioDriver>(&mut self, radio: &mut R) {
        self.cursor = (self.cursor + 1) % SCAN_CHANNELS.len();
        self.set_channel(radio, SCAN_CHANNELS[self.cursor]);
    }

    /// Bias the next scan toward the entry before the current cursor. Used
    /// after a heartbeat loss, where the gateway was last heard near the
    /// previous scan position.
    pub(crate) fn retreat_cursor(&mut self) {
        self.cursor = self.cursor.checked_sub(1).unwrap_or(SCAN_CHANNELS.len() - 1);
    }

    /// Single-step the currently tuned channel, wrapping between 1 and the
    /// regulatory maximum.
    pub(crate) fn step_channel<R: RadioDriver>(&mut self, radio: &mut R, reverse: bool) {
        let current = radio.current_channel();
        let target = if reverse {
            if current <= 1 { MAX_CHANNEL } else { current - 1 }
        } else {
            if current == 0 || current >= MAX_CHANNEL { 1 } else { current + 1 }
        };
        self.set_channel(radio, target);
    }

    pub(crate) fn set_channel<R: RadioDriver>(&mut self, radio: &mut R, channel: u8) {
        if let Err(code) = radio.set_channel(channel) {
            log!(Level::Warn, "Failed to set channel {}: {}", channel, code);
        }
    }
}
