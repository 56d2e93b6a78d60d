//! Datagram radio abstraction.
//!
//! The link core drives the radio through the [`RadioDriver`] trait: send a
//! datagram to a peer, manage the peer table, and retune the channel. The
//! receive direction does not appear here; the platform's receive callback
//! hands datagrams to the RX queue in the crate root (see
//! [`ReceivedDatagram`](crate::ReceivedDatagram)).
//!
//! Note: Radio bring-up (station mode, protocol selection, PHY-rate limits)
//! is not part of this trait as it is highly platform-dependent. The driver
//! is expected to be initialized before the core is set up.

use core::fmt;

/// A 6-byte hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// The all-ones broadcast address.
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    /// The all-zero address, used for a cleared gateway binding.
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Outcome of a failed datagram send.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SendError {
    /// The radio's internal transmit buffer is full. Transient; the periodic
    /// resenders in the link core are the retry mechanism.
    BufferFull,
    /// Any other driver error, with the platform error code.
    Other(i32),
}

/// Connectionless datagram radio with a peer table and channel control.
///
/// Semantics expected from implementations:
/// - datagrams up to 250 bytes, delivered whole or not at all
/// - `send` is synchronous from the caller's viewpoint: the result reflects
///   acceptance by the radio, not delivery
/// - per-peer PHY-rate override supported when `use_default_rate` is false
pub trait RadioDriver {
    fn send(&mut self, peer: &MacAddress, data: &[u8]) -> Result<(), SendError>;

    /// Register a peer. `use_default_rate` keeps the radio's default PHY
    /// configuration; `false` applies the tuned link rate used for the
    /// gateway data path. Registering an existing peer is a no-op success.
    fn add_peer(&mut self, peer: &MacAddress, use_default_rate: bool) -> Result<(), i32>;

    fn has_peer(&self, peer: &MacAddress) -> bool;

    /// Remove a peer registration. Returns `true` when the peer is absent
    /// afterwards (including when it was never registered).
    fn delete_peer(&mut self, peer: &MacAddress) -> bool;

    fn set_channel(&mut self, channel: u8) -> Result<(), i32>;

    /// The channel the radio is tuned to right now. Single source of truth
    /// for the link core's channel bookkeeping.
    fn current_channel(&self) -> u8;

    fn local_mac(&self) -> MacAddress;
}
