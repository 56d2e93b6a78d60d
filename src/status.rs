//! Named status indicators surfaced to the board's LED/status layer.

/// One bit per indicator; the packed byte travels in the status telemetry
/// frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StatusFlag {
    Loading,
    LowBattery,
    ImuError,
    WifiConnecting,
    ServerConnecting,
    PairingMode,
    Updating,
}

impl StatusFlag {
    pub const fn bit(self) -> u8 {
        match self {
            StatusFlag::Loading => 1 << 0,
            StatusFlag::LowBattery => 1 << 1,
            StatusFlag::ImuError => 1 << 2,
            StatusFlag::WifiConnecting => 1 << 3,
            StatusFlag::ServerConnecting => 1 << 4,
            StatusFlag::PairingMode => 1 << 5,
            StatusFlag::Updating => 1 << 6,
        }
    }
}

/// Receiver for status changes raised by the link core.
pub trait StatusSink {
    fn set_status(&mut self, flag: StatusFlag, active: bool);

    /// Packed byte of all currently active indicators.
    fn snapshot(&self) -> u8;
}

/// Plain bitmask implementation of [`StatusSink`].
#[derive(Default)]
pub struct StatusRegistry {
    bits: u8,
}

impl StatusRegistry {
    pub const fn new() -> Self {
        StatusRegistry { bits: 0 }
    }

    pub fn is_set(&self, flag: StatusFlag) -> bool {
        self.bits & flag.bit() != 0
    }
}

impl StatusSink for StatusRegistry {
    fn set_status(&mut self, flag: StatusFlag, active: bool) {
        if active {
            self.bits |= flag.bit();
        } else {
            self.bits &= !flag.bit();
        }
    }

    fn snapshot(&self) -> u8 {
        self.bits
    }
}
