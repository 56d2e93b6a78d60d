//! Bidirectional heartbeat with independent echo and response roles.
//!
//! Outbound: once per second the tracker emits an echo with a random
//! sequence number and waits for the matching response; five consecutive
//! unanswered cycles declare the link lost. Inbound: echoes from the gateway
//! are answered with the mirrored sequence number, sent twice for loss
//! resilience, with duplicate echoes suppressed by sequence.

use embassy_time::{Duration, Instant};
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const MAX_MISSED_HEARTBEATS: u8 = 5;

/// What the 1 Hz heartbeat cycle asks the caller to do.
pub(crate) enum HeartbeatTick {
    Idle,
    /// Emit a heartbeat echo with this sequence number.
    SendEcho(u16),
    /// Five responses missed; tear the link down.
    LinkLost,
}

pub(crate) struct HeartbeatEngine {
    rng: WyRand,
    awaiting_response: bool,
    sequence: u16,
    sent_at: Instant,
    missed: u8,
    last_cycle: Option<Instant>,
    last_echo_sequence: Option<u16>,
}

impl HeartbeatEngine {
    pub(crate) fn new(rng_seed: u64) -> Self {
        HeartbeatEngine {
            rng: WyRand::seed_from_u64(rng_seed),
            awaiting_response: false,
            sequence: 0,
            sent_at: Instant::now(),
            missed: 0,
            last_cycle: None,
            last_echo_sequence: None,
        }
    }

    /// Forget all in-flight state. Called when a connection is (re)established.
    pub(crate) fn reset(&mut self) {
        self.awaiting_response = false;
        self.missed = 0;
        self.last_cycle = None;
        self.last_echo_sequence = None;
    }

    /// Run the once-per-second cycle. The first call after a reset is due
    /// immediately.
    pub(crate) fn poll(&mut self, now: Instant) -> HeartbeatTick {
        let due = self.last_cycle.map_or(true, |last| now - last >= HEARTBEAT_INTERVAL);
        if !due {
            return HeartbeatTick::Idle;
        }

        if self.awaiting_response {
            self.missed += 1;
            if self.missed >= MAX_MISSED_HEARTBEATS {
                return HeartbeatTick::LinkLost;
            }
            self.awaiting_response = false;
        }

        self.sequence = self.rng.next_u32() as u16;
        self.awaiting_response = true;
        self.sent_at = now;
        self.last_cycle = Some(now);
        HeartbeatTick::SendEcho(self.sequence)
    }

    /// A heartbeat response arrived. Returns the round-trip latency when the
    /// sequence matches the outstanding echo, `None` otherwise (mismatches
    /// neither clear the awaiting flag nor reset the miss counter).
    pub(crate) fn on_response(&mut self, sequence: u16, now: Instant) -> Option<Duration> {
        if !self.awaiting_response || sequence != self.sequence {
            return None;
        }
        self.awaiting_response = false;
        self.missed = 0;
        Some(now - self.sent_at)
    }

    /// A heartbeat echo arrived from the gateway. Returns `true` when it is
    /// fresh and must be answered, `false` for a duplicate.
    pub(crate) fn on_echo(&mut self, sequence: u16) -> bool {
        if self.last_echo_sequence == Some(sequence) {
            return false;
        }
        self.last_echo_sequence = Some(sequence);
        true
    }

    pub(crate) fn missed(&self) -> u8 {
        self.missed
    }

    #[cfg(test)]
    pub(crate) fn awaiting_response(&self) -> bool {
        self.awaiting_response
    }

    #[cfg(test)]
    pub(crate) fn sequence(&self) -> u16 {
        self.sequence
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use embassy_time::MockDriver;

    fn advance(millis: u64) {
        MockDriver::get().advance(Duration::from_millis(millis));
    }

    #[test]
    fn first_poll_sends_immediately_then_paces_at_one_second() {
        let _time = crate::test_support::time_guard();
        let mut hb = HeartbeatEngine::new(1);
        assert!(matches!(hb.poll(Instant::now()), HeartbeatTick::SendEcho(_)));
        assert!(matches!(hb.poll(Instant::now()), HeartbeatTick::Idle));
        advance(1_000);
        assert!(matches!(hb.poll(Instant::now()), HeartbeatTick::SendEcho(_)));
    }

    #[test]
    fn matched_response_clears_awaiting_and_misses() {
        let _time = crate::test_support::time_guard();
        let mut hb = HeartbeatEngine::new(2);
        assert!(matches!(hb.poll(Instant::now()), HeartbeatTick::SendEcho(_)));
        advance(1_000);
        assert!(matches!(hb.poll(Instant::now()), HeartbeatTick::SendEcho(_)));
        assert_eq!(hb.missed(), 1);

        let seq = hb.sequence();
        advance(20);
        let latency = hb.on_response(seq, Instant::now()).expect("matched sequence");
        assert_eq!(latency, Duration::from_millis(20));
        assert_eq!(hb.missed(), 0);
        assert!(!hb.awaiting_response());
    }

    #[test]
    fn mismatched_response_changes_nothing() {
        let _time = crate::test_support::time_guard();
        let mut hb = HeartbeatEngine::new(3);
        let HeartbeatTick::SendEcho(seq) = hb.poll(Instant::now()) else {
            panic!("expected echo");
        };
        assert!(hb.on_response(seq.wrapping_add(1), Instant::now()).is_none());
        assert!(hb.awaiting_response());
    }

    #[test]
    fn five_missed_cycles_declare_the_link_lost() {
        let _time = crate::test_support::time_guard();
        let mut hb = HeartbeatEngine::new(4);
        assert!(matches!(hb.poll(Instant::now()), HeartbeatTick::SendEcho(_)));
        for _ in 0..4 {
            advance(1_000);
            assert!(matches!(hb.poll(Instant::now()), HeartbeatTick::SendEcho(_)));
        }
        assert_eq!(hb.missed(), 4);
        advance(1_000);
        assert!(matches!(hb.poll(Instant::now()), HeartbeatTick::LinkLost));
    }

    #[test]
    fn duplicate_echo_is_suppressed_once() {
        let _time = crate::test_support::time_guard();
        let mut hb = HeartbeatEngine::new(5);
        assert!(hb.on_echo(0));
        assert!(!hb.on_echo(0));
        assert!(hb.on_echo(1));
        assert!(!hb.on_echo(1));
        assert!(hb.on_echo(0));
    }
}
