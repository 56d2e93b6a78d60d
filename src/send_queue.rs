//! # Send Queue Module
//!
//! Bounded FIFO of pending outbound datagrams with rate-limited draining.
//!
//! ## Drain strategy
//!
//! 1. **Inter-send spacing**: at most one attempted send per 5 ms window,
//!    measured with microsecond arithmetic. The drain runs on every upkeep
//!    tick and after every enqueue.
//! 2. **Lossy by design**: the head is popped regardless of the send result.
//!    Transient buffer-full and hard errors are not distinguished here; the
//!    periodic resenders in the state machine and the heartbeat engine are
//!    the retry mechanism. Retransmitting at this level would only stack
//!    stale telemetry.
//! 3. **Ephemeral peers**: a message can ask for its peer registration to be
//!    removed right after the attempt, so one-shot pairing traffic does not
//!    occupy the radio's peer table.
//! 4. **Telemetry backoff**: a failed telemetry send suppresses further
//!    telemetry for 500 ms to avoid tight error loops under RF congestion.

use embassy_time::{Duration, Instant};
use log::{Level, log};

use crate::radio::{MacAddress, RadioDriver, SendError};

pub(crate) const SEND_QUEUE_SIZE: usize = 64;
pub(crate) const MAX_PENDING_PAYLOAD: usize = 128;

const SEND_SPACING: Duration = Duration::from_micros(5_000);
const TELEMETRY_SEND_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Control,
    Heartbeat,
    Telemetry,
}

pub(crate) struct PendingMessage {
    peer: MacAddress,
    data: [u8; MAX_PENDING_PAYLOAD],
    length: usize,
    kind: MessageKind,
    ephemeral: bool,
    use_default_rate: bool,
}

/// Ring buffer of pending messages. Enqueue drops the new message when full.
pub(crate) struct SendQueue<const N: usize> {
    slots: [Option<PendingMessage>; N],
    head: usize,
    count: usize,
    last_attempt: Option<Instant>,
    last_heartbeat_sent: Option<Instant>,
    telemetry_backoff_until: Option<Instant>,
}

impl<const N: usize> SendQueue<N> {
    pub(crate) fn new() -> Self {
        SendQueue {
            slots: [const { None }; N],
            head: 0,
            count: 0,
            last_attempt: None,
            last_heartbeat_sent: None,
            telemetry_backoff_until: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Queue a message for sending. Returns `false` when the message is
    /// invalid or the queue is full; the message is dropped in both cases.
    pub(crate) fn enqueue(
        &mut self,
        peer: MacAddress,
        payload: &[u8],
        kind: MessageKind,
        ephemeral: bool,
        use_default_rate: bool,
    ) -> bool {
        if payload.is_empty() || payload.len() > MAX_PENDING_PAYLOAD {
            log!(Level::Warn, "Invalid message size {} for {}, skipping", payload.len(), peer);
            return false;
        }
        if self.len() == N {
            log!(Level::Warn, "Send queue full, dropping message to {} (depth: {}/{})", peer, self.len(), N);
            return false;
        }

        let mut data = [0u8; MAX_PENDING_PAYLOAD];
        data[..payload.len()].copy_from_slice(payload);
        let slot = (self.head + self.count) % N;
        self.slots[slot] = Some(PendingMessage {
            peer,
            data,
            length: payload.len(),
            kind,
            ephemeral,
            use_default_rate,
        });
        self.count += 1;
        true
    }

    /// Attempt to send the head of the queue, respecting the inter-send
    /// spacing window.
    pub(crate) fn drain<R: RadioDriver>(&mut self, radio: &mut R) {
        if self.is_empty() {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_attempt {
            if now - last < SEND_SPACING {
                return;
            }
        }
        self.attempt_head(radio, now);
    }

    /// Send the head right away, ignoring the spacing window. Used for the
    /// back-to-back OTA acknowledgement triplet.
    pub(crate) fn force_drain<R: RadioDriver>(&mut self, radio: &mut R) {
        if self.is_empty() {
            return;
        }
        self.attempt_head(radio, Instant::now());
    }

    fn attempt_head<R: RadioDriver>(&mut self, radio: &mut R, now: Instant) {
        let Some(message) = self.pop() else {
            return;
        };
        self.last_attempt = Some(now);

        if message.length == 0 || message.length > MAX_PENDING_PAYLOAD {
            log!(Level::Warn, "Invalid queued message size {} for {}, dropping", message.length, message.peer);
            return;
        }

        if !radio.has_peer(&message.peer) {
            if let Err(code) = radio.add_peer(&message.peer, message.use_default_rate) {
                log!(Level::Warn, "Failed to add peer {} for queued message, error: {}", message.peer, code);
                return;
            }
        }

        let result = radio.send(&message.peer, &message.data[..message.length]);

        if message.ephemeral {
            radio.delete_peer(&message.peer);
        }

        match result {
            Ok(()) => {
                if message.kind == MessageKind::Heartbeat {
                    self.last_heartbeat_sent = Some(now);
                }
            }
            Err(SendError::BufferFull) => {
                log!(Level::Debug, "Radio buffer full, dropping message to {}", message.peer);
            }
            Err(SendError::Other(code)) => {
                log!(Level::Warn, "Failed to send queued message to {}, error: {}", message.peer, code);
            }
        }

        if message.kind == MessageKind::Telemetry && result.is_err() {
            self.telemetry_backoff_until = Some(now + TELEMETRY_SEND_BACKOFF);
        }
    }

    fn pop(&mut self) -> Option<PendingMessage> {
        if self.count == 0 {
            return None;
        }
        let message = self.slots[self.head].take();
        self.head = (self.head + 1) % N;
        self.count -= 1;
        message
    }

    /// Discard every queued message. The spacing and backoff bookkeeping is
    /// kept; only the content goes.
    pub(crate) fn flush(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.count = 0;
        self.head = 0;
    }

    /// Drop every queued message addressed to `peer`, preserving the order of
    /// the rest.
    pub(crate) fn purge_peer(&mut self, peer: &MacAddress) {
        let mut kept = 0;
        for i in 0..self.count {
            let from = (self.head + i) % N;
            let Some(message) = self.slots[from].take() else {
                continue;
            };
            if message.peer == *peer {
                continue;
            }
            let to = (self.head + kept) % N;
            self.slots[to] = Some(message);
            kept += 1;
        }
        self.count = kept;
    }

    pub(crate) fn last_heartbeat_sent(&self) -> Option<Instant> {
        self.last_heartbeat_sent
    }

    pub(crate) fn telemetry_backoff_active(&self, now: Instant) -> bool {
        self.telemetry_backoff_until.map_or(false, |until| now < until)
    }

    #[cfg(test)]
    pub(crate) fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    #[cfg(test)]
    pub(crate) fn peer_message_count(&self, peer: &MacAddress) -> usize {
        (0..self.count)
            .filter_map(|i| self.slots[(self.head + i) % N].as_ref())
            .filter(|m| m.peer == *peer)
            .count()
    }
}
