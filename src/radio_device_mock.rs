//! In-memory radio device.
//!
//! Records every peer-table mutation, channel change and sent datagram, and
//! lets callers script send results, so the link core can be exercised on a
//! host without radio hardware. Enabled with the `radio-device-mock` feature;
//! the crate's own test suite is built on it.

use heapless::{Deque, Vec};

use crate::MAX_DATAGRAM_SIZE;
use crate::radio::{MacAddress, RadioDriver, SendError};

const SENT_LOG_CAPACITY: usize = 256;
const PEER_TABLE_CAPACITY: usize = 8;
const CHANNEL_LOG_CAPACITY: usize = 64;
const SCRIPT_CAPACITY: usize = 16;

/// One recorded send attempt.
#[derive(Clone)]
pub struct SentDatagram {
    pub peer: MacAddress,
    pub data: Vec<u8, MAX_DATAGRAM_SIZE>,
    pub result: Result<(), SendError>,
}

pub struct RadioDevice {
    mac: MacAddress,
    channel: u8,
    peers: Vec<(MacAddress, bool), PEER_TABLE_CAPACITY>,
    scripted_results: Deque<Result<(), SendError>, SCRIPT_CAPACITY>,
    fail_all_with: Option<SendError>,
    /// Every send attempt, in order.
    pub sent: Vec<SentDatagram, SENT_LOG_CAPACITY>,
    /// Every channel the radio was tuned to, in order.
    pub channel_history: Vec<u8, CHANNEL_LOG_CAPACITY>,
}

impl RadioDevice {
    pub fn new(mac: MacAddress) -> Self {
        RadioDevice {
            mac,
            channel: 1,
            peers: Vec::new(),
            scripted_results: Deque::new(),
            fail_all_with: None,
            sent: Vec::new(),
            channel_history: Vec::new(),
        }
    }

    /// Queue a result for the next send attempt. Unscripted attempts succeed.
    pub fn script_send_result(&mut self, result: Result<(), SendError>) {
        let _ = self.scripted_results.push_back(result);
    }

    /// Make every following send fail until [`clear_failure`](Self::clear_failure).
    pub fn fail_sends_with(&mut self, error: SendError) {
        self.fail_all_with = Some(error);
    }

    pub fn clear_failure(&mut self) {
        self.fail_all_with = None;
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }

    /// Sent datagrams whose first byte matches `tag`.
    pub fn sent_with_tag(&self, tag: u8) -> impl Iterator<Item = &SentDatagram> {
        self.sent.iter().filter(move |d| d.data.first() == Some(&tag))
    }

    pub fn peer_rate_is_default(&self, peer: &MacAddress) -> Option<bool> {
        self.peers.iter().find(|(mac, _)| mac == peer).map(|(_, default)| *default)
    }
}

impl RadioDriver for RadioDevice {
    fn send(&mut self, peer: &MacAddress, data: &[u8]) -> Result<(), SendError> {
        let result = match self.scripted_results.pop_front() {
            Some(result) => result,
            None => match self.fail_all_with {
                Some(error) => Err(error),
                None => Ok(()),
            },
        };
        let _ = self.sent.push(SentDatagram {
            peer: *peer,
            data: Vec::from_slice(data).unwrap_or_default(),
            result,
        });
        result
    }

    fn add_peer(&mut self, peer: &MacAddress, use_default_rate: bool) -> Result<(), i32> {
        if self.has_peer(peer) {
            return Ok(());
        }
        self.peers.push((*peer, use_default_rate)).map_err(|_| -1)
    }

    fn has_peer(&self, peer: &MacAddress) -> bool {
        self.peers.iter().any(|(mac, _)| mac == peer)
    }

    fn delete_peer(&mut self, peer: &MacAddress) -> bool {
        if let Some(index) = self.peers.iter().position(|(mac, _)| mac == peer) {
            self.peers.swap_remove(index);
        }
        true
    }

    fn set_channel(&mut self, channel: u8) -> Result<(), i32> {
        self.channel = channel;
        let _ = self.channel_history.push(channel);
        Ok(())
    }

    fn current_channel(&self) -> u8 {
        self.channel
    }

    fn local_mac(&self) -> MacAddress {
        self.mac
    }
}
