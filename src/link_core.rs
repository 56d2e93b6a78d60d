//! # Link Core Module
//!
//! The tracker-side state machine of the gateway link: discovery, pairing,
//! handshake, the connected steady state with heartbeats and telemetry, and
//! the secure firmware-update handoff.
//!
//! ## State machine
//!
//! ```text
//! NotSetup ──setup──▶ Searching ──stored binding──▶ Connecting ◀─┐
//!                        │                             │         │ 5 missed
//!                        ▼ no binding                  ▼         │ heartbeats
//!                     Pairing ──response──▶ Connecting ─▶ Connected
//!                        ▲   announcement + request          │
//!                        └── timeout / unpair                ▼ EnterOta
//!                                                        OtaUpdate
//! ```
//!
//! The core is an explicitly constructed value: the embedding owns it, ticks
//! it from a periodic upkeep timer and feeds it received datagrams. There is
//! no global instance. All scheduling uses the monotonic `embassy_time`
//! clock.

use embassy_time::{Duration, Instant};
use log::{Level, log};
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

use crate::channel_plan::ChannelPlan;
use crate::credentials::CredentialStore;
use crate::heartbeat::{HeartbeatEngine, HeartbeatTick};
use crate::link_message::{
    EnterOta, HandshakeRequest, HandshakeResponse, HeartbeatEcho, HeartbeatResponse, LinkMessage,
    PairingAnnouncement, PairingRequest, SECURITY_CODE_LEN, SetTrackerRate, TrackerData, Unpair,
};
use crate::ota::{OtaJoinCredentials, OtaPoll, OtaSession, WifiInterface};
use crate::radio::{MacAddress, RadioDriver};
use crate::send_queue::{MAX_PENDING_PAYLOAD, MessageKind, SEND_QUEUE_SIZE, SendQueue};
use crate::status::{StatusFlag, StatusSink};
use crate::telemetry::TelemetryHub;
use crate::{DEFAULT_TRACKER_RATE_HZ, DeviceInfo, LinkConfig};

const SCAN_HOP_INTERVAL: Duration = Duration::from_millis(400);
const PAIRING_RESEND_INTERVAL: Duration = Duration::from_millis(200);
const PAIRING_TIMEOUT: Duration = Duration::from_secs(60);
const PAIRING_TIMEOUT_KNOWN_GATEWAY: Duration = Duration::from_secs(10);
const CONNECT_STEP_INTERVAL: Duration = Duration::from_millis(300);
const HANDSHAKE_RESEND_INTERVAL: Duration = Duration::from_millis(150);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const TRACKER_RATE_MIN_HZ: u32 = 1;
const TRACKER_RATE_MAX_HZ: u32 = 1000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkState {
    NotSetup,
    Searching,
    Connecting,
    Pairing,
    Connected,
    Failed,
    OtaUpdate,
}

/// The (possibly absent) association with a gateway. While `present` is
/// false the address is all-zero and the other fields carry no meaning.
struct GatewayBinding {
    mac: MacAddress,
    security: [u8; SECURITY_CODE_LEN],
    tracker_id: u8,
    present: bool,
}

impl GatewayBinding {
    const fn absent() -> Self {
        GatewayBinding {
            mac: MacAddress::ZERO,
            security: [0; SECURITY_CODE_LEN],
            tracker_id: 0,
            present: false,
        }
    }

    fn clear(&mut self) {
        self.mac = MacAddress::ZERO;
        self.security = [0; SECURITY_CODE_LEN];
        self.tracker_id = 0;
        self.present = false;
    }
}

pub struct LinkCore<R, C, W, S> {
    radio: R,
    credentials: C,
    wifi: W,
    status: S,
    state: LinkState,
    binding: GatewayBinding,
    plan: ChannelPlan,
    queue: SendQueue<SEND_QUEUE_SIZE>,
    heartbeat: HeartbeatEngine,
    telemetry: TelemetryHub,
    device_info: DeviceInfo,
    tracker_rate_hz: u32,
    ota: Option<OtaSession>,
    pairing_started: Instant,
    pairing_timeout: Duration,
    connect_started: Instant,
    last_scan_hop: Option<Instant>,
    last_pairing_request: Option<Instant>,
    last_channel_step: Option<Instant>,
    last_handshake_request: Option<Instant>,
}

impl<R, C, W, S> LinkCore<R, C, W, S>
where
    R: RadioDriver,
    C: CredentialStore,
    W: WifiInterface,
    S: StatusSink,
{
    pub fn new(radio: R, credentials: C, wifi: W, status: S, config: LinkConfig) -> Self {
        let mut rng = WyRand::seed_from_u64(config.rng_seed);
        LinkCore {
            radio,
            credentials,
            wifi,
            status,
            state: LinkState::NotSetup,
            binding: GatewayBinding::absent(),
            plan: ChannelPlan::new(),
            queue: SendQueue::new(),
            heartbeat: HeartbeatEngine::new(rng.next_u64()),
            telemetry: TelemetryHub::new(),
            device_info: config.device_info,
            tracker_rate_hz: DEFAULT_TRACKER_RATE_HZ,
            ota: None,
            pairing_started: Instant::now(),
            pairing_timeout: PAIRING_TIMEOUT,
            connect_started: Instant::now(),
            last_scan_hop: None,
            last_pairing_request: None,
            last_channel_step: None,
            last_handshake_request: None,
        }
    }

    /// Bring the link up. The radio driver must already be initialised in
    /// station mode; this tunes the first scan channel, registers the
    /// broadcast peer and starts the search for a gateway.
    pub fn setup(&mut self) {
        log!(Level::Info, "Setting up gateway link, address: {}", self.radio.local_mac());

        self.plan.reset();
        self.binding.clear();
        self.queue.flush();
        self.heartbeat.reset();
        self.last_scan_hop = None;
        self.last_pairing_request = None;
        self.last_channel_step = None;
        self.last_handshake_request = None;

        if let Err(code) = self.radio.set_channel(self.plan.first_channel()) {
            log!(Level::Error, "Failed to set channel for init: {}", code);
            self.set_state(LinkState::Failed);
            return;
        }
        if let Err(code) = self.radio.add_peer(&MacAddress::BROADCAST, true) {
            log!(Level::Error, "Failed to add broadcast peer: {}", code);
            self.set_state(LinkState::Failed);
            return;
        }

        self.set_state(LinkState::Searching);
    }

    /// Periodic upkeep tick: drains the send queue, advances the state
    /// machine and runs the telemetry scheduler.
    pub fn upkeep(&mut self) {
        self.queue.drain(&mut self.radio);

        let now = Instant::now();
        match self.state {
            LinkState::NotSetup | LinkState::Searching | LinkState::Failed => {}
            LinkState::Pairing => self.upkeep_pairing(now),
            LinkState::Connecting => self.upkeep_connecting(now),
            LinkState::Connected => self.upkeep_connected(now),
            LinkState::OtaUpdate => self.upkeep_ota(now),
        }
    }

    /// A datagram arrived from the radio. Parses, validates and dispatches;
    /// anything malformed or out of place is dropped without a state change.
    pub fn handle_datagram(&mut self, source: MacAddress, data: &[u8]) {
        let Some(message) = LinkMessage::parse(data) else {
            log!(Level::Debug, "Dropping invalid {}-byte datagram from {}", data.len(), source);
            return;
        };

        match message {
            LinkMessage::PairingAnnouncement(m) => self.on_pairing_announcement(source, m),
            LinkMessage::PairingResponse => self.on_pairing_response(source),
            LinkMessage::HandshakeResponse(m) => self.on_handshake_response(source, m),
            LinkMessage::HeartbeatEcho(m) => self.on_heartbeat_echo(source, m),
            LinkMessage::HeartbeatResponse(m) => self.on_heartbeat_response(source, m),
            LinkMessage::Unpair(m) => self.on_unpair(source, m),
            LinkMessage::SetTrackerRate(m) => self.on_set_tracker_rate(source, m),
            LinkMessage::EnterOta(m) => self.on_enter_ota(source, m),
            // Tracker-originated frame types are not meaningful inbound.
            LinkMessage::PairingRequest(_)
            | LinkMessage::HandshakeRequest(_)
            | LinkMessage::TrackerData(_)
            | LinkMessage::OtaAck => {}
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected && self.binding.present
    }

    pub fn tracker_id(&self) -> u8 {
        self.binding.tracker_id
    }

    pub fn tracker_rate_hz(&self) -> u32 {
        self.tracker_rate_hz
    }

    pub fn gateway_mac(&self) -> Option<MacAddress> {
        self.binding.present.then_some(self.binding.mac)
    }

    /// When the queue last put a heartbeat echo on the air successfully.
    pub fn last_heartbeat_sent(&self) -> Option<Instant> {
        self.queue.last_heartbeat_sent()
    }

    pub fn telemetry(&self) -> &TelemetryHub {
        &self.telemetry
    }

    pub fn telemetry_mut(&mut self) -> &mut TelemetryHub {
        &mut self.telemetry
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn credentials(&self) -> &C {
        &self.credentials
    }

    pub fn wifi(&self) -> &W {
        &self.wifi
    }

    pub fn wifi_mut(&mut self) -> &mut W {
        &mut self.wifi
    }

    pub fn status(&self) -> &S {
        &self.status
    }

    fn set_state(&mut self, new_state: LinkState) {
        if self.state == new_state {
            return;
        }
        let previous = self.state;
        self.state = new_state;

        if previous == LinkState::OtaUpdate {
            self.status.set_status(StatusFlag::Updating, false);
            self.ota = None;
        }

        match new_state {
            LinkState::NotSetup => {
                log!(Level::Info, "Link not set up");
            }
            LinkState::Searching => {
                log!(Level::Info, "Searching for gateway");
                match (self.credentials.gateway_mac(), self.credentials.security_code()) {
                    (Some(mac), Some(security)) => {
                        log!(Level::Info, "Stored gateway {} found, connecting", mac);
                        self.binding.mac = mac;
                        self.binding.security = security;
                        self.binding.tracker_id = 0;
                        self.binding.present = true;
                        self.status.set_status(StatusFlag::WifiConnecting, false);
                        self.status.set_status(StatusFlag::PairingMode, false);
                        self.set_state(LinkState::Connecting);
                    }
                    _ => {
                        log!(Level::Info, "No stored gateway, entering pairing mode");
                        self.enter_pairing();
                    }
                }
            }
            LinkState::Connecting => {
                log!(Level::Info, "Connecting to gateway {}", self.binding.mac);
                self.status.set_status(StatusFlag::WifiConnecting, true);
                self.status.set_status(StatusFlag::PairingMode, false);
                self.connect_started = Instant::now();
                self.last_channel_step = None;
                self.last_handshake_request = None;
            }
            LinkState::Pairing => {
                if !self.binding.present {
                    log!(Level::Info, "Starting pairing mode");
                    self.status.set_status(StatusFlag::WifiConnecting, false);
                    self.status.set_status(StatusFlag::PairingMode, true);
                    self.pairing_started = Instant::now();
                    self.pairing_timeout = if self.credentials.gateway_mac().is_some()
                        && self.credentials.security_code().is_some()
                    {
                        PAIRING_TIMEOUT_KNOWN_GATEWAY
                    } else {
                        PAIRING_TIMEOUT
                    };
                    self.last_scan_hop = None;
                    self.last_pairing_request = None;
                }
            }
            LinkState::Connected => {
                log!(Level::Info, "Connected to gateway {} as tracker {}", self.binding.mac, self.binding.tracker_id);
                self.status.set_status(StatusFlag::WifiConnecting, false);
                self.status.set_status(StatusFlag::PairingMode, false);
            }
            LinkState::Failed => {
                log!(Level::Error, "Link setup failed");
            }
            LinkState::OtaUpdate => {
                log!(Level::Info, "Entering firmware update mode");
                self.status.set_status(StatusFlag::WifiConnecting, false);
                self.status.set_status(StatusFlag::PairingMode, false);
                self.status.set_status(StatusFlag::Updating, true);
            }
        }
    }

    /// Drop any bound gateway and (re)enter pairing mode.
    fn enter_pairing(&mut self) {
        if self.binding.present {
            self.radio.delete_peer(&self.binding.mac);
            self.binding.clear();
        }
        self.set_state(LinkState::Pairing);
    }

    fn upkeep_pairing(&mut self, now: Instant) {
        if !self.binding.present && due(self.last_scan_hop, SCAN_HOP_INTERVAL, now) {
            self.last_scan_hop = Some(now);
            self.plan.advance_scan(&mut self.radio);
            log!(Level::Debug, "Scanning channel {} for gateway", self.radio.current_channel());
        }

        if now - self.pairing_started > self.pairing_timeout {
            log!(Level::Info, "Pairing timed out, restarting gateway search");
            if self.binding.present {
                self.radio.delete_peer(&self.binding.mac);
                self.binding.clear();
            }
            self.set_state(LinkState::Searching);
            return;
        }

        if self.binding.present && due(self.last_pairing_request, PAIRING_RESEND_INTERVAL, now) {
            self.last_pairing_request = Some(now);
            self.send_pairing_request();
        }
    }

    fn upkeep_connecting(&mut self, now: Instant) {
        if !self.binding.present {
            self.set_state(LinkState::Searching);
            return;
        }

        if due(self.last_channel_step, CONNECT_STEP_INTERVAL, now) {
            self.last_channel_step = Some(now);
            self.plan.step_channel(&mut self.radio, false);
            log!(Level::Debug, "Probing gateway on channel {}", self.radio.current_channel());
        }

        if due(self.last_handshake_request, HANDSHAKE_RESEND_INTERVAL, now) {
            self.last_handshake_request = Some(now);
            self.send_handshake_request();
        }

        if now - self.connect_started > CONNECT_TIMEOUT {
            log!(Level::Info, "Connecting to gateway timed out, entering pairing mode");
            self.enter_pairing();
        }
    }

    fn upkeep_connected(&mut self, now: Instant) {
        match self.heartbeat.poll(now) {
            HeartbeatTick::Idle => {}
            HeartbeatTick::SendEcho(sequence) => {
                self.enqueue_message(
                    self.binding.mac,
                    &LinkMessage::HeartbeatEcho(HeartbeatEcho { sequence }),
                    MessageKind::Heartbeat,
                    false,
                );
            }
            HeartbeatTick::LinkLost => {
                log!(
                    Level::Warn,
                    "Connection lost, {} heartbeats missed",
                    self.heartbeat.missed()
                );
                self.plan.retreat_cursor();
                self.radio.delete_peer(&self.binding.mac);
                self.queue.purge_peer(&self.binding.mac);
                self.set_state(LinkState::Connecting);
                return;
            }
        }

        let backoff = self.queue.telemetry_backoff_active(now);
        let status_bits = self.status.snapshot();
        let frames = self.telemetry.poll(
            now,
            self.binding.tracker_id,
            self.tracker_rate_hz,
            backoff,
            true,
            status_bits,
            &self.device_info,
        );
        for frame in frames {
            if let Some(data) = TrackerData::new(&frame) {
                self.enqueue_message(
                    self.binding.mac,
                    &LinkMessage::TrackerData(data),
                    MessageKind::Telemetry,
                    false,
                );
            }
        }
    }

    fn upkeep_ota(&mut self, now: Instant) {
        let outcome = match self.ota.as_mut() {
            Some(session) => session.poll(now, &mut self.wifi),
            None => return,
        };
        if let OtaPoll::Abort = outcome {
            self.set_state(LinkState::NotSetup);
            self.setup();
        }
    }

    fn send_pairing_request(&mut self) {
        if !self.binding.present {
            log!(Level::Warn, "No gateway address, cannot send pairing request");
            return;
        }
        let message = LinkMessage::PairingRequest(PairingRequest {
            security: self.binding.security,
        });
        // One-shot registration; the gateway is not a stable peer yet.
        self.enqueue_message(self.binding.mac, &message, MessageKind::Control, true);
    }

    fn send_handshake_request(&mut self) {
        if !self.binding.present {
            log!(Level::Warn, "No gateway address, cannot send handshake request");
            return;
        }
        // Broadcast so the request lands regardless of which channel the
        // gateway settled on while we hop.
        let message = LinkMessage::HandshakeRequest(HandshakeRequest {
            security: self.binding.security,
        });
        self.enqueue_message(MacAddress::BROADCAST, &message, MessageKind::Control, false);
    }

    fn enqueue_message(&mut self, peer: MacAddress, message: &LinkMessage, kind: MessageKind, ephemeral: bool) {
        let mut buffer = [0u8; MAX_PENDING_PAYLOAD];
        let Some(length) = message.encode(&mut buffer) else {
            log!(Level::Error, "Message does not fit the send queue payload");
            return;
        };
        self.queue.enqueue(peer, &buffer[..length], kind, ephemeral, false);
        self.queue.drain(&mut self.radio);
    }

    fn on_pairing_announcement(&mut self, source: MacAddress, message: PairingAnnouncement) {
        if self.state != LinkState::Pairing || self.binding.present {
            return;
        }
        log!(
            Level::Info,
            "Found gateway {} on channel {}",
            source,
            message.channel
        );
        self.binding.mac = source;
        self.binding.security = message.security;
        self.binding.present = true;
        self.plan.set_channel(&mut self.radio, message.channel);
        // The request phase gets a full timeout window of its own.
        self.pairing_started = Instant::now();
    }

    fn on_pairing_response(&mut self, source: MacAddress) {
        if self.state != LinkState::Pairing || !self.binding.present {
            return;
        }
        if source != self.binding.mac {
            log!(Level::Debug, "Pairing response from unknown address {}, ignoring", source);
            return;
        }
        log!(Level::Info, "Paired with gateway {}, establishing connection", self.binding.mac);
        self.credentials.store(self.binding.mac, self.binding.security);
        // Bias the connect-phase probing to start just below the pairing
        // channel; the forward stepping then crosses it early.
        self.plan.step_channel(&mut self.radio, true);
        self.radio.delete_peer(&self.binding.mac);
        self.set_state(LinkState::Connecting);
    }

    fn on_handshake_response(&mut self, source: MacAddress, message: HandshakeResponse) {
        if self.state != LinkState::Connecting || !self.binding.present {
            return;
        }
        if source != self.binding.mac {
            log!(Level::Debug, "Handshake response from unknown address {}, ignoring", source);
            return;
        }
        log!(
            Level::Info,
            "Assigned channel {} and tracker id {}",
            message.channel,
            message.tracker_id
        );
        self.binding.tracker_id = message.tracker_id;
        self.heartbeat.reset();
        self.plan.set_channel(&mut self.radio, message.channel);
        self.set_state(LinkState::Connected);
    }

    fn on_heartbeat_echo(&mut self, source: MacAddress, message: HeartbeatEcho) {
        if self.state != LinkState::Connected || !self.binding.present || source != self.binding.mac {
            return;
        }
        if !self.heartbeat.on_echo(message.sequence) {
            log!(Level::Debug, "Duplicate heartbeat echo {}, ignoring", message.sequence);
            return;
        }
        let response = LinkMessage::HeartbeatResponse(HeartbeatResponse {
            sequence: message.sequence,
        });
        // Sent twice on purpose: a single lost frame must not cost a
        // heartbeat cycle on the gateway side.
        self.enqueue_message(self.binding.mac, &response, MessageKind::Control, false);
        self.enqueue_message(self.binding.mac, &response, MessageKind::Control, false);
    }

    fn on_heartbeat_response(&mut self, source: MacAddress, message: HeartbeatResponse) {
        if self.state != LinkState::Connected || !self.binding.present || source != self.binding.mac {
            return;
        }
        match self.heartbeat.on_response(message.sequence, Instant::now()) {
            Some(latency) => {
                log!(Level::Debug, "Heartbeat response {} received, latency {} ms", message.sequence, latency.as_millis());
            }
            None => {
                log!(Level::Debug, "Heartbeat sequence mismatch, got {}", message.sequence);
            }
        }
    }

    fn on_unpair(&mut self, source: MacAddress, message: Unpair) {
        if !self.binding.present {
            return;
        }
        if source != self.binding.mac {
            log!(Level::Info, "Unpair request from unknown address {}, ignoring", source);
            return;
        }
        if message.security != self.binding.security {
            log!(Level::Info, "Unpair request with invalid security code, ignoring");
            return;
        }

        log!(Level::Info, "Unpairing from gateway {}", self.binding.mac);
        self.radio.delete_peer(&self.binding.mac);
        self.credentials.clear();
        self.queue.flush();
        self.enter_pairing();
    }

    fn on_set_tracker_rate(&mut self, source: MacAddress, message: SetTrackerRate) {
        if self.state != LinkState::Connected || !self.binding.present || source != self.binding.mac {
            return;
        }
        self.tracker_rate_hz = message.rate_hz.clamp(TRACKER_RATE_MIN_HZ, TRACKER_RATE_MAX_HZ);
        log!(Level::Info, "Tracker rate set to {} Hz", self.tracker_rate_hz);
    }

    fn on_enter_ota(&mut self, source: MacAddress, message: EnterOta) {
        if self.state != LinkState::Connected || !self.binding.present || source != self.binding.mac {
            return;
        }
        if message.security != self.binding.security {
            log!(Level::Info, "Update mode request with invalid security code, ignoring");
            return;
        }

        let credentials = OtaJoinCredentials::from_message(&message);
        log!(
            Level::Info,
            "Update mode request: {}.{}.{}.{}:{}, network {}",
            credentials.ip[0],
            credentials.ip[1],
            credentials.ip[2],
            credentials.ip[3],
            credentials.port,
            credentials.ssid_str()
        );

        // The link is going down anyway; stale traffic has no value.
        self.queue.flush();

        // Acknowledge three times back to back, outside the normal spacing,
        // so the gateway hears us before we leave the channel.
        let mut buffer = [0u8; MAX_PENDING_PAYLOAD];
        if let Some(length) = LinkMessage::OtaAck.encode(&mut buffer) {
            for _ in 0..3 {
                self.queue
                    .enqueue(self.binding.mac, &buffer[..length], MessageKind::Control, false, false);
                self.queue.force_drain(&mut self.radio);
            }
        }
        self.radio.delete_peer(&self.binding.mac);

        self.ota = Some(OtaSession::new(credentials, Instant::now()));
        self.set_state(LinkState::OtaUpdate);
    }
}

fn due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    last.map_or(true, |t| now - t >= interval)
}
