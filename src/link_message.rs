//! Wire format of the tracker↔gateway link protocol.
//!
//! Every frame is little-endian and tightly packed; the first byte is the
//! message type tag. Parsing is strict: a frame whose length does not match
//! its type exactly is rejected, and the caller drops it silently (logged at
//! debug level). Telemetry payloads ride inside [`TrackerData`] frames and
//! are built by the [`telemetry`](crate::telemetry) module.

/// Length of the shared secret carried by pairing, handshake, unpair and OTA
/// frames.
pub const SECURITY_CODE_LEN: usize = 8;

/// Maximum payload a [`TrackerData`] frame can carry.
pub const MAX_TRACKER_DATA: usize = 240;

/// Wire size of an [`EnterOta`] frame.
pub(crate) const ENTER_OTA_WIRE_LEN: usize = 1 + 8 + 16 + 4 + 4 + 33 + 65;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MessageType {
    PairingRequest = 0,
    PairingResponse = 1,
    HandshakeRequest = 2,
    HandshakeResponse = 3,
    HeartbeatEcho = 4,
    HeartbeatResponse = 5,
    TrackerData = 6,
    PairingAnnouncement = 7,
    Unpair = 8,
    SetTrackerRate = 9,
    EnterOta = 10,
    OtaAck = 11,
}

/// Tracker→gateway request to pair, carrying the announced secret back.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PairingRequest {
    pub security: [u8; SECURITY_CODE_LEN],
}

/// Tracker→gateway request to re-establish a paired link.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HandshakeRequest {
    pub security: [u8; SECURITY_CODE_LEN],
}

/// Gateway→tracker handshake completion: assigned channel and tracker id.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HandshakeResponse {
    pub channel: u8,
    pub tracker_id: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeartbeatEcho {
    pub sequence: u16,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeartbeatResponse {
    pub sequence: u16,
}

/// Opaque telemetry payload, `{tag, len, payload[len]}` on the wire.
#[derive(Clone, Copy)]
pub struct TrackerData {
    pub length: u8,
    pub payload: [u8; MAX_TRACKER_DATA],
}

impl TrackerData {
    pub fn new(payload: &[u8]) -> Option<TrackerData> {
        if payload.is_empty() || payload.len() > MAX_TRACKER_DATA {
            return None;
        }
        let mut data = [0u8; MAX_TRACKER_DATA];
        data[..payload.len()].copy_from_slice(payload);
        Some(TrackerData {
            length: payload.len() as u8,
            payload: data,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.payload[..self.length as usize]
    }
}

/// Unsolicited gateway broadcast advertising its channel and secret while it
/// is in pairing mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PairingAnnouncement {
    pub channel: u8,
    pub security: [u8; SECURITY_CODE_LEN],
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Unpair {
    pub security: [u8; SECURITY_CODE_LEN],
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SetTrackerRate {
    pub rate_hz: u32,
}

/// Authenticated gateway command to switch into firmware-update mode,
/// carrying the join credentials for the update network.
#[derive(Clone, Copy)]
pub struct EnterOta {
    pub security: [u8; SECURITY_CODE_LEN],
    pub auth: [u8; 16],
    pub port: u32,
    pub ip: [u8; 4],
    pub ssid: [u8; 33],
    pub passphrase: [u8; 65],
}

impl EnterOta {
    pub fn ssid_str(&self) -> &str {
        c_str(&self.ssid)
    }

    pub fn passphrase_str(&self) -> &str {
        c_str(&self.passphrase)
    }
}

/// Interpret a NUL-terminated byte buffer as UTF-8, empty on malformed input.
pub(crate) fn c_str(buffer: &[u8]) -> &str {
    let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    core::str::from_utf8(&buffer[..end]).unwrap_or("")
}

/// Copy a string into a fixed NUL-terminated buffer, truncating to capacity.
pub fn fill_c_str<const N: usize>(value: &str) -> [u8; N] {
    let mut buffer = [0u8; N];
    let len = value.len().min(N - 1);
    buffer[..len].copy_from_slice(&value.as_bytes()[..len]);
    buffer
}

/// A parsed link frame.
pub enum LinkMessage {
    PairingRequest(PairingRequest),
    PairingResponse,
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    HeartbeatEcho(HeartbeatEcho),
    HeartbeatResponse(HeartbeatResponse),
    TrackerData(TrackerData),
    PairingAnnouncement(PairingAnnouncement),
    Unpair(Unpair),
    SetTrackerRate(SetTrackerRate),
    EnterOta(EnterOta),
    OtaAck,
}

impl LinkMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            LinkMessage::PairingRequest(_) => MessageType::PairingRequest,
            LinkMessage::PairingResponse => MessageType::PairingResponse,
            LinkMessage::HandshakeRequest(_) => MessageType::HandshakeRequest,
            LinkMessage::HandshakeResponse(_) => MessageType::HandshakeResponse,
            LinkMessage::HeartbeatEcho(_) => MessageType::HeartbeatEcho,
            LinkMessage::HeartbeatResponse(_) => MessageType::HeartbeatResponse,
            LinkMessage::TrackerData(_) => MessageType::TrackerData,
            LinkMessage::PairingAnnouncement(_) => MessageType::PairingAnnouncement,
            LinkMessage::Unpair(_) => MessageType::Unpair,
            LinkMessage::SetTrackerRate(_) => MessageType::SetTrackerRate,
            LinkMessage::EnterOta(_) => MessageType::EnterOta,
            LinkMessage::OtaAck => MessageType::OtaAck,
        }
    }

    /// Parse a received datagram. Returns `None` for unknown tags and for
    /// frames whose length does not match their type.
    pub fn parse(data: &[u8]) -> Option<LinkMessage> {
        if data.is_empty() {
            return None;
        }
        match data[0] {
            0 if data.len() == 9 => {
                let mut security = [0u8; SECURITY_CODE_LEN];
                security.copy_from_slice(&data[1..9]);
                Some(LinkMessage::PairingRequest(PairingRequest { security }))
            }
            1 if data.len() == 1 => Some(LinkMessage::PairingResponse),
            2 if data.len() == 9 => {
                let mut security = [0u8; SECURITY_CODE_LEN];
                security.copy_from_slice(&data[1..9]);
                Some(LinkMessage::HandshakeRequest(HandshakeRequest { security }))
            }
            3 if data.len() == 3 => Some(LinkMessage::HandshakeResponse(HandshakeResponse {
                channel: data[1],
                tracker_id: data[2],
            })),
            4 if data.len() == 3 => Some(LinkMessage::HeartbeatEcho(HeartbeatEcho {
                sequence: u16::from_le_bytes([data[1], data[2]]),
            })),
            5 if data.len() == 3 => Some(LinkMessage::HeartbeatResponse(HeartbeatResponse {
                sequence: u16::from_le_bytes([data[1], data[2]]),
            })),
            6 if data.len() >= 2 && data.len() == 2 + data[1] as usize => {
                TrackerData::new(&data[2..]).map(LinkMessage::TrackerData)
            }
            7 if data.len() == 10 => {
                let mut security = [0u8; SECURITY_CODE_LEN];
                security.copy_from_slice(&data[2..10]);
                Some(LinkMessage::PairingAnnouncement(PairingAnnouncement {
                    channel: data[1],
                    security,
                }))
            }
            8 if data.len() == 9 => {
                let mut security = [0u8; SECURITY_CODE_LEN];
                security.copy_from_slice(&data[1..9]);
                Some(LinkMessage::Unpair(Unpair { security }))
            }
            9 if data.len() == 5 => Some(LinkMessage::SetTrackerRate(SetTrackerRate {
                rate_hz: u32::from_le_bytes([data[1], data[2], data[3], data[4]]),
            })),
            10 if data.len() == ENTER_OTA_WIRE_LEN => {
                let mut security = [0u8; SECURITY_CODE_LEN];
                security.copy_from_slice(&data[1..9]);
                let mut auth = [0u8; 16];
                auth.copy_from_slice(&data[9..25]);
                let port = u32::from_le_bytes([data[25], data[26], data[27], data[28]]);
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&data[29..33]);
                let mut ssid = [0u8; 33];
                ssid.copy_from_slice(&data[33..66]);
                let mut passphrase = [0u8; 65];
                passphrase.copy_from_slice(&data[66..131]);
                Some(LinkMessage::EnterOta(EnterOta {
                    security,
                    auth,
                    port,
                    ip,
                    ssid,
                    passphrase,
                }))
            }
            11 if data.len() == 1 => Some(LinkMessage::OtaAck),
            _ => None,
        }
    }

    /// Encode the frame into `out`, returning the wire length. `None` when
    /// `out` is too small.
    pub fn encode(&self, out: &mut [u8]) -> Option<usize> {
        match self {
            LinkMessage::PairingRequest(m) => encode_tag_security(out, 0, &m.security),
            LinkMessage::PairingResponse => encode_tag_only(out, 1),
            LinkMessage::HandshakeRequest(m) => encode_tag_security(out, 2, &m.security),
            LinkMessage::HandshakeResponse(m) => {
                if out.len() < 3 {
                    return None;
                }
                out[0] = 3;
                out[1] = m.channel;
                out[2] = m.tracker_id;
                Some(3)
            }
            LinkMessage::HeartbeatEcho(m) => encode_tag_sequence(out, 4, m.sequence),
            LinkMessage::HeartbeatResponse(m) => encode_tag_sequence(out, 5, m.sequence),
            LinkMessage::TrackerData(m) => {
                let total = 2 + m.length as usize;
                if out.len() < total {
                    return None;
                }
                out[0] = 6;
                out[1] = m.length;
                out[2..total].copy_from_slice(m.bytes());
                Some(total)
            }
            LinkMessage::PairingAnnouncement(m) => {
                if out.len() < 10 {
                    return None;
                }
                out[0] = 7;
                out[1] = m.channel;
                out[2..10].copy_from_slice(&m.security);
                Some(10)
            }
            LinkMessage::Unpair(m) => encode_tag_security(out, 8, &m.security),
            LinkMessage::SetTrackerRate(m) => {
                if out.len() < 5 {
                    return None;
                }
                out[0] = 9;
                out[1..5].copy_from_slice(&m.rate_hz.to_le_bytes());
                Some(5)
            }
            LinkMessage::EnterOta(m) => {
                if out.len() < ENTER_OTA_WIRE_LEN {
                    return None;
                }
                out[0] = 10;
                out[1..9].copy_from_slice(&m.security);
                out[9..25].copy_from_slice(&m.auth);
                out[25..29].copy_from_slice(&m.port.to_le_bytes());
                out[29..33].copy_from_slice(&m.ip);
                out[33..66].copy_from_slice(&m.ssid);
                out[66..131].copy_from_slice(&m.passphrase);
                Some(ENTER_OTA_WIRE_LEN)
            }
            LinkMessage::OtaAck => encode_tag_only(out, 11),
        }
    }
}

fn encode_tag_only(out: &mut [u8], tag: u8) -> Option<usize> {
    if out.is_empty() {
        return None;
    }
    out[0] = tag;
    Some(1)
}

fn encode_tag_security(out: &mut [u8], tag: u8, security: &[u8; SECURITY_CODE_LEN]) -> Option<usize> {
    if out.len() < 9 {
        return None;
    }
    out[0] = tag;
    out[1..9].copy_from_slice(security);
    Some(9)
}

fn encode_tag_sequence(out: &mut [u8], tag: u8, sequence: u16) -> Option<usize> {
    if out.len() < 3 {
        return None;
    }
    out[0] = tag;
    out[1..3].copy_from_slice(&sequence.to_le_bytes());
    Some(3)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    fn roundtrip(message: LinkMessage) -> LinkMessage {
        let mut buf = [0u8; 256];
        let len = message.encode(&mut buf).expect("encode must fit");
        LinkMessage::parse(&buf[..len]).expect("parse must accept encoded frame")
    }

    #[test]
    fn pairing_request_roundtrip() {
        let security = [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7];
        match roundtrip(LinkMessage::PairingRequest(PairingRequest { security })) {
            LinkMessage::PairingRequest(m) => assert_eq!(m.security, security),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn empty_frames_roundtrip() {
        assert!(matches!(
            roundtrip(LinkMessage::PairingResponse),
            LinkMessage::PairingResponse
        ));
        assert!(matches!(roundtrip(LinkMessage::OtaAck), LinkMessage::OtaAck));
    }

    #[test]
    fn handshake_response_roundtrip() {
        match roundtrip(LinkMessage::HandshakeResponse(HandshakeResponse {
            channel: 8,
            tracker_id: 3,
        })) {
            LinkMessage::HandshakeResponse(m) => {
                assert_eq!(m.channel, 8);
                assert_eq!(m.tracker_id, 3);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn heartbeat_sequence_is_little_endian() {
        let mut buf = [0u8; 8];
        let len = LinkMessage::HeartbeatEcho(HeartbeatEcho { sequence: 0x1234 })
            .encode(&mut buf)
            .unwrap();
        assert_eq!(&buf[..len], &[4, 0x34, 0x12]);

        match roundtrip(LinkMessage::HeartbeatResponse(HeartbeatResponse { sequence: 0xBEEF })) {
            LinkMessage::HeartbeatResponse(m) => assert_eq!(m.sequence, 0xBEEF),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn tracker_data_roundtrip_and_length_prefix() {
        let payload = [9u8; 16];
        let frame = TrackerData::new(&payload).unwrap();
        let mut buf = [0u8; 64];
        let len = LinkMessage::TrackerData(frame).encode(&mut buf).unwrap();
        assert_eq!(len, 18);
        assert_eq!(buf[0], 6);
        assert_eq!(buf[1], 16);

        match LinkMessage::parse(&buf[..len]).unwrap() {
            LinkMessage::TrackerData(m) => assert_eq!(m.bytes(), &payload),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn tracker_data_rejects_length_mismatch() {
        // Claims 16 bytes of payload, carries 4.
        let wire = [6u8, 16, 1, 2, 3, 4];
        assert!(LinkMessage::parse(&wire).is_none());
    }

    #[test]
    fn pairing_announcement_roundtrip() {
        let security = [1, 2, 3, 4, 5, 6, 7, 8];
        match roundtrip(LinkMessage::PairingAnnouncement(PairingAnnouncement {
            channel: 5,
            security,
        })) {
            LinkMessage::PairingAnnouncement(m) => {
                assert_eq!(m.channel, 5);
                assert_eq!(m.security, security);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn set_tracker_rate_roundtrip() {
        match roundtrip(LinkMessage::SetTrackerRate(SetTrackerRate { rate_hz: 400 })) {
            LinkMessage::SetTrackerRate(m) => assert_eq!(m.rate_hz, 400),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn enter_ota_roundtrip() {
        let mut auth = [0u8; 16];
        for (i, b) in auth.iter_mut().enumerate() {
            *b = i as u8;
        }
        let message = EnterOta {
            security: [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7],
            auth,
            port: 4242,
            ip: [10, 0, 0, 7],
            ssid: fill_c_str("net"),
            passphrase: fill_c_str("pw"),
        };
        let mut buf = [0u8; 256];
        let len = LinkMessage::EnterOta(message).encode(&mut buf).unwrap();
        assert_eq!(len, ENTER_OTA_WIRE_LEN);

        match LinkMessage::parse(&buf[..len]).unwrap() {
            LinkMessage::EnterOta(m) => {
                assert_eq!(m.auth, auth);
                assert_eq!(m.port, 4242);
                assert_eq!(m.ip, [10, 0, 0, 7]);
                assert_eq!(m.ssid_str(), "net");
                assert_eq!(m.passphrase_str(), "pw");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn wrong_length_is_rejected_for_every_tag() {
        for tag in 0u8..=11 {
            // One byte longer than any valid frame of that tag could ever
            // need, except TrackerData which validates its inner length.
            let oversized = [tag, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF];
            if tag == 6 {
                continue;
            }
            assert!(
                LinkMessage::parse(&oversized).is_none(),
                "tag {} accepted an invalid length",
                tag
            );
        }
        assert!(LinkMessage::parse(&[]).is_none());
        assert!(LinkMessage::parse(&[42]).is_none());
    }

    #[test]
    fn c_str_handles_missing_terminator_and_bad_utf8() {
        assert_eq!(c_str(b"abc\0def"), "abc");
        assert_eq!(c_str(b"abc"), "abc");
        assert_eq!(c_str(&[0xFF, 0xFE, 0x00]), "");
        let filled: [u8; 4] = fill_c_str("too long for this");
        assert_eq!(filled[3], 0);
    }
}
