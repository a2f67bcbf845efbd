//! NTPv4/NTPv5 wire codec.
//!
//! `NtpMessage` is a sum type over protocol version (see DESIGN.md) rather
//! than one sparse struct holding both v4- and v5-only fields: fields not
//! applicable to a version simply don't exist on that variant.

use crate::error::NtpError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub const HEADER_LEN: usize = 48;
pub const OUR_DRAFT_ID: &str = "draft-ietf-ntp-ntpv5-02+";
/// 4096-bit Bloom filter, byte-addressable.
pub const REFERENCE_IDS_OCTETS: usize = 4096 / 8;

/// The literal 8-byte sequence `NTP5DRFT`, used as a v4-to-v5 upgrade probe
/// planted in a v4 message's `reference_ts` field.
pub const NTP5_MAGIC: u64 = u64::from_be_bytes(*b"NTP5DRFT");

const EF_PADDING: u16 = 0xf501;
const EF_MAC: u16 = 0xf502;
const EF_REFERENCE_IDS_REQ: u16 = 0xf503;
const EF_REFERENCE_IDS_RESP: u16 = 0xf504;
const EF_SERVER_INFO: u16 = 0xf505;
#[allow(dead_code)]
const EF_CORRECTION: u16 = 0xf506;
const EF_REFERENCE_TS: u16 = 0xf507;
#[allow(dead_code)]
const EF_MONOTONIC_RX_TS: u16 = 0xf508;
const EF_SECONDARY_RX_TS: u16 = 0xf509;
const EF_DRAFT_ID: u16 = 0xf5ff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
    Other(u8),
}

impl Mode {
    fn from_bits(bits: u8) -> Self {
        match bits {
            3 => Mode::Client,
            4 => Mode::Server,
            x => Mode::Other(x),
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            Mode::Client => 3,
            Mode::Server => 4,
            Mode::Other(x) => x,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ntp5Leap {
    Normal = 0,
    Insert = 1,
    Delete = 2,
    Unknown = 3,
}

impl Ntp5Leap {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Ntp5Leap::Normal,
            1 => Ntp5Leap::Insert,
            2 => Ntp5Leap::Delete,
            _ => Ntp5Leap::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ntp4Leap {
    Normal = 0,
    Insert = 1,
    Delete = 2,
    Unsynchronized = 3,
}

impl Ntp4Leap {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Ntp4Leap::Normal,
            1 => Ntp4Leap::Insert,
            2 => Ntp4Leap::Delete,
            _ => Ntp4Leap::Unsynchronized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timescale {
    Utc,
    Tai,
    Ut1,
    SmearedUtc,
    Other(u8),
}

impl Timescale {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Timescale::Utc,
            1 => Timescale::Tai,
            2 => Timescale::Ut1,
            3 => Timescale::SmearedUtc,
            x => Timescale::Other(x),
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            Timescale::Utc => 0,
            Timescale::Tai => 1,
            Timescale::Ut1 => 2,
            Timescale::SmearedUtc => 3,
            Timescale::Other(x) => x,
        }
    }
}

pub mod ntp5_flags {
    pub const SYNCHRONIZED: u16 = 0x1;
    pub const INTERLEAVED: u16 = 0x2;
    pub const AUTH_NAK: u16 = 0x4;
}

/// Extension fields shared by both versions, keyed by the wire tag they
/// were parsed from. Fields this node neither emits nor interprets
/// (CORRECTION, MONOTONIC_RX_TS, and any unrecognized tag) pass through
/// uninterpreted in `raw`, the same way the legacy v4 MAC passes through
/// unparsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    pub server_info: Option<u16>,
    pub reference_ids_req: Option<(u16, u16)>,
    pub reference_ids_resp: Option<Vec<u8>>,
    pub reference_ts: Option<u64>,
    pub secondary_rx_ts: Vec<(Timescale, u8, u64)>,
    pub draft_id: Option<String>,
    pub raw: Vec<(u16, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NtpV4Message {
    pub mode: Mode,
    pub leap: Ntp4Leap,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: f64,
    pub root_disp: f64,
    pub reference_id: u32,
    pub reference_ts: u64,
    pub origin_ts: u64,
    pub receive_ts: u64,
    pub transmit_ts: u64,
    pub ext: Extensions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NtpV5Message {
    pub mode: Mode,
    pub leap: Ntp5Leap,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub timescale: Timescale,
    pub era: u8,
    pub flags: u16,
    pub root_delay: f64,
    pub root_disp: f64,
    pub server_cookie: u64,
    pub client_cookie: u64,
    pub receive_ts: u64,
    pub transmit_ts: u64,
    pub ext: Extensions,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NtpMessage {
    V4(NtpV4Message),
    V5(NtpV5Message),
}

impl NtpMessage {
    pub fn version(&self) -> u8 {
        match self {
            NtpMessage::V4(_) => 4,
            NtpMessage::V5(_) => 5,
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            NtpMessage::V4(m) => m.mode,
            NtpMessage::V5(m) => m.mode,
        }
    }

    pub fn stratum(&self) -> u8 {
        match self {
            NtpMessage::V4(m) => m.stratum,
            NtpMessage::V5(m) => m.stratum,
        }
    }

    pub fn root_delay(&self) -> f64 {
        match self {
            NtpMessage::V4(m) => m.root_delay,
            NtpMessage::V5(m) => m.root_delay,
        }
    }

    pub fn root_disp(&self) -> f64 {
        match self {
            NtpMessage::V4(m) => m.root_disp,
            NtpMessage::V5(m) => m.root_disp,
        }
    }

    pub fn receive_ts(&self) -> u64 {
        match self {
            NtpMessage::V4(m) => m.receive_ts,
            NtpMessage::V5(m) => m.receive_ts,
        }
    }

    pub fn transmit_ts(&self) -> u64 {
        match self {
            NtpMessage::V4(m) => m.transmit_ts,
            NtpMessage::V5(m) => m.transmit_ts,
        }
    }

    pub fn as_v4(&self) -> Option<&NtpV4Message> {
        match self {
            NtpMessage::V4(m) => Some(m),
            NtpMessage::V5(_) => None,
        }
    }

    pub fn as_v5(&self) -> Option<&NtpV5Message> {
        match self {
            NtpMessage::V5(m) => Some(m),
            NtpMessage::V4(_) => None,
        }
    }

    /// Decode a received datagram payload into a message.
    pub fn decode(bytes: &[u8]) -> Result<NtpMessage, NtpError> {
        if bytes.len() < HEADER_LEN || bytes.len() % 4 != 0 {
            return Err(NtpError::InvalidFormat("bad length"));
        }

        let lvm = bytes[0];
        let version = (lvm >> 3) & 0x7;
        let mode = Mode::from_bits(lvm & 0x7);

        let mut cursor = Cursor::new(bytes);
        cursor.set_position(1);

        match version {
            5 => {
                let leap = Ntp5Leap::from_bits(lvm >> 6);
                let stratum = cursor.read_u8().map_err(|_| NtpError::InvalidFormat("short header"))?;
                let poll = cursor.read_i8().map_err(|_| NtpError::InvalidFormat("short header"))?;
                let precision = cursor.read_i8().map_err(|_| NtpError::InvalidFormat("short header"))?;
                let timescale = Timescale::from_bits(cursor.read_u8().unwrap());
                let era = cursor.read_u8().unwrap();
                let flags = cursor.read_u16::<BigEndian>().unwrap();
                let root_delay_raw = cursor.read_u32::<BigEndian>().unwrap();
                let root_disp_raw = cursor.read_u32::<BigEndian>().unwrap();
                let server_cookie = cursor.read_u64::<BigEndian>().unwrap();
                let client_cookie = cursor.read_u64::<BigEndian>().unwrap();
                let receive_ts = cursor.read_u64::<BigEndian>().unwrap();
                let transmit_ts = cursor.read_u64::<BigEndian>().unwrap();

                let ext = parse_extensions(&bytes[HEADER_LEN..], 5)?;

                match &ext.draft_id {
                    None => return Err(NtpError::InvalidFormat("missing draft ID")),
                    Some(id) if id != OUR_DRAFT_ID => {
                        return Err(NtpError::InvalidFormat("unknown draft ID"))
                    }
                    Some(_) => {}
                }

                Ok(NtpMessage::V5(NtpV5Message {
                    mode,
                    leap,
                    stratum,
                    poll,
                    precision,
                    timescale,
                    era,
                    flags,
                    root_delay: root_delay_raw as f64 / (1u64 << 28) as f64,
                    root_disp: root_disp_raw as f64 / (1u64 << 28) as f64,
                    server_cookie,
                    client_cookie,
                    receive_ts,
                    transmit_ts,
                    ext,
                }))
            }
            4 => {
                let leap = Ntp4Leap::from_bits(lvm >> 6);
                let stratum = cursor.read_u8().map_err(|_| NtpError::InvalidFormat("short header"))?;
                let poll = cursor.read_i8().map_err(|_| NtpError::InvalidFormat("short header"))?;
                let precision = cursor.read_i8().map_err(|_| NtpError::InvalidFormat("short header"))?;
                let root_delay_raw = cursor.read_u32::<BigEndian>().unwrap();
                let root_disp_raw = cursor.read_u32::<BigEndian>().unwrap();
                let reference_id = cursor.read_u32::<BigEndian>().unwrap();
                let reference_ts = cursor.read_u64::<BigEndian>().unwrap();
                let origin_ts = cursor.read_u64::<BigEndian>().unwrap();
                let receive_ts = cursor.read_u64::<BigEndian>().unwrap();
                let transmit_ts = cursor.read_u64::<BigEndian>().unwrap();

                let ext = parse_extensions(&bytes[HEADER_LEN..], 4)?;

                Ok(NtpMessage::V4(NtpV4Message {
                    mode,
                    leap,
                    stratum,
                    poll,
                    precision,
                    root_delay: root_delay_raw as f64 / (1u64 << 16) as f64,
                    root_disp: root_disp_raw as f64 / (1u64 << 16) as f64,
                    reference_id,
                    reference_ts,
                    origin_ts,
                    receive_ts,
                    transmit_ts,
                    ext,
                }))
            }
            _ => Err(NtpError::InvalidFormat("invalid version")),
        }
    }

    /// Encode this message to wire bytes. `target_len`, if given, pads a
    /// v5 message with a PADDING extension up to that length (never
    /// shrinks it).
    pub fn encode(&self, target_len: usize) -> Vec<u8> {
        match self {
            NtpMessage::V4(m) => encode_v4(m),
            NtpMessage::V5(m) => encode_v5(m, target_len),
        }
    }
}

fn parse_extensions(mut rest: &[u8], version: u8) -> Result<Extensions, NtpError> {
    let mut ext = Extensions::default();

    while !rest.is_empty() {
        if version == 4 && rest.len() <= 24 {
            // Trailing legacy MAC; not parsed.
            break;
        }
        if rest.len() < 4 {
            return Err(NtpError::InvalidFormat("truncated extension header"));
        }

        let ef_type = u16::from_be_bytes([rest[0], rest[1]]);
        let ef_len = u16::from_be_bytes([rest[2], rest[3]]) as usize;

        if ef_len < 4 || ef_len > rest.len() {
            return Err(NtpError::InvalidFormat("invalid extension length"));
        }
        if version == 4 && (ef_len < 16 || ef_len % 4 != 0) {
            return Err(NtpError::InvalidFormat("invalid v4 extension length"));
        }

        let body = &rest[4..ef_len];

        match ef_type {
            EF_PADDING | EF_MAC => {}
            EF_REFERENCE_IDS_REQ => {
                if body.len() >= 2 {
                    let offset = u16::from_be_bytes([body[0], body[1]]);
                    ext.reference_ids_req = Some((offset, (ef_len - 4) as u16));
                }
            }
            EF_REFERENCE_IDS_RESP => {
                ext.reference_ids_resp = Some(body.to_vec());
            }
            EF_SERVER_INFO if ef_len == 8 => {
                ext.server_info = Some(u16::from_be_bytes([body[0], body[1]]));
            }
            EF_REFERENCE_TS if ef_len == 12 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&body[0..8]);
                ext.reference_ts = Some(u64::from_be_bytes(buf));
            }
            EF_SECONDARY_RX_TS if ef_len == 16 => {
                let scale = body[0];
                let era = body[1];
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&body[4..12]);
                let ts = u64::from_be_bytes(buf);
                if scale == Timescale::Utc.to_bits() {
                    ext.secondary_rx_ts.push((Timescale::Utc, era, ts));
                }
            }
            EF_DRAFT_ID => {
                if let Ok(s) = std::str::from_utf8(body) {
                    if s.is_ascii() {
                        ext.draft_id = Some(s.to_string());
                    }
                }
            }
            other => {
                ext.raw.push((other, body.to_vec()));
            }
        }

        let advance = (ef_len + 3) & !3usize;
        rest = &rest[advance..];
    }

    Ok(ext)
}

fn saturating_q(value: f64, frac_bits: u32) -> u32 {
    let scaled = value * (1u64 << frac_bits) as f64;
    if scaled <= 0.0 {
        0
    } else if scaled >= u32::MAX as f64 {
        u32::MAX
    } else {
        scaled as u32
    }
}

fn encode_ef(ef_type: u16, body: &[u8]) -> Vec<u8> {
    let pad = (4 - body.len() % 4) % 4;
    let mut out = Vec::with_capacity(4 + body.len() + pad);
    out.write_u16::<BigEndian>(ef_type).unwrap();
    out.write_u16::<BigEndian>((4 + body.len()) as u16).unwrap();
    out.extend_from_slice(body);
    out.extend(std::iter::repeat(0u8).take(pad));
    out
}

fn encode_extensions(ext: &Extensions) -> Vec<u8> {
    let mut out = Vec::new();

    if let Some(bitmap) = ext.server_info {
        let mut body = Vec::new();
        body.write_u16::<BigEndian>(bitmap).unwrap();
        body.write_u16::<BigEndian>(0).unwrap();
        out.extend(encode_ef(EF_SERVER_INFO, &body));
    }
    if let Some((offset, length)) = ext.reference_ids_req {
        let mut body = Vec::new();
        body.write_u16::<BigEndian>(offset).unwrap();
        body.extend(std::iter::repeat(0u8).take((length as usize).saturating_sub(2)));
        out.extend(encode_ef(EF_REFERENCE_IDS_REQ, &body));
    }
    if let Some(resp) = &ext.reference_ids_resp {
        out.extend(encode_ef(EF_REFERENCE_IDS_RESP, resp));
    }
    if let Some(ts) = ext.reference_ts {
        let mut body = Vec::new();
        body.write_u64::<BigEndian>(ts).unwrap();
        out.extend(encode_ef(EF_REFERENCE_TS, &body));
    }
    for (scale, era, ts) in &ext.secondary_rx_ts {
        let mut body = Vec::new();
        body.write_u8(scale.to_bits()).unwrap();
        body.write_u8(*era).unwrap();
        body.write_u16::<BigEndian>(0).unwrap();
        body.write_u64::<BigEndian>(*ts).unwrap();
        out.extend(encode_ef(EF_SECONDARY_RX_TS, &body));
    }
    if let Some(draft_id) = &ext.draft_id {
        out.extend(encode_ef(EF_DRAFT_ID, draft_id.as_bytes()));
    }

    out
}

fn encode_v4(m: &NtpV4Message) -> Vec<u8> {
    let stratum = if m.stratum < 16 { m.stratum } else { 0 };
    let lvm = ((m.leap as u8) << 6) | (4 << 3) | m.mode.to_bits();

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.write_u8(lvm).unwrap();
    header.write_u8(stratum).unwrap();
    header.write_i8(m.poll).unwrap();
    header.write_i8(m.precision).unwrap();
    header.write_u32::<BigEndian>(saturating_q(m.root_delay, 16)).unwrap();
    header.write_u32::<BigEndian>(saturating_q(m.root_disp, 16)).unwrap();
    header.write_u32::<BigEndian>(m.reference_id).unwrap();
    header.write_u64::<BigEndian>(m.reference_ts).unwrap();
    header.write_u64::<BigEndian>(m.origin_ts).unwrap();
    header.write_u64::<BigEndian>(m.receive_ts).unwrap();
    header.write_u64::<BigEndian>(m.transmit_ts).unwrap();

    header.extend(encode_extensions(&m.ext));
    header
}

fn encode_v5(m: &NtpV5Message, target_len: usize) -> Vec<u8> {
    let stratum = if m.stratum < 16 { m.stratum } else { 0 };
    let lvm = ((m.leap as u8) << 6) | (5 << 3) | m.mode.to_bits();

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.write_u8(lvm).unwrap();
    header.write_u8(stratum).unwrap();
    header.write_i8(m.poll).unwrap();
    header.write_i8(m.precision).unwrap();
    header.write_u8(m.timescale.to_bits()).unwrap();
    header.write_u8(m.era).unwrap();
    header.write_u16::<BigEndian>(m.flags).unwrap();
    header.write_u32::<BigEndian>(saturating_q(m.root_delay, 28)).unwrap();
    header.write_u32::<BigEndian>(saturating_q(m.root_disp, 28)).unwrap();
    header.write_u64::<BigEndian>(m.server_cookie).unwrap();
    header.write_u64::<BigEndian>(m.client_cookie).unwrap();
    header.write_u64::<BigEndian>(m.receive_ts).unwrap();
    header.write_u64::<BigEndian>(m.transmit_ts).unwrap();

    header.extend(encode_extensions(&m.ext));

    if header.len() < target_len {
        assert!(header.len() + 4 <= target_len, "not enough slack for PADDING");
        let pad_body = vec![0u8; target_len - header.len() - 4];
        header.extend(encode_ef(EF_PADDING, &pad_body));
    }

    header
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v5_fixture() -> NtpV5Message {
        NtpV5Message {
            mode: Mode::Client,
            leap: Ntp5Leap::Normal,
            stratum: 0,
            poll: 4,
            precision: -20,
            timescale: Timescale::Utc,
            era: 0,
            flags: ntp5_flags::INTERLEAVED,
            root_delay: 0.0,
            root_disp: 0.0,
            server_cookie: 0,
            client_cookie: 0x1122_3344_5566_7788,
            receive_ts: 0,
            transmit_ts: 0,
            ext: Extensions {
                draft_id: Some(OUR_DRAFT_ID.to_string()),
                ..Default::default()
            },
        }
    }

    fn v4_fixture() -> NtpV4Message {
        NtpV4Message {
            mode: Mode::Client,
            leap: Ntp4Leap::Normal,
            stratum: 0,
            poll: 4,
            precision: -20,
            root_delay: 0.01,
            root_disp: 0.01,
            reference_id: 0x0102_0304,
            reference_ts: 0,
            origin_ts: 0,
            receive_ts: 123,
            transmit_ts: 456,
            ext: Extensions::default(),
        }
    }

    #[test]
    fn decode_encode_v4_roundtrip() {
        let msg = NtpMessage::V4(v4_fixture());
        let bytes = msg.encode(0);
        let decoded = NtpMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_encode_v5_roundtrip() {
        let msg = NtpMessage::V5(v5_fixture());
        let bytes = msg.encode(0);
        let decoded = NtpMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn v5_without_draft_id_is_rejected() {
        // 48-byte v5 header, no extensions at all.
        let mut m = v5_fixture();
        m.ext.draft_id = None;
        let bytes = encode_v5(&m, 0);
        assert_eq!(bytes.len(), HEADER_LEN);
        let err = NtpMessage::decode(&bytes).unwrap_err();
        assert_eq!(err, NtpError::InvalidFormat("missing draft ID"));
    }

    #[test]
    fn misaligned_length_is_rejected() {
        let mut bytes = NtpMessage::V4(v4_fixture()).encode(0);
        bytes.push(0);
        assert!(matches!(
            NtpMessage::decode(&bytes[..47]),
            Err(NtpError::InvalidFormat(_))
        ));
        assert!(matches!(
            NtpMessage::decode(&bytes[..49]),
            Err(NtpError::InvalidFormat(_))
        ));
    }

    #[test]
    fn root_delay_saturates_on_encode() {
        let mut m = v4_fixture();
        m.root_delay = 1_000_000.0;
        let bytes = encode_v4(&m);
        let decoded = NtpMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.root_delay(), u32::MAX as f64 / (1u64 << 16) as f64);
    }

    #[test]
    fn stratum_16_encodes_as_zero() {
        let mut m = v4_fixture();
        m.stratum = 16;
        let bytes = encode_v4(&m);
        assert_eq!(bytes[1], 0);
    }

    #[test]
    fn v5_padding_fills_to_target_len() {
        let m = v5_fixture();
        let bytes = encode_v5(&m, 68);
        assert_eq!(bytes.len(), 68);
        let decoded = NtpMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, NtpMessage::V5(m));
    }

    #[test]
    fn reference_ids_resp_slices_through_unchanged() {
        let mut m = v5_fixture();
        m.ext.reference_ids_resp = Some(vec![0xaa; 32]);
        let bytes = encode_v5(&m, 0);
        let decoded = NtpMessage::decode(&bytes).unwrap();
        assert_eq!(
            decoded.as_v5().unwrap().ext.reference_ids_resp,
            Some(vec![0xaa; 32])
        );
    }

    #[test]
    fn v4_trailing_short_block_is_treated_as_mac() {
        let mut bytes = NtpMessage::V4(v4_fixture()).encode(0);
        // 20 bytes of legacy MAC: under the 24-byte threshold, so it must
        // be skipped rather than parsed as an extension header.
        bytes.extend(vec![0u8; 20]);
        let decoded = NtpMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, NtpMessage::V4(v4_fixture()));
    }
}
