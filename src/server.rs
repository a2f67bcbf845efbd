//! Server role: answers NTPv4/v5 client requests from a reference clock
//! that is itself fed by `Node::select_sources` (see `node.rs`).

use crate::clock::read_clock;
use crate::codec::{
    ntp5_flags, Extensions, Mode, NtpMessage, NtpV4Message, NtpV5Message, Ntp4Leap, Ntp5Leap,
    Timescale, NTP5_MAGIC, OUR_DRAFT_ID, REFERENCE_IDS_OCTETS,
};
use rand::Rng;
use std::collections::{HashMap, VecDeque};

/// Server-side FIFO cache bound: past this many outstanding interleaved
/// exchanges, the oldest saved transmit timestamp is evicted.
const MAX_SAVED_TIMESTAMPS: usize = 1000;

pub struct ServerState {
    precision: i8,
    dispersion_rate: f64,

    pub stratum: u8,
    pub reference_id: u32,
    /// This node's own fingerprint, OR'd into every reported Bloom
    /// filter so upstream nodes (and we, reflected back) can detect
    /// synchronization loops.
    pub own_reference_id: Vec<u8>,
    pub reference_ids: Vec<u8>,
    pub reference_ts: u64,
    pub root_delay: f64,
    pub root_disp: f64,
    leap4: Ntp4Leap,
    leap5: Ntp5Leap,
    flags: u16,

    /// v4 client receive_ts -> transmit_ts, and v5 client_cookie ->
    /// transmit_ts, keyed by the timestamp the server chose at
    /// reception time (it doubles as the interleaved cache key).
    saved_timestamps: HashMap<u64, u64>,
    timestamp_queue: VecDeque<u64>,
}

impl ServerState {
    pub fn precision(&self) -> i8 {
        self.precision
    }

    pub fn new(dispersion_rate: f64, local_reference: bool) -> Self {
        let mut own_reference_id = vec![0u8; REFERENCE_IDS_OCTETS];
        let mut rng = rand::thread_rng();
        for _ in 0..10 {
            let bit = rng.gen_range(0..REFERENCE_IDS_OCTETS * 8);
            own_reference_id[bit / 8] |= 1 << (7 - bit % 8);
        }

        let mut server = ServerState {
            precision: -20,
            dispersion_rate,
            stratum: 0,
            reference_id: 0,
            own_reference_id: own_reference_id.clone(),
            reference_ids: own_reference_id,
            reference_ts: read_clock(-20),
            root_delay: 0.0,
            root_disp: 0.0,
            leap4: Ntp4Leap::Unsynchronized,
            leap5: Ntp5Leap::Unknown,
            flags: 0,
            saved_timestamps: HashMap::new(),
            timestamp_queue: VecDeque::new(),
        };

        let zeros = vec![0u8; REFERENCE_IDS_OCTETS];
        if local_reference {
            server.set_reference(1, 0x7f7f_0001, &zeros, 0, 0.0, 0.0);
        } else {
            server.set_reference(0, 0, &zeros, 0, 0.0, 0.0);
        }

        server
    }

    /// Adopt a new reference, as chosen by `Node::select_sources`
    /// (or the static local reference at startup).
    pub fn set_reference(
        &mut self,
        stratum: u8,
        reference_id: u32,
        reference_ids: &[u8],
        reference_ts: u64,
        root_delay: f64,
        root_disp: f64,
    ) {
        if stratum > 0 {
            self.leap4 = Ntp4Leap::Normal;
            self.leap5 = Ntp5Leap::Normal;
            self.flags = ntp5_flags::SYNCHRONIZED;
        } else {
            self.leap4 = Ntp4Leap::Unsynchronized;
            self.leap5 = Ntp5Leap::Unknown;
            self.flags = 0;
        }
        self.stratum = stratum;
        self.reference_id = reference_id;
        self.reference_ids = or_bitmaps(&self.own_reference_id, reference_ids);
        self.reference_ts = reference_ts;
        self.root_delay = root_delay;
        self.root_disp = root_disp;
    }

    fn make_response(&mut self, request: &NtpMessage, receive_ts: u64, transmit_ts: u64) -> NtpMessage {
        let mut root_disp = self.root_disp;
        if self.stratum > 1 {
            root_disp += wrapping_abs_delta(transmit_ts, self.reference_ts) * self.dispersion_rate;
        }

        match request {
            NtpMessage::V5(req) => {
                let mut flags = self.flags;
                let mut transmit_ts = transmit_ts;
                let server_cookie = if req.flags & ntp5_flags::INTERLEAVED != 0 {
                    if req.server_cookie != 0 {
                        if let Some(&saved) = self.saved_timestamps.get(&req.server_cookie) {
                            flags |= ntp5_flags::INTERLEAVED;
                            transmit_ts = saved;
                        }
                    }
                    receive_ts
                } else {
                    0
                };

                let server_info = req.ext.server_info.map(|_| (1u16 << 3) | (1u16 << 4));
                let reference_ids_resp = req.ext.reference_ids_req.map(|(offset, length)| {
                    let start = (offset as usize).min(self.reference_ids.len());
                    let end = (start + length as usize).min(self.reference_ids.len());
                    self.reference_ids[start..end].to_vec()
                });
                let reference_ts = req.ext.reference_ts.map(|_| self.reference_ts);
                let secondary_rx_ts = if req
                    .ext
                    .secondary_rx_ts
                    .iter()
                    .any(|(scale, _, _)| *scale == Timescale::Utc)
                {
                    vec![(Timescale::Utc, 0u8, receive_ts)]
                } else {
                    Vec::new()
                };
                let draft_id = req
                    .ext
                    .draft_id
                    .as_ref()
                    .map(|id| OUR_DRAFT_ID[..id.len().min(OUR_DRAFT_ID.len())].to_string());

                NtpMessage::V5(NtpV5Message {
                    mode: Mode::Server,
                    leap: self.leap5,
                    stratum: self.stratum,
                    poll: req.poll,
                    precision: self.precision,
                    timescale: Timescale::Utc,
                    era: 0,
                    flags,
                    root_delay: self.root_delay,
                    root_disp,
                    server_cookie,
                    client_cookie: req.client_cookie,
                    receive_ts,
                    transmit_ts,
                    ext: Extensions {
                        server_info,
                        reference_ids_resp,
                        reference_ts,
                        secondary_rx_ts,
                        draft_id,
                        ..Default::default()
                    },
                })
            }
            NtpMessage::V4(req) => {
                let (origin_ts, transmit_ts) = if req.receive_ts != req.transmit_ts
                    && self.saved_timestamps.contains_key(&req.origin_ts)
                {
                    let saved = self.saved_timestamps.remove(&req.origin_ts).unwrap();
                    (req.receive_ts, saved)
                } else {
                    (req.transmit_ts, transmit_ts)
                };

                let reference_ts = if req.reference_ts == NTP5_MAGIC {
                    NTP5_MAGIC
                } else {
                    self.reference_ts
                };

                NtpMessage::V4(NtpV4Message {
                    mode: Mode::Server,
                    leap: self.leap4,
                    stratum: self.stratum,
                    poll: req.poll,
                    precision: self.precision,
                    root_delay: self.root_delay,
                    root_disp,
                    reference_id: self.reference_id,
                    reference_ts,
                    origin_ts,
                    receive_ts,
                    transmit_ts,
                    ext: Extensions::default(),
                })
            }
        }
    }

    fn save_timestamps(&mut self, receive_ts: u64, transmit_ts: u64) {
        debug_assert!(!self.saved_timestamps.contains_key(&receive_ts));
        debug_assert!(self.saved_timestamps.len() <= MAX_SAVED_TIMESTAMPS);
        debug_assert!(self.saved_timestamps.len() <= self.timestamp_queue.len());

        self.saved_timestamps.insert(receive_ts, transmit_ts);
        self.timestamp_queue.push_back(receive_ts);

        if self.timestamp_queue.len() > MAX_SAVED_TIMESTAMPS {
            if let Some(oldest) = self.timestamp_queue.pop_front() {
                self.saved_timestamps.remove(&oldest);
            }
        }
    }

    /// Handle one inbound datagram: decode, validate, build and return
    /// the response bytes to send back (bounded to `request_len`).
    /// Returns `None` when the datagram should be silently dropped.
    pub fn receive_request(&mut self, message: &[u8]) -> Option<Vec<u8>> {
        let mut receive_ts = read_clock(self.precision);
        while self.saved_timestamps.contains_key(&receive_ts) {
            receive_ts += 1;
        }

        let request = NtpMessage::decode(message).ok()?;
        if request.mode() != Mode::Client {
            return None;
        }

        let request_len = message.len();

        let mut pre_transmit_ts = read_clock(self.precision);
        while pre_transmit_ts == receive_ts {
            pre_transmit_ts = read_clock(self.precision);
        }

        let response = self.make_response(&request, receive_ts, pre_transmit_ts);

        let transmit_ts = read_clock(self.precision);
        let encoded = response.encode(request_len);

        if encoded.len() > request_len {
            return None;
        }

        self.save_timestamps(receive_ts, transmit_ts);
        Some(encoded)
    }
}

fn or_bitmaps(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x | y).collect()
}

fn wrapping_abs_delta(a: u64, b: u64) -> f64 {
    ((a.wrapping_sub(b) as i64) as f64 / (1u64 << 32) as f64).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientState;

    #[test]
    fn unreferenced_server_reports_stratum_zero() {
        let server = ServerState::new(15e-6, false);
        assert_eq!(server.stratum, 0);
        assert_eq!(server.leap4, Ntp4Leap::Unsynchronized);
    }

    #[test]
    fn local_reference_reports_stratum_one() {
        let server = ServerState::new(15e-6, true);
        assert_eq!(server.stratum, 1);
        assert_eq!(server.leap4, Ntp4Leap::Normal);
    }

    #[test]
    fn serves_a_v4_client_request() {
        let mut server = ServerState::new(15e-6, true);
        let mut client = ClientState::new(15e-6, 4, false, 4);
        let request = client.send_request();
        let bytes = request.encode(48);

        let response_bytes = server.receive_request(&bytes).expect("server answers");
        assert!(response_bytes.len() <= bytes.len());

        client.receive_response(&response_bytes).unwrap();
        assert!(client.sample.is_some());
    }

    #[test]
    fn server_drops_another_servers_packet() {
        let mut server = ServerState::new(15e-6, true);
        let foreign = NtpMessage::V4(NtpV4Message {
            mode: Mode::Server,
            leap: Ntp4Leap::Normal,
            stratum: 1,
            poll: 4,
            precision: -20,
            root_delay: 0.0,
            root_disp: 0.0,
            reference_id: 0,
            reference_ts: 0,
            origin_ts: 0,
            receive_ts: 0,
            transmit_ts: 0,
            ext: Extensions::default(),
        });
        let bytes = foreign.encode(48);
        assert!(server.receive_request(&bytes).is_none());
    }

    #[test]
    fn saved_timestamps_are_single_use() {
        let mut server = ServerState::new(15e-6, true);
        server.save_timestamps(10, 20);
        assert_eq!(server.saved_timestamps.remove(&10), Some(20));
        assert_eq!(server.saved_timestamps.get(&10), None);
    }

    #[test]
    fn saved_timestamps_evict_oldest_past_the_cap() {
        let mut server = ServerState::new(15e-6, true);
        for key in 0..(MAX_SAVED_TIMESTAMPS as u64 + 1) {
            server.save_timestamps(key, key * 2);
        }

        assert_eq!(server.saved_timestamps.len(), MAX_SAVED_TIMESTAMPS);
        assert_eq!(server.timestamp_queue.len(), MAX_SAVED_TIMESTAMPS);
        assert!(!server.saved_timestamps.contains_key(&0));
        assert_eq!(
            server.saved_timestamps.get(&(MAX_SAVED_TIMESTAMPS as u64)),
            Some(&(MAX_SAVED_TIMESTAMPS as u64 * 2))
        );
    }

    #[test]
    fn set_reference_always_keeps_own_bits_set() {
        let mut server = ServerState::new(15e-6, false);
        let upstream_ids = vec![0u8; REFERENCE_IDS_OCTETS];
        server.set_reference(2, 0x0102_0304, &upstream_ids, 0, 0.01, 0.01);

        for (own_byte, combined_byte) in server.own_reference_id.iter().zip(server.reference_ids.iter()) {
            assert_eq!(own_byte & combined_byte, *own_byte);
        }
        assert_eq!(server.leap4, Ntp4Leap::Normal);
        assert_eq!(server.flags, ntp5_flags::SYNCHRONIZED);
    }
}
