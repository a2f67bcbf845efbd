//! Client role: one `ClientState` tracks the polling/response cycle
//! against a single upstream server, in either basic or interleaved mode.

use crate::clock::read_clock;
use crate::codec::{
    ntp5_flags, Mode, NtpMessage, NtpV4Message, NtpV5Message, Ntp4Leap, Ntp5Leap, Timescale,
    Extensions, NTP5_MAGIC, OUR_DRAFT_ID, REFERENCE_IDS_OCTETS,
};
use crate::error::NtpError;

/// A completed round-trip measurement against an upstream source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NtpSample {
    pub offset: f64,
    pub delay: f64,
    pub disp: f64,
    pub root_delay: f64,
    pub root_disp: f64,
    pub stratum: u8,
}

pub struct ClientState {
    precision: i8,
    dispersion_rate: f64,
    pub version: u8,
    auto_version: bool,
    interleaved: bool,
    refids_fragments: u16,
    timescale: Timescale,

    pub missed_responses: u32,

    /// Accumulated Bloom filter of upstream reference IDs, built from
    /// REFERENCE_IDS_RESP fragments across successive polls.
    pub reference_ids: Vec<u8>,
    next_refids_fragment: u16,
    pub complete_refids: bool,
    /// Only ever populated from a v4 response's `reference_id` field.
    pub reference_id: Option<u32>,

    last_request: Option<NtpMessage>,
    prev_request: Option<NtpMessage>,
    prev_response: Option<NtpMessage>,
    last_transmit_ts: Option<u64>,
    prev_transmit_ts: Option<u64>,
    prev_receive_ts: Option<u64>,

    pub sample: Option<NtpSample>,
}

impl ClientState {
    pub fn new(dispersion_rate: f64, version: u8, interleaved: bool, refids_fragments: u16) -> Self {
        let (version, auto_version) = match version {
            4 | 5 => (version, false),
            _ => (4, true),
        };

        ClientState {
            precision: -20,
            dispersion_rate,
            version,
            auto_version,
            interleaved,
            refids_fragments,
            timescale: Timescale::Utc,
            missed_responses: 0,
            reference_ids: vec![0u8; REFERENCE_IDS_OCTETS],
            next_refids_fragment: 0,
            complete_refids: false,
            reference_id: None,
            last_request: None,
            prev_request: None,
            prev_response: None,
            last_transmit_ts: None,
            prev_transmit_ts: None,
            prev_receive_ts: None,
            sample: None,
        }
    }

    fn interleaved_eligible(&self) -> bool {
        self.interleaved
            && self
                .prev_response
                .as_ref()
                .map_or(false, |r| r.version() == self.version)
            && self.missed_responses <= 4
    }

    fn make_request(&self) -> NtpMessage {
        let interleaved_eligible = self.interleaved_eligible();

        if self.version == 5 {
            let mut flags = 0u16;
            if self.interleaved {
                flags |= ntp5_flags::INTERLEAVED;
            }
            let server_cookie = if interleaved_eligible {
                self.prev_response
                    .as_ref()
                    .and_then(|r| r.as_v5())
                    .map(|r| r.server_cookie)
                    .unwrap_or(0)
            } else {
                0
            };

            let chunk = (REFERENCE_IDS_OCTETS as u16) / self.refids_fragments;
            let ext = Extensions {
                server_info: Some(0),
                reference_ids_req: Some((self.next_refids_fragment * chunk, chunk)),
                reference_ts: Some(0),
                secondary_rx_ts: vec![(self.timescale, 0, 0)],
                draft_id: Some(OUR_DRAFT_ID.to_string()),
                ..Default::default()
            };

            NtpMessage::V5(NtpV5Message {
                mode: Mode::Client,
                leap: Ntp5Leap::Normal,
                stratum: 0,
                poll: 0,
                precision: 0,
                timescale: self.timescale,
                era: 0,
                flags,
                root_delay: 0.0,
                root_disp: 0.0,
                server_cookie,
                client_cookie: rand::random(),
                receive_ts: 0,
                transmit_ts: 0,
                ext,
            })
        } else {
            let transmit_ts: u64 = rand::random();
            let (origin_ts, receive_ts) = if interleaved_eligible {
                let origin_ts = self
                    .prev_response
                    .as_ref()
                    .and_then(|r| r.as_v4())
                    .map(|r| r.receive_ts)
                    .unwrap_or(0);
                (origin_ts, rand::random())
            } else {
                (0, 0)
            };
            let reference_ts = if self.auto_version { NTP5_MAGIC } else { 0 };

            NtpMessage::V4(NtpV4Message {
                mode: Mode::Client,
                leap: Ntp4Leap::Normal,
                stratum: 0,
                poll: 0,
                precision: 0,
                root_delay: 0.0,
                root_disp: 0.0,
                reference_id: 0,
                reference_ts,
                origin_ts,
                receive_ts,
                transmit_ts,
                ext: Extensions::default(),
            })
        }
    }

    /// Build the next request, applying downgrade bookkeeping, and
    /// return it ready to encode and send. The caller is responsible
    /// for the actual socket write.
    pub fn send_request(&mut self) -> NtpMessage {
        self.missed_responses += 1;

        if self.auto_version && self.version == 5 && self.missed_responses > 8 {
            self.version = 4;
        }

        self.prev_request = self.last_request.take();

        let request = self.make_request();
        self.last_request = Some(request.clone());

        self.prev_transmit_ts = self.last_transmit_ts;
        self.last_transmit_ts = Some(read_clock(self.precision));

        request
    }

    fn merge_refids_fragment(&mut self, fragment: &[u8]) {
        let total = REFERENCE_IDS_OCTETS;
        let chunk = total / self.refids_fragments as usize;
        let start = self.next_refids_fragment as usize * chunk;
        let end = (start + chunk).min(total);

        let n = (end - start).min(fragment.len());
        self.reference_ids[start..start + n].copy_from_slice(&fragment[..n]);

        if end < total {
            self.next_refids_fragment += 1;
        } else {
            self.next_refids_fragment = 0;
            self.complete_refids = true;
        }
    }

    /// Decode and validate a datagram received on this client's socket,
    /// folding it into a fresh `sample` on success.
    pub fn receive_response(&mut self, bytes: &[u8]) -> Result<(), NtpError> {
        let receive_ts = read_clock(self.precision);
        let response = NtpMessage::decode(bytes)?;

        if self.missed_responses == 0 || response.mode() != Mode::Server {
            return Ok(());
        }

        let interleaved = match &response {
            NtpMessage::V5(r) => {
                let req = self
                    .last_request
                    .as_ref()
                    .and_then(|m| m.as_v5())
                    .expect("missed_responses > 0 implies a prior request was sent");
                if r.client_cookie != req.client_cookie {
                    return Err(NtpError::BogusResponse("client cookie mismatch"));
                }
                r.flags & ntp5_flags::INTERLEAVED != 0
            }
            NtpMessage::V4(r) => {
                let req = self
                    .last_request
                    .as_ref()
                    .and_then(|m| m.as_v4())
                    .expect("missed_responses > 0 implies a prior request was sent");
                let interleaved = if r.origin_ts == req.receive_ts {
                    true
                } else if r.origin_ts == req.transmit_ts {
                    false
                } else {
                    return Err(NtpError::BogusResponse("origin timestamp mismatch"));
                };
                // v4 provides no Bloom filter; every non-bogus v4 response
                // clears the accumulator, even if a later check rejects it.
                self.reference_ids = vec![0u8; REFERENCE_IDS_OCTETS];
                interleaved
            }
        };

        self.reference_id = response.as_v4().map(|r| r.reference_id);

        let unsynchronized = match &response {
            NtpMessage::V5(r) => r.flags & ntp5_flags::SYNCHRONIZED == 0,
            NtpMessage::V4(r) => r.leap == Ntp4Leap::Unsynchronized,
        } || response.stratum() == 0
            || response.root_delay() / 2.0 + response.root_disp() > 16.0;

        if unsynchronized {
            return Err(NtpError::UnsynchronizedResponse);
        }

        if let NtpMessage::V5(r) = &response {
            if r.timescale != self.timescale {
                return Err(NtpError::UnsupportedTimescale);
            }
        }

        if let NtpMessage::V5(r) = &response {
            match &r.ext.reference_ids_resp {
                Some(fragment) => self.merge_refids_fragment(fragment),
                // No upstreams on the server side: nothing to merge.
                None => self.reference_ids = vec![0u8; REFERENCE_IDS_OCTETS],
            }
        }

        let (t1, t2, t3, t4) = if interleaved {
            let prev_response = self
                .prev_response
                .as_ref()
                .expect("interleaved eligibility implies a previous response");
            (
                self.prev_transmit_ts
                    .expect("interleaved eligibility implies a previous transmit"),
                prev_response.receive_ts(),
                response.transmit_ts(),
                self.prev_receive_ts
                    .expect("interleaved eligibility implies a previous receive"),
            )
        } else {
            (
                self.last_transmit_ts
                    .expect("missed_responses > 0 implies a prior request was sent"),
                response.receive_ts(),
                response.transmit_ts(),
                receive_ts,
            )
        };

        let offset = 0.5 * (wrapping_delta(t2, t1) + wrapping_delta(t3, t4));
        let delay = (wrapping_delta(t4, t1) - wrapping_delta(t3, t2)).abs();
        let disp = delay * self.dispersion_rate;

        self.sample = Some(NtpSample {
            offset,
            delay,
            disp,
            root_delay: delay + response.root_delay(),
            root_disp: disp + response.root_disp(),
            stratum: response.stratum(),
        });

        let upgrade = self.auto_version
            && self.version == 4
            && response.as_v4().map_or(false, |r| r.reference_ts == NTP5_MAGIC);

        self.prev_response = Some(response);
        self.prev_receive_ts = Some(receive_ts);
        self.missed_responses = 0;

        if upgrade {
            self.version = 5;
        }

        Ok(())
    }
}

/// `(a - b) / 2^32` over 64-bit NTP fixed-point timestamps, treating the
/// subtraction as wrapping so the result stays meaningful across era
/// rollover or a clock step larger than half the fixed-point range.
fn wrapping_delta(a: u64, b: u64) -> f64 {
    (a.wrapping_sub(b) as i64) as f64 / (1u64 << 32) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_v4_response(origin_ts: u64, receive_ts: u64, transmit_ts: u64) -> NtpMessage {
        NtpMessage::V4(NtpV4Message {
            mode: Mode::Server,
            leap: Ntp4Leap::Normal,
            stratum: 1,
            poll: 4,
            precision: -20,
            root_delay: 0.0,
            root_disp: 0.0,
            reference_id: 0x7f000001,
            reference_ts: 0,
            origin_ts,
            receive_ts,
            transmit_ts,
            ext: Extensions::default(),
        })
    }

    #[test]
    fn basic_mode_round_trip_produces_a_sample() {
        let mut client = ClientState::new(15e-6, 4, false, 4);
        let request = client.send_request();
        let req = request.as_v4().unwrap();

        let response = server_v4_response(req.transmit_ts, 1_000, req.transmit_ts.wrapping_add(10));
        let bytes = response.encode(0);
        client.receive_response(&bytes).unwrap();

        assert!(client.sample.is_some());
        assert_eq!(client.missed_responses, 0);
    }

    /// Pins spec.md §8 S1's worked example numerically: a basic v4
    /// exchange with T2-T1=10s and T3-T4≈11s must yield offset≈+10.5s,
    /// not the ≈+5.25s the /4 reading of the offset prose would give.
    #[test]
    fn basic_mode_round_trip_matches_s1_worked_example() {
        let mut client = ClientState::new(15e-6, 4, false, 4);

        let t1 = read_clock(-20);
        client.missed_responses = 1;
        client.last_transmit_ts = Some(t1);
        client.last_request = Some(NtpMessage::V4(NtpV4Message {
            mode: Mode::Client,
            leap: Ntp4Leap::Normal,
            stratum: 0,
            poll: 2,
            precision: -20,
            root_delay: 0.0,
            root_disp: 0.0,
            reference_id: 0,
            reference_ts: 0,
            origin_ts: 0,
            receive_ts: 0,
            transmit_ts: t1,
            ext: Extensions::default(),
        }));

        let t2 = t1.wrapping_add(10u64 << 32);
        let t3 = t1.wrapping_add(11u64 << 32);
        let mut response = server_v4_response(t1, t2, t3);
        if let NtpMessage::V4(ref mut r) = response {
            r.stratum = 2;
            r.root_delay = 0.01;
            r.root_disp = 0.01;
            r.reference_id = 0x0102_0304;
        }

        client.receive_response(&response.encode(0)).unwrap();

        let sample = client.sample.expect("valid response produces a sample");
        assert!(
            (sample.offset - 10.5).abs() < 0.05,
            "offset {} not close to the S1-mandated +10.5s",
            sample.offset
        );
        assert_eq!(client.reference_id, Some(0x0102_0304));
        assert_eq!(client.reference_ids, vec![0u8; REFERENCE_IDS_OCTETS]);
    }

    #[test]
    fn stray_response_before_any_request_is_ignored() {
        let mut client = ClientState::new(15e-6, 4, false, 4);
        let response = server_v4_response(0, 0, 0);
        let bytes = response.encode(0);
        assert!(client.receive_response(&bytes).is_ok());
        assert!(client.sample.is_none());
    }

    #[test]
    fn mismatched_origin_timestamp_is_bogus() {
        let mut client = ClientState::new(15e-6, 4, false, 4);
        client.send_request();
        let response = server_v4_response(0xdead_beef, 0, 0);
        let bytes = response.encode(0);
        assert_eq!(
            client.receive_response(&bytes),
            Err(NtpError::BogusResponse("origin timestamp mismatch"))
        );
    }

    #[test]
    fn auto_version_upgrades_on_ntp5_magic() {
        let mut client = ClientState::new(15e-6, 0, false, 4);
        assert_eq!(client.version, 4);
        let request = client.send_request();
        let req = request.as_v4().unwrap();
        let mut response =
            server_v4_response(req.transmit_ts, 1_000, req.transmit_ts.wrapping_add(5));
        if let NtpMessage::V4(ref mut r) = response {
            r.reference_ts = NTP5_MAGIC;
        }
        let bytes = response.encode(0);
        client.receive_response(&bytes).unwrap();
        assert_eq!(client.version, 5);
    }

    #[test]
    fn downgrades_to_v4_after_too_many_missed_responses() {
        let mut client = ClientState::new(15e-6, 0, false, 4);
        client.version = 5;
        client.auto_version = true;
        for _ in 0..9 {
            client.send_request();
        }
        assert_eq!(client.version, 4);
    }

    fn server_v5_response(
        client_cookie: u64,
        server_cookie: u64,
        interleaved: bool,
        receive_ts: u64,
        transmit_ts: u64,
    ) -> NtpMessage {
        let mut flags = ntp5_flags::SYNCHRONIZED;
        if interleaved {
            flags |= ntp5_flags::INTERLEAVED;
        }
        NtpMessage::V5(NtpV5Message {
            mode: Mode::Server,
            leap: Ntp5Leap::Normal,
            stratum: 1,
            poll: 4,
            precision: -20,
            timescale: Timescale::Utc,
            era: 0,
            flags,
            root_delay: 0.0,
            root_disp: 0.0,
            server_cookie,
            client_cookie,
            receive_ts,
            transmit_ts,
            ext: Extensions::default(),
        })
    }

    #[test]
    fn interleaved_follow_up_echoes_prior_server_cookie() {
        let mut client = ClientState::new(15e-6, 5, true, 4);

        let request1 = client.send_request();
        let cookie1 = request1.as_v5().unwrap().client_cookie;
        let response1 = server_v5_response(cookie1, 0xAAAA, false, 1_000, 2_000);
        client.receive_response(&response1.encode(0)).unwrap();
        assert!(client.sample.is_some());

        // Eligible for an interleaved follow-up: same v5 version, no
        // misses since the last successful exchange.
        let request2 = client.send_request();
        let req2 = request2.as_v5().unwrap();
        assert_eq!(req2.server_cookie, 0xAAAA);

        let cookie2 = req2.client_cookie;
        let response2 = server_v5_response(cookie2, 0xBBBB, true, 3_000, 2_000);
        client.receive_response(&response2.encode(0)).unwrap();

        assert!(client.sample.is_some());
        assert_eq!(client.missed_responses, 0);
    }

    #[test]
    fn refid_fragments_assemble_into_a_complete_accumulator() {
        let fragments = 4u16;
        let chunk = REFERENCE_IDS_OCTETS / fragments as usize;
        let mut client = ClientState::new(15e-6, 5, false, fragments);

        let mut expected = vec![0u8; REFERENCE_IDS_OCTETS];
        for i in 0..fragments {
            let request = client.send_request();
            let cookie = request.as_v5().unwrap().client_cookie;

            let fragment: Vec<u8> = (0..chunk).map(|b| (i as usize * chunk + b) as u8).collect();
            expected[i as usize * chunk..(i as usize + 1) * chunk].copy_from_slice(&fragment);

            let mut response = server_v5_response(cookie, 0, false, 1_000 + i as u64, 2_000 + i as u64);
            if let NtpMessage::V5(ref mut r) = response {
                r.ext.reference_ids_resp = Some(fragment);
            }
            client.receive_response(&response.encode(0)).unwrap();

            if i + 1 < fragments {
                assert!(!client.complete_refids);
            }
        }

        assert!(client.complete_refids);
        assert_eq!(client.reference_ids, expected);
    }

    /// A malformed/adversarial REFERENCE_IDS_RESP shorter than the
    /// requested chunk must be absorbed, not panic the client (and, via
    /// `node.rs`, the whole single-threaded event loop).
    #[test]
    fn undersized_refids_fragment_is_absorbed_without_panicking() {
        let fragments = 4u16;
        let chunk = REFERENCE_IDS_OCTETS / fragments as usize;
        let mut client = ClientState::new(15e-6, 5, false, fragments);

        let request = client.send_request();
        let cookie = request.as_v5().unwrap().client_cookie;

        let short_fragment = vec![0xaa; chunk - 1];
        let mut response = server_v5_response(cookie, 0, false, 1_000, 2_000);
        if let NtpMessage::V5(ref mut r) = response {
            r.ext.reference_ids_resp = Some(short_fragment.clone());
        }

        client.receive_response(&response.encode(0)).unwrap();

        assert_eq!(&client.reference_ids[..chunk - 1], &short_fragment[..]);
        assert_eq!(client.reference_ids[chunk - 1], 0);
        assert!(!client.complete_refids);
    }
}
