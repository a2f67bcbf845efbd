//! Ties one `ServerState` and N `ClientState`s together behind a single
//! cooperative, single-threaded event loop multiplexed over every UDP
//! socket with `mio`.

use crate::client::ClientState;
use crate::clock::read_clock;
use crate::codec::REFERENCE_IDS_OCTETS;
use crate::server::ServerState;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token};
use rand::Rng;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

const SERVER_TOKEN: Token = Token(0);
const RECV_BUF_LEN: usize = 1024;

struct ClientLink {
    socket: MioUdpSocket,
    address: SocketAddr,
    state: ClientState,
    /// Polls remaining before this source is reconsidered by selection,
    /// set after a synchronization loop is detected against it.
    selection_delay: u32,
}

pub struct Node {
    poll: Poll,
    events: Events,
    server_socket: MioUdpSocket,
    server: ServerState,
    clients: HashMap<Token, ClientLink>,
    own_addresses: Vec<Ipv4Addr>,
    no_refid_loop: bool,
    max_distance: f64,
    poll_interval_log2: i32,
    next_poll: Instant,
    selected_sources: Vec<SocketAddr>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_reference: bool,
        own_port: u16,
        max_distance: f64,
        dispersion_rate: f64,
        no_refid_loop: bool,
        servers: &[String],
        version: u8,
        poll_interval_log2: i32,
        interleaved: bool,
        refids_fragments: u16,
    ) -> anyhow::Result<Self> {
        let mut poll = Poll::new()?;
        let mut clients = HashMap::new();
        let mut own_addresses = Vec::new();

        let mut next_token = 1usize;
        for server in servers {
            let (host, port) = match server.split_once(':') {
                Some((h, p)) => (h.to_string(), p.parse::<u16>()?),
                None => (server.clone(), 123),
            };

            let addr = (host.as_str(), port)
                .to_socket_addrs()?
                .find(|a| a.is_ipv4())
                .ok_or_else(|| anyhow::anyhow!("could not resolve {} to an IPv4 address", server))?;

            let std_socket = UdpSocket::bind("0.0.0.0:0")?;
            std_socket.set_nonblocking(true)?;
            std_socket.connect(addr)?;
            if let SocketAddr::V4(local) = std_socket.local_addr()? {
                own_addresses.push(*local.ip());
            }

            let mut socket = MioUdpSocket::from_std(std_socket);
            let token = Token(next_token);
            next_token += 1;
            poll.registry()
                .register(&mut socket, token, Interest::READABLE)?;

            clients.insert(
                token,
                ClientLink {
                    socket,
                    address: addr,
                    state: ClientState::new(dispersion_rate, version, interleaved, refids_fragments),
                    selection_delay: 0,
                },
            );
        }

        let std_server_socket = UdpSocket::bind(("0.0.0.0", own_port))?;
        std_server_socket.set_nonblocking(true)?;
        let mut server_socket = MioUdpSocket::from_std(std_server_socket);
        poll.registry()
            .register(&mut server_socket, SERVER_TOKEN, Interest::READABLE)?;

        Ok(Node {
            poll,
            events: Events::with_capacity(64),
            server_socket,
            server: ServerState::new(dispersion_rate, local_reference),
            clients,
            own_addresses,
            no_refid_loop,
            max_distance,
            poll_interval_log2,
            next_poll: Instant::now(),
            selected_sources: Vec::new(),
        })
    }

    fn get_timeout(&self) -> Duration {
        let now = Instant::now();
        if self.next_poll <= now {
            Duration::ZERO
        } else {
            self.next_poll - now
        }
    }

    /// Recompute the preferred upstream sources and propagate the best
    /// one (if any) into the server's reference.
    pub fn select_sources(&mut self) {
        tracing::info!("selecting sources");

        struct Candidate {
            address: SocketAddr,
            offset_summary: f64,
            stratum: u8,
            root_delay: f64,
            root_disp: f64,
            reference_ids: Vec<u8>,
        }

        let mut selected = Vec::new();

        for link in self.clients.values_mut() {
            if link.selection_delay > 0 {
                link.selection_delay -= 1;
            }

            let sample = match link.state.sample.take() {
                None => {
                    tracing::info!(address = %link.address, "not selected: missing sample");
                    continue;
                }
                Some(s) => s,
            };

            if sample.root_delay / 2.0 + sample.root_disp > self.max_distance {
                tracing::info!(address = %link.address, "not selected: distance too large");
                continue;
            }
            if link.state.version == 5 && !link.state.complete_refids {
                tracing::info!(address = %link.address, "not selected: waiting for complete refids");
                continue;
            }

            let bloom_loop = contains_own_fingerprint(&self.server.own_reference_id, &link.state.reference_ids);
            let address_loop = !self.no_refid_loop
                && link
                    .state
                    .reference_id
                    .map(Ipv4Addr::from)
                    .map_or(false, |ip| self.own_addresses.contains(&ip));

            if bloom_loop || address_loop {
                tracing::info!(address = %link.address, "not selected: synchronization loop");
                link.selection_delay = rand::thread_rng().gen_range(1..=4);
                continue;
            }
            if link.selection_delay > 0 {
                tracing::info!(address = %link.address, "not selected: recently in loop");
                continue;
            }

            selected.push(Candidate {
                address: link.address,
                offset_summary: sample.root_delay / 2.0 + sample.root_disp + 0.001 * sample.stratum as f64,
                stratum: sample.stratum,
                root_delay: sample.root_delay,
                root_disp: sample.root_disp,
                reference_ids: link.state.reference_ids.clone(),
            });
        }

        selected.sort_by(|a, b| a.offset_summary.partial_cmp(&b.offset_summary).unwrap());
        self.selected_sources = selected.iter().map(|c| c.address).collect();

        if let Some(winner) = selected.first() {
            for (i, candidate) in selected.iter().enumerate() {
                tracing::info!(address = %candidate.address, rank = i + 1, "selected");
            }

            let mut combined = vec![0u8; REFERENCE_IDS_OCTETS];
            for candidate in &selected {
                for (c, r) in combined.iter_mut().zip(candidate.reference_ids.iter()) {
                    *c |= r;
                }
            }

            let reference_id = match winner.address {
                SocketAddr::V4(addr) => u32::from(*addr.ip()),
                SocketAddr::V6(_) => 0,
            };

            self.server.set_reference(
                winner.stratum + 1,
                reference_id,
                &combined,
                read_clock(self.server.precision()),
                winner.root_delay,
                winner.root_disp,
            );
        }
    }

    fn poll_all_clients(&mut self) {
        for link in self.clients.values_mut() {
            let request = link.state.send_request();
            let bytes = request.encode(0);
            if let Err(e) = link.socket.send(&bytes) {
                tracing::warn!(address = %link.address, error = %e, "failed to send request");
            } else {
                tracing::info!(address = %link.address, version = request.version(), "sent request");
            }
        }
    }

    /// Run one iteration: wait for readable sockets (or the next poll
    /// deadline), service them, and re-poll every client if due.
    pub fn process_events(&mut self, wait: bool) -> anyhow::Result<()> {
        let timeout = if wait { self.get_timeout() } else { Duration::ZERO };
        self.poll.poll(&mut self.events, Some(timeout))?;

        let mut buf = [0u8; RECV_BUF_LEN];
        let ready: Vec<Token> = self.events.iter().map(|e| e.token()).collect();

        for token in ready {
            if token == SERVER_TOKEN {
                loop {
                    match self.server_socket.recv_from(&mut buf) {
                        Ok((len, from)) => {
                            if let Some(response) = self.server.receive_request(&buf[..len]) {
                                if let Err(e) = self.server_socket.send_to(&response, from) {
                                    tracing::warn!(%from, error = %e, "failed to send response");
                                }
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "server recv failed");
                            break;
                        }
                    }
                }
            } else if let Some(link) = self.clients.get_mut(&token) {
                loop {
                    match link.socket.recv(&mut buf) {
                        Ok(len) => {
                            if let Err(e) = link.state.receive_response(&buf[..len]) {
                                tracing::info!(address = %link.address, error = %e, "response rejected");
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            tracing::warn!(address = %link.address, error = %e, "client recv failed");
                            break;
                        }
                    }
                }
            }
        }

        if self.get_timeout() == Duration::ZERO {
            self.select_sources();
            self.poll_all_clients();
            let interval = 2f64.powi(self.poll_interval_log2).max(0.0);
            self.next_poll = Instant::now() + Duration::from_secs_f64(interval);
        }

        Ok(())
    }
}

fn contains_own_fingerprint(own: &[u8], other: &[u8]) -> bool {
    own.iter().zip(other.iter()).all(|(o, c)| o & c == *o)
}
