//! In-memory doubles for the transport and simulation seams.

use crate::game::{PlayerId, Simulation};
use crate::session::SessionTable;
use crate::transport::Transport;
use shared::{decode_name, PlayerFlags, ServerOpcode, Viewport};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

/// Records every datagram sent and serves queued inbound ones. `recv_from`
/// never completes while the inbox is empty.
pub struct MemoryTransport {
    local: SocketAddr,
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    inbox: Mutex<VecDeque<(SocketAddr, Vec<u8>)>>,
    failing: Mutex<HashSet<SocketAddr>>,
    recv_failures: Mutex<u32>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            local: SocketAddr::from(([127, 0, 0, 1], 7777)),
            sent: Mutex::new(Vec::new()),
            inbox: Mutex::new(VecDeque::new()),
            failing: Mutex::new(HashSet::new()),
            recv_failures: Mutex::new(0),
        }
    }

    pub fn push_inbound(&self, from: SocketAddr, data: &[u8]) {
        self.inbox.lock().unwrap().push_back((from, data.to_vec()));
    }

    pub fn fail_sends_to(&self, addr: SocketAddr) {
        self.failing.lock().unwrap().insert(addr);
    }

    /// Makes the next `recv_from` fail the way an ICMP port-unreachable
    /// does, ahead of anything in the inbox.
    pub fn fail_next_recv(&self) {
        *self.recv_failures.lock().unwrap() += 1;
    }

    pub fn sent_to(&self, addr: SocketAddr) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == addr)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Transport for MemoryTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.failing.lock().unwrap().contains(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "send refused",
            ));
        }
        self.sent.lock().unwrap().push((addr, buf.to_vec()));
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        {
            let mut failures = self.recv_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "port unreachable",
                ));
            }
        }
        let next = self.inbox.lock().unwrap().pop_front();
        match next {
            Some((from, data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok((len, from))
            }
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TestPlayer {
    pub name: String,
    pub controls: u8,
    pub view: Viewport,
    pub team: Option<u8>,
}

/// Simulation double that records which collaborator calls were made.
#[derive(Debug, Default)]
pub struct RecordingGame {
    pub players: HashMap<PlayerId, TestPlayer>,
    pub next_id: PlayerId,
    pub reject_joins: bool,
    pub removed: Vec<PlayerId>,
    pub started: Vec<usize>,
    pub matchmaker_updates: Vec<usize>,
    pub stop_requests: usize,
    pub all_matchmaker_updates: usize,
    pub updates: usize,
}

impl Simulation for RecordingGame {
    fn make_new_player(
        &mut self,
        _slot: usize,
        hello: &[u8],
        _flags: PlayerFlags,
    ) -> Option<PlayerId> {
        if self.reject_joins {
            return None;
        }
        self.next_id += 1;
        self.players.insert(
            self.next_id,
            TestPlayer {
                name: decode_name(hello),
                ..Default::default()
            },
        );
        Some(self.next_id)
    }

    fn remove_player(&mut self, player: PlayerId) {
        self.players.remove(&player);
        self.removed.push(player);
    }

    fn player_name(&self, player: PlayerId) -> Option<&str> {
        self.players.get(&player).map(|p| p.name.as_str())
    }

    fn start_player(&mut self, slot: usize, sessions: &mut SessionTable) {
        self.started.push(slot);
        let _ = sessions.enqueue(slot, ServerOpcode::StartAck, &[0, 0, 0, 0]);
    }

    fn set_controls(&mut self, player: PlayerId, controls: u8) {
        if let Some(p) = self.players.get_mut(&player) {
            p.controls = controls;
        }
    }

    fn set_viewport(&mut self, player: PlayerId, view: Viewport) {
        if let Some(p) = self.players.get_mut(&player) {
            p.view = view;
        }
    }

    fn set_player_team(&mut self, player: PlayerId, team: u8) {
        if let Some(p) = self.players.get_mut(&player) {
            p.team = (team < 2).then_some(team);
        }
    }

    fn has_team(&self, player: PlayerId) -> bool {
        self.players.get(&player).is_some_and(|p| p.team.is_some())
    }

    fn update_matchmaker(&mut self, slot: usize, _sessions: &mut SessionTable) {
        self.matchmaker_updates.push(slot);
    }

    fn try_to_stop_matchmaking(&mut self, _sessions: &mut SessionTable) {
        self.stop_requests += 1;
    }

    fn update_all_matchmakers(&mut self, _sessions: &mut SessionTable) {
        self.all_matchmaker_updates += 1;
    }

    fn update(&mut self, _sessions: &mut SessionTable) {
        self.updates += 1;
    }
}
