//! Fixed-capacity session table for the connectionless server.
//!
//! A UDP peer has no connection object, so the server keeps one slot per
//! joined address. Slots are reusable storage: acquiring takes the first empty
//! index and releasing clears the slot in place, making the index available to
//! the very next join.
//!
//! Each slot is either empty or holds a complete [`Session`] (address, player,
//! outbound buffer and liveness record together), so the table can never hold
//! half of a client.

use crate::error::{EnqueueError, FlushError, SessionError};
use crate::game::{PlayerId, Simulation};
use crate::liveness::Liveness;
use crate::outbound::OutboundBuffer;
use crate::transport::Transport;
use log::{error, info, warn};
use shared::{Payload, PlayerFlags, ServerOpcode, StatusMsg};
use std::net::SocketAddr;

/// A joined peer
#[derive(Debug, Clone)]
pub struct Session {
    /// Peer address and port; the only identity a datagram carries
    pub addr: SocketAddr,
    pub flags: PlayerFlags,
    /// Handle of the player owned by the simulation
    pub player: PlayerId,
    pub outbound: OutboundBuffer,
    pub liveness: Liveness,
}

#[derive(Debug, Clone, Default)]
pub enum Slot {
    #[default]
    Empty,
    Occupied(Session),
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            Slot::Occupied(session) => Some(session),
            Slot::Empty => None,
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        match self {
            Slot::Occupied(session) => Some(session),
            Slot::Empty => None,
        }
    }
}

pub struct SessionTable {
    slots: Vec<Slot>,
    buffer_capacity: usize,
    overflows: u64,
}

impl SessionTable {
    pub fn new(max_clients: usize, buffer_capacity: usize) -> Self {
        Self {
            slots: vec![Slot::Empty; max_clients],
            buffer_capacity,
            overflows: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Slot::is_empty)
    }

    /// Enqueue attempts rejected for lack of room since startup.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn get(&self, index: usize) -> Option<&Session> {
        self.slots.get(index).and_then(Slot::session)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Session> {
        self.slots.get_mut(index).and_then(Slot::session_mut)
    }

    /// Occupied sessions with their slot numbers.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Session)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.session().map(|session| (index, session)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Session)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.session_mut().map(|session| (index, session)))
    }

    /// Snapshot of the occupied slot numbers, safe to walk while releasing.
    pub fn occupied_indices(&self) -> Vec<usize> {
        self.iter().map(|(index, _)| index).collect()
    }

    /// Slot owned by `addr`, matching address and port exactly.
    pub fn find(&self, addr: SocketAddr) -> Option<usize> {
        self.iter()
            .find(|(_, session)| session.addr == addr)
            .map(|(index, _)| index)
    }

    /// Claims the first empty slot for `addr`.
    ///
    /// The slot is only written once the simulation has created the player,
    /// so on either error the table is exactly as it was.
    pub fn acquire<G: Simulation>(
        &mut self,
        addr: SocketAddr,
        hello: &[u8],
        flags: PlayerFlags,
        game: &mut G,
    ) -> Result<usize, SessionError> {
        let index = self
            .slots
            .iter()
            .position(Slot::is_empty)
            .ok_or(SessionError::Full)?;

        let player = game
            .make_new_player(index, hello, flags)
            .ok_or(SessionError::PlayerRejected)?;

        self.slots[index] = Slot::Occupied(Session {
            addr,
            flags,
            player,
            outbound: OutboundBuffer::new(self.buffer_capacity),
            liveness: Liveness::default(),
        });

        info!("Hello from client {} (slot {})", addr, index);
        Ok(index)
    }

    /// Frees a slot and removes its player. Releasing an empty slot does nothing.
    pub fn release<G: Simulation>(&mut self, index: usize, game: &mut G) -> Option<Session> {
        let slot = self.slots.get_mut(index)?;
        match std::mem::take(slot) {
            Slot::Occupied(session) => {
                game.remove_player(session.player);
                info!("Client {} left slot {}", session.addr, index);
                Some(session)
            }
            Slot::Empty => None,
        }
    }

    pub fn insert_flags(&mut self, index: usize, flags: PlayerFlags) {
        if let Some(session) = self.get_mut(index) {
            session.flags.insert(flags);
        }
    }

    pub fn remove_flags(&mut self, index: usize, flags: PlayerFlags) {
        if let Some(session) = self.get_mut(index) {
            session.flags.remove(flags);
        }
    }

    pub fn flags(&self, index: usize) -> Option<PlayerFlags> {
        self.get(index).map(|session| session.flags)
    }

    /// Runs `write` against one session's batch. Overflow is logged and
    /// counted; the session stays connected.
    pub fn with_outbound<F>(&mut self, index: usize, write: F) -> Result<(), EnqueueError>
    where
        F: FnOnce(&mut OutboundBuffer) -> Result<(), EnqueueError>,
    {
        let session = self.get_mut(index).ok_or(EnqueueError::NoSession(index))?;
        match write(&mut session.outbound) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Too many messages for client {}: {}", index, e);
                if matches!(e, EnqueueError::Overflow { .. }) {
                    self.overflows += 1;
                }
                Err(e)
            }
        }
    }

    /// Appends a frame to one session's batch.
    pub fn enqueue(
        &mut self,
        index: usize,
        opcode: ServerOpcode,
        payload: &[u8],
    ) -> Result<(), EnqueueError> {
        self.with_outbound(index, |outbound| outbound.enqueue(opcode, payload))
    }

    pub fn enqueue_payload<P: Payload>(
        &mut self,
        index: usize,
        opcode: ServerOpcode,
        payload: &P,
    ) -> Result<(), EnqueueError> {
        let bytes = payload.to_bytes()?;
        self.enqueue(index, opcode, &bytes)
    }

    pub fn add_ping(&mut self, index: usize) -> Result<(), EnqueueError> {
        self.enqueue(index, ServerOpcode::Ping, &[0])
    }

    /// Queues the same frame for every session matching `filter`. Returns
    /// how many sessions accepted it.
    pub fn broadcast_filtered<F>(
        &mut self,
        filter: F,
        opcode: ServerOpcode,
        payload: &[u8],
    ) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        let targets: Vec<usize> = self
            .iter()
            .filter(|(_, session)| filter(session))
            .map(|(index, _)| index)
            .collect();

        targets
            .into_iter()
            .filter(|&index| self.enqueue(index, opcode, payload).is_ok())
            .count()
    }

    pub fn broadcast(&mut self, opcode: ServerOpcode, payload: &[u8]) -> usize {
        self.broadcast_filtered(|_| true, opcode, payload)
    }

    /// Message-line text for every session; also written to the server log.
    pub fn broadcast_status(&mut self, text: &str) -> usize {
        info!("{}", text);
        match StatusMsg::new(text).to_bytes() {
            Ok(bytes) => self.broadcast(ServerOpcode::StatusMessage, &bytes),
            Err(e) => {
                error!("Could not encode status message: {}", e);
                0
            }
        }
    }

    /// Sends every spectator the slot number and name of each player.
    pub fn broadcast_player_ids<G: Simulation>(&mut self, game: &G) {
        let players: Vec<(u8, String)> = self
            .iter()
            .filter(|(_, session)| !session.flags.contains(PlayerFlags::SPECTATOR))
            .map(|(index, session)| {
                let name = game.player_name(session.player).unwrap_or_default();
                (index as u8, name.to_string())
            })
            .collect();

        let spectators: Vec<usize> = self
            .iter()
            .filter(|(_, session)| session.flags.contains(PlayerFlags::SPECTATOR))
            .map(|(index, _)| index)
            .collect();

        for spectator in spectators {
            for (owner_id, name) in &players {
                let _ = self.with_outbound(spectator, |outbound| {
                    outbound.add_player_id(*owner_id, name)
                });
            }
        }
    }

    /// Sends one session's batch.
    pub async fn flush<T: Transport>(
        &mut self,
        index: usize,
        transport: &T,
    ) -> Result<bool, FlushError> {
        let session = self.get_mut(index).ok_or(FlushError::NoSession(index))?;
        let addr = session.addr;
        session.outbound.flush(transport, addr).await
    }

    /// Sends every pending batch. A session whose send fails is released
    /// without telling the others; the evicted slots are returned.
    pub async fn flush_all<T: Transport, G: Simulation>(
        &mut self,
        transport: &T,
        game: &mut G,
    ) -> Vec<usize> {
        let mut evicted = Vec::new();
        for index in self.occupied_indices() {
            if let Err(e) = self.flush(index, transport).await {
                error!("Transmit error: removing client {}: {}", index, e);
                self.release(index, game);
                evicted.push(index);
            }
        }
        evicted
    }
}
