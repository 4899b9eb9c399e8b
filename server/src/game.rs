use crate::session::SessionTable;
use log::{debug, info, warn};
use rand::Rng;
use shared::{decode_name, MapXY, PlayerFlags, ServerOpcode, StatusMsg, Viewport};
use std::collections::HashMap;

pub type PlayerId = u32;

pub const TEAM_COUNT: u8 = 2;
/// Team value of a player that has not picked a side yet.
pub const NO_TEAM: u8 = TEAM_COUNT;

pub const MAP_WIDTH: u16 = 128;
pub const MAP_HEIGHT: u16 = 128;

/// The game running behind the session layer.
///
/// The server owns the sessions; the simulation owns the players and is
/// handed the session table whenever it needs to queue messages or read
/// session flags.
pub trait Simulation {
    /// Builds the player for a joining client from its handshake bytes.
    /// `None` refuses the join.
    fn make_new_player(&mut self, slot: usize, hello: &[u8], flags: PlayerFlags)
        -> Option<PlayerId>;

    fn remove_player(&mut self, player: PlayerId);

    fn player_name(&self, player: PlayerId) -> Option<&str>;

    /// The client in `slot` asked to begin playing.
    fn start_player(&mut self, slot: usize, sessions: &mut SessionTable);

    fn set_controls(&mut self, player: PlayerId, controls: u8);

    fn set_viewport(&mut self, player: PlayerId, view: Viewport);

    /// Requested team; the simulation decides whether it is valid.
    fn set_player_team(&mut self, player: PlayerId, team: u8);

    fn has_team(&self, player: PlayerId) -> bool;

    fn update_matchmaker(&mut self, slot: usize, sessions: &mut SessionTable);

    fn try_to_stop_matchmaking(&mut self, sessions: &mut SessionTable);

    fn update_all_matchmakers(&mut self, sessions: &mut SessionTable);

    /// One simulation step, run at the end of every idle tick.
    fn update(&mut self, sessions: &mut SessionTable);
}

#[derive(Debug, Clone)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub slot: usize,
    pub name: String,
    pub controls: u8,
    pub view: Viewport,
    pub team: u8,
}

/// Minimal lobby-and-match simulation used by the server binary.
#[derive(Debug, Clone)]
pub struct GameState {
    pub tick: u32,
    pub players: HashMap<PlayerId, PlayerRecord>,
    pub match_running: bool,
    next_player_id: PlayerId,
}

impl Default for GameState {
    fn default() -> Self {
        Self::new()
    }
}

impl GameState {
    pub fn new() -> Self {
        Self {
            tick: 0,
            players: HashMap::new(),
            match_running: false,
            next_player_id: 1,
        }
    }

    fn random_spawn() -> MapXY {
        let mut rng = rand::thread_rng();
        MapXY {
            mapx: rng.gen_range(0..MAP_WIDTH),
            mapy: rng.gen_range(0..MAP_HEIGHT),
        }
    }

    /// Slots of non-spectators currently in matchmaking.
    fn matchmaking_slots(sessions: &SessionTable) -> Vec<usize> {
        sessions
            .iter()
            .filter(|(_, s)| {
                s.flags.contains(PlayerFlags::MATCHMAKING)
                    && !s.flags.contains(PlayerFlags::SPECTATOR)
            })
            .map(|(index, _)| index)
            .collect()
    }
}

impl Simulation for GameState {
    fn make_new_player(
        &mut self,
        slot: usize,
        hello: &[u8],
        flags: PlayerFlags,
    ) -> Option<PlayerId> {
        let name = decode_name(hello);
        if name.trim().is_empty() {
            warn!("Rejecting player in slot {}: empty name", slot);
            return None;
        }

        let id = self.next_player_id;
        self.next_player_id += 1;

        info!(
            "Added player {} ({}) in slot {}{}",
            id,
            name,
            slot,
            if flags.contains(PlayerFlags::SPECTATOR) {
                " as spectator"
            } else {
                ""
            }
        );
        self.players.insert(
            id,
            PlayerRecord {
                id,
                slot,
                name,
                controls: 0,
                view: Viewport::default(),
                team: NO_TEAM,
            },
        );
        Some(id)
    }

    fn remove_player(&mut self, player: PlayerId) {
        if self.players.remove(&player).is_some() {
            info!("Removed player {}", player);
        }
        if self.players.is_empty() {
            self.match_running = false;
        }
    }

    fn player_name(&self, player: PlayerId) -> Option<&str> {
        self.players.get(&player).map(|p| p.name.as_str())
    }

    fn start_player(&mut self, slot: usize, sessions: &mut SessionTable) {
        let spawn = Self::random_spawn();
        debug!("Starting slot {} at ({}, {})", slot, spawn.mapx, spawn.mapy);
        let _ = sessions.with_outbound(slot, |outbound| outbound.add_init_game(spawn));
    }

    fn set_controls(&mut self, player: PlayerId, controls: u8) {
        if let Some(record) = self.players.get_mut(&player) {
            record.controls = controls;
        }
    }

    fn set_viewport(&mut self, player: PlayerId, view: Viewport) {
        if let Some(record) = self.players.get_mut(&player) {
            record.view = view;
        }
    }

    fn set_player_team(&mut self, player: PlayerId, team: u8) {
        let Some(record) = self.players.get_mut(&player) else {
            return;
        };
        if team >= TEAM_COUNT {
            warn!("Player {} asked for invalid team {}", player, team);
            return;
        }
        info!("{} joins team {}", record.name, team);
        record.team = team;
    }

    fn has_team(&self, player: PlayerId) -> bool {
        self.players
            .get(&player)
            .is_some_and(|record| record.team < TEAM_COUNT)
    }

    fn update_matchmaker(&mut self, slot: usize, sessions: &mut SessionTable) {
        let waiting = Self::matchmaking_slots(sessions).len();
        let status = StatusMsg::new(&format!("{} player(s) matchmaking", waiting));
        let _ = sessions.enqueue_payload(slot, ServerOpcode::StatusMessage, &status);
        sessions.broadcast_player_ids(&*self);
    }

    fn try_to_stop_matchmaking(&mut self, sessions: &mut SessionTable) {
        if self.match_running {
            debug!("Match already running, ignoring matchmaking stop");
            return;
        }
        for slot in Self::matchmaking_slots(sessions) {
            sessions.remove_flags(slot, PlayerFlags::PLAYER_READY);
        }
        sessions.broadcast_status("Matchmaking paused");
    }

    fn update_all_matchmakers(&mut self, sessions: &mut SessionTable) {
        if self.match_running {
            return;
        }

        let slots = Self::matchmaking_slots(sessions);
        let all_ready = slots.iter().all(|&slot| {
            sessions
                .flags(slot)
                .is_some_and(|flags| flags.contains(PlayerFlags::PLAYER_READY))
        });
        let teams_used: Vec<u8> = slots
            .iter()
            .filter_map(|&slot| sessions.get(slot))
            .filter_map(|s| self.players.get(&s.player))
            .map(|record| record.team)
            .collect();
        let both_teams = (0..TEAM_COUNT).all(|team| teams_used.contains(&team));

        if !all_ready || !both_teams {
            return;
        }

        self.match_running = true;
        sessions.broadcast_status("Match starting");
        for slot in slots {
            self.start_player(slot, sessions);
        }
    }

    fn update(&mut self, sessions: &mut SessionTable) {
        self.tick = self.tick.wrapping_add(1);

        let moved: Vec<(usize, PlayerId)> = sessions
            .iter()
            .filter(|(_, s)| s.flags.contains(PlayerFlags::NEW_VIEWPORT))
            .map(|(slot, s)| (slot, s.player))
            .collect();

        // Confirm each new viewport by its top-left corner, clamped to the map.
        for (slot, player) in moved {
            sessions.remove_flags(slot, PlayerFlags::NEW_VIEWPORT);
            let Some(record) = self.players.get(&player) else {
                continue;
            };
            let x = record.view.tx.min(MAP_WIDTH - 1);
            let y = record.view.ty.min(MAP_HEIGHT - 1);
            debug!("Slot {} viewport now at ({}, {})", slot, x, y);
            let _ = sessions.with_outbound(slot, |outbound| outbound.add_change_viewport(x, y));
        }
    }
}
