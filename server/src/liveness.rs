//! Ping and timeout bookkeeping for sessions that have no transport-level
//! connection to lose.
//!
//! Every idle tick a participating session gets older. Once it has been quiet
//! for `ping_idle_ticks` ticks it is pinged; any inbound datagram resets the
//! record. A session that stays silent through more than `ping_miss_limit`
//! pings is evicted and the remaining sessions are told.

use crate::game::Simulation;
use crate::session::SessionTable;
use log::debug;
use shared::PlayerFlags;

/// Flags that put a session under liveness monitoring.
pub const MONITORED: PlayerFlags =
    PlayerFlags::from_bits(PlayerFlags::MATCHMAKING.bits() | PlayerFlags::RUNNING.bits());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    pub ping_idle_ticks: u32,
    pub ping_miss_limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    Wait,
    Ping,
    Evict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Liveness {
    idle_ticks: u32,
    missed_pings: u32,
}

impl Liveness {
    /// Ticks since the last inbound datagram or ping.
    pub fn idle_ticks(&self) -> u32 {
        self.idle_ticks
    }

    /// Pings sent since the peer was last heard from.
    pub fn missed_pings(&self) -> u32 {
        self.missed_pings
    }

    /// The peer was heard from.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Advances one idle tick. Eviction is checked before anything else, and
    /// exactly one action results.
    pub fn tick(&mut self, policy: &LivenessPolicy) -> LivenessAction {
        if self.missed_pings > policy.ping_miss_limit {
            return LivenessAction::Evict;
        }

        self.idle_ticks += 1;
        if self.idle_ticks >= policy.ping_idle_ticks {
            self.idle_ticks = 0;
            self.missed_pings += 1;
            return LivenessAction::Ping;
        }
        LivenessAction::Wait
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: Vec<usize>,
    pub evicted: Vec<usize>,
}

/// Runs one tick of liveness over every monitored session.
///
/// Walks a snapshot of the occupied slot numbers, so evicting a session
/// neither skips nor repeats any other.
pub fn sweep<G: Simulation>(
    sessions: &mut SessionTable,
    game: &mut G,
    policy: &LivenessPolicy,
) -> SweepReport {
    let mut report = SweepReport::default();

    for index in sessions.occupied_indices() {
        let Some(session) = sessions.get_mut(index) else {
            continue;
        };
        if !session.flags.intersects(MONITORED) {
            continue;
        }

        match session.liveness.tick(policy) {
            LivenessAction::Evict => {
                let name = game
                    .player_name(session.player)
                    .unwrap_or("A player")
                    .to_string();
                sessions.release(index, game);
                sessions.broadcast_status(&format!("{} timed out", name));
                report.evicted.push(index);
            }
            LivenessAction::Ping => {
                debug!("Ping client {}", index);
                // A full buffer still counts as a missed ping.
                let _ = sessions.add_ping(index);
                report.pinged.push(index);
            }
            LivenessAction::Wait => {}
        }
    }

    report
}
