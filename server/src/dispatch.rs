//! Inbound datagram handling.
//!
//! The first byte of a datagram decides its kind: a join handshake, or a
//! stream of frames from an existing session. Frames are applied in order.
//! A bad or unknown opcode, or a server-kill request, stops the rest of the
//! datagram; whatever earlier frames already did stays done.

use crate::error::SessionError;
use crate::game::Simulation;
use crate::network::Server;
use crate::transport::Transport;
use log::{debug, error, info, warn};
use shared::{ClientFrame, CodecError, Datagram, FrameReader, PlayerFlags, ServerOpcode};
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    ServerKill,
    Malformed(CodecError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Joined(usize),
    /// Join refused with the given acknowledgement.
    Rejected(ServerOpcode),
    /// The join reply could not be sent; the new session was dropped again.
    JoinReplyFailed,
    UnknownSender,
    Processed {
        slot: usize,
        frames: usize,
    },
    Aborted {
        slot: usize,
        applied: usize,
        reason: AbortReason,
    },
    Left(usize),
}

enum FrameStep {
    Continue,
    Left,
    Kill,
}

impl<T: Transport, G: Simulation> Server<T, G> {
    /// Handles one inbound datagram. Errors are logged here and never reach
    /// the caller.
    pub async fn dispatch(&mut self, data: &[u8], from: SocketAddr) -> DispatchOutcome {
        match Datagram::classify(data) {
            Datagram::Join { spectator, hello } => {
                self.handle_join(from, hello, spectator).await
            }
            Datagram::Frames(frames) => self.handle_frames(from, frames).await,
        }
    }

    async fn handle_join(
        &mut self,
        from: SocketAddr,
        hello: &[u8],
        spectator: bool,
    ) -> DispatchOutcome {
        let flags = if spectator {
            PlayerFlags::SPECTATOR | PlayerFlags::PLAYER_READY
        } else {
            PlayerFlags::NONE
        };

        if let Some(existing) = self.sessions.find(from) {
            info!("Replacing session {} for {}", existing, from);
            self.sessions.release(existing, &mut self.game);
        }

        let (ack, outcome) = match self.sessions.acquire(from, hello, flags, &mut self.game) {
            Ok(slot) => (ServerOpcode::AckOk, DispatchOutcome::Joined(slot)),
            Err(SessionError::Full) => {
                warn!("No free slot for {}", from);
                (
                    ServerOpcode::AckTooMany,
                    DispatchOutcome::Rejected(ServerOpcode::AckTooMany),
                )
            }
            Err(SessionError::PlayerRejected) => {
                error!("Could not create player for {}", from);
                (
                    ServerOpcode::AckUnable,
                    DispatchOutcome::Rejected(ServerOpcode::AckUnable),
                )
            }
        };

        if let Err(e) = self.transport.send_to(&[1, ack as u8], from).await {
            error!("Failed to send join reply to {}: {}", from, e);
            if let DispatchOutcome::Joined(slot) = outcome {
                self.sessions.release(slot, &mut self.game);
            }
            self.stats.join_reply_failures += 1;
            return DispatchOutcome::JoinReplyFailed;
        }
        outcome
    }

    async fn handle_frames(&mut self, from: SocketAddr, data: &[u8]) -> DispatchOutcome {
        let Some(slot) = self.sessions.find(from) else {
            warn!("Dropping datagram from unknown client {}", from);
            self.stats.unknown_senders += 1;
            return DispatchOutcome::UnknownSender;
        };

        if let Some(session) = self.sessions.get_mut(slot) {
            session.liveness.reset();
        }

        let mut applied = 0;
        for next in FrameReader::new(data) {
            let frame = match next {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Unknown message from client {}: {}", slot, e);
                    return self.abort(slot, applied, AbortReason::Malformed(e));
                }
            };

            match self.apply_frame(slot, frame).await {
                FrameStep::Continue => applied += 1,
                FrameStep::Left => {
                    self.stats.frames += applied as u64 + 1;
                    return DispatchOutcome::Left(slot);
                }
                FrameStep::Kill => {
                    warn!("Got serverkill from client {}", slot);
                    return self.abort(slot, applied, AbortReason::ServerKill);
                }
            }
        }

        self.stats.frames += applied as u64;
        DispatchOutcome::Processed {
            slot,
            frames: applied,
        }
    }

    fn abort(&mut self, slot: usize, applied: usize, reason: AbortReason) -> DispatchOutcome {
        self.stats.frames += applied as u64;
        self.stats.aborted_datagrams += 1;
        DispatchOutcome::Aborted {
            slot,
            applied,
            reason,
        }
    }

    async fn apply_frame(&mut self, slot: usize, frame: ClientFrame) -> FrameStep {
        let Some(player) = self.sessions.get(slot).map(|s| s.player) else {
            return FrameStep::Left;
        };

        match frame {
            ClientFrame::Start => self.game.start_player(slot, &mut self.sessions),
            ClientFrame::Control(controls) => self.game.set_controls(player, controls),
            ClientFrame::Bye => {
                self.leave(slot).await;
                return FrameStep::Left;
            }
            ClientFrame::ClientReady => self.sessions.insert_flags(slot, PlayerFlags::RUNNING),
            ClientFrame::Viewport(view) => {
                self.game.set_viewport(player, view);
                self.sessions.insert_flags(slot, PlayerFlags::NEW_VIEWPORT);
            }
            // The liveness record was already reset for this datagram.
            ClientFrame::Ping => {}
            ClientFrame::TeamRequest(team) => self.game.set_player_team(player, team),
            ClientFrame::MatchmakingStart => {
                self.sessions.insert_flags(slot, PlayerFlags::MATCHMAKING);
                self.game.update_matchmaker(slot, &mut self.sessions);
            }
            ClientFrame::MatchmakingStop => self.game.try_to_stop_matchmaking(&mut self.sessions),
            ClientFrame::MatchmakingReady => {
                if self.game.has_team(player) {
                    self.sessions.insert_flags(slot, PlayerFlags::PLAYER_READY);
                    self.game.update_all_matchmakers(&mut self.sessions);
                } else {
                    debug!("Ignoring ready from client {} without a team", slot);
                }
            }
            ClientFrame::ServerKill => return FrameStep::Kill,
        }
        FrameStep::Continue
    }

    /// Acknowledges a leave directly, skipping any queued frames, then frees
    /// the slot and tells everyone else.
    async fn leave(&mut self, slot: usize) {
        let Some(session) = self.sessions.get(slot) else {
            return;
        };
        let addr = session.addr;
        let name = self
            .game
            .player_name(session.player)
            .unwrap_or("A player")
            .to_string();

        if let Err(e) = self.send_direct(slot, &[1, ServerOpcode::ByeAck as u8]).await {
            error!("Failed to send bye ack to {}: {}", addr, e);
        }

        self.sessions.release(slot, &mut self.game);
        self.sessions.broadcast_status(&format!("{} left the game", name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::liveness::Liveness;
    use crate::testing::{MemoryTransport, RecordingGame};
    use shared::{decode_batch, encode_frames, encode_hello, Payload, StatusMsg, Viewport};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn server(max_clients: usize) -> Server<MemoryTransport, RecordingGame> {
        let config = ServerConfig {
            max_clients,
            ..Default::default()
        };
        Server::with_transport(config, MemoryTransport::new(), RecordingGame::default())
    }

    async fn joined(
        server: &mut Server<MemoryTransport, RecordingGame>,
        port: u16,
        name: &str,
    ) -> usize {
        match server.dispatch(&encode_hello(name, false), addr(port)).await {
            DispatchOutcome::Joined(slot) => slot,
            other => panic!("join failed: {:?}", other),
        }
    }

    fn frames(list: &[ClientFrame]) -> Vec<u8> {
        encode_frames(list).unwrap()
    }

    #[tokio::test]
    async fn test_join_replies_ack_ok() {
        let mut server = server(4);
        let slot = joined(&mut server, 1, "alice").await;

        assert_eq!(slot, 0);
        assert_eq!(
            server.transport().sent_to(addr(1)),
            vec![vec![1, ServerOpcode::AckOk as u8]]
        );
        let session = server.sessions().get(0).unwrap();
        assert_eq!(session.flags, PlayerFlags::NONE);
        assert_eq!(server.game().player_name(session.player), Some("alice"));
    }

    #[tokio::test]
    async fn test_spectator_join_presets_flags() {
        let mut server = server(4);
        let outcome = server.dispatch(&encode_hello("eve", true), addr(1)).await;

        assert_eq!(outcome, DispatchOutcome::Joined(0));
        assert_eq!(
            server.sessions().flags(0),
            Some(PlayerFlags::SPECTATOR | PlayerFlags::PLAYER_READY)
        );
    }

    #[tokio::test]
    async fn test_join_over_capacity_replies_too_many() {
        let mut server = server(1);
        joined(&mut server, 1, "first").await;
        let before = server.sessions().get(0).unwrap().clone();

        let outcome = server.dispatch(&encode_hello("second", false), addr(2)).await;

        assert_eq!(outcome, DispatchOutcome::Rejected(ServerOpcode::AckTooMany));
        assert_eq!(
            server.transport().sent_to(addr(2)),
            vec![vec![1, ServerOpcode::AckTooMany as u8]]
        );
        let after = server.sessions().get(0).unwrap();
        assert_eq!(after.addr, before.addr);
        assert_eq!(after.player, before.player);
        assert_eq!(server.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_player_replies_unable() {
        let mut server = server(2);
        server.game_mut().reject_joins = true;

        let outcome = server.dispatch(&encode_hello("x", false), addr(1)).await;

        assert_eq!(outcome, DispatchOutcome::Rejected(ServerOpcode::AckUnable));
        assert_eq!(
            server.transport().sent_to(addr(1)),
            vec![vec![1, ServerOpcode::AckUnable as u8]]
        );
        assert!(server.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_from_same_address_replaces_session() {
        let mut server = server(2);
        joined(&mut server, 1, "old").await;
        let slot = joined(&mut server, 1, "new").await;

        assert_eq!(slot, 0);
        assert_eq!(server.sessions().len(), 1);
        assert_eq!(server.game().removed.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_sender_is_dropped() {
        let mut server = server(2);
        joined(&mut server, 1, "a").await;

        let outcome = server
            .dispatch(&frames(&[ClientFrame::Control(9)]), addr(2))
            .await;

        assert_eq!(outcome, DispatchOutcome::UnknownSender);
        assert_eq!(server.stats().unknown_senders, 1);
        assert_eq!(server.game().players.values().next().unwrap().controls, 0);
        assert_eq!(server.transport().sent_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_opcode_aborts_remaining_frames() {
        let mut server = server(2);
        joined(&mut server, 1, "a").await;

        let datagram = [0x04, 7, 0x77, 0x04, 9];
        let outcome = server.dispatch(&datagram, addr(1)).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Aborted {
                slot: 0,
                applied: 1,
                reason: AbortReason::Malformed(CodecError::UnknownOpcode(0x77)),
            }
        );
        let player = server.sessions().get(0).unwrap().player;
        assert_eq!(server.game().players[&player].controls, 7);
        assert_eq!(server.stats().aborted_datagrams, 1);
    }

    #[tokio::test]
    async fn test_server_kill_aborts_but_keeps_session() {
        let mut server = server(2);
        joined(&mut server, 1, "a").await;

        let outcome = server
            .dispatch(
                &frames(&[
                    ClientFrame::ClientReady,
                    ClientFrame::ServerKill,
                    ClientFrame::Control(3),
                ]),
                addr(1),
            )
            .await;

        assert_eq!(
            outcome,
            DispatchOutcome::Aborted {
                slot: 0,
                applied: 1,
                reason: AbortReason::ServerKill,
            }
        );
        assert!(server
            .sessions()
            .flags(0)
            .unwrap()
            .contains(PlayerFlags::RUNNING));
        let player = server.sessions().get(0).unwrap().player;
        assert_eq!(server.game().players[&player].controls, 0);
    }

    #[tokio::test]
    async fn test_bye_acks_releases_and_stops() {
        let mut server = server(2);
        joined(&mut server, 1, "alice").await;
        joined(&mut server, 2, "bob").await;

        let outcome = server
            .dispatch(
                &frames(&[ClientFrame::Bye, ClientFrame::ClientReady]),
                addr(1),
            )
            .await;

        assert_eq!(outcome, DispatchOutcome::Left(0));
        assert!(server.sessions().get(0).is_none());
        let sent = server.transport().sent_to(addr(1));
        assert_eq!(sent.last().unwrap(), &vec![1, ServerOpcode::ByeAck as u8]);

        let bytes = server
            .sessions()
            .get(1)
            .unwrap()
            .outbound
            .as_bytes()
            .to_vec();
        let batch = decode_batch(&bytes).unwrap();
        assert_eq!(batch.len(), 1);
        let status = StatusMsg::from_bytes(batch[0].payload).unwrap();
        assert_eq!(status.text(), "alice left the game");
    }

    #[tokio::test]
    async fn test_frames_reset_liveness_before_dispatch() {
        let mut server = server(2);
        joined(&mut server, 1, "a").await;
        let policy = server.config().liveness_policy();
        let mut stale = Liveness::default();
        for _ in 0..policy.ping_idle_ticks + 3 {
            stale.tick(&policy);
        }
        server.sessions_mut().get_mut(0).unwrap().liveness = stale;
        assert_eq!(server.sessions().get(0).unwrap().liveness.missed_pings(), 1);

        server.dispatch(&frames(&[ClientFrame::Ping]), addr(1)).await;

        assert_eq!(
            server.sessions().get(0).unwrap().liveness,
            Liveness::default()
        );
    }

    #[tokio::test]
    async fn test_viewport_and_team_frames() {
        let mut server = server(2);
        joined(&mut server, 1, "a").await;
        let view = Viewport {
            tx: 10,
            ty: 20,
            bx: 42,
            by: 38,
        };

        let outcome = server
            .dispatch(
                &frames(&[ClientFrame::Viewport(view), ClientFrame::TeamRequest(1)]),
                addr(1),
            )
            .await;

        assert_eq!(outcome, DispatchOutcome::Processed { slot: 0, frames: 2 });
        let player = server.sessions().get(0).unwrap().player;
        assert_eq!(server.game().players[&player].view, view);
        assert_eq!(server.game().players[&player].team, Some(1));
        assert!(server
            .sessions()
            .flags(0)
            .unwrap()
            .contains(PlayerFlags::NEW_VIEWPORT));
    }

    #[tokio::test]
    async fn test_matchmaking_frames() {
        let mut server = server(2);
        joined(&mut server, 1, "a").await;

        server
            .dispatch(
                &frames(&[
                    ClientFrame::MatchmakingStart,
                    ClientFrame::MatchmakingReady,
                    ClientFrame::MatchmakingStop,
                ]),
                addr(1),
            )
            .await;

        let flags = server.sessions().flags(0).unwrap();
        assert!(flags.contains(PlayerFlags::MATCHMAKING));
        // No team yet, so ready was ignored.
        assert!(!flags.contains(PlayerFlags::PLAYER_READY));
        assert_eq!(server.game().matchmaker_updates, vec![0]);
        assert_eq!(server.game().all_matchmaker_updates, 0);
        assert_eq!(server.game().stop_requests, 1);

        server
            .dispatch(
                &frames(&[ClientFrame::TeamRequest(0), ClientFrame::MatchmakingReady]),
                addr(1),
            )
            .await;

        assert!(server
            .sessions()
            .flags(0)
            .unwrap()
            .contains(PlayerFlags::PLAYER_READY));
        assert_eq!(server.game().all_matchmaker_updates, 1);
    }

    #[tokio::test]
    async fn test_start_frame_calls_simulation() {
        let mut server = server(2);
        joined(&mut server, 1, "a").await;

        server.dispatch(&frames(&[ClientFrame::Start]), addr(1)).await;

        assert_eq!(server.game().started, vec![0]);
        assert_eq!(server.sessions().get(0).unwrap().outbound.frame_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_join_reply_drops_session() {
        let mut server = server(2);
        server.transport().fail_sends_to(addr(1));

        let outcome = server.dispatch(&encode_hello("a", false), addr(1)).await;

        assert_eq!(outcome, DispatchOutcome::JoinReplyFailed);
        assert!(server.sessions().is_empty());
        assert_eq!(server.stats().join_reply_failures, 1);
        assert_eq!(server.stats().evictions, 0);
    }

    #[tokio::test]
    async fn test_failed_rejection_reply_is_counted() {
        let mut server = server(1);
        joined(&mut server, 1, "first").await;
        server.transport().fail_sends_to(addr(2));

        let outcome = server.dispatch(&encode_hello("second", false), addr(2)).await;

        assert_eq!(outcome, DispatchOutcome::JoinReplyFailed);
        assert_eq!(server.sessions().len(), 1);
        assert_eq!(server.stats().join_reply_failures, 1);
        assert_eq!(server.stats().evictions, 0);
    }

    #[tokio::test]
    async fn test_bye_ack_skips_queued_frames() {
        let mut server = server(2);
        joined(&mut server, 1, "alice").await;
        server.sessions_mut().add_ping(0).unwrap();

        server.dispatch(&frames(&[ClientFrame::Bye]), addr(1)).await;

        // The pending ping is dropped with the session, never sent.
        assert_eq!(
            server.transport().sent_to(addr(1)),
            vec![
                vec![1, ServerOpcode::AckOk as u8],
                vec![1, ServerOpcode::ByeAck as u8],
            ]
        );
    }
}
