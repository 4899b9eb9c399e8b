//! Server context and the tick-paced event loop.

use crate::config::ServerConfig;
use crate::error::{FlushError, StartupError};
use crate::game::Simulation;
use crate::liveness::{self, LivenessPolicy};
use crate::session::SessionTable;
use crate::transport::{bind_udp, Transport};
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};

/// Large enough for any datagram a well-behaved client sends.
pub const RECV_BUFFER_SIZE: usize = 2048;

/// Ticks between periodic statistics lines.
const STATS_INTERVAL: u64 = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub datagrams: u64,
    pub frames: u64,
    /// Datagrams cut short by a bad opcode or a server-kill request
    pub aborted_datagrams: u64,
    pub unknown_senders: u64,
    pub overflows: u64,
    pub evictions: u64,
    /// Joins whose acknowledgement could not be sent
    pub join_reply_failures: u64,
    pub ticks: u64,
}

/// What a single pass of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    Received,
    Ticked,
}

/// Everything the loop touches. Only one pass runs at a time, so nothing here
/// is shared or locked.
pub struct Server<T: Transport, G: Simulation> {
    pub(crate) transport: T,
    pub(crate) sessions: SessionTable,
    pub(crate) game: G,
    pub(crate) config: ServerConfig,
    pub(crate) policy: LivenessPolicy,
    pub(crate) stats: ServerStats,
    recv_buf: Vec<u8>,
}

impl<G: Simulation> Server<UdpSocket, G> {
    /// Validates the configuration and binds the UDP socket.
    pub fn bind(config: ServerConfig, game: G) -> Result<Self, StartupError> {
        config.validate()?;
        let socket = bind_udp(config.bind_addr)?;
        info!("Server listening on {}", config.bind_addr);
        Ok(Self::with_transport(config, socket, game))
    }
}

impl<T: Transport, G: Simulation> Server<T, G> {
    pub fn with_transport(config: ServerConfig, transport: T, game: G) -> Self {
        Self {
            transport,
            sessions: SessionTable::new(config.max_clients, config.buffer_capacity),
            game,
            policy: config.liveness_policy(),
            config,
            stats: ServerStats::default(),
            recv_buf: vec![0; RECV_BUFFER_SIZE],
        }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionTable {
        &mut self.sessions
    }

    pub fn game(&self) -> &G {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut G {
        &mut self.game
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            overflows: self.sessions.overflows(),
            ..self.stats
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// One pass of the loop: dispatch a ready datagram, or else run the tick
    /// work and sleep out the rest of the budget. Never both.
    pub async fn run_once(&mut self) -> Iteration {
        let started = Instant::now();
        let mut buf = std::mem::take(&mut self.recv_buf);

        let received = timeout(
            self.config.poll_timeout,
            self.transport.recv_from(&mut buf),
        )
        .await;
        let iteration = match received {
            Ok(Ok((len, from))) => {
                self.stats.datagrams += 1;
                let outcome = self.dispatch(&buf[..len], from).await;
                debug!("Datagram from {} ({} bytes): {:?}", from, len, outcome);
                Iteration::Received
            }
            Ok(Err(e)) => {
                warn!("Receive failed: {}", e);
                self.tick(started).await;
                Iteration::Ticked
            }
            Err(_) => {
                self.tick(started).await;
                Iteration::Ticked
            }
        };

        self.recv_buf = buf;
        iteration
    }

    /// Sends `data` to the session in `slot` at once. Frames already queued
    /// in its batch stay queued for the next flush.
    pub async fn send_direct(&self, slot: usize, data: &[u8]) -> Result<usize, FlushError> {
        let addr = self
            .sessions
            .get(slot)
            .map(|session| session.addr)
            .ok_or(FlushError::NoSession(slot))?;
        Ok(self.transport.send_to(data, addr).await?)
    }

    /// Runs until the task is dropped.
    pub async fn run(&mut self) {
        info!(
            "Server started: {} slots, {:?} tick",
            self.sessions.capacity(),
            self.config.tick_budget
        );
        loop {
            self.run_once().await;
        }
    }

    async fn tick(&mut self, started: Instant) {
        self.stats.ticks += 1;

        let failed = self.sessions.flush_all(&self.transport, &mut self.game).await;
        self.stats.evictions += failed.len() as u64;

        let report = liveness::sweep(&mut self.sessions, &mut self.game, &self.policy);
        self.stats.evictions += report.evicted.len() as u64;

        self.game.update(&mut self.sessions);

        let elapsed = started.elapsed();
        if self.stats.ticks.is_multiple_of(STATS_INTERVAL) {
            debug!(
                "Tick {}: {} sessions, {:?} used, {:?}",
                self.stats.ticks,
                self.sessions.len(),
                elapsed,
                self.stats()
            );
        }

        sleep(self.config.tick_budget.saturating_sub(elapsed)).await;
    }
}
