//! # Game Server Library
//!
//! Session layer of an authoritative game server that talks to its clients
//! over plain UDP. There is no connection to open or lose, so the server
//! invents its own: a join handshake assigns a slot, every datagram from that
//! address is attributed to the slot, and silence is detected with pings.
//!
//! ## Data Flow
//!
//! A datagram arrives and the dispatcher decodes its frames. Handlers update
//! the session table or the simulation and may queue replies in the session's
//! outbound batch. When no datagram is waiting, the tick scheduler flushes
//! every batch as one datagram per session, runs the liveness sweep, steps the
//! simulation and sleeps out the remainder of the tick budget.
//!
//! ## Module Organization
//!
//! ### Session Table (`session`)
//! Fixed number of slots. A slot is either empty or holds a whole session:
//! peer address, flags, player handle, outbound batch and liveness record.
//!
//! ### Outbound Batch Buffer (`outbound`)
//! Packs `[count][opcode][payload]...` into a bounded buffer. A frame that
//! does not fit is rejected without touching what is already queued.
//!
//! ### Liveness Monitor (`liveness`)
//! Counts idle ticks, pings quiet sessions and evicts those that ignore too
//! many pings.
//!
//! ### Dispatcher (`dispatch`)
//! Join handshakes and per-frame handling. An unknown opcode ends the
//! datagram but keeps the effects of frames already applied.
//!
//! ### Tick Scheduler (`network`)
//! The single-threaded loop owning all of the above.
//!
//! ### Seams (`game`, `transport`)
//! `Simulation` is everything the session layer asks of the game;
//! `Transport` is the datagram socket. Both have in-memory doubles for tests.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::game::GameState;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         max_clients: 8,
//!         ..Default::default()
//!     };
//!     let mut server = Server::bind(config, GameState::new())?;
//!     server.run().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod game;
pub mod liveness;
pub mod network;
pub mod outbound;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
