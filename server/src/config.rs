//! Startup configuration for the game server.

use crate::liveness::LivenessPolicy;
use shared::{DEFAULT_PORT, MAX_DATAGRAM};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_CLIENTS: usize = 16;
pub const DEFAULT_TICK_BUDGET_US: u64 = 20_000;
pub const DEFAULT_PING_IDLE_TICKS: u32 = 100;
pub const DEFAULT_PING_MISS_LIMIT: u32 = 3;
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Slot numbers travel in a single byte.
pub const MAX_CLIENTS_LIMIT: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("buffer capacity {0} must be between 2 and {max}", max = MAX_DATAGRAM)]
    BufferCapacity(usize),
    #[error("max clients {0} must be between 1 and {max}", max = MAX_CLIENTS_LIMIT)]
    MaxClients(usize),
    #[error("tick budget must be greater than zero")]
    ZeroTickBudget,
    #[error("ping idle ticks must be greater than zero")]
    ZeroPingIdleTicks,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the UDP socket binds to
    pub bind_addr: SocketAddr,
    /// Session table capacity
    pub max_clients: usize,
    /// Target duration of one tick
    pub tick_budget: Duration,
    /// How long a pass waits for an inbound datagram before doing tick work
    pub poll_timeout: Duration,
    /// Idle ticks before a participating session is pinged
    pub ping_idle_ticks: u32,
    /// Unanswered pings tolerated before eviction
    pub ping_miss_limit: u32,
    /// Bytes per outbound batch, count byte included
    pub buffer_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            max_clients: DEFAULT_MAX_CLIENTS,
            tick_budget: Duration::from_micros(DEFAULT_TICK_BUDGET_US),
            poll_timeout: Duration::from_micros(1),
            ping_idle_ticks: DEFAULT_PING_IDLE_TICKS,
            ping_miss_limit: DEFAULT_PING_MISS_LIMIT,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=MAX_DATAGRAM).contains(&self.buffer_capacity) {
            return Err(ConfigError::BufferCapacity(self.buffer_capacity));
        }
        if !(1..=MAX_CLIENTS_LIMIT).contains(&self.max_clients) {
            return Err(ConfigError::MaxClients(self.max_clients));
        }
        if self.tick_budget.is_zero() {
            return Err(ConfigError::ZeroTickBudget);
        }
        if self.ping_idle_ticks == 0 {
            return Err(ConfigError::ZeroPingIdleTicks);
        }
        Ok(())
    }

    pub fn liveness_policy(&self) -> LivenessPolicy {
        LivenessPolicy {
            ping_idle_ticks: self.ping_idle_ticks,
            ping_miss_limit: self.ping_miss_limit,
        }
    }
}
