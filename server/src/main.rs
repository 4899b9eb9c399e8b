use clap::Parser;
use log::{error, info};
use server::config::{
    ServerConfig, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_CLIENTS, DEFAULT_PING_IDLE_TICKS,
    DEFAULT_PING_MISS_LIMIT, DEFAULT_TICK_BUDGET_US,
};
use server::game::GameState;
use server::network::Server;
use shared::DEFAULT_PORT;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// IP address to bind to
    #[clap(short = 'H', long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    host: IpAddr,
    /// UDP port to listen on
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Number of session slots
    #[clap(short, long, default_value_t = DEFAULT_MAX_CLIENTS)]
    max_clients: usize,
    /// Target tick duration in microseconds
    #[clap(long, default_value_t = DEFAULT_TICK_BUDGET_US)]
    tick_budget_us: u64,
    /// Idle ticks before a session is pinged
    #[clap(long, default_value_t = DEFAULT_PING_IDLE_TICKS)]
    ping_idle_ticks: u32,
    /// Unanswered pings tolerated before a session is dropped
    #[clap(long, default_value_t = DEFAULT_PING_MISS_LIMIT)]
    ping_miss_limit: u32,
    /// Outbound batch size in bytes
    #[clap(long, default_value_t = DEFAULT_BUFFER_CAPACITY)]
    buffer_capacity: usize,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: SocketAddr::new(self.host, self.port),
            max_clients: self.max_clients,
            tick_budget: Duration::from_micros(self.tick_budget_us),
            ping_idle_ticks: self.ping_idle_ticks,
            ping_miss_limit: self.ping_miss_limit,
            buffer_capacity: self.buffer_capacity,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();

    let mut server = match Server::bind(config, GameState::new()) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {}", e);
            process::exit(e.exit_code());
        }
    };

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }
}
