//! # Server Configuration
//!
//! Every setting can come from a command-line flag or the matching
//! environment variable (`PORT`, `POLL_TIMEOUT_SECS`, ...), which is how
//! hosted deployments hand the listening port to the process.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;

/// How long a long poll is held open before answering `{"data": null}`.
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;

/// How often idle tunnels are swept.
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 60;

pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone, Parser)]
#[command(name = "tunnel-relay", version, about = "Rendezvous relay for NAT-bound devices")]
pub struct Config {
    /// Address to listen on.
    #[arg(long, env = "HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Long-poll deadline in seconds.
    #[arg(
        long,
        env = "POLL_TIMEOUT_SECS",
        default_value_t = DEFAULT_POLL_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub poll_timeout_secs: u64,

    /// Interval between idle-tunnel sweeps in seconds.
    #[arg(
        long,
        env = "REAP_INTERVAL_SECS",
        default_value_t = DEFAULT_REAP_INTERVAL_SECS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub reap_interval_secs: u64,
}

impl Config {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            poll_timeout_secs: DEFAULT_POLL_TIMEOUT_SECS,
            reap_interval_secs: DEFAULT_REAP_INTERVAL_SECS,
        }
    }
}
