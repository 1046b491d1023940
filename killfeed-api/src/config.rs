use std::net::SocketAddr;

use envconfig::Envconfig;
use killfeed_common::config::{EnvMsDuration, StreamConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "development")]
    pub environment: String,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "PORT", default = "8081")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub stream: StreamConfig,

    #[envconfig(default = "100")]
    pub poll_batch_size: usize,

    /// How long a pull is held open waiting for the first new killmail.
    #[envconfig(default = "60000")]
    pub poll_wait_ms: EnvMsDuration,

    #[envconfig(default = "10")]
    pub websocket_batch_size: usize,

    /// Upper bound of a single push read; cancellation is checked between reads.
    #[envconfig(default = "5000")]
    pub websocket_wait_ms: EnvMsDuration,

    #[envconfig(default = "86400")]
    pub cursor_ttl_secs: u64,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

impl Config {
    pub fn address(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}
