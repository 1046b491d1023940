use std::num::NonZeroUsize;

use envconfig::Envconfig;
use killfeed_common::config::{EnvMsDuration, NonEmptyString, StreamConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "development")]
    pub environment: String,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub stream: StreamConfig,

    /// Sent to ESI in the user agent so CCP can reach the operator.
    pub esi_contact_information: NonEmptyString,

    #[envconfig(from = "ZKILLBOARD_QUEUE_ID")]
    pub queue_id: NonEmptyString,

    #[envconfig(default = "https://zkillredisq.stream/listen.php")]
    pub redisq_url: String,

    #[envconfig(default = "https://esi.evetech.net/latest")]
    pub esi_url: String,

    #[envconfig(default = "15000")]
    pub feed_timeout_ms: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub esi_timeout_ms: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub feed_backoff_ms: EnvMsDuration,

    #[envconfig(default = "1024")]
    pub dedup_capacity: NonZeroUsize,

    #[envconfig(default = "64")]
    pub max_concurrent_enrichments: NonZeroUsize,

    #[envconfig(default = "15000")]
    pub enrichment_drain_timeout_ms: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
