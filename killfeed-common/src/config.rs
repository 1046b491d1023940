use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

pub const ENVIRONMENT_PRODUCTION: &str = "production";

/// Where the killmail log lives. Shared by every binary.
#[derive(Envconfig, Clone)]
pub struct StreamConfig {
    pub redis_url: NonEmptyString,

    #[envconfig(default = "killmails")]
    pub stream_key: NonEmptyString,

    #[envconfig(default = "10000")]
    pub stream_max_length: usize,

    // One redis connection per concurrent blocking read.
    #[envconfig(default = "256")]
    pub stream_max_blocking_reads: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
