use std::time::Duration;

use async_trait::async_trait;
use killfeed_common::record::RawEvent;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Seconds RedisQ holds the request open when it has nothing to hand out.
const REDISQ_TIME_TO_WAIT: u64 = 10;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("failed to send request: {0}")]
    RequestError(#[source] reqwest::Error),
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(StatusCode),
    #[error("failed to decode response: {0}")]
    DecodeError(#[source] reqwest::Error),
}

/// Source of raw killmail notifications.
#[async_trait]
pub trait EventFeed: Send + Sync {
    /// Next event, or `None` if the feed had nothing within its wait.
    async fn next_event(&self) -> Result<Option<RawEvent>, FeedError>;
}

#[derive(Deserialize)]
struct RedisQResponse {
    package: Option<RawEvent>,
}

/// zKillboard's RedisQ long-poll endpoint. Each queue id is a separate
/// cursor on zKillboard's side, so one poller per queue id.
pub struct RedisQFeed {
    client: reqwest::Client,
    url: String,
    queue_id: String,
}

impl RedisQFeed {
    pub fn new(url: &str, queue_id: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(format!("Killfeed/{}", killfeed_common::VERSION))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.to_owned(),
            queue_id: queue_id.to_owned(),
        })
    }
}

#[async_trait]
impl EventFeed for RedisQFeed {
    async fn next_event(&self) -> Result<Option<RawEvent>, FeedError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("queueID", self.queue_id.clone()),
                ("ttw", REDISQ_TIME_TO_WAIT.to_string()),
            ])
            .send()
            .await
            .map_err(FeedError::RequestError)?;

        if response.status() != StatusCode::OK {
            return Err(FeedError::UnexpectedStatus(response.status()));
        }

        let body: RedisQResponse = response.json().await.map_err(FeedError::DecodeError)?;

        Ok(body.package)
    }
}
