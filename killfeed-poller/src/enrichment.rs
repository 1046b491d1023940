use std::time::Duration;

use async_trait::async_trait;
use killfeed_common::record::Killmail;
use reqwest::header;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("failed to fetch killmail from ESI: {0}")]
    RequestError(#[source] reqwest::Error),
    #[error("ESI answered {0} for the killmail")]
    UnexpectedStatus(reqwest::StatusCode),
    #[error("failed to decode killmail from ESI: {0}")]
    DecodeError(#[source] reqwest::Error),
}

/// Fetches the full killmail for a feed notification.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn fetch_detail(&self, killmail_id: i64, hash: &str) -> Result<Killmail, EnrichError>;
}

pub struct EsiClient {
    client: reqwest::Client,
    base_url: String,
}

impl EsiClient {
    pub fn new(base_url: &str, contact: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(user_agent(contact))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    fn killmail_url(&self, killmail_id: i64, hash: &str) -> String {
        format!("{}/killmails/{}/{}/", self.base_url, killmail_id, hash)
    }
}

fn user_agent(contact: &str) -> String {
    format!("Killfeed/{} ({})", killfeed_common::VERSION, contact)
}

#[async_trait]
impl Enricher for EsiClient {
    async fn fetch_detail(&self, killmail_id: i64, hash: &str) -> Result<Killmail, EnrichError> {
        let response = self
            .client
            .get(self.killmail_url(killmail_id, hash))
            .send()
            .await
            .map_err(EnrichError::RequestError)?;

        if !response.status().is_success() {
            return Err(EnrichError::UnexpectedStatus(response.status()));
        }

        response.json().await.map_err(EnrichError::DecodeError)
    }
}
