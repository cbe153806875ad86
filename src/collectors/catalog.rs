use crate::collectors::promotions;
use crate::config::CatalogConfig;
use crate::models::promotion::PromotionItem;
use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

const CLIENT_ID: &str = concat!("freenow/", env!("CARGO_PKG_VERSION"), " (free promotion checker)");

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport { url: String, source: reqwest::Error },

    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} returned invalid JSON: {source}")]
    Decode { url: String, source: reqwest::Error },

    #[error("malformed catalog payload: {0}")]
    Malformed(String),

    #[error("no catalog endpoints configured")]
    NoEndpoints,

    #[error("all catalog endpoints failed; last error: {last}")]
    AllEndpointsFailed { last: Box<FetchError> },
}

/// Anything that can produce the current free promotions.
pub trait CatalogSource {
    fn fetch_free_now(&self, now: DateTime<Utc>) -> Result<Vec<PromotionItem>, FetchError>;
}

/// Blocking HTTP fetcher with per-endpoint retries and endpoint fallback.
pub struct CatalogFetcher {
    client:    Client,
    endpoints: Vec<String>,
    attempts:  u32,
    backoff:   Duration,
    tz:        Tz,
    locale:    String,
}

impl CatalogFetcher {
    pub fn new(cfg: &CatalogConfig, tz: Tz) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.timeout())
            .build()?;
        Ok(Self {
            client,
            endpoints: cfg.endpoints(),
            attempts:  cfg.attempts.max(1),
            backoff:   cfg.backoff(),
            tz,
            locale:    cfg.locale.clone(),
        })
    }

    /// GET `url` as JSON. Retries transport errors, non-2xx answers and bad
    /// bodies, sleeping `backoff * attempt` between tries.
    pub fn fetch_json(&self, url: &str) -> Result<Value, FetchError> {
        let mut attempt = 1;
        loop {
            match self.get_once(url) {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= self.attempts => return Err(e),
                Err(e) => {
                    let delay = self.backoff * attempt;
                    tracing::warn!(url, attempt, error = %e, delay_ms = delay.as_millis() as u64, "fetch failed, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    fn get_once(&self, url: &str) -> Result<Value, FetchError> {
        let resp = self.client.get(url)
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, CLIENT_ID)
            .send()
            .map_err(|source| FetchError::Transport { url: url.to_string(), source })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status { url: url.to_string(), status: status.as_u16() });
        }
        resp.json::<Value>()
            .map_err(|source| FetchError::Decode { url: url.to_string(), source })
    }
}

impl CatalogSource for CatalogFetcher {
    /// First endpoint that both answers and parses wins.
    fn fetch_free_now(&self, now: DateTime<Utc>) -> Result<Vec<PromotionItem>, FetchError> {
        let mut last: Option<FetchError> = None;
        for url in &self.endpoints {
            let result = self.fetch_json(url)
                .and_then(|payload| promotions::parse_free_now(&payload, now, self.tz, &self.locale));
            match result {
                Ok(items) => {
                    tracing::info!(url = %url, count = items.len(), "catalog fetched");
                    return Ok(items);
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "endpoint failed");
                    last = Some(e);
                }
            }
        }
        match last {
            Some(e) => Err(FetchError::AllEndpointsFailed { last: Box::new(e) }),
            None    => Err(FetchError::NoEndpoints),
        }
    }
}
