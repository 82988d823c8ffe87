//! Fetch orchestrator: obtains a current metric value for one source.
//!
//! Combines the throttle ledger (per-service spacing), the fetch slot
//! pool, and the retrying executor, then runs the source's extraction
//! strategies over each payload location in order. The orchestrator
//! reports a failure with an explanation when everything is exhausted;
//! it never fabricates a value.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, RETRY_AFTER, USER_AGENT};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::extract;
use crate::pool::SlotPool;
use crate::retry::{self, CallError, RetryError, RetryPolicy};
use crate::throttle::ThrottleLedger;

/// Raw result of one HTTP fetch, before classification.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    /// Server-provided retry delay, if the response carried one.
    pub retry_after: Option<Duration>,
}

/// An external metric endpoint. Transport-level failures map to
/// `CallError::Transient`; status classification is the caller's job.
#[async_trait]
pub trait MetricProvider: Send + Sync {
    /// Fetch one payload location, sending any per-source extra headers
    /// (Referer, app ids and the like) along with the request.
    async fn fetch_raw(
        &self,
        location: &str,
        headers: &HashMap<String, String>,
    ) -> Result<RawResponse, CallError>;
}

/// reqwest-backed provider with a browser-ish User-Agent. The scraped
/// sites answer differently (or not at all) to default client agents.
pub struct HttpMetricProvider {
    client: reqwest::Client,
}

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

impl HttpMetricProvider {
    pub fn new(user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let agent = user_agent.unwrap_or(DEFAULT_USER_AGENT);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(agent).context("user agent contains invalid characters")?,
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(20))
            .build()
            .context("failed to build fetch HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MetricProvider for HttpMetricProvider {
    async fn fetch_raw(
        &self,
        location: &str,
        headers: &HashMap<String, String>,
    ) -> Result<RawResponse, CallError> {
        let mut request = self.client.get(location);
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let resp = request
            .send()
            .await
            .map_err(|e| CallError::Transient(e.to_string()))?;

        let status = resp.status().as_u16();
        let retry_after = parse_retry_after(resp.headers());
        let body = resp
            .text()
            .await
            .map_err(|e| CallError::Transient(e.to_string()))?;

        Ok(RawResponse {
            status,
            body,
            retry_after,
        })
    }
}

/// Read a `Retry-After` header as a delay in seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = raw.trim().parse().ok()?;
    if secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// Classification mapping for external fetches: 2xx success, 429 rate
/// limited (with any server hint), 5xx transient, the rest
/// unrecoverable.
fn classify_fetch(resp: RawResponse) -> Result<String, CallError> {
    match resp.status {
        200 | 201 => Ok(resp.body),
        429 => Err(CallError::RateLimited {
            retry_after: resp.retry_after,
            message: "external endpoint returned 429".into(),
        }),
        500..=599 => Err(CallError::Transient(format!(
            "external endpoint returned {}",
            resp.status
        ))),
        status => Err(CallError::Unrecoverable(format!(
            "external endpoint returned {}",
            status
        ))),
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source {name}: request failed: {last}")]
    Request { name: String, last: RetryError },
    #[error("source {name}: all extraction strategies exhausted")]
    Extraction { name: String },
}

pub struct FetchOrchestrator {
    provider: Arc<dyn MetricProvider>,
    throttle: Arc<ThrottleLedger>,
    pool: SlotPool,
    policy: RetryPolicy,
}

impl FetchOrchestrator {
    pub fn new(
        provider: Arc<dyn MetricProvider>,
        throttle: Arc<ThrottleLedger>,
        pool: SlotPool,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            throttle,
            pool,
            policy,
        }
    }

    /// Fetch the current metric value for `source`.
    ///
    /// Waits out the per-service throttle, takes a fetch slot, then
    /// tries each payload location through the retrying executor. The
    /// first location whose payload yields a well-formed value wins.
    /// Extraction failure on a fetched payload does not refetch within
    /// the same call.
    pub async fn fetch(&self, source: &SourceConfig) -> Result<u64, FetchError> {
        self.throttle
            .wait_if_needed(source.service_key(), source.min_interval())
            .await;
        let _slot = self.pool.acquire().await;

        let mut fetched_any = false;
        let mut last_err: Option<RetryError> = None;

        for location in &source.locations {
            let provider = &self.provider;
            let extra_headers = &source.headers;
            let body = match retry::execute(&self.policy, source.service_key(), move || {
                let provider = Arc::clone(provider);
                let location = location.clone();
                let headers = extra_headers.clone();
                async move {
                    let resp = provider.fetch_raw(&location, &headers).await?;
                    classify_fetch(resp)
                }
            })
            .await
            {
                Ok(body) => body,
                Err(err) => {
                    warn!(
                        source = %source.name,
                        location = %location,
                        error = %err,
                        "payload location failed"
                    );
                    last_err = Some(err);
                    continue;
                }
            };

            fetched_any = true;
            if let Some(value) = extract::extract(&source.strategies, &body) {
                info!(source = %source.name, value, "metric fetched");
                return Ok(value);
            }
            debug!(
                source = %source.name,
                location = %location,
                "no extraction strategy matched payload"
            );
        }

        match (fetched_any, last_err) {
            // At least one payload came back but nothing matched it.
            (true, _) | (false, None) => Err(FetchError::Extraction {
                name: source.name.clone(),
            }),
            (false, Some(last)) => Err(FetchError::Request {
                name: source.name.clone(),
                last,
            }),
        }
    }
}
