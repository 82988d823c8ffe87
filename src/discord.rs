//! Discord REST adapter: `ChannelApi` over `PATCH /channels/{id}`.
//!
//! Error responses are classified into the shared taxonomy: 403/404 are
//! unrecoverable, 429 is rate-limited with the server's own suggested
//! delay (Discord puts it in the JSON body as fractional seconds, and
//! sometimes in a `Retry-After` header), 5xx is transient.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::fetch::parse_retry_after;
use crate::retry::CallError;
use crate::update::{ChannelApi, TargetKind};

pub struct DiscordApi {
    client: reqwest::Client,
    api_base: String,
}

impl DiscordApi {
    pub fn new(token: &str, api_base: &str) -> anyhow::Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bot {}", token))
            .context("bot token contains invalid header characters")?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("failed to build Discord HTTP client")?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn channel_url(&self, id: &str) -> String {
        format!("{}/channels/{}", self.api_base, id)
    }
}

/// Pull Discord's suggested delay out of a 429 response body
/// (`{"retry_after": 1.23, ...}`).
fn body_retry_after(body: &str) -> Option<Duration> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    let secs = parsed.get("retry_after")?.as_f64()?;
    if secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

fn classify_edit(status: u16, retry_after: Option<Duration>, body: &str) -> CallError {
    match status {
        429 => CallError::RateLimited {
            retry_after: body_retry_after(body).or(retry_after),
            message: "discord returned 429".into(),
        },
        403 => CallError::Unrecoverable("missing permission to edit channel".into()),
        404 => CallError::Unrecoverable("channel not found".into()),
        500..=599 => CallError::Transient(format!("discord returned {}", status)),
        _ => {
            // Bodies can be localized; truncate on characters, not bytes.
            let excerpt: String = body.chars().take(300).collect();
            CallError::Unrecoverable(format!("discord returned {}: {}", status, excerpt))
        }
    }
}

#[async_trait]
impl ChannelApi for DiscordApi {
    async fn edit(&self, id: &str, kind: TargetKind, value: &str) -> Result<(), CallError> {
        let field = match kind {
            TargetKind::Name => "name",
            TargetKind::Topic => "topic",
        };
        let body = serde_json::json!({ field: value });

        let resp = self
            .client
            .patch(self.channel_url(id))
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::Transient(e.to_string()))?;

        let status = resp.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(());
        }
        let retry_after = parse_retry_after(resp.headers());
        let text = resp.text().await.unwrap_or_default();
        Err(classify_edit(status, retry_after, &text))
    }

    /// Best-effort capability probe: a channel we cannot GET is a
    /// channel we certainly cannot edit. A successful GET does not prove
    /// Manage Channels, but it filters the guaranteed rejections.
    async fn check_permission(&self, id: &str) -> bool {
        match self.client.get(self.channel_url(id)).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if status == 403 || status == 404 {
                    warn!(channel = %id, status, "channel not accessible");
                    false
                } else {
                    true
                }
            }
            Err(e) => {
                // Transport failure says nothing about permission; let
                // the edit attempt decide.
                debug!(channel = %id, error = %e, "permission probe failed");
                true
            }
        }
    }

    async fn read(&self, id: &str, kind: TargetKind) -> Option<String> {
        let resp = self.client.get(self.channel_url(id)).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let parsed: Value = resp.json().await.ok()?;
        let field = match kind {
            TargetKind::Name => "name",
            TargetKind::Topic => "topic",
        };
        parsed.get(field)?.as_str().map(String::from)
    }
}
