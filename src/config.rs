//! Configuration: typed structs loaded from a JSON file, with
//! documented defaults for every tunable.
//!
//! Sources describe where metric values come from; targets describe
//! which channels receive them and how. The Discord bot token may come
//! from the file or from the `FOLLOWSYNC_DISCORD_TOKEN` environment
//! variable (a `.env` file is honored).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::time::Duration;
use tracing::warn;

use crate::extract::Strategy;
use crate::retry::RetryPolicy;
use crate::update::TargetKind;

pub const TOKEN_ENV_VAR: &str = "FOLLOWSYNC_DISCORD_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Seconds between poll cycles. Default 4 hours.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub fetch: FetchTuning,
    #[serde(default)]
    pub edit: EditTuning,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// Limits for external metric fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchTuning {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    /// Fetch pool size, the number of concurrent external requests.
    #[serde(default = "default_fetch_concurrency")]
    pub max_concurrent: usize,
    /// User-Agent sent with external fetches. Defaults to a browser-ish
    /// agent when unset.
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Limits for remote channel edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditTuning {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    /// Edit pool size, the number of concurrent channel edits.
    #[serde(default = "default_edit_concurrency")]
    pub max_concurrent: usize,
}

/// Combined display text policy for targets fed by several sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisplayConfig {
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Above this length the combined text switches to abbreviated form.
    #[serde(default = "default_max_display_len")]
    pub max_display_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscordConfig {
    /// Bot token. Usually left unset here and supplied via env.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

/// An external origin of a metric value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    /// Throttle key. Sources sharing a service share its min interval.
    /// Defaults to `name`.
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Payload locations (URLs), tried in order until one yields a value.
    pub locations: Vec<String>,
    /// Minimum seconds between requests to this source's service.
    #[serde(default = "default_service_min_interval")]
    pub min_interval_secs: u64,
    /// Extraction strategies, priority order. Defaults to the generic
    /// follower-count probes.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<Strategy>,
    /// Display label, e.g. "TikTok".
    pub label: String,
    /// Short label for abbreviated display, e.g. "TT". Defaults to `label`.
    #[serde(default)]
    pub short_label: Option<String>,
    /// Extra request headers sent with every fetch for this source
    /// (Referer, app ids and similar site requirements).
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl SourceConfig {
    pub fn service_key(&self) -> &str {
        self.service.as_deref().unwrap_or(&self.name)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn short_label(&self) -> &str {
        self.short_label.as_deref().unwrap_or(&self.label)
    }
}

/// A remote channel kept in sync with one or more sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Channel id.
    pub id: String,
    /// Name-like (voice channel name) or text-like (topic).
    pub kind: TargetKind,
    /// Local write throttle, independent of the remote API's limits.
    #[serde(default = "default_target_min_interval")]
    pub min_update_secs: u64,
    /// Names of the sources whose values feed this target.
    pub sources: Vec<String>,
}

impl TargetConfig {
    pub fn min_update_interval(&self) -> Duration {
        Duration::from_secs(self.min_update_secs)
    }
}

impl Config {
    /// Load from a JSON file. A missing file yields the defaults (and a
    /// warning), matching how an empty deployment starts up.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Token resolution: environment wins over the file.
    pub fn discord_token(&self) -> Option<String> {
        std::env::var(TOKEN_ENV_VAR)
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| self.discord.token.clone())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl FetchTuning {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: self.backoff_base,
            base_delay: Duration::from_secs(self.base_delay_secs),
        }
    }
}

impl EditTuning {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: self.backoff_base,
            base_delay: Duration::from_secs(self.base_delay_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            fetch: FetchTuning::default(),
            edit: EditTuning::default(),
            display: DisplayConfig::default(),
            discord: DiscordConfig::default(),
            sources: Vec::new(),
            targets: Vec::new(),
        }
    }
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: default_api_base(),
        }
    }
}

impl Default for FetchTuning {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            base_delay_secs: default_base_delay(),
            max_concurrent: default_fetch_concurrency(),
            user_agent: None,
        }
    }
}

impl Default for EditTuning {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            base_delay_secs: default_base_delay(),
            max_concurrent: default_edit_concurrency(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            max_display_len: default_max_display_len(),
        }
    }
}

fn default_poll_interval() -> u64 {
    4 * 3600
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base() -> f64 {
    2.0
}
fn default_base_delay() -> u64 {
    1
}
fn default_fetch_concurrency() -> usize {
    3
}
fn default_edit_concurrency() -> usize {
    2
}
fn default_separator() -> String {
    " | ".to_string()
}
fn default_max_display_len() -> usize {
    100
}
fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}
fn default_service_min_interval() -> u64 {
    300
}
fn default_target_min_interval() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

fn default_strategies() -> Vec<Strategy> {
    vec![
        Strategy::KeyRegex {
            key: "followerCount".into(),
        },
        Strategy::LabelledNumber {
            label: "Followers".into(),
        },
    ]
}
