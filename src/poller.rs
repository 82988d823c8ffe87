//! Poll loop: drives one full cycle (fetch every enabled source, then
//! reconcile every mapped target) on a fixed period, forever, until
//! cancelled.
//!
//! A single interval timer is the only ticking mechanism. Cycles are
//! spaced at least the configured period apart; if a cycle overruns,
//! the schedule drifts rather than bunching ticks. Failures from any
//! one source or target are logged and swallowed here; the loop never
//! terminates because of them.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, SourceConfig, TargetConfig};
use crate::fetch::FetchOrchestrator;
use crate::format::{self, DisplayPart};
use crate::update::UpdateController;

pub struct SyncEngine {
    sources: Vec<SourceConfig>,
    targets: Vec<TargetConfig>,
    separator: String,
    max_display_len: usize,
    fetcher: Arc<FetchOrchestrator>,
    updater: Arc<UpdateController>,
}

impl SyncEngine {
    pub fn new(
        config: &Config,
        fetcher: Arc<FetchOrchestrator>,
        updater: Arc<UpdateController>,
    ) -> Self {
        Self {
            sources: config.sources.clone(),
            targets: config.targets.clone(),
            separator: config.display.separator.clone(),
            max_display_len: config.display.max_display_len,
            fetcher,
            updater,
        }
    }

    /// One full cycle: all enabled sources fetched independently, then
    /// all mapped targets reconciled.
    pub async fn run_cycle(&self) {
        let values = self.fetch_all().await;
        self.reconcile_all(&values).await;
    }

    /// Fetch every enabled source concurrently. The fetch pool bounds
    /// how many are actually in flight; one source's failure never
    /// blocks another's.
    async fn fetch_all(&self) -> HashMap<String, u64> {
        let mut set = JoinSet::new();
        for source in self.sources.iter().filter(|s| s.enabled) {
            let fetcher = Arc::clone(&self.fetcher);
            let source = source.clone();
            set.spawn(async move {
                let name = source.name.clone();
                (name, fetcher.fetch(&source).await)
            });
        }

        let mut values = HashMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(value))) => {
                    values.insert(name, value);
                }
                Ok((name, Err(err))) => {
                    warn!(source = %name, error = %err, "fetch failed this cycle");
                }
                Err(err) => {
                    error!(error = %err, "fetch task panicked");
                }
            }
        }
        values
    }

    async fn reconcile_all(&self, values: &HashMap<String, u64>) {
        for target in &self.targets {
            let parts: Vec<DisplayPart> = target
                .sources
                .iter()
                .filter_map(|name| {
                    let count = *values.get(name)?;
                    let source = self.sources.iter().find(|s| &s.name == name)?;
                    Some(DisplayPart {
                        label: source.label.clone(),
                        short_label: source.short_label().to_string(),
                        count,
                    })
                })
                .collect();

            if parts.is_empty() {
                debug!(channel = %target.id, "no source values this cycle, skipping");
                continue;
            }

            let desired = format::compose(&parts, &self.separator, self.max_display_len);
            match self.updater.reconcile(target, &desired).await {
                Ok(true) => {}
                Ok(false) => debug!(channel = %target.id, "no write necessary"),
                Err(err) => warn!(channel = %target.id, error = %err, "update failed this cycle"),
            }
        }
    }
}

/// Tick forever. Ends only when the enclosing task is cancelled.
pub async fn run(engine: Arc<SyncEngine>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        info!("poll cycle starting");
        engine.run_cycle().await;
        debug!("poll cycle complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscordConfig, DisplayConfig, EditTuning, FetchTuning};
    use crate::extract::Strategy;
    use crate::fetch::{MetricProvider, RawResponse};
    use crate::pool::SlotPool;
    use crate::retry::{CallError, RetryPolicy};
    use crate::throttle::ThrottleLedger;
    use crate::update::{ChannelApi, TargetKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct CycleProvider {
        counts: Mutex<HashMap<String, u64>>,
        failing: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MetricProvider for CycleProvider {
        async fn fetch_raw(
            &self,
            location: &str,
            _headers: &HashMap<String, String>,
        ) -> Result<RawResponse, CallError> {
            if self.failing.lock().unwrap().iter().any(|l| l == location) {
                return Err(CallError::Unrecoverable("gone".into()));
            }
            let counts = self.counts.lock().unwrap();
            let count = counts.get(location).copied().unwrap_or(0);
            Ok(RawResponse {
                status: 200,
                body: format!(r#"{{"followerCount":{}}}"#, count),
                retry_after: None,
            })
        }
    }

    struct RecordingApi {
        edits: Mutex<Vec<(String, String)>>,
        edit_calls: AtomicU32,
    }

    #[async_trait]
    impl ChannelApi for RecordingApi {
        async fn edit(&self, id: &str, _kind: TargetKind, value: &str) -> Result<(), CallError> {
            self.edit_calls.fetch_add(1, Ordering::SeqCst);
            self.edits.lock().unwrap().push((id.into(), value.into()));
            Ok(())
        }
        async fn check_permission(&self, _id: &str) -> bool {
            true
        }
        async fn read(&self, _id: &str, _kind: TargetKind) -> Option<String> {
            None
        }
    }

    fn source(name: &str, label: &str, location: &str) -> SourceConfig {
        SourceConfig {
            name: name.into(),
            service: None,
            enabled: true,
            locations: vec![location.into()],
            min_interval_secs: 0,
            strategies: vec![Strategy::JsonPointer {
                pointer: "/followerCount".into(),
            }],
            label: label.into(),
            short_label: None,
            headers: HashMap::new(),
        }
    }

    fn engine(
        provider: Arc<CycleProvider>,
        api: Arc<RecordingApi>,
        sources: Vec<SourceConfig>,
        targets: Vec<TargetConfig>,
    ) -> SyncEngine {
        let config = Config {
            poll_interval_secs: 60,
            fetch: FetchTuning::default(),
            edit: EditTuning::default(),
            display: DisplayConfig::default(),
            discord: DiscordConfig::default(),
            sources,
            targets,
        };
        let fetcher = Arc::new(FetchOrchestrator::new(
            provider,
            Arc::new(ThrottleLedger::new()),
            SlotPool::new("fetch", 3),
            RetryPolicy::default(),
        ));
        let updater = Arc::new(UpdateController::new(
            api,
            SlotPool::new("edit", 2),
            RetryPolicy::default(),
        ));
        SyncEngine::new(&config, fetcher, updater)
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_fetches_and_updates_mapped_targets() {
        let provider = Arc::new(CycleProvider {
            counts: Mutex::new(HashMap::from([
                ("https://a".to_string(), 1_500u64),
                ("https://b".to_string(), 200u64),
            ])),
            failing: Mutex::new(vec![]),
        });
        let api = Arc::new(RecordingApi {
            edits: Mutex::new(vec![]),
            edit_calls: AtomicU32::new(0),
        });

        let engine = engine(
            Arc::clone(&provider),
            Arc::clone(&api),
            vec![
                source("tiktok", "TikTok", "https://a"),
                source("insta", "Instagram", "https://b"),
            ],
            vec![
                TargetConfig {
                    id: "chan-1".into(),
                    kind: TargetKind::Topic,
                    min_update_secs: 0,
                    sources: vec!["tiktok".into(), "insta".into()],
                },
            ],
        );

        engine.run_cycle().await;

        let edits = api.edits.lock().unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].0, "chan-1");
        assert_eq!(
            edits[0].1,
            "TikTok: 1,500 Followers | Instagram: 200 Followers"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_source_does_not_block_others() {
        let provider = Arc::new(CycleProvider {
            counts: Mutex::new(HashMap::from([("https://b".to_string(), 42u64)])),
            failing: Mutex::new(vec!["https://a".to_string()]),
        });
        let api = Arc::new(RecordingApi {
            edits: Mutex::new(vec![]),
            edit_calls: AtomicU32::new(0),
        });

        let engine = engine(
            Arc::clone(&provider),
            Arc::clone(&api),
            vec![
                source("tiktok", "TikTok", "https://a"),
                source("insta", "Instagram", "https://b"),
            ],
            vec![
                TargetConfig {
                    id: "t-tiktok".into(),
                    kind: TargetKind::Name,
                    min_update_secs: 0,
                    sources: vec!["tiktok".into()],
                },
                TargetConfig {
                    id: "t-insta".into(),
                    kind: TargetKind::Name,
                    min_update_secs: 0,
                    sources: vec!["insta".into()],
                },
            ],
        );

        engine.run_cycle().await;

        let edits = api.edits.lock().unwrap();
        // Only the healthy source's target got an edit; the failed one
        // was skipped, not errored out of the cycle.
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].0, "t-insta");
        assert_eq!(edits[0].1, "Instagram: 42 Followers");
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_value_second_cycle_issues_no_edit() {
        let provider = Arc::new(CycleProvider {
            counts: Mutex::new(HashMap::from([("https://a".to_string(), 100u64)])),
            failing: Mutex::new(vec![]),
        });
        let api = Arc::new(RecordingApi {
            edits: Mutex::new(vec![]),
            edit_calls: AtomicU32::new(0),
        });

        let engine = engine(
            Arc::clone(&provider),
            Arc::clone(&api),
            vec![source("tiktok", "TikTok", "https://a")],
            vec![TargetConfig {
                id: "chan".into(),
                kind: TargetKind::Topic,
                min_update_secs: 0,
                sources: vec!["tiktok".into()],
            }],
        );

        engine.run_cycle().await;
        engine.run_cycle().await;
        assert_eq!(api.edit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_sources_are_not_fetched() {
        let provider = Arc::new(CycleProvider {
            counts: Mutex::new(HashMap::from([("https://a".to_string(), 100u64)])),
            failing: Mutex::new(vec![]),
        });
        let api = Arc::new(RecordingApi {
            edits: Mutex::new(vec![]),
            edit_calls: AtomicU32::new(0),
        });

        let mut disabled = source("tiktok", "TikTok", "https://a");
        disabled.enabled = false;

        let engine = engine(
            Arc::clone(&provider),
            Arc::clone(&api),
            vec![disabled],
            vec![TargetConfig {
                id: "chan".into(),
                kind: TargetKind::Topic,
                min_update_secs: 0,
                sources: vec!["tiktok".into()],
            }],
        );

        engine.run_cycle().await;
        assert_eq!(api.edit_calls.load(Ordering::SeqCst), 0);
    }
}
