//! Update controller: decides whether a channel write is necessary and
//! performs it through the shared retry/backoff/limiter machinery.
//!
//! Edits are expensive and rate-limited on the remote side, so the
//! controller suppresses everything it can before dispatching: a local
//! per-target write throttle (independent of the remote API's own
//! limits, protecting against a misconfigured poll interval), a
//! permission precondition checked before spending any retry budget,
//! and a no-op comparison against the last-known displayed value.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::TargetConfig;
use crate::pool::SlotPool;
use crate::retry::{self, CallError, RetryError, RetryPolicy};

/// What kind of display value a target holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Name-like, e.g. a voice channel name.
    Name,
    /// Text-like, e.g. a text channel topic.
    Topic,
}

/// The remote channel API, as seen by the controller. Implementations
/// classify their own error responses into the shared taxonomy.
#[async_trait]
pub trait ChannelApi: Send + Sync {
    async fn edit(&self, id: &str, kind: TargetKind, value: &str) -> Result<(), CallError>;
    /// Whether we hold the capability to edit this channel.
    async fn check_permission(&self, id: &str) -> bool;
    /// Best-effort read of the currently displayed value, used to seed
    /// the last-known state on first contact.
    async fn read(&self, id: &str, kind: TargetKind) -> Option<String>;
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("target {target}: missing permission to edit channel")]
    PermissionDenied { target: String },
    #[error("target {target}: edit failed: {source}")]
    Edit {
        target: String,
        #[source]
        source: RetryError,
    },
}

/// Last value written (or observed) per target, plus the write timestamp.
#[derive(Debug, Default, Clone)]
struct TargetState {
    last_value: Option<String>,
    last_write: Option<Instant>,
}

pub struct UpdateController {
    api: Arc<dyn ChannelApi>,
    pool: SlotPool,
    policy: RetryPolicy,
    states: std::sync::Mutex<HashMap<String, TargetState>>,
}

impl UpdateController {
    pub fn new(api: Arc<dyn ChannelApi>, pool: SlotPool, policy: RetryPolicy) -> Self {
        Self {
            api,
            pool,
            policy,
            states: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Bring `target` in line with `desired`. Returns whether a write
    /// was actually applied; skips are Ok(false), not errors.
    pub async fn reconcile(&self, target: &TargetConfig, desired: &str) -> Result<bool, UpdateError> {
        // 1. Local write throttle.
        let (since_write, last_value) = {
            let states = self.states.lock().expect("state lock poisoned");
            let state = states.get(&target.id).cloned().unwrap_or_default();
            (
                state.last_write.map(|t| Instant::now() - t),
                state.last_value,
            )
        };
        if let Some(since) = since_write {
            let min = target.min_update_interval();
            if since < min {
                info!(
                    channel = %target.id,
                    since_secs = since.as_secs_f64(),
                    min_secs = min.as_secs_f64(),
                    "skipping edit, too soon since last write"
                );
                return Ok(false);
            }
        }

        // 2. Precondition: never spend retry budget on a call that is
        // guaranteed to be rejected.
        if !self.api.check_permission(&target.id).await {
            return Err(UpdateError::PermissionDenied {
                target: target.id.clone(),
            });
        }

        // 3. No-op suppression. Seed from the remote value on first
        // contact so a restart does not trigger a redundant edit.
        let last_value = match last_value {
            Some(v) => Some(v),
            None => self.api.read(&target.id, target.kind).await,
        };
        if last_value.as_deref().map(str::trim) == Some(desired.trim()) {
            debug!(channel = %target.id, "desired value already displayed, skipping edit");
            let mut states = self.states.lock().expect("state lock poisoned");
            states.entry(target.id.clone()).or_default().last_value = last_value;
            return Ok(false);
        }

        // 4. The write itself, bounded by the edit pool and retried per
        // classification.
        let _slot = self.pool.acquire().await;
        let api = &self.api;
        retry::execute(&self.policy, &target.id, move || {
            let api = Arc::clone(api);
            let id = target.id.clone();
            let kind = target.kind;
            let value = desired.to_string();
            async move { api.edit(&id, kind, &value).await }
        })
        .await
        .map_err(|source| UpdateError::Edit {
            target: target.id.clone(),
            source,
        })?;

        // 5. Record the applied value and write time.
        {
            let mut states = self.states.lock().expect("state lock poisoned");
            let state = states.entry(target.id.clone()).or_default();
            state.last_value = Some(desired.to_string());
            state.last_write = Some(Instant::now());
        }
        info!(channel = %target.id, value = %desired, "channel updated");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::time::{advance, Duration};

    struct MockApi {
        permission: AtomicBool,
        current: std::sync::Mutex<Option<String>>,
        edit_calls: AtomicU32,
        fail_edits_with: std::sync::Mutex<Option<CallError>>,
    }

    impl MockApi {
        fn new(current: Option<&str>) -> Self {
            Self {
                permission: AtomicBool::new(true),
                current: std::sync::Mutex::new(current.map(String::from)),
                edit_calls: AtomicU32::new(0),
                fail_edits_with: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl ChannelApi for MockApi {
        async fn edit(&self, _id: &str, _kind: TargetKind, value: &str) -> Result<(), CallError> {
            self.edit_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.fail_edits_with.lock().unwrap().clone() {
                return Err(err);
            }
            *self.current.lock().unwrap() = Some(value.to_string());
            Ok(())
        }
        async fn check_permission(&self, _id: &str) -> bool {
            self.permission.load(Ordering::SeqCst)
        }
        async fn read(&self, _id: &str, _kind: TargetKind) -> Option<String> {
            self.current.lock().unwrap().clone()
        }
    }

    fn target() -> TargetConfig {
        TargetConfig {
            id: "123".into(),
            kind: TargetKind::Topic,
            min_update_secs: 60,
            sources: vec!["svc-a".into()],
        }
    }

    fn controller(api: Arc<MockApi>) -> UpdateController {
        UpdateController::new(api, SlotPool::new("edit", 2), RetryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn applies_changed_value() {
        let api = Arc::new(MockApi::new(Some("Count: 100")));
        let ctl = controller(Arc::clone(&api));
        let applied = ctl.reconcile(&target(), "Count: 200").await.unwrap();
        assert!(applied);
        assert_eq!(api.edit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.current.lock().unwrap().as_deref(), Some("Count: 200"));
    }

    #[tokio::test(start_paused = true)]
    async fn identical_value_issues_zero_remote_calls() {
        let api = Arc::new(MockApi::new(Some("Count: 100")));
        let ctl = controller(Arc::clone(&api));
        let applied = ctl.reconcile(&target(), "Count: 100").await.unwrap();
        assert!(!applied);
        assert_eq!(api.edit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_reconcile_is_idempotent() {
        let api = Arc::new(MockApi::new(None));
        let ctl = controller(Arc::clone(&api));
        let t = target();

        assert!(ctl.reconcile(&t, "Count: 200").await.unwrap());
        advance(Duration::from_secs(120)).await;
        assert!(!ctl.reconcile(&t, "Count: 200").await.unwrap());
        advance(Duration::from_secs(120)).await;
        assert!(!ctl.reconcile(&t, "Count: 200").await.unwrap());

        assert_eq!(api.edit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_permission_fails_without_calls() {
        let api = Arc::new(MockApi::new(Some("Count: 100")));
        api.permission.store(false, Ordering::SeqCst);
        let ctl = controller(Arc::clone(&api));

        let err = ctl.reconcile(&target(), "Count: 200").await.unwrap_err();
        assert!(matches!(err, UpdateError::PermissionDenied { .. }));
        assert_eq!(api.edit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn write_throttle_skips_early_second_write() {
        let api = Arc::new(MockApi::new(None));
        let ctl = controller(Arc::clone(&api));
        let t = target();

        assert!(ctl.reconcile(&t, "Count: 1").await.unwrap());
        advance(Duration::from_secs(10)).await;
        // Changed value, but inside the 60s local throttle.
        assert!(!ctl.reconcile(&t, "Count: 2").await.unwrap());
        assert_eq!(api.edit_calls.load(Ordering::SeqCst), 1);

        advance(Duration::from_secs(60)).await;
        assert!(ctl.reconcile(&t, "Count: 2").await.unwrap());
        assert_eq!(api.edit_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_edit_is_not_retried() {
        let api = Arc::new(MockApi::new(None));
        *api.fail_edits_with.lock().unwrap() =
            Some(CallError::Unrecoverable("forbidden".into()));
        let ctl = controller(Arc::clone(&api));

        let err = ctl.reconcile(&target(), "Count: 1").await.unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Edit {
                source: RetryError::Unrecoverable { attempts: 1, .. },
                ..
            }
        ));
        assert_eq!(api.edit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_edit_retries_until_exhaustion() {
        let api = Arc::new(MockApi::new(None));
        *api.fail_edits_with.lock().unwrap() = Some(CallError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
            message: "429".into(),
        });
        let ctl = controller(Arc::clone(&api));

        let err = ctl.reconcile(&target(), "Count: 1").await.unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Edit {
                source: RetryError::Exhausted { attempts: 4, .. },
                ..
            }
        ));
        assert_eq!(api.edit_calls.load(Ordering::SeqCst), 4);
    }
}
