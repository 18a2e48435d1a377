//! Batch orchestrator: signs in on every configured site, one at a time.
//!
//! Sites never run concurrently. A failure on one site is recorded as its
//! outcome and the batch moves on; statuses are written once at the end.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::browser::PageHost;
use crate::lifecycle::{pause, PageController, WaitPolicy};
use crate::models::{BatchResult, PageRequest, SignInStatus, SiteConfig, SiteConfigs, SiteOutcome};
use crate::settings::Settings;
use crate::store::{KeyValueStore, StatusMap, StatusStore};

pub const MSG_SIGN_IN_FAILED: &str = "sign-in failed";
pub const MSG_CANCELLED: &str = "cancelled";

pub struct BatchOrchestrator<H: ?Sized> {
    pages: PageController<H>,
    settings: Settings,
}

impl<H: PageHost + ?Sized> BatchOrchestrator<H> {
    pub fn new(host: Arc<H>, settings: Settings) -> Self {
        Self {
            pages: PageController::new(host, settings.poll_interval),
            settings,
        }
    }

    /// Sign in on each site in order and collect one outcome per site.
    pub async fn run_batch(
        &self,
        configs: &SiteConfigs,
        show_process: bool,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let mut results = Vec::with_capacity(configs.len());
        let total = configs.len();

        for (index, config) in configs.iter().enumerate() {
            if cancel.is_cancelled() {
                results.push(SiteOutcome::failed(config, MSG_CANCELLED));
                continue;
            }

            tracing::info!("Signing in on {} ({}/{})", config.name, index + 1, total);
            let outcome = match self.sign_in_site(config, show_process, cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!("Sign-in on {} failed: {:#}", config.name, e);
                    SiteOutcome::failed(config, e.to_string())
                }
            };
            tracing::info!(
                site = %config.id,
                success = outcome.success,
                "{}: {}",
                config.name,
                outcome.message
            );
            results.push(outcome);

            if index + 1 < total {
                // Cancellation is picked up at the top of the next iteration.
                pause(self.settings.site_pacing, cancel).await.ok();
            }
        }

        BatchResult::from_outcomes(results)
    }

    async fn sign_in_site(
        &self,
        config: &SiteConfig,
        show_process: bool,
        cancel: &CancellationToken,
    ) -> Result<SiteOutcome> {
        let page = self.pages.open(&config.url, show_process).await?;

        let outcome = async {
            self.pages
                .await_loaded(
                    &page,
                    WaitPolicy::batch(self.settings.batch_max_load_attempts),
                    cancel,
                )
                .await?;
            pause(Duration::from_secs(config.effective_wait_secs()), cancel).await?;

            let reply = self
                .pages
                .send(
                    &page,
                    &PageRequest::TriggerSignIn {
                        config: config.clone(),
                        show_process,
                    },
                )
                .await?;
            let outcome = outcome_from_reply(config, &reply);

            if outcome.success && config.close_wait_time > 0 {
                // Cancelling the grace period keeps the sign-in that already happened.
                pause(Duration::from_secs(config.close_wait_time), cancel).await.ok();
            }
            Ok::<SiteOutcome, anyhow::Error>(outcome)
        }
        .await;

        self.pages.close_quietly(&page).await;
        outcome
    }

    /// Run over the stored configs and write back the statuses of successful sites.
    pub async fn run_and_record<S: KeyValueStore>(
        &self,
        store: &StatusStore<S>,
        show_process: bool,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let configs = match store.site_configs() {
            Ok(configs) => configs,
            Err(e) => {
                tracing::error!("Could not load site configs: {:#}", e);
                return BatchResult::aborted(e.to_string());
            }
        };

        let result = self.run_batch(&configs, show_process, cancel).await;

        let statuses = statuses_from_outcomes(&result.results, Utc::now());
        if let Err(e) = store.record_statuses(statuses, self.settings.status_policy) {
            tracing::error!("Could not save sign-in statuses: {:#}", e);
            return BatchResult {
                success: false,
                results: result.results,
                message: Some(e.to_string()),
            };
        }

        result
    }
}

/// Turn a page reply into an outcome; anything unrecognizable is a failure.
pub fn outcome_from_reply(config: &SiteConfig, reply: &Value) -> SiteOutcome {
    let success = reply.get("success").and_then(Value::as_bool).unwrap_or(false);
    let message = reply
        .get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or(MSG_SIGN_IN_FAILED);
    SiteOutcome::new(config, success, message)
}

/// Status entries for the successful outcomes, all stamped with `at`.
pub fn statuses_from_outcomes(outcomes: &[SiteOutcome], at: DateTime<Utc>) -> StatusMap {
    outcomes
        .iter()
        .filter(|o| o.success)
        .map(|o| (o.site_id.clone(), SignInStatus::succeeded_at(at, o.message.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::{FakeHost, FakeSite, HostEvent};
    use crate::models::SelectorType;
    use crate::settings::StatusPolicy;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn site(n: u32) -> SiteConfig {
        SiteConfig {
            id: format!("site_{n}"),
            name: format!("Site {n}"),
            url: format!("https://s{n}.example.com/"),
            selector_type: SelectorType::Css,
            sign_selector: "#checkin".to_string(),
            signed_selector_type: SelectorType::Css,
            signed_selector: None,
            wait_time: 2,
            close_wait_time: 0,
        }
    }

    fn sites(count: u32) -> SiteConfigs {
        (1..=count).map(site).collect()
    }

    fn orchestrator(host: Arc<FakeHost>) -> BatchOrchestrator<FakeHost> {
        BatchOrchestrator::new(host, Settings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch_opens_nothing() {
        let host = Arc::new(FakeHost::new());
        let result = orchestrator(host.clone())
            .run_batch(&SiteConfigs::new(), false, &CancellationToken::new())
            .await;

        assert!(!result.success);
        assert!(result.results.is_empty());
        assert!(host.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_sites_succeed_and_are_recorded() {
        let host = Arc::new(FakeHost::new());
        let store = StatusStore::new(MemoryStore::default());
        for config in sites(3).iter() {
            store.save_site_config(config.clone()).unwrap();
        }

        let started = Utc::now();
        let result = orchestrator(host.clone())
            .run_and_record(&store, false, &CancellationToken::new())
            .await;

        assert!(result.success);
        assert_eq!(result.results.len(), 3);
        assert!(result.results.iter().all(|r| r.success));

        let statuses = store.statuses().unwrap();
        assert_eq!(statuses.len(), 3);
        assert!(statuses
            .values()
            .all(|s| s.last_sign_in_date.unwrap() >= started));
        assert_eq!(host.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_site_is_isolated() {
        let host = Arc::new(FakeHost::new().with_site(
            "https://s2.example.com/",
            FakeSite {
                load_error: Some("tab crashed".to_string()),
                ..FakeSite::default()
            },
        ));
        let result = orchestrator(host.clone())
            .run_batch(&sites(3), false, &CancellationToken::new())
            .await;

        let flags: Vec<bool> = result.results.iter().map(|r| r.success).collect();
        assert_eq!(flags, [true, false, true]);
        assert_eq!(result.results[1].message, "tab crashed");
        assert!(result.success);

        // The failed site's page is still closed and later sites still run.
        assert_eq!(
            host.opened(),
            [
                "https://s1.example.com/",
                "https://s2.example.com/",
                "https://s3.example.com/"
            ]
        );
        assert_eq!(host.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_configuration_order() {
        let configs: SiteConfigs = [site(3), site(1), site(2)].into_iter().collect();
        let host = Arc::new(FakeHost::new());
        let result = orchestrator(host)
            .run_batch(&configs, false, &CancellationToken::new())
            .await;

        let ids: Vec<&str> = result.results.iter().map(|r| r.site_id.as_str()).collect();
        assert_eq!(ids, ["site_3", "site_1", "site_2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_or_malformed_reply_is_generic_failure() {
        let host = Arc::new(
            FakeHost::new()
                .with_site("https://s1.example.com/", FakeSite::replying(Value::Null))
                .with_site("https://s2.example.com/", FakeSite::replying(json!({"ok": 1}))),
        );
        let result = orchestrator(host)
            .run_batch(&sites(2), false, &CancellationToken::new())
            .await;

        assert!(!result.success);
        for outcome in &result.results {
            assert!(!outcome.success);
            assert_eq!(outcome.message, MSG_SIGN_IN_FAILED);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_carries_error_text() {
        let host = Arc::new(FakeHost::new().with_site(
            "https://s1.example.com/",
            FakeSite {
                reply: Err("Could not establish connection".to_string()),
                ..FakeSite::default()
            },
        ));
        let result = orchestrator(host)
            .run_batch(&sites(1), false, &CancellationToken::new())
            .await;
        assert_eq!(result.results[0].message, "Could not establish connection");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_errors_do_not_fail_the_site() {
        let host = Arc::new(FakeHost::new().with_site(
            "https://s1.example.com/",
            FakeSite {
                close_error: true,
                ..FakeSite::default()
            },
        ));
        let result = orchestrator(host)
            .run_batch(&sites(1), true, &CancellationToken::new())
            .await;
        assert!(result.results[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_show_process_opens_visible_pages() {
        let host = Arc::new(FakeHost::new());
        orchestrator(host.clone())
            .run_batch(&sites(1), true, &CancellationToken::new())
            .await;

        assert_eq!(
            host.events(),
            [
                HostEvent::Opened {
                    url: "https://s1.example.com/".to_string(),
                    visible: true
                },
                HostEvent::Sent {
                    url: "https://s1.example.com/".to_string(),
                    request: "TRIGGER_SIGN_IN".to_string()
                },
                HostEvent::Closed {
                    url: "https://s1.example.com/".to_string()
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pages_open_in_background_without_show_process() {
        let host = Arc::new(FakeHost::new());
        orchestrator(host.clone())
            .run_batch(&sites(2), false, &CancellationToken::new())
            .await;

        let visibilities: Vec<bool> = host
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HostEvent::Opened { visible, .. } => Some(visible),
                _ => None,
            })
            .collect();
        assert_eq!(visibilities, [false, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_close_grace_keeps_success() {
        let store = StatusStore::new(MemoryStore::default());
        let mut lingering = site(1);
        lingering.close_wait_time = 10;
        store.save_site_config(lingering).unwrap();
        store.save_site_config(site(2)).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            // 2s post-load wait, then 3s into the grace period
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = orchestrator(Arc::new(FakeHost::new()))
            .run_and_record(&store, false, &cancel)
            .await;

        assert!(started.elapsed() < Duration::from_secs(12));
        assert!(result.results[0].success);
        assert_eq!(result.results[0].message, "clicked sign-in button");
        assert_eq!(result.results[1].message, MSG_CANCELLED);
        assert_eq!(store.statuses().unwrap().keys().collect::<Vec<_>>(), ["site_1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_and_waits_add_up() {
        let mut slow = site(1);
        slow.close_wait_time = 5;
        let mut zero_wait = site(2);
        zero_wait.wait_time = 0;
        let configs: SiteConfigs = [slow, zero_wait].into_iter().collect();

        let started = tokio::time::Instant::now();
        orchestrator(Arc::new(FakeHost::new()))
            .run_batch(&configs, false, &CancellationToken::new())
            .await;

        // 2s wait + 5s close grace + 1s pacing + 2s default wait, no pacing after the last site
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_millis(10_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_grace_only_after_success() {
        let mut failing = site(1);
        failing.close_wait_time = 30;
        let host = Arc::new(FakeHost::new().with_site(
            "https://s1.example.com/",
            FakeSite::replying(json!({"success": false, "message": "button not found"})),
        ));

        let started = tokio::time::Instant::now();
        let result = orchestrator(host)
            .run_batch(&SiteConfigs::from_iter([failing]), false, &CancellationToken::new())
            .await;

        assert_eq!(result.results[0].message, "button not found");
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_attempt_cap_bounds_batch_wait() {
        let host = Arc::new(FakeHost::new().with_site(
            "https://s1.example.com/",
            FakeSite {
                loading_polls: u32::MAX,
                ..FakeSite::default()
            },
        ));
        let settings = Settings {
            batch_max_load_attempts: Some(4),
            ..Settings::default()
        };
        let result = BatchOrchestrator::new(host, settings)
            .run_batch(&sites(2), false, &CancellationToken::new())
            .await;

        assert_eq!(result.results[0].message, "page load timed out after 4 attempts");
        assert!(result.results[1].success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_batch_skips_remaining_sites() {
        let host = Arc::new(FakeHost::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orchestrator(host.clone()).run_batch(&sites(2), false, &cancel).await;
        assert!(result
            .results
            .iter()
            .all(|r| !r.success && r.message == MSG_CANCELLED));
        assert!(host.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_policy_drops_prior_statuses() {
        let store = StatusStore::new(MemoryStore::default());
        store.save_site_config(site(1)).unwrap();
        store
            .record_statuses(
                StatusMap::from([(
                    "site_gone".to_string(),
                    SignInStatus::succeeded_at(Utc::now(), "old"),
                )]),
                StatusPolicy::Merge,
            )
            .unwrap();

        let settings = Settings {
            status_policy: StatusPolicy::Replace,
            ..Settings::default()
        };
        BatchOrchestrator::new(Arc::new(FakeHost::new()), settings)
            .run_and_record(&store, false, &CancellationToken::new())
            .await;

        let statuses = store.statuses().unwrap();
        assert_eq!(statuses.keys().collect::<Vec<_>>(), ["site_1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_policy_keeps_failed_sites_status() {
        let store = StatusStore::new(MemoryStore::default());
        store.save_site_config(site(1)).unwrap();
        store.save_site_config(site(2)).unwrap();
        let yesterday = Utc::now() - chrono::Duration::days(1);
        store
            .record_statuses(
                StatusMap::from([(
                    "site_2".to_string(),
                    SignInStatus::succeeded_at(yesterday, "clicked sign-in button"),
                )]),
                StatusPolicy::Merge,
            )
            .unwrap();

        let host = Arc::new(FakeHost::new().with_site(
            "https://s2.example.com/",
            FakeSite::replying(json!({"success": false, "message": "button not found"})),
        ));
        orchestrator(host)
            .run_and_record(&store, false, &CancellationToken::new())
            .await;

        let statuses = store.statuses().unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses["site_2"].last_sign_in_date, Some(yesterday));
    }

    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<Value>> {
            anyhow::bail!("store unavailable")
        }

        fn set(&self, _key: &str, _value: Value) -> Result<()> {
            anyhow::bail!("store unavailable")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_store_aborts_batch() {
        let host = Arc::new(FakeHost::new());
        let result = orchestrator(host.clone())
            .run_and_record(&StatusStore::new(BrokenStore), false, &CancellationToken::new())
            .await;

        assert_eq!(result, BatchResult::aborted("store unavailable"));
        assert!(host.events().is_empty());
    }

    #[test]
    fn test_statuses_only_for_successes() {
        let a = site(1);
        let b = site(2);
        let at = Utc::now();
        let statuses = statuses_from_outcomes(
            &[
                SiteOutcome::new(&a, true, "signed in successfully"),
                SiteOutcome::failed(&b, "button not found"),
            ],
            at,
        );
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses["site_1"], SignInStatus::succeeded_at(at, "signed in successfully"));
    }
}
