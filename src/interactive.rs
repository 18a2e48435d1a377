//! Single-site flows started by a user: sign in on one site, or test a
//! config against its live page without clicking.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::browser::{PageHandle, PageHost};
use crate::error::{PageError, ValidationError};
use crate::lifecycle::{pause, PageController, WaitPolicy};
use crate::models::{PageRequest, SiteConfig, SiteOutcome, TestConfigResult};
use crate::orchestrator::{outcome_from_reply, statuses_from_outcomes};
use crate::settings::{Settings, StatusPolicy};
use crate::store::{KeyValueStore, StatusStore};

pub const MSG_TEST_FAILED: &str = "test failed";
pub const MSG_LOAD_TIMEOUT: &str = "page load timed out, check the URL and your connection";
pub const MSG_PAGE_CLOSED: &str = "the page was closed before the test finished";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignInOptions {
    /// Open the page in the foreground and highlight the click
    pub show_process: bool,
    /// Log each step at info instead of debug
    pub verbose: bool,
}

macro_rules! step {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

pub struct InteractiveFlow<H: ?Sized> {
    pages: PageController<H>,
    settings: Settings,
}

impl<H: PageHost + ?Sized> InteractiveFlow<H> {
    pub fn new(host: Arc<H>, settings: Settings) -> Self {
        Self {
            pages: PageController::new(host, settings.poll_interval),
            settings,
        }
    }

    /// Sign in on one site. Errors become a failed outcome.
    pub async fn sign_in_one(
        &self,
        config: &SiteConfig,
        options: SignInOptions,
        cancel: &CancellationToken,
    ) -> SiteOutcome {
        step!(options.verbose, "Opening {} for sign-in", config.url);
        let page = match self.pages.open(&config.url, options.show_process).await {
            Ok(page) => page,
            Err(e) => return SiteOutcome::failed(config, e.to_string()),
        };

        let outcome = self.drive_sign_in(&page, config, options, cancel).await;
        self.pages.close_quietly(&page).await;

        match outcome {
            Ok(outcome) => {
                tracing::info!("{}: {}", config.name, outcome.message);
                outcome
            }
            Err(e) => {
                tracing::warn!("Sign-in on {} failed: {:#}", config.name, e);
                SiteOutcome::failed(config, e.to_string())
            }
        }
    }

    async fn drive_sign_in(
        &self,
        page: &PageHandle,
        config: &SiteConfig,
        options: SignInOptions,
        cancel: &CancellationToken,
    ) -> Result<SiteOutcome> {
        self.pages
            .await_loaded(page, WaitPolicy::interactive(), cancel)
            .await?;
        step!(options.verbose, "Page loaded, waiting {}s", config.effective_wait_secs());
        pause(Duration::from_secs(config.effective_wait_secs()), cancel).await?;

        step!(options.verbose, "Triggering sign-in on {}", config.name);
        let reply = self
            .pages
            .send(
                page,
                &PageRequest::TriggerSignIn {
                    config: config.clone(),
                    show_process: options.show_process,
                },
            )
            .await?;
        let outcome = outcome_from_reply(config, &reply);

        if outcome.success && config.close_wait_time > 0 {
            step!(options.verbose, "Keeping page open for {}s", config.close_wait_time);
            // Cancelling the grace period keeps the sign-in that already happened.
            pause(Duration::from_secs(config.close_wait_time), cancel).await.ok();
        }
        Ok(outcome)
    }

    /// Sign in on one site and store its status right away if it succeeded.
    ///
    /// A failed status write is returned as the error; the sign-in itself
    /// may still have happened.
    pub async fn sign_in_and_record<S: KeyValueStore>(
        &self,
        store: &StatusStore<S>,
        config: &SiteConfig,
        options: SignInOptions,
        cancel: &CancellationToken,
    ) -> Result<SiteOutcome> {
        let outcome = self.sign_in_one(config, options, cancel).await;
        if outcome.success {
            let statuses = statuses_from_outcomes(std::slice::from_ref(&outcome), Utc::now());
            store
                .record_statuses(statuses, StatusPolicy::Merge)
                .with_context(|| format!("Signed in on {} but could not save its status", config.name))?;
        }
        Ok(outcome)
    }

    /// Run the non-clicking walkthrough of `config` on a visible page.
    ///
    /// Validation happens before anything is opened.
    pub async fn test_config(
        &self,
        config: &SiteConfig,
        need_details: bool,
        cancel: &CancellationToken,
    ) -> Result<TestConfigResult, ValidationError> {
        config.validate()?;

        let page = match self.pages.open(&config.url, true).await {
            Ok(page) => page,
            Err(e) => return Ok(TestConfigResult::failed(friendly_message(&e))),
        };

        let result = async {
            self.pages
                .await_loaded(
                    &page,
                    WaitPolicy::bounded(self.settings.test_load_attempts),
                    cancel,
                )
                .await?;
            pause(Duration::from_secs(config.effective_wait_secs()), cancel).await?;
            self.pages
                .send(
                    &page,
                    &PageRequest::TestConfig {
                        config: config.clone(),
                        need_details,
                    },
                )
                .await
        }
        .await;

        self.pages.close_quietly(&page).await;

        Ok(match result {
            Ok(reply) => test_result_from_reply(reply),
            Err(e) => {
                tracing::warn!("Config test of {} failed: {:#}", config.name, e);
                TestConfigResult::failed(friendly_message(&e))
            }
        })
    }
}

fn test_result_from_reply(reply: Value) -> TestConfigResult {
    match serde_json::from_value::<TestConfigResult>(reply) {
        Ok(result) => result,
        Err(e) => {
            tracing::debug!("Unusable test reply: {}", e);
            TestConfigResult::failed(MSG_TEST_FAILED)
        }
    }
}

fn friendly_message(error: &anyhow::Error) -> String {
    match error.downcast_ref::<PageError>() {
        Some(PageError::Timeout { .. }) => MSG_LOAD_TIMEOUT.to_string(),
        Some(PageError::PageClosed) => MSG_PAGE_CLOSED.to_string(),
        _ => error.to_string(),
    }
}
