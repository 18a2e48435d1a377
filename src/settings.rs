//! Runtime settings for the sign-in daemon.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a batch writes `signInStatuses` back to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StatusPolicy {
    /// Keep entries of sites this run did not sign in
    #[default]
    Merge,
    /// Overwrite the whole key with this run's successes
    Replace,
}

/// Timing and capability knobs shared by the batch and interactive flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Spacing between load-state polls
    pub poll_interval: Duration,
    /// Pause between two sites of a batch
    pub site_pacing: Duration,
    /// Settle time after scrolling the target into view
    pub scroll_settle: Duration,
    /// Settle time after the click, before verification
    pub click_settle: Duration,
    /// Poll budget of the config test flow
    pub test_load_attempts: u32,
    /// Poll budget of the batch flow; None polls until loaded or gone
    pub batch_max_load_attempts: Option<u32>,
    pub status_policy: StatusPolicy,
    /// Enables `expression` selectors, which run arbitrary code in the page
    pub allow_expression_selectors: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            site_pacing: Duration::from_secs(1),
            scroll_settle: Duration::from_millis(500),
            click_settle: Duration::from_millis(1000),
            test_load_attempts: 20,
            batch_max_load_attempts: None,
            status_policy: StatusPolicy::Merge,
            allow_expression_selectors: false,
        }
    }
}
