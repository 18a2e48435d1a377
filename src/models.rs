//! Data models for site sign-in automation.

use chrono::{DateTime, Local, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::ValidationError;

/// Seconds to wait after load when a config leaves it unset.
pub const DEFAULT_WAIT_SECS: u64 = 2;

/// Addressing mode for a site's selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SelectorType {
    #[default]
    Css,
    Xpath,
    /// Arbitrary page expression. Gated by `allow_expression_selectors`.
    #[serde(alias = "js")]
    Expression,
    /// Regex over the visible text of clickable elements.
    #[serde(alias = "regex")]
    Pattern,
}

impl fmt::Display for SelectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectorType::Css => "css",
            SelectorType::Xpath => "xpath",
            SelectorType::Expression => "expression",
            SelectorType::Pattern => "pattern",
        };
        f.write_str(name)
    }
}

fn default_wait_time() -> u64 {
    DEFAULT_WAIT_SECS
}

/// One user-defined sign-in target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteConfig {
    /// Stable identifier, also the key in the stored mapping
    #[serde(default)]
    pub id: String,
    /// Display label
    pub name: String,
    /// Absolute URL to navigate to
    pub url: String,
    #[serde(default)]
    pub selector_type: SelectorType,
    /// Selector for the clickable sign-in control
    pub sign_selector: String,
    #[serde(default)]
    pub signed_selector_type: SelectorType,
    /// Optional selector proving the sign-in took effect
    #[serde(default)]
    pub signed_selector: Option<String>,
    /// Seconds to pause after load completes
    #[serde(default = "default_wait_time")]
    pub wait_time: u64,
    /// Seconds to keep the page open after a successful sign-in
    #[serde(default)]
    pub close_wait_time: u64,
}

impl SiteConfig {
    /// Check required fields and the URL before the config is persisted or used.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        if self.url.trim().is_empty() {
            return Err(ValidationError::MissingField("url"));
        }
        if self.sign_selector.trim().is_empty() {
            return Err(ValidationError::MissingField("signSelector"));
        }
        url::Url::parse(&self.url).map_err(|e| ValidationError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    /// Assign a fresh id if this config has none yet.
    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = generate_site_id();
        }
    }

    /// Post-load delay actually applied; an unset (zero) wait falls back to the default.
    pub fn effective_wait_secs(&self) -> u64 {
        if self.wait_time == 0 {
            DEFAULT_WAIT_SECS
        } else {
            self.wait_time
        }
    }

    /// Verification selector, if one is configured.
    pub fn signed_selector(&self) -> Option<&str> {
        self.signed_selector
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Generate an id from the current time plus a random suffix.
pub fn generate_site_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("site_{}_{}", Utc::now().timestamp_millis(), &random[..9])
}

/// Insertion-ordered mapping of site id to config.
///
/// Serialized as a JSON object keyed by id; document order is iteration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteConfigs {
    entries: Vec<SiteConfig>,
}

impl SiteConfigs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SiteConfig> {
        self.entries.iter()
    }

    pub fn get(&self, id: &str) -> Option<&SiteConfig> {
        self.entries.iter().find(|c| c.id == id)
    }

    /// Replace the entry with the same id in place, or append it.
    pub fn upsert(&mut self, config: SiteConfig) {
        match self.entries.iter_mut().find(|c| c.id == config.id) {
            Some(existing) => *existing = config,
            None => self.entries.push(config),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<SiteConfig> {
        let index = self.entries.iter().position(|c| c.id == id)?;
        Some(self.entries.remove(index))
    }
}

impl FromIterator<SiteConfig> for SiteConfigs {
    fn from_iter<I: IntoIterator<Item = SiteConfig>>(iter: I) -> Self {
        let mut configs = SiteConfigs::new();
        for config in iter {
            configs.upsert(config);
        }
        configs
    }
}

impl Serialize for SiteConfigs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for config in &self.entries {
            map.serialize_entry(&config.id, config)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SiteConfigs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ConfigsVisitor;

        impl<'de> Visitor<'de> for ConfigsVisitor {
            type Value = SiteConfigs;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of site id to site config")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<SiteConfigs, A::Error> {
                let mut configs = SiteConfigs::new();
                while let Some((id, mut config)) = access.next_entry::<String, SiteConfig>()? {
                    // The key is authoritative; stored values may omit the id.
                    config.id = id;
                    configs.upsert(config);
                }
                Ok(configs)
            }
        }

        deserializer.deserialize_map(ConfigsVisitor)
    }
}

/// Last successful sign-in for one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInStatus {
    #[serde(default)]
    pub last_sign_in_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message: String,
}

impl SignInStatus {
    pub fn succeeded_at(at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            last_sign_in_date: Some(at),
            last_message: message.into(),
        }
    }
}

/// Whether `status` records a success on the same local calendar day as `now`.
pub fn is_signed_in_today(status: Option<&SignInStatus>, now: DateTime<Local>) -> bool {
    status
        .and_then(|s| s.last_sign_in_date)
        .map(|date| date.with_timezone(&Local).date_naive() == now.date_naive())
        .unwrap_or(false)
}

/// Reply of the page-side executor to a sign-in command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInResponse {
    pub success: bool,
    pub message: String,
}

impl SignInResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Result of one site in one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteOutcome {
    pub site_id: String,
    pub name: String,
    pub success: bool,
    pub message: String,
}

impl SiteOutcome {
    pub fn new(config: &SiteConfig, success: bool, message: impl Into<String>) -> Self {
        Self {
            site_id: config.id.clone(),
            name: config.name.clone(),
            success,
            message: message.into(),
        }
    }

    pub fn failed(config: &SiteConfig, message: impl Into<String>) -> Self {
        Self::new(config, false, message)
    }
}

/// Aggregate result of a batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    /// True iff at least one site succeeded
    pub success: bool,
    #[serde(default)]
    pub results: Vec<SiteOutcome>,
    /// Only set when the batch itself could not run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BatchResult {
    pub fn from_outcomes(results: Vec<SiteOutcome>) -> Self {
        Self {
            success: results.iter().any(|r| r.success),
            results,
            message: None,
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            success: false,
            results: Vec::new(),
            message: Some(message.into()),
        }
    }
}

/// Computed visibility of an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ElementVisibility {
    #[serde(default)]
    pub display: String,
    #[serde(default)]
    pub visibility: String,
    #[serde(default)]
    pub opacity: String,
    #[serde(default)]
    pub is_visible: bool,
}

/// Identifying attributes of an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ElementAttributes {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub src: Option<String>,
}

/// Description of a located element, reported by config tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ElementDetails {
    #[serde(default)]
    pub text: String,
    pub tag_name: String,
    /// "(x, y)" of the bounding box's top-left corner
    pub position: String,
    /// "WxH"
    pub size: String,
    #[serde(default)]
    pub visibility: ElementVisibility,
    #[serde(default)]
    pub attributes: ElementAttributes,
}

/// Result of testing a site config against its live page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConfigResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_details: Option<ElementDetails>,
}

impl TestConfigResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            element_details: None,
        }
    }
}

/// Command delivered to a page's execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageRequest {
    #[serde(rename_all = "camelCase")]
    TriggerSignIn {
        config: SiteConfig,
        #[serde(default)]
        show_process: bool,
    },
    #[serde(rename_all = "camelCase")]
    TestConfig {
        config: SiteConfig,
        #[serde(default)]
        need_details: bool,
    },
}

/// Broadcast when the stored site list changes. No response is expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigEvent {
    ConfigUpdated { configs: SiteConfigs },
}

/// Per-site row of the status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub site_id: String,
    pub name: String,
    pub url: String,
    pub signed_in_today: bool,
    #[serde(default)]
    pub last_sign_in_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message: Option<String>,
}
