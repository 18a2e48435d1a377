//! Sign-in executor: the logic that runs against a single page.
//!
//! The executor only talks to a [`PageContext`], which exposes the handful of
//! DOM operations a sign-in needs. `BrowserClient` provides the real one.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::locator::{marker_selector, Locator};
use crate::models::{ElementDetails, PageRequest, SignInResponse, SiteConfig, TestConfigResult};
use crate::settings::Settings;

pub const MSG_BUTTON_NOT_FOUND: &str = "button not found";
pub const MSG_SIGNED_IN: &str = "signed in successfully";
pub const MSG_CLICKED: &str = "clicked sign-in button";
pub const MSG_SIGN_IN_ERROR: &str = "sign-in error";
pub const MSG_TARGET_NOT_FOUND: &str = "target element not found";
pub const MSG_TEST_COMPLETED: &str = "test completed";
pub const MSG_TEST_ERROR: &str = "test error";

/// Overlay transition time.
const FEEDBACK_MOVE: Duration = Duration::from_millis(300);
/// Pause on each walkthrough phase.
const FEEDBACK_HOLD: Duration = Duration::from_millis(1000);
/// Half of the pointer press animation.
const POINTER_PRESS: Duration = Duration::from_millis(200);

/// An element a lookup resolved to, addressed by its marker attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef {
    pub marker: String,
}

impl ElementRef {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    /// CSS selector for this element.
    pub fn selector(&self) -> String {
        marker_selector(&self.marker)
    }
}

/// DOM operations available inside one page.
#[async_trait]
pub trait PageContext: Send + Sync {
    /// Resolve a locator. Malformed selectors and misses are `Ok(None)`.
    async fn locate(&self, locator: &Locator) -> Result<Option<ElementRef>>;

    /// Smooth, centered scroll.
    async fn scroll_into_view(&self, element: &ElementRef) -> Result<()>;

    async fn click(&self, element: &ElementRef) -> Result<()>;

    async fn element_details(&self, element: &ElementRef) -> Result<ElementDetails>;

    /// Add the highlight/pointer/tooltip stylesheet (idempotent).
    async fn inject_feedback_styles(&self) -> Result<()>;

    /// Highlight the element and move the pointer and tooltip onto it.
    async fn show_feedback(&self, element: &ElementRef, message: &str) -> Result<()>;

    async fn set_pointer_pressed(&self, pressed: bool) -> Result<()>;

    /// Remove the highlight and the overlay elements.
    async fn clear_feedback(&self, element: &ElementRef) -> Result<()>;
}

/// Runs sign-in and config-test commands against a page.
#[derive(Debug, Clone)]
pub struct SignInExecutor {
    allow_expression: bool,
    scroll_settle: Duration,
    click_settle: Duration,
}

impl SignInExecutor {
    pub fn new(settings: &Settings) -> Self {
        Self {
            allow_expression: settings.allow_expression_selectors,
            scroll_settle: settings.scroll_settle,
            click_settle: settings.click_settle,
        }
    }

    /// Answer a page request; the reply is what the host hands back to the sender.
    pub async fn handle<P: PageContext + ?Sized>(&self, page: &P, request: &PageRequest) -> Value {
        let reply = match request {
            PageRequest::TriggerSignIn {
                config,
                show_process,
            } => serde_json::to_value(self.execute(page, config, *show_process).await),
            PageRequest::TestConfig {
                config,
                need_details,
            } => serde_json::to_value(self.test_config(page, config, *need_details).await),
        };
        reply.unwrap_or(Value::Null)
    }

    /// Locate the sign-in control, click it and optionally verify the result.
    pub async fn execute<P: PageContext + ?Sized>(
        &self,
        page: &P,
        config: &SiteConfig,
        show_process: bool,
    ) -> SignInResponse {
        match self.try_execute(page, config, show_process).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Sign-in on {} failed: {:#}", config.name, e);
                SignInResponse::failed(error_message(&e, MSG_SIGN_IN_ERROR))
            }
        }
    }

    async fn try_execute<P: PageContext + ?Sized>(
        &self,
        page: &P,
        config: &SiteConfig,
        show_process: bool,
    ) -> Result<SignInResponse> {
        let locator = Locator::new(config.selector_type, &config.sign_selector);
        let Some(element) = self.resolve(page, &locator).await? else {
            return Ok(SignInResponse::failed(MSG_BUTTON_NOT_FOUND));
        };

        page.scroll_into_view(&element).await?;
        tokio::time::sleep(self.scroll_settle).await;

        if show_process {
            page.inject_feedback_styles().await?;
            page.show_feedback(&element, "signing in").await?;
        }

        page.click(&element).await?;
        tokio::time::sleep(self.click_settle).await;

        if show_process {
            page.clear_feedback(&element).await.ok();
        }

        if let Some(signed) = config.signed_selector() {
            let verify = Locator::new(config.signed_selector_type, signed);
            match self.resolve(page, &verify).await {
                Ok(Some(_)) => return Ok(SignInResponse::ok(MSG_SIGNED_IN)),
                Ok(None) => {
                    tracing::debug!("Verification selector not found on {}", config.name)
                }
                Err(e) => tracing::debug!("Verification lookup failed on {}: {:#}", config.name, e),
            }
        }

        // Without a confirming element the click itself counts as the sign-in.
        Ok(SignInResponse::ok(MSG_CLICKED))
    }

    /// Slowed-down walkthrough of what a sign-in would do, without clicking.
    pub async fn test_config<P: PageContext + ?Sized>(
        &self,
        page: &P,
        config: &SiteConfig,
        need_details: bool,
    ) -> TestConfigResult {
        match self.try_test_config(page, config, need_details).await {
            Ok(result) => result,
            Err(e) => TestConfigResult::failed(error_message(&e, MSG_TEST_ERROR)),
        }
    }

    async fn try_test_config<P: PageContext + ?Sized>(
        &self,
        page: &P,
        config: &SiteConfig,
        need_details: bool,
    ) -> Result<TestConfigResult> {
        page.inject_feedback_styles().await?;

        let locator = Locator::new(config.selector_type, &config.sign_selector);
        let Some(element) = self.resolve(page, &locator).await? else {
            return Ok(TestConfigResult::failed(MSG_TARGET_NOT_FOUND));
        };

        for (message, hold) in [
            ("found target element", FEEDBACK_HOLD),
            ("about to click", FEEDBACK_HOLD),
            ("simulating click", Duration::ZERO),
        ] {
            page.show_feedback(&element, message).await?;
            tokio::time::sleep(FEEDBACK_MOVE + hold).await;
        }

        page.set_pointer_pressed(true).await?;
        tokio::time::sleep(POINTER_PRESS).await;
        page.set_pointer_pressed(false).await?;
        tokio::time::sleep(POINTER_PRESS).await;

        let details = page.element_details(&element).await?;

        page.clear_feedback(&element).await?;
        tokio::time::sleep(FEEDBACK_MOVE).await;

        Ok(TestConfigResult {
            success: true,
            message: MSG_TEST_COMPLETED.to_string(),
            element_details: need_details.then_some(details),
        })
    }

    async fn resolve<P: PageContext + ?Sized>(
        &self,
        page: &P,
        locator: &Locator,
    ) -> Result<Option<ElementRef>> {
        if locator.is_unsafe() && !self.allow_expression {
            bail!("expression selectors are disabled");
        }
        page.locate(locator).await
    }
}

fn error_message(error: &anyhow::Error, fallback: &str) -> String {
    let message = error.to_string();
    if message.is_empty() {
        fallback.to_string()
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SelectorType;
    use std::sync::Mutex;

    /// Page with a fixed set of resolvable selectors that records every call.
    #[derive(Default)]
    struct ScriptedPage {
        present: Vec<String>,
        fail_click: bool,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedPage {
        fn with(present: &[&str]) -> Self {
            Self {
                present: present.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageContext for ScriptedPage {
        async fn locate(&self, locator: &Locator) -> Result<Option<ElementRef>> {
            self.record(format!("locate {}", locator.selector()));
            Ok(self
                .present
                .iter()
                .any(|s| s == locator.selector())
                .then(|| ElementRef::new(locator.selector())))
        }

        async fn scroll_into_view(&self, element: &ElementRef) -> Result<()> {
            self.record(format!("scroll {}", element.marker));
            Ok(())
        }

        async fn click(&self, element: &ElementRef) -> Result<()> {
            if self.fail_click {
                bail!("Node is detached from document");
            }
            self.record(format!("click {}", element.marker));
            Ok(())
        }

        async fn element_details(&self, element: &ElementRef) -> Result<ElementDetails> {
            self.record("details");
            Ok(ElementDetails {
                text: "Check in".to_string(),
                tag_name: "button".to_string(),
                position: "(10, 20)".to_string(),
                size: "80x24".to_string(),
                attributes: crate::models::ElementAttributes {
                    id: Some(element.marker.clone()),
                    ..Default::default()
                },
                ..Default::default()
            })
        }

        async fn inject_feedback_styles(&self) -> Result<()> {
            self.record("styles");
            Ok(())
        }

        async fn show_feedback(&self, _element: &ElementRef, message: &str) -> Result<()> {
            self.record(format!("feedback {message}"));
            Ok(())
        }

        async fn set_pointer_pressed(&self, pressed: bool) -> Result<()> {
            self.record(format!("pressed {pressed}"));
            Ok(())
        }

        async fn clear_feedback(&self, _element: &ElementRef) -> Result<()> {
            self.record("clear");
            Ok(())
        }
    }

    fn config(selector: &str) -> SiteConfig {
        SiteConfig {
            id: "site_1".to_string(),
            name: "Forum".to_string(),
            url: "https://forum.example.com".to_string(),
            selector_type: SelectorType::Css,
            sign_selector: selector.to_string(),
            signed_selector_type: SelectorType::Css,
            signed_selector: None,
            wait_time: 2,
            close_wait_time: 0,
        }
    }

    fn executor() -> SignInExecutor {
        SignInExecutor::new(&Settings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_button_fails_without_clicking() {
        let page = ScriptedPage::with(&[]);
        let response = executor().execute(&page, &config("#sign"), false).await;

        assert_eq!(response, SignInResponse::failed(MSG_BUTTON_NOT_FOUND));
        assert_eq!(page.calls(), ["locate #sign"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_without_verification_assumes_success() {
        let page = ScriptedPage::with(&["#sign"]);
        let response = executor().execute(&page, &config("#sign"), false).await;

        assert_eq!(response, SignInResponse::ok(MSG_CLICKED));
        assert_eq!(page.calls(), ["locate #sign", "scroll #sign", "click #sign"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_selector_found_reports_verified() {
        let page = ScriptedPage::with(&["#sign", ".signed"]);
        let mut site = config("#sign");
        site.signed_selector = Some(".signed".to_string());

        let response = executor().execute(&page, &site, false).await;
        assert_eq!(response, SignInResponse::ok(MSG_SIGNED_IN));
        assert_eq!(page.calls().last().unwrap(), "locate .signed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_selector_missing_still_succeeds() {
        let page = ScriptedPage::with(&["#sign"]);
        let mut site = config("#sign");
        site.signed_selector = Some(".signed".to_string());

        let response = executor().execute(&page, &site, false).await;
        assert_eq!(response, SignInResponse::ok(MSG_CLICKED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_error_becomes_failed_response() {
        let page = ScriptedPage {
            present: vec!["#sign".to_string()],
            fail_click: true,
            ..Default::default()
        };
        let response = executor().execute(&page, &config("#sign"), false).await;

        assert!(!response.success);
        assert_eq!(response.message, "Node is detached from document");
    }

    #[tokio::test(start_paused = true)]
    async fn test_show_process_highlights_the_click() {
        let page = ScriptedPage::with(&["#sign"]);
        executor().execute(&page, &config("#sign"), true).await;

        assert_eq!(
            page.calls(),
            [
                "locate #sign",
                "scroll #sign",
                "styles",
                "feedback signing in",
                "click #sign",
                "clear"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expression_selectors_need_capability() {
        let page = ScriptedPage::with(&["document.body"]);
        let mut site = config("document.body");
        site.selector_type = SelectorType::Expression;

        let denied = executor().execute(&page, &site, false).await;
        assert_eq!(
            denied,
            SignInResponse::failed("expression selectors are disabled")
        );
        assert!(page.calls().is_empty());

        let settings = Settings {
            allow_expression_selectors: true,
            ..Settings::default()
        };
        let allowed = SignInExecutor::new(&settings).execute(&page, &site, false).await;
        assert_eq!(allowed, SignInResponse::ok(MSG_CLICKED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_test_without_match_only_injects_styles() {
        let page = ScriptedPage::with(&[]);
        let result = executor().test_config(&page, &config("#sign"), true).await;

        assert_eq!(result, TestConfigResult::failed(MSG_TARGET_NOT_FOUND));
        assert_eq!(page.calls(), ["styles", "locate #sign"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_test_walkthrough_never_clicks() {
        let page = ScriptedPage::with(&["#sign"]);
        let result = executor().test_config(&page, &config("#sign"), true).await;

        assert!(result.success);
        assert_eq!(result.message, MSG_TEST_COMPLETED);
        assert_eq!(result.element_details.unwrap().tag_name, "button");
        assert_eq!(
            page.calls(),
            [
                "styles",
                "locate #sign",
                "feedback found target element",
                "feedback about to click",
                "feedback simulating click",
                "pressed true",
                "pressed false",
                "details",
                "clear"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_details_only_when_requested() {
        let page = ScriptedPage::with(&["#sign"]);
        let result = executor().test_config(&page, &config("#sign"), false).await;
        assert!(result.success);
        assert!(result.element_details.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_dispatches_page_requests() {
        let page = ScriptedPage::with(&["#sign"]);
        let reply = executor()
            .handle(
                &page,
                &PageRequest::TriggerSignIn {
                    config: config("#sign"),
                    show_process: false,
                },
            )
            .await;
        assert_eq!(reply["success"], true);
        assert_eq!(reply["message"], MSG_CLICKED);

        let reply = executor()
            .handle(
                &page,
                &PageRequest::TestConfig {
                    config: config("#missing"),
                    need_details: false,
                },
            )
            .await;
        assert_eq!(reply["success"], false);
        assert_eq!(reply["message"], MSG_TARGET_NOT_FOUND);
    }
}
