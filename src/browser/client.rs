//! Chrome CDP client wrapper.
//!
//! Owns one browser and the sign-in pages opened in it. Commands sent to a
//! page are answered by running the [`SignInExecutor`] against that page.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::target::{CreateTargetParams, GetTargetsParams};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::executor::{ElementRef, PageContext, SignInExecutor};
use super::locator::{clickable_texts_script, first_pattern_match, mark_clickable_script, Locator, LookupPlan};
use super::{LoadState, PageHandle, PageHost};
use crate::models::{ElementDetails, PageRequest};

const FEEDBACK_STYLE_ID: &str = "signin-feedback-styles";

const FEEDBACK_CSS: &str = r#"
.signin-highlight {
    transition: all 0.3s ease-in-out !important;
    box-shadow: 0 0 0 2px #2196F3, 0 0 15px rgba(33, 150, 243, 0.5) !important;
    border-radius: 4px !important;
}
.signin-pointer {
    position: fixed; width: 20px; height: 20px;
    background: rgba(244, 67, 54, 0.9); border: 2px solid white; border-radius: 50%;
    pointer-events: none; z-index: 2147483646;
    transition: all 0.3s cubic-bezier(0.4, 0, 0.2, 1);
}
.signin-pointer.pressed { transform: scale(0.8); background: rgba(244, 67, 54, 0.7); }
.signin-tooltip {
    position: fixed; background: rgba(0, 0, 0, 0.8); color: white;
    padding: 8px 16px; border-radius: 4px; font-size: 14px;
    pointer-events: none; z-index: 2147483647; white-space: nowrap;
    transition: all 0.3s cubic-bezier(0.4, 0, 0.2, 1);
}
"#;

/// Chrome browser client hosting sign-in pages.
pub struct BrowserClient {
    browser: Browser,
    pages: Arc<RwLock<HashMap<String, Page>>>,
    executor: SignInExecutor,
}

impl BrowserClient {
    /// Launch the browser.
    pub async fn new(user_data_dir: PathBuf, headless: bool, executor: SignInExecutor) -> Result<Self> {
        // Ensure user data directory exists
        tokio::fs::create_dir_all(&user_data_dir).await?;

        let chrome_path = Self::find_chrome_executable()?;

        // The profile keeps site logins between runs, so no ephemeral flags here.
        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .user_data_dir(&user_data_dir)
            .viewport(None)
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-background-timer-throttling")
            .arg("--disable-backgrounding-occluded-windows")
            .arg("--disable-renderer-backgrounding")
            .arg("--disable-breakpad")
            .arg("--disable-default-apps")
            .arg("--disable-extensions")
            .arg("--disable-sync")
            .arg("--mute-audio")
            .arg("--no-first-run");

        if !headless {
            builder = builder.with_head();
        }

        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch browser")?;

        // Spawn handler task - just drain events
        tokio::spawn(async move { while handler.next().await.is_some() {} });

        Ok(Self {
            browser,
            pages: Arc::new(RwLock::new(HashMap::new())),
            executor,
        })
    }

    async fn get_page(&self, handle: &PageHandle) -> Option<Page> {
        self.pages.read().await.get(&handle.id).cloned()
    }

    /// Whether the page's target still exists in the browser.
    async fn target_alive(&self, page: &Page) -> bool {
        match self.browser.execute(GetTargetsParams::default()).await {
            Ok(response) => response
                .result
                .target_infos
                .iter()
                .any(|info| &info.target_id == page.target_id()),
            Err(e) => {
                tracing::debug!("Target query failed: {}", e);
                false
            }
        }
    }

    /// Health check - verify browser is responsive.
    pub async fn health_check(&self) -> Result<bool> {
        let _version = self.browser.version().await?;
        Ok(true)
    }

    /// Find Chrome executable on the system.
    fn find_chrome_executable() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("CHROME_PATH") {
            let p = PathBuf::from(path);
            if p.exists() {
                tracing::info!("Using Chrome from CHROME_PATH: {:?}", p);
                return Ok(p);
            }
        }

        let paths = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Google Chrome Canary.app/Contents/MacOS/Google Chrome Canary",
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ];

        for path in &paths {
            let p = PathBuf::from(path);
            if p.exists() {
                tracing::info!("Found Chrome at: {}", path);
                return Ok(p);
            }
        }

        anyhow::bail!("Chrome/Chromium not found. Install Chrome or set CHROME_PATH.")
    }
}

#[async_trait]
impl PageHost for BrowserClient {
    async fn open(&self, url: &str, visible: bool) -> Result<PageHandle> {
        let params = CreateTargetParams::builder()
            .url(url)
            .background(!visible)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build target params: {:?}", e))?;

        let page = self
            .browser
            .new_page(params)
            .await
            .with_context(|| format!("Failed to open page for {}", url))?;

        if visible {
            if let Err(e) = page.bring_to_front().await {
                tracing::debug!("Could not bring page to front: {}", e);
            }
        }

        let handle = PageHandle::new(uuid::Uuid::new_v4().to_string());
        self.pages.write().await.insert(handle.id.clone(), page);
        tracing::debug!("Opened page {} at {}", handle.id, url);

        Ok(handle)
    }

    async fn load_state(&self, handle: &PageHandle) -> Result<LoadState> {
        let Some(page) = self.get_page(handle).await else {
            return Ok(LoadState::Gone);
        };

        match page.evaluate("document.readyState").await {
            Ok(result) => {
                let state: String = result.into_value().unwrap_or_default();
                Ok(if state == "complete" {
                    LoadState::Complete
                } else {
                    LoadState::Loading
                })
            }
            // Evaluation also fails mid-navigation; only a missing target means gone.
            Err(e) if self.target_alive(&page).await => {
                tracing::debug!("readyState unavailable, still loading: {}", e);
                Ok(LoadState::Loading)
            }
            Err(_) => Ok(LoadState::Gone),
        }
    }

    async fn send(&self, handle: &PageHandle, request: &PageRequest) -> Result<Value> {
        let page = self
            .get_page(handle)
            .await
            .ok_or_else(|| anyhow::anyhow!("Page not found: {}", handle.id))?;

        let context = ChromePage { page };
        Ok(self.executor.handle(&context, request).await)
    }

    async fn close(&self, handle: &PageHandle) -> Result<()> {
        let page = self.pages.write().await.remove(&handle.id);
        if let Some(page) = page {
            page.close().await.context("Failed to close page")?;
            tracing::debug!("Closed page {}", handle.id);
        }
        Ok(())
    }
}

/// DOM `click()` on the element, not a mouse event at its position.
const CLICK_BODY: &str = "el.click();";

/// Script running `body` with `el` bound to the marked element.
fn element_script(element: &ElementRef, body: &str) -> Result<String> {
    Ok(format!(
        r#"(() => {{
                const el = document.querySelector({});
                if (!el) throw new Error('Element is no longer attached');
                {}
            }})()"#,
        serde_json::to_string(&element.selector())?,
        body
    ))
}

/// [`PageContext`] backed by a live CDP page.
struct ChromePage {
    page: Page,
}

impl ChromePage {
    /// Evaluate `body` with `el` bound to the marked element.
    async fn with_element(&self, element: &ElementRef, body: &str) -> Result<Value> {
        let result = self.page.evaluate(element_script(element, body)?).await?;
        Ok(result.into_value::<Value>().unwrap_or(Value::Null))
    }

    async fn mark(&self, script: String, marker: String) -> Result<Option<ElementRef>> {
        let found: bool = self
            .page
            .evaluate(script)
            .await
            .context("Element lookup failed")?
            .into_value()
            .unwrap_or(false);
        Ok(found.then(|| ElementRef::new(marker)))
    }
}

#[async_trait]
impl PageContext for ChromePage {
    async fn locate(&self, locator: &Locator) -> Result<Option<ElementRef>> {
        let marker = format!("sg-{}", uuid::Uuid::new_v4().simple());

        match locator.plan(&marker) {
            LookupPlan::Script(script) => self.mark(script, marker).await,
            LookupPlan::Pattern(regex) => {
                let texts: Vec<String> = self
                    .page
                    .evaluate(clickable_texts_script())
                    .await
                    .context("Failed to read clickable elements")?
                    .into_value()
                    .unwrap_or_default();

                match first_pattern_match(&regex, &texts) {
                    Some(index) => self.mark(mark_clickable_script(index, &marker), marker).await,
                    None => Ok(None),
                }
            }
            LookupPlan::Invalid => Ok(None),
        }
    }

    async fn scroll_into_view(&self, element: &ElementRef) -> Result<()> {
        self.with_element(
            element,
            "el.scrollIntoView({ behavior: 'smooth', block: 'center' });",
        )
        .await?;
        Ok(())
    }

    async fn click(&self, element: &ElementRef) -> Result<()> {
        self.with_element(element, CLICK_BODY)
            .await
            .context("Click failed")?;
        Ok(())
    }

    async fn element_details(&self, element: &ElementRef) -> Result<ElementDetails> {
        let details = self
            .with_element(
                element,
                r#"
                const rect = el.getBoundingClientRect();
                const style = window.getComputedStyle(el);
                const str = (v) => (v === undefined || v === null) ? null : String(v);
                return {
                    text: (el.textContent || '').trim() || el.value || el.alt || '',
                    tagName: el.tagName.toLowerCase(),
                    position: `(${Math.round(rect.left)}, ${Math.round(rect.top)})`,
                    size: `${Math.round(rect.width)}x${Math.round(rect.height)}`,
                    visibility: {
                        display: style.display,
                        visibility: style.visibility,
                        opacity: style.opacity,
                        isVisible: style.display !== 'none'
                            && style.visibility !== 'hidden'
                            && style.opacity !== '0'
                    },
                    attributes: {
                        id: str(el.id),
                        class: str(el.getAttribute('class')),
                        type: str(el.type),
                        href: str(el.href),
                        src: str(el.src)
                    }
                };
                "#,
            )
            .await?;
        serde_json::from_value(details).context("Failed to parse element details")
    }

    async fn inject_feedback_styles(&self) -> Result<()> {
        let script = format!(
            r#"(() => {{
                const id = {};
                if (document.getElementById(id)) return;
                const style = document.createElement('style');
                style.id = id;
                style.textContent = {};
                (document.head || document.documentElement).appendChild(style);
            }})()"#,
            serde_json::to_string(FEEDBACK_STYLE_ID)?,
            serde_json::to_string(FEEDBACK_CSS)?
        );
        self.page.evaluate(script).await?;
        Ok(())
    }

    async fn show_feedback(&self, element: &ElementRef, message: &str) -> Result<()> {
        let body = format!(
            r#"
            const overlay = (cls) => {{
                let node = document.querySelector('.' + cls);
                if (!node) {{
                    node = document.createElement('div');
                    node.className = cls;
                    document.body.appendChild(node);
                }}
                return node;
            }};
            const pointer = overlay('signin-pointer');
            const tooltip = overlay('signin-tooltip');
            el.classList.add('signin-highlight');
            const rect = el.getBoundingClientRect();
            const x = rect.left + rect.width / 2;
            const y = rect.top + rect.height / 2;
            tooltip.textContent = {};
            tooltip.style.left = `${{x + 30}}px`;
            tooltip.style.top = `${{y}}px`;
            pointer.style.left = `${{x - 10}}px`;
            pointer.style.top = `${{y - 10}}px`;
            "#,
            serde_json::to_string(message)?
        );
        self.with_element(element, &body).await?;
        Ok(())
    }

    async fn set_pointer_pressed(&self, pressed: bool) -> Result<()> {
        let script = format!(
            r#"(() => {{
                const pointer = document.querySelector('.signin-pointer');
                if (pointer) pointer.classList.toggle('pressed', {});
            }})()"#,
            pressed
        );
        self.page.evaluate(script).await?;
        Ok(())
    }

    async fn clear_feedback(&self, element: &ElementRef) -> Result<()> {
        self.with_element(
            element,
            r#"
            el.classList.remove('signin-highlight');
            for (const node of document.querySelectorAll('.signin-pointer, .signin-tooltip')) {
                node.style.opacity = '0';
                setTimeout(() => node.remove(), 300);
            }
            "#,
        )
        .await?;
        Ok(())
    }
}
