//! Page lifecycle: open a page, poll it until loaded, close it.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::browser::{LoadState, PageHandle, PageHost};
use crate::error::PageError;
use crate::models::PageRequest;

/// How long and how strictly to wait for a page to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// None polls until the page loads or goes away
    pub max_attempts: Option<u32>,
    /// Treat a page that disappeared as loaded instead of failing
    pub vanished_is_loaded: bool,
}

impl WaitPolicy {
    /// Batch runs never hang on a page that was closed underneath them.
    pub fn batch(max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts,
            vanished_is_loaded: true,
        }
    }

    pub fn interactive() -> Self {
        Self {
            max_attempts: None,
            vanished_is_loaded: false,
        }
    }

    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            vanished_is_loaded: false,
        }
    }
}

/// Drives pages of a [`PageHost`].
pub struct PageController<H: ?Sized> {
    host: Arc<H>,
    poll_interval: Duration,
}

impl<H: PageHost + ?Sized> PageController<H> {
    pub fn new(host: Arc<H>, poll_interval: Duration) -> Self {
        Self {
            host,
            poll_interval,
        }
    }

    pub async fn open(&self, url: &str, visible: bool) -> Result<PageHandle> {
        self.host.open(url, visible).await
    }

    /// Poll the page's load state until it is complete.
    pub async fn await_loaded(
        &self,
        page: &PageHandle,
        policy: WaitPolicy,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(PageError::Cancelled.into());
            }
            if let Some(max) = policy.max_attempts {
                if attempts >= max {
                    return Err(PageError::Timeout { attempts: max }.into());
                }
            }

            match self.host.load_state(page).await? {
                LoadState::Complete => {
                    tracing::debug!("Page {} loaded after {} polls", page.id, attempts);
                    return Ok(());
                }
                LoadState::Gone if policy.vanished_is_loaded => {
                    tracing::debug!("Page {} went away while loading", page.id);
                    return Ok(());
                }
                LoadState::Gone => return Err(PageError::PageClosed.into()),
                LoadState::Loading => {}
            }

            attempts += 1;
            pause(self.poll_interval, cancel).await?;
        }
    }

    pub async fn send(&self, page: &PageHandle, request: &PageRequest) -> Result<Value> {
        self.host.send(page, request).await
    }

    pub async fn close(&self, page: &PageHandle) -> Result<()> {
        self.host.close(page).await
    }

    /// Close and only log failures; the page may already be gone.
    pub async fn close_quietly(&self, page: &PageHandle) {
        if let Err(e) = self.close(page).await {
            tracing::warn!("Failed to close page {}: {:#}", page.id, e);
        }
    }
}

/// Sleep that ends early with [`PageError::Cancelled`].
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(PageError::Cancelled.into()),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::{FakeHost, FakeSite};

    const URL: &str = "https://slow.example.com";

    fn controller(host: FakeHost) -> PageController<FakeHost> {
        PageController::new(Arc::new(host), Duration::from_millis(500))
    }

    fn page_error(result: Result<()>) -> PageError {
        result
            .unwrap_err()
            .downcast::<PageError>()
            .expect("expected a PageError")
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_through_loading_polls() {
        let pages = controller(FakeHost::new().with_site(
            URL,
            FakeSite {
                loading_polls: 3,
                ..FakeSite::default()
            },
        ));
        let page = pages.open(URL, false).await.unwrap();

        let started = tokio::time::Instant::now();
        pages
            .await_loaded(&page, WaitPolicy::interactive(), &CancellationToken::new())
            .await
            .unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1500) && waited < Duration::from_millis(1600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_times_out() {
        let pages = controller(FakeHost::new().with_site(
            URL,
            FakeSite {
                loading_polls: 100,
                ..FakeSite::default()
            },
        ));
        let page = pages.open(URL, true).await.unwrap();

        let started = tokio::time::Instant::now();
        let error = page_error(
            pages
                .await_loaded(&page, WaitPolicy::bounded(20), &CancellationToken::new())
                .await,
        );
        assert_eq!(error, PageError::Timeout { attempts: 20 });
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_millis(10_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_page_depends_on_policy() {
        let pages = controller(FakeHost::new().with_site(
            URL,
            FakeSite {
                vanishes: true,
                ..FakeSite::default()
            },
        ));
        let page = pages.open(URL, false).await.unwrap();
        let cancel = CancellationToken::new();

        assert!(pages
            .await_loaded(&page, WaitPolicy::batch(None), &cancel)
            .await
            .is_ok());
        assert_eq!(
            page_error(pages.await_loaded(&page, WaitPolicy::bounded(20), &cancel).await),
            PageError::PageClosed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_unbounded_wait() {
        let pages = controller(FakeHost::new().with_site(
            URL,
            FakeSite {
                loading_polls: u32::MAX,
                ..FakeSite::default()
            },
        ));
        let page = pages.open(URL, false).await.unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });

        assert_eq!(
            page_error(pages.await_loaded(&page, WaitPolicy::batch(None), &cancel).await),
            PageError::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let host = Arc::new(FakeHost::new());
        let pages = PageController::new(host.clone(), Duration::from_millis(500));
        let page = pages.open(URL, false).await.unwrap();

        pages.close(&page).await.unwrap();
        pages.close(&page).await.unwrap();
        assert_eq!(host.open_count(), 0);
    }
}
