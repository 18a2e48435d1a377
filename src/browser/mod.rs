//! Browser plumbing: the page host seam, the Chromium implementation and the
//! in-page sign-in executor.

pub mod client;
pub mod executor;
pub mod locator;

#[cfg(test)]
pub mod fake;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::models::PageRequest;

pub use client::BrowserClient;

/// Opaque handle to a page opened by a [`PageHost`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageHandle {
    pub id: String,
}

impl PageHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Load progress of a page as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    Complete,
    /// The page no longer exists (closed externally or crashed)
    Gone,
}

/// Platform that hosts pages and delivers commands into them.
#[async_trait]
pub trait PageHost: Send + Sync {
    /// Open a page at `url`; `visible` brings it to the foreground.
    async fn open(&self, url: &str, visible: bool) -> Result<PageHandle>;

    async fn load_state(&self, page: &PageHandle) -> Result<LoadState>;

    /// Deliver one request to the page's execution context and return its reply.
    ///
    /// `Value::Null` means the page answered nothing.
    async fn send(&self, page: &PageHandle, request: &PageRequest) -> Result<Value>;

    /// Close a page. Closing an unknown page is not an error.
    async fn close(&self, page: &PageHandle) -> Result<()>;
}
