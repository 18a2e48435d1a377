//! Scripted [`PageHost`] for exercising the flows without a browser.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{LoadState, PageHandle, PageHost};
use crate::models::PageRequest;

/// How one URL behaves when opened.
#[derive(Debug, Clone)]
pub struct FakeSite {
    /// Polls answered with `Loading` before `Complete`
    pub loading_polls: u32,
    pub open_error: Option<String>,
    pub load_error: Option<String>,
    /// The page reports `Gone` on the first poll
    pub vanishes: bool,
    /// Reply to page requests; `Err` simulates a broken channel
    pub reply: Result<Value, String>,
    pub close_error: bool,
}

impl Default for FakeSite {
    fn default() -> Self {
        Self {
            loading_polls: 0,
            open_error: None,
            load_error: None,
            vanishes: false,
            reply: Ok(json!({"success": true, "message": "clicked sign-in button"})),
            close_error: false,
        }
    }
}

impl FakeSite {
    pub fn replying(reply: Value) -> Self {
        Self {
            reply: Ok(reply),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Opened { url: String, visible: bool },
    Sent { url: String, request: String },
    Closed { url: String },
}

struct OpenPage {
    url: String,
    polls: u32,
}

#[derive(Default)]
pub struct FakeHost {
    sites: HashMap<String, FakeSite>,
    pages: Mutex<HashMap<String, OpenPage>>,
    events: Mutex<Vec<HostEvent>>,
    next_id: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_site(mut self, url: &str, site: FakeSite) -> Self {
        self.sites.insert(url.to_string(), site);
        self
    }

    fn site(&self, url: &str) -> FakeSite {
        self.sites.get(url).cloned().unwrap_or_default()
    }

    fn url_of(&self, page: &PageHandle) -> Option<String> {
        self.pages.lock().unwrap().get(&page.id).map(|p| p.url.clone())
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn opened(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HostEvent::Opened { url, .. } => Some(url),
                _ => None,
            })
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    fn push(&self, event: HostEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl PageHost for FakeHost {
    async fn open(&self, url: &str, visible: bool) -> Result<PageHandle> {
        if let Some(error) = self.site(url).open_error {
            bail!(error);
        }
        let id = format!("page-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.pages.lock().unwrap().insert(
            id.clone(),
            OpenPage {
                url: url.to_string(),
                polls: 0,
            },
        );
        self.push(HostEvent::Opened {
            url: url.to_string(),
            visible,
        });
        Ok(PageHandle::new(id))
    }

    async fn load_state(&self, page: &PageHandle) -> Result<LoadState> {
        let mut pages = self.pages.lock().unwrap();
        let Some(open) = pages.get_mut(&page.id) else {
            return Ok(LoadState::Gone);
        };
        let site = self.site(&open.url);
        if let Some(error) = site.load_error {
            bail!(error);
        }
        if site.vanishes {
            return Ok(LoadState::Gone);
        }
        if open.polls < site.loading_polls {
            open.polls += 1;
            return Ok(LoadState::Loading);
        }
        Ok(LoadState::Complete)
    }

    async fn send(&self, page: &PageHandle, request: &PageRequest) -> Result<Value> {
        let Some(url) = self.url_of(page) else {
            bail!("Could not establish connection. Receiving end does not exist.");
        };
        let kind = serde_json::to_value(request)?["type"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.push(HostEvent::Sent {
            url: url.clone(),
            request: kind,
        });
        self.site(&url).reply.map_err(anyhow::Error::msg)
    }

    async fn close(&self, page: &PageHandle) -> Result<()> {
        let Some(open) = self.pages.lock().unwrap().remove(&page.id) else {
            return Ok(());
        };
        self.push(HostEvent::Closed {
            url: open.url.clone(),
        });
        if self.site(&open.url).close_error {
            bail!("No tab with id");
        }
        Ok(())
    }
}
