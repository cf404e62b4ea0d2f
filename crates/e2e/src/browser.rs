//! Browser control contract
//!
//! The harness never drives a browser directly. Everything goes through
//! [`BrowserControl`], which a backend (the Playwright bridge, or the
//! in-memory fake used by the harness tests) implements. Every call is a
//! suspension point and carries its own deadline where the operation can
//! block.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::E2eResult;
use crate::routes::Router;

/// State of one element matched by a selector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    pub visible: bool,
    pub enabled: bool,
    /// `None` for elements that are not checkable
    #[serde(default)]
    pub checked: Option<bool>,
    #[serde(default)]
    pub text: String,
}

/// One concrete element: a selector plus the index among its matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementTarget {
    pub selector: String,
    pub index: usize,
}

/// Scripts the harness evaluates in the page
#[derive(Debug, Clone, PartialEq)]
pub enum PageScript {
    /// `localStorage.setItem`, evaluates to the value read back
    SetItem { key: String, value: String },
    /// `localStorage.removeItem`, evaluates to `true` once the key is gone
    RemoveItem { key: String },
    /// `localStorage.getItem`
    GetItem { key: String },
    /// Arbitrary expression
    Expression(String),
}

impl PageScript {
    pub fn to_js(&self) -> String {
        match self {
            PageScript::SetItem { key, value } => format!(
                "(() => {{ localStorage.setItem({k}, {v}); return localStorage.getItem({k}); }})()",
                k = js_string(key),
                v = js_string(value)
            ),
            PageScript::RemoveItem { key } => format!(
                "(() => {{ localStorage.removeItem({k}); return localStorage.getItem({k}) === null; }})()",
                k = js_string(key)
            ),
            PageScript::GetItem { key } => format!("localStorage.getItem({})", js_string(key)),
            PageScript::Expression(expr) => expr.clone(),
        }
    }
}

/// JSON string literals are valid JS string literals.
fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Primitives the harness needs from a live page
#[async_trait]
pub trait BrowserControl: Send + Sync {
    /// Load `url` and wait for the load event.
    async fn navigate(&self, url: &str, timeout: Duration) -> E2eResult<()>;

    /// Reload the current page and wait for the load event.
    async fn reload(&self, timeout: Duration) -> E2eResult<()>;

    async fn click(&self, target: &ElementTarget, timeout: Duration) -> E2eResult<()>;

    async fn fill(&self, target: &ElementTarget, value: &str, timeout: Duration) -> E2eResult<()>;

    async fn evaluate(&self, script: &PageScript) -> E2eResult<serde_json::Value>;

    /// Current state of every element matching `selector`, in document order.
    async fn inspect(&self, selector: &str) -> E2eResult<Vec<ElementSnapshot>>;

    async fn screenshot(&self, path: &Path) -> E2eResult<()>;

    async fn close(&self) -> E2eResult<()>;
}

/// Opens a fresh page whose network traffic is routed through `router`
#[async_trait]
pub trait PageLauncher: Send + Sync {
    async fn launch(&self, router: Router) -> E2eResult<Box<dyn BrowserControl>>;
}

/// Exclusive ownership of a page for the length of one run.
///
/// [`PageLease::release`] closes the page exactly once. If the lease is
/// dropped unreleased (the run future was cancelled or unwound), the close
/// is handed to the runtime instead.
pub struct PageLease {
    page: Option<Box<dyn BrowserControl>>,
}

impl PageLease {
    pub fn new(page: Box<dyn BrowserControl>) -> Self {
        Self { page: Some(page) }
    }

    pub fn page(&self) -> Option<&dyn BrowserControl> {
        self.page.as_deref()
    }

    pub async fn release(&mut self) -> E2eResult<()> {
        match self.page.take() {
            Some(page) => page.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };
        warn!("Page lease dropped without release; closing in background");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = page.close().await {
                        warn!("Background page close failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime available to close page"),
        }
    }
}
