//! In-memory browser for exercising the harness without a real engine
//!
//! A [`FakeSite`] describes a tiny application: what each page renders on
//! load, how it reacts to clicks, and which backend answers requests the
//! router lets through. The application reads the session store only when
//! a page loads, like a real single-page app reading `localStorage` at
//! startup. Click reactions can be delayed to model responses that arrive
//! after the step that triggered them has finished.

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::browser::{BrowserControl, ElementSnapshot, ElementTarget, PageLauncher, PageScript};
use crate::error::{E2eError, E2eResult};
use crate::routes::{InterceptedRequest, RouteAction, Router};

#[derive(Debug, Clone, PartialEq)]
pub struct FakeElement {
    pub selector: String,
    pub text: String,
    pub visible: bool,
    pub enabled: bool,
    pub checked: Option<bool>,
}

impl FakeElement {
    pub fn new(selector: &str, text: &str) -> Self {
        Self {
            selector: selector.to_string(),
            text: text.to_string(),
            visible: true,
            enabled: true,
            checked: None,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn checkbox(mut self, checked: bool) -> Self {
        self.checked = Some(checked);
        self
    }

    /// `text="X"` is an exact text match, `text=X` a substring match,
    /// anything else is compared with the element's selector.
    fn matches(&self, selector: &str) -> bool {
        match selector.strip_prefix("text=") {
            Some(text) => match text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
                Some(exact) => self.text == exact,
                None => self.text.contains(text),
            },
            None => self.selector == selector,
        }
    }

    fn snapshot(&self) -> ElementSnapshot {
        ElementSnapshot {
            visible: self.visible,
            enabled: self.enabled,
            checked: self.checked,
            text: self.text.clone(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Dom {
    elements: Vec<FakeElement>,
}

impl Dom {
    pub fn add(&mut self, element: FakeElement) {
        self.elements.push(element);
    }

    pub fn remove(&mut self, selector: &str) {
        self.elements.retain(|e| !e.matches(selector));
    }

    pub fn set_visible(&mut self, selector: &str, visible: bool) {
        for el in self.elements.iter_mut().filter(|e| e.matches(selector)) {
            el.visible = visible;
        }
    }

    pub fn matching(&self, selector: &str) -> Vec<&FakeElement> {
        self.elements.iter().filter(|e| e.matches(selector)).collect()
    }

    fn nth_mut(&mut self, selector: &str, index: usize) -> Option<&mut FakeElement> {
        self.elements.iter_mut().filter(|e| e.matches(selector)).nth(index)
    }

    fn clear(&mut self) {
        self.elements.clear();
    }
}

/// Response seen by the application
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl FetchResult {
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.body).ok()
    }
}

pub type Backend = Arc<dyn Fn(&InterceptedRequest) -> FetchResult + Send + Sync>;

/// What an application sees while reacting to a load or a click
pub struct PageScope<'a> {
    pub dom: &'a mut Dom,
    session: &'a BTreeMap<String, String>,
    url: &'a str,
    network: &'a Network,
}

impl PageScope<'_> {
    /// Session value as of the last page load.
    pub fn session(&self, key: &str) -> Option<&str> {
        self.session.get(key).map(String::as_str)
    }

    pub fn url(&self) -> &str {
        self.url
    }

    /// Issue a request through the router, relative to the current page.
    pub fn fetch(&self, method: &str, path: &str) -> FetchResult {
        let url = url::Url::parse(self.url)
            .and_then(|base| base.join(path))
            .map(|u| u.to_string())
            .unwrap_or_else(|_| path.to_string());
        self.network.send(&InterceptedRequest::new(method, url))
    }

    pub fn send(&self, request: &InterceptedRequest) -> FetchResult {
        self.network.send(request)
    }
}

pub type Behavior = Arc<dyn Fn(&mut PageScope<'_>) + Send + Sync>;

type Expression = Arc<dyn Fn(&Dom, &BTreeMap<String, String>) -> serde_json::Value + Send + Sync>;

pub struct Network {
    router: Router,
    backend: Backend,
}

impl Network {
    fn send(&self, request: &InterceptedRequest) -> FetchResult {
        let decision = self.router.handle(request);
        match decision.action {
            RouteAction::Fulfill(response) => FetchResult {
                status: response.status,
                body: response.body_string(),
                content_type: response.content_type,
            },
            RouteAction::Continue => {
                let result = (self.backend)(request);
                self.router
                    .log()
                    .complete_pass_through(decision.seq, result.status, Some(result.content_type.clone()));
                result
            }
        }
    }
}

/// Description of the fake application
#[derive(Clone, Default)]
pub struct FakeSite {
    pages: Vec<(String, Behavior)>,
    clicks: Vec<(String, Duration, Behavior)>,
    expressions: Vec<(String, Expression)>,
    backend: Option<Backend>,
    load_latency: Duration,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render `path` on navigation and reload.
    pub fn page<F>(mut self, path: &str, render: F) -> Self
    where
        F: Fn(&mut PageScope<'_>) + Send + Sync + 'static,
    {
        self.pages.push((path.to_string(), Arc::new(render)));
        self
    }

    /// React to clicks on `selector` after `latency`.
    pub fn on_click<F>(mut self, selector: &str, latency: Duration, react: F) -> Self
    where
        F: Fn(&mut PageScope<'_>) + Send + Sync + 'static,
    {
        self.clicks.push((selector.to_string(), latency, Arc::new(react)));
        self
    }

    pub fn on_expression<F>(mut self, expression: &str, eval: F) -> Self
    where
        F: Fn(&Dom, &BTreeMap<String, String>) -> serde_json::Value + Send + Sync + 'static,
    {
        self.expressions.push((expression.to_string(), Arc::new(eval)));
        self
    }

    /// Answer pass-through requests; the default is a 404 HTML page.
    pub fn backend<F>(mut self, backend: F) -> Self
    where
        F: Fn(&InterceptedRequest) -> FetchResult + Send + Sync + 'static,
    {
        self.backend = Some(Arc::new(backend));
        self
    }

    pub fn load_latency(mut self, latency: Duration) -> Self {
        self.load_latency = latency;
        self
    }

    fn default_backend() -> Backend {
        Arc::new(|_| FetchResult {
            status: 404,
            content_type: "text/html".to_string(),
            body: "<!doctype html><html><body>Not Found</body></html>".to_string(),
        })
    }
}

#[derive(Debug, Default)]
struct PageState {
    url: Option<String>,
    dom: Dom,
    /// Live `localStorage`
    storage: BTreeMap<String, String>,
    /// Storage as the application read it at the last load
    observed: BTreeMap<String, String>,
    generation: u64,
    closed: bool,
}

/// Counters shared between a launcher and the pages it opened
#[derive(Debug, Default)]
pub struct FakeStats {
    launches: AtomicUsize,
    closes: AtomicUsize,
    loads: AtomicUsize,
}

impl FakeStats {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

pub struct FakeBrowser {
    state: Arc<Mutex<PageState>>,
    site: Arc<FakeSite>,
    network: Arc<Network>,
    stats: Arc<FakeStats>,
}

impl FakeBrowser {
    pub fn new(site: FakeSite, router: Router) -> Self {
        Self::with_stats(Arc::new(site), router, Arc::new(FakeStats::default()))
    }

    fn with_stats(site: Arc<FakeSite>, router: Router, stats: Arc<FakeStats>) -> Self {
        let backend = site.backend.clone().unwrap_or_else(FakeSite::default_backend);
        Self {
            state: Arc::new(Mutex::new(PageState::default())),
            site,
            network: Arc::new(Network { router, backend }),
            stats,
        }
    }

    pub fn stats(&self) -> Arc<FakeStats> {
        self.stats.clone()
    }

    /// Live session store contents, bypassing the page.
    pub fn storage(&self) -> BTreeMap<String, String> {
        self.state.lock().storage.clone()
    }

    fn ensure_open(&self) -> E2eResult<()> {
        if self.state.lock().closed {
            return Err(E2eError::Bridge("page is closed".into()));
        }
        Ok(())
    }

    async fn load(&self, url: &str) -> E2eResult<()> {
        self.ensure_open()?;
        if !self.site.load_latency.is_zero() {
            tokio::time::sleep(self.site.load_latency).await;
        }

        let path = url::Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.to_string());
        let render = self
            .site
            .pages
            .iter()
            .find(|(p, _)| *p == path)
            .map(|(_, render)| render.clone())
            .ok_or_else(|| E2eError::Navigation {
                url: url.to_string(),
                reason: "404 Not Found".into(),
            })?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.generation += 1;
        state.url = Some(url.to_string());
        state.dom.clear();
        state.observed = state.storage.clone();
        self.stats.loads.fetch_add(1, Ordering::SeqCst);

        let mut scope = PageScope {
            dom: &mut state.dom,
            session: &state.observed,
            url,
            network: &self.network,
        };
        render(&mut scope);
        Ok(())
    }
}

fn apply(state: &Mutex<PageState>, network: &Network, behavior: &Behavior, generation: u64) {
    let mut guard = state.lock();
    let state = &mut *guard;
    if state.closed || state.generation != generation {
        return;
    }
    let url = state.url.clone().unwrap_or_default();
    let mut scope = PageScope {
        dom: &mut state.dom,
        session: &state.observed,
        url: &url,
        network,
    };
    behavior(&mut scope);
}

#[async_trait]
impl BrowserControl for FakeBrowser {
    async fn navigate(&self, url: &str, _timeout: Duration) -> E2eResult<()> {
        self.load(url).await
    }

    async fn reload(&self, _timeout: Duration) -> E2eResult<()> {
        let url = self
            .state
            .lock()
            .url
            .clone()
            .ok_or_else(|| E2eError::Navigation {
                url: "(reload)".into(),
                reason: "nothing loaded yet".into(),
            })?;
        self.load(&url).await
    }

    async fn click(&self, target: &ElementTarget, _timeout: Duration) -> E2eResult<()> {
        self.ensure_open()?;
        let generation = {
            let mut state = self.state.lock();
            let el = state
                .dom
                .nth_mut(&target.selector, target.index)
                .ok_or_else(|| E2eError::Interaction {
                    selector: target.selector.clone(),
                    reason: "element detached".into(),
                })?;
            if !el.visible || !el.enabled {
                return Err(E2eError::Interaction {
                    selector: target.selector.clone(),
                    reason: "element not visible or disabled".into(),
                });
            }
            if let Some(checked) = el.checked {
                el.checked = Some(!checked);
            }
            state.generation
        };

        let reactions: Vec<_> = self
            .site
            .clicks
            .iter()
            .filter(|(selector, _, _)| *selector == target.selector)
            .map(|(_, latency, behavior)| (*latency, behavior.clone()))
            .collect();

        for (latency, behavior) in reactions {
            if latency.is_zero() {
                apply(&self.state, &self.network, &behavior, generation);
            } else {
                let state = self.state.clone();
                let network = self.network.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(latency).await;
                    apply(&state, &network, &behavior, generation);
                });
            }
        }
        Ok(())
    }

    async fn fill(&self, target: &ElementTarget, value: &str, _timeout: Duration) -> E2eResult<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let el = state
            .dom
            .nth_mut(&target.selector, target.index)
            .ok_or_else(|| E2eError::Interaction {
                selector: target.selector.clone(),
                reason: "element detached".into(),
            })?;
        el.text = value.to_string();
        Ok(())
    }

    async fn evaluate(&self, script: &PageScript) -> E2eResult<serde_json::Value> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        Ok(match script {
            PageScript::SetItem { key, value } => {
                state.storage.insert(key.clone(), value.clone());
                serde_json::Value::String(value.clone())
            }
            PageScript::RemoveItem { key } => {
                state.storage.remove(key);
                serde_json::Value::Bool(true)
            }
            PageScript::GetItem { key } => state
                .storage
                .get(key)
                .map(|v| serde_json::Value::String(v.clone()))
                .unwrap_or(serde_json::Value::Null),
            PageScript::Expression(expr) => {
                let eval = self
                    .site
                    .expressions
                    .iter()
                    .find(|(e, _)| e == expr)
                    .map(|(_, eval)| eval.clone())
                    .ok_or_else(|| E2eError::Bridge(format!("unsupported expression: {}", expr)))?;
                eval(&state.dom, &state.storage)
            }
        })
    }

    async fn inspect(&self, selector: &str) -> E2eResult<Vec<ElementSnapshot>> {
        self.ensure_open()?;
        let state = self.state.lock();
        Ok(state.dom.matching(selector).into_iter().map(FakeElement::snapshot).collect())
    }

    async fn screenshot(&self, path: &Path) -> E2eResult<()> {
        self.ensure_open()?;
        RgbaImage::from_pixel(32, 18, Rgba([255, 255, 255, 255])).save(path)?;
        Ok(())
    }

    async fn close(&self) -> E2eResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(E2eError::Bridge("page closed twice".into()));
        }
        state.closed = true;
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens [`FakeBrowser`] pages for a site
pub struct FakeLauncher {
    site: Arc<FakeSite>,
    stats: Arc<FakeStats>,
}

impl FakeLauncher {
    pub fn new(site: FakeSite) -> Self {
        Self {
            site: Arc::new(site),
            stats: Arc::new(FakeStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<FakeStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl PageLauncher for FakeLauncher {
    async fn launch(&self, router: Router) -> E2eResult<Box<dyn BrowserControl>> {
        self.stats.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeBrowser::with_stats(
            self.site.clone(),
            router,
            self.stats.clone(),
        )))
    }
}
