//! Route mocking for requests issued by the page
//!
//! Routes are registered on a [`RouterBuilder`] and frozen into a [`Router`]
//! before the first navigation. The frozen router is immutable and cheap to
//! clone, so the browser side can consult it from whatever task delivers
//! network events without touching executor state.
//!
//! Matching rules:
//! - routes are scanned in registration order, first match wins
//! - the method must match unless the route uses the `*` wildcard
//! - patterns starting with `/` match against the request path, anything
//!   else against the full URL
//! - glob `*` matches within one path segment, `**` matches across segments
//! - a `?` in a pattern starts the query part, whose parameters are compared
//!   without regard to order
//! - unmatched requests pass through to the real network

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{E2eError, E2eResult};

/// A request seen by the browser before it reaches the network
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterceptedRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl InterceptedRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Parse the request body as JSON.
    pub fn json_body(&self) -> Option<serde_json::Value> {
        self.body.as_deref().and_then(|b| serde_json::from_str(b).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MockBody {
    Json(serde_json::Value),
    Text(String),
}

/// A substitute response served to the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: String,
    pub body: MockBody,
}

impl MockResponse {
    pub fn json(value: serde_json::Value) -> Self {
        Self {
            status: 200,
            content_type: "application/json".to_string(),
            body: MockBody::Json(value),
        }
    }

    pub fn text(status: u16, content_type: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            body: MockBody::Text(body.into()),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Response served when a dynamic handler fails, so the page never hangs.
    pub fn handler_failure(reason: &str) -> Self {
        Self {
            status: 500,
            content_type: "application/json".to_string(),
            body: MockBody::Json(serde_json::json!({ "error": "mock handler failed", "reason": reason })),
        }
    }

    /// Serialized body. JSON objects serialize with sorted keys, so the same
    /// value always produces the same bytes.
    pub fn body_string(&self) -> String {
        match &self.body {
            MockBody::Json(value) => value.to_string(),
            MockBody::Text(text) => text.clone(),
        }
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type DynamicHandler =
    Arc<dyn Fn(&InterceptedRequest) -> Result<MockResponse, HandlerError> + Send + Sync>;

#[derive(Clone)]
pub enum MockHandler {
    Static(MockResponse),
    Dynamic(DynamicHandler),
}

impl MockHandler {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&InterceptedRequest) -> Result<MockResponse, HandlerError> + Send + Sync + 'static,
    {
        MockHandler::Dynamic(Arc::new(f))
    }

    fn respond(&self, request: &InterceptedRequest) -> Result<MockResponse, String> {
        match self {
            MockHandler::Static(response) => Ok(response.clone()),
            MockHandler::Dynamic(f) => match catch_unwind(AssertUnwindSafe(|| f(request))) {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(e.to_string()),
                Err(panic) => Err(panic_message(panic)),
            },
        }
    }
}

impl fmt::Debug for MockHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MockHandler::Static(r) => f.debug_tuple("Static").field(r).finish(),
            MockHandler::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodMatcher {
    Any,
    Exact(String),
}

impl MethodMatcher {
    pub fn parse(method: &str) -> Self {
        match method.trim() {
            "" | "*" => MethodMatcher::Any,
            m => MethodMatcher::Exact(m.to_ascii_uppercase()),
        }
    }

    fn matches(&self, method: &str) -> bool {
        match self {
            MethodMatcher::Any => true,
            MethodMatcher::Exact(m) => m.eq_ignore_ascii_case(method),
        }
    }
}

impl fmt::Display for MethodMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodMatcher::Any => f.write_str("*"),
            MethodMatcher::Exact(m) => f.write_str(m),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Prefix,
    #[default]
    Glob,
}

/// Compiled URL matcher
#[derive(Debug, Clone)]
pub enum UrlMatcher {
    Exact {
        source: String,
        base: String,
        query: Vec<(String, String)>,
    },
    Prefix(String),
    Glob {
        source: String,
        base: Regex,
        query: Option<Vec<(String, Regex)>>,
    },
}

impl UrlMatcher {
    pub fn exact(pattern: &str) -> Self {
        let (base, query) = split_query(pattern);
        UrlMatcher::Exact {
            source: pattern.to_string(),
            base: base.to_string(),
            query: sorted_pairs(query),
        }
    }

    pub fn prefix(pattern: &str) -> Self {
        UrlMatcher::Prefix(pattern.to_string())
    }

    pub fn glob(pattern: &str) -> E2eResult<Self> {
        let (base, query) = split_query(pattern);
        let base_re = compile_glob(pattern, base, "[^/]*")?;
        let query = match query {
            Some(q) => Some(
                sorted_pairs(Some(q))
                    .into_iter()
                    .map(|(k, v)| Ok((k, compile_glob(pattern, &v, ".*")?)))
                    .collect::<E2eResult<Vec<_>>>()?,
            ),
            None => None,
        };
        Ok(UrlMatcher::Glob {
            source: pattern.to_string(),
            base: base_re,
            query,
        })
    }

    pub fn compile(kind: MatchKind, pattern: &str) -> E2eResult<Self> {
        if pattern.is_empty() {
            return Err(E2eError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "empty URL pattern".into(),
            });
        }
        match kind {
            MatchKind::Exact => Ok(Self::exact(pattern)),
            MatchKind::Prefix => Ok(Self::prefix(pattern)),
            MatchKind::Glob => Self::glob(pattern),
        }
    }

    pub fn source(&self) -> &str {
        match self {
            UrlMatcher::Exact { source, .. } => source,
            UrlMatcher::Prefix(source) => source,
            UrlMatcher::Glob { source, .. } => source,
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        let target = RequestTarget::parse(url);
        let path_mode = self.source().starts_with('/');
        let base = if path_mode { &target.path } else { &target.origin_path };

        match self {
            UrlMatcher::Exact { base: b, query, .. } => {
                b == base && *query == sorted_pairs(target.query.as_deref())
            }
            UrlMatcher::Prefix(prefix) => target.with_query(base).starts_with(prefix.as_str()),
            UrlMatcher::Glob {
                base: re,
                query: None,
                ..
            } => re.is_match(&target.with_query(base)),
            UrlMatcher::Glob {
                base: re,
                query: Some(expected),
                ..
            } => re.is_match(base) && query_matches(expected, &sorted_pairs(target.query.as_deref())),
        }
    }
}

/// Every expected parameter must claim a distinct actual parameter, and no
/// actual parameter may be left over.
fn query_matches(expected: &[(String, Regex)], actual: &[(String, String)]) -> bool {
    if expected.len() != actual.len() {
        return false;
    }
    let mut used = vec![false; actual.len()];
    'outer: for (key, value) in expected {
        for (i, (k, v)) in actual.iter().enumerate() {
            if !used[i] && k == key && value.is_match(v) {
                used[i] = true;
                continue 'outer;
            }
        }
        return false;
    }
    true
}

fn split_query(pattern: &str) -> (&str, Option<&str>) {
    match pattern.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (pattern, None),
    }
}

fn sorted_pairs(query: Option<&str>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = match query {
        Some(q) if !q.is_empty() => url::form_urlencoded::parse(q.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        _ => Vec::new(),
    };
    pairs.sort();
    pairs
}

fn compile_glob(source: &str, glob: &str, single: &str) -> E2eResult<Regex> {
    let mut re = String::with_capacity(glob.len() * 2 + 2);
    re.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '*' {
            if chars.peek() == Some(&'*') {
                chars.next();
                re.push_str(".*");
            } else {
                re.push_str(single);
            }
        } else {
            re.push_str(&regex::escape(&c.to_string()));
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| E2eError::InvalidPattern {
        pattern: source.to_string(),
        reason: e.to_string(),
    })
}

/// Request URL split into the parts patterns are matched against
struct RequestTarget {
    /// scheme://host[:port]/path, no query or fragment
    origin_path: String,
    path: String,
    query: Option<String>,
}

impl RequestTarget {
    fn parse(raw: &str) -> Self {
        match url::Url::parse(raw) {
            Ok(url) => {
                let mut origin_path = url.clone();
                origin_path.set_query(None);
                origin_path.set_fragment(None);
                Self {
                    origin_path: origin_path.to_string(),
                    path: url.path().to_string(),
                    query: url.query().map(str::to_string),
                }
            }
            Err(_) => {
                let without_fragment = raw.split('#').next().unwrap_or(raw);
                let (path, query) = split_query(without_fragment);
                Self {
                    origin_path: path.to_string(),
                    path: path.to_string(),
                    query: query.map(str::to_string),
                }
            }
        }
    }

    fn with_query(&self, base: &str) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", base, q),
            None => base.to_string(),
        }
    }
}

/// Method plus URL matcher
#[derive(Debug, Clone)]
pub struct RoutePattern {
    pub method: MethodMatcher,
    pub url: UrlMatcher,
}

impl RoutePattern {
    pub fn new(method: &str, url: UrlMatcher) -> Self {
        Self {
            method: MethodMatcher::parse(method),
            url,
        }
    }

    pub fn glob(method: &str, pattern: &str) -> E2eResult<Self> {
        Ok(Self::new(method, UrlMatcher::glob(pattern)?))
    }

    pub fn matches(&self, request: &InterceptedRequest) -> bool {
        self.method.matches(&request.method) && self.url.matches(&request.url)
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url.source())
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub index: usize,
    pub pattern: RoutePattern,
    pub handler: MockHandler,
}

/// Append-only registration phase
#[derive(Debug, Default)]
pub struct RouterBuilder {
    routes: Vec<Route>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: RoutePattern, handler: MockHandler) -> &mut Self {
        let index = self.routes.len();
        debug!("Registered route #{}: {}", index, pattern);
        self.routes.push(Route {
            index,
            pattern,
            handler,
        });
        self
    }

    /// Register a static JSON response for a glob pattern.
    pub fn mock_json(&mut self, method: &str, pattern: &str, value: serde_json::Value) -> E2eResult<&mut Self> {
        let pattern = RoutePattern::glob(method, pattern)?;
        Ok(self.register(pattern, MockHandler::Static(MockResponse::json(value))))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// End the registration phase.
    pub fn freeze(self) -> Router {
        Router {
            routes: self.routes.into(),
            log: Arc::new(InterceptionLog::default()),
        }
    }
}

/// What the browser should do with an intercepted request
#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    Fulfill(MockResponse),
    Continue,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Interception log sequence number for this request
    pub seq: u64,
    pub action: RouteAction,
}

/// Frozen, shareable route table
#[derive(Debug, Clone)]
pub struct Router {
    routes: Arc<[Route]>,
    log: Arc<InterceptionLog>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// A router without routes; everything passes through.
    pub fn empty() -> Self {
        RouterBuilder::new().freeze()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// First route, in registration order, whose pattern matches.
    pub fn match_request(&self, request: &InterceptedRequest) -> Option<&Route> {
        self.routes.iter().find(|route| route.pattern.matches(request))
    }

    /// Decide the fate of an intercepted request and log it.
    pub fn handle(&self, request: &InterceptedRequest) -> RouteDecision {
        let Some(route) = self.match_request(request) else {
            let seq = self.log.push(request, InterceptionOutcome::PassThrough {
                status: None,
                content_type: None,
            });
            debug!("Pass-through #{}: {} {}", seq, request.method, request.url);
            return RouteDecision {
                seq,
                action: RouteAction::Continue,
            };
        };

        match route.handler.respond(request) {
            Ok(response) => {
                let seq = self.log.push(request, InterceptionOutcome::Mocked {
                    route: route.index,
                    status: response.status,
                });
                debug!("Mocked #{} via route #{}: {} {} -> {}", seq, route.index, request.method, request.url, response.status);
                RouteDecision {
                    seq,
                    action: RouteAction::Fulfill(response),
                }
            }
            Err(reason) => {
                warn!("Mock handler #{} failed for {} {}: {}", route.index, request.method, request.url, reason);
                let response = MockResponse::handler_failure(&reason);
                let seq = self.log.push(request, InterceptionOutcome::HandlerFailed {
                    route: route.index,
                    error: reason,
                });
                RouteDecision {
                    seq,
                    action: RouteAction::Fulfill(response),
                }
            }
        }
    }

    pub fn log(&self) -> &InterceptionLog {
        &self.log
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InterceptionOutcome {
    Mocked {
        route: usize,
        status: u16,
    },
    PassThrough {
        status: Option<u16>,
        content_type: Option<String>,
    },
    HandlerFailed {
        route: usize,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptionRecord {
    pub seq: u64,
    pub method: String,
    pub url: String,
    #[serde(flatten)]
    pub outcome: InterceptionOutcome,
}

impl InterceptionRecord {
    pub fn is_pass_through(&self) -> bool {
        matches!(self.outcome, InterceptionOutcome::PassThrough { .. })
    }

    pub fn handler_error(&self) -> Option<&str> {
        match &self.outcome {
            InterceptionOutcome::HandlerFailed { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for InterceptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} {} -> ", self.seq, self.method, self.url)?;
        match &self.outcome {
            InterceptionOutcome::Mocked { route, status } => write!(f, "mocked by route #{} ({})", route, status),
            InterceptionOutcome::PassThrough { status, content_type } => {
                f.write_str("pass-through")?;
                if let Some(status) = status {
                    write!(f, " {}", status)?;
                }
                if let Some(ct) = content_type {
                    write!(f, " {}", ct)?;
                }
                Ok(())
            }
            InterceptionOutcome::HandlerFailed { route, error } => {
                write!(f, "handler #{} failed: {} (served 500)", route, error)
            }
        }
    }
}

/// Every request the router saw, in arrival order
#[derive(Debug, Default)]
pub struct InterceptionLog {
    next_seq: AtomicU64,
    records: Mutex<Vec<InterceptionRecord>>,
}

impl InterceptionLog {
    fn push(&self, request: &InterceptedRequest, outcome: InterceptionOutcome) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.records.lock().push(InterceptionRecord {
            seq,
            method: request.method.to_ascii_uppercase(),
            url: request.url.clone(),
            outcome,
        });
        seq
    }

    /// Attach the real response to a pass-through record once it arrives.
    pub fn complete_pass_through(&self, seq: u64, status: u16, content_type: Option<String>) {
        let mut records = self.records.lock();
        if let Some(record) = records.iter_mut().find(|r| r.seq == seq) {
            if let InterceptionOutcome::PassThrough { .. } = record.outcome {
                record.outcome = InterceptionOutcome::PassThrough {
                    status: Some(status),
                    content_type,
                };
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<InterceptionRecord> {
        self.records.lock().clone()
    }

    /// Handler failures recorded at or after position `from`.
    pub fn failures_since(&self, from: usize) -> Vec<InterceptionRecord> {
        self.records
            .lock()
            .iter()
            .skip(from)
            .filter(|r| r.handler_error().is_some())
            .cloned()
            .collect()
    }
}
