//! Scenarios: named, ordered step lists plus the routes they mock
//!
//! Scenarios are built in Rust with [`Scenario::builder`] or parsed from
//! YAML. Once built a scenario is immutable; every execution produces a
//! fresh run and a fresh router.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::artifacts::sanitize;
use crate::error::{E2eError, E2eResult};
use crate::poll::Pick;
use crate::routes::{MatchKind, MockHandler, MockResponse, RoutePattern, Router, RouterBuilder, UrlMatcher};

/// A single step in a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Navigate to a URL (relative to the base URL)
    Navigate {
        url: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    Click {
        selector: String,
        #[serde(default)]
        pick: Option<Pick>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    Fill {
        selector: String,
        value: String,
        #[serde(default)]
        pick: Option<Pick>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Write a session store key, optionally reloading afterwards
    InjectState {
        key: String,
        value: String,
        #[serde(default)]
        reload: bool,
    },

    ClearState {
        key: String,
        #[serde(default)]
        reload: bool,
    },

    Reload {
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    AssertVisible {
        selector: String,
        #[serde(default)]
        pick: Option<Pick>,
        /// Exact text match; only valid on `text=` selectors
        #[serde(default)]
        exact: bool,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    AssertHidden {
        selector: String,
        #[serde(default)]
        pick: Option<Pick>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    AssertText {
        selector: String,
        text: String,
        /// Substring instead of full-text comparison
        #[serde(default)]
        contains: bool,
        #[serde(default)]
        pick: Option<Pick>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    AssertChecked {
        selector: String,
        #[serde(default = "default_checked")]
        checked: bool,
        #[serde(default)]
        pick: Option<Pick>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Wait for an element to become visible or a script condition to hold
    Wait {
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        condition: Option<String>,
        /// Only with `selector`
        #[serde(default)]
        pick: Option<Pick>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    Screenshot {
        name: String,
    },
}

fn default_checked() -> bool {
    true
}

impl Step {
    pub fn navigate(url: &str) -> Self {
        Step::Navigate {
            url: url.to_string(),
            timeout_ms: None,
        }
    }

    pub fn click(selector: &str) -> Self {
        Step::Click {
            selector: selector.to_string(),
            pick: None,
            timeout_ms: None,
        }
    }

    pub fn fill(selector: &str, value: &str) -> Self {
        Step::Fill {
            selector: selector.to_string(),
            value: value.to_string(),
            pick: None,
            timeout_ms: None,
        }
    }

    pub fn inject_state(key: &str, value: &str) -> Self {
        Step::InjectState {
            key: key.to_string(),
            value: value.to_string(),
            reload: false,
        }
    }

    pub fn clear_state(key: &str) -> Self {
        Step::ClearState {
            key: key.to_string(),
            reload: false,
        }
    }

    pub fn reload() -> Self {
        Step::Reload { timeout_ms: None }
    }

    pub fn assert_visible(selector: &str) -> Self {
        Step::AssertVisible {
            selector: selector.to_string(),
            pick: None,
            exact: false,
            timeout_ms: None,
        }
    }

    pub fn assert_hidden(selector: &str) -> Self {
        Step::AssertHidden {
            selector: selector.to_string(),
            pick: None,
            timeout_ms: None,
        }
    }

    pub fn assert_text(selector: &str, text: &str) -> Self {
        Step::AssertText {
            selector: selector.to_string(),
            text: text.to_string(),
            contains: false,
            pick: None,
            timeout_ms: None,
        }
    }

    pub fn assert_checked(selector: &str, checked: bool) -> Self {
        Step::AssertChecked {
            selector: selector.to_string(),
            checked,
            pick: None,
            timeout_ms: None,
        }
    }

    pub fn wait_for(selector: &str) -> Self {
        Step::Wait {
            selector: Some(selector.to_string()),
            condition: None,
            pick: None,
            timeout_ms: None,
        }
    }

    pub fn wait_until(condition: &str) -> Self {
        Step::Wait {
            selector: None,
            condition: Some(condition.to_string()),
            pick: None,
            timeout_ms: None,
        }
    }

    pub fn screenshot(name: &str) -> Self {
        Step::Screenshot { name: name.to_string() }
    }

    /// Set the per-step timeout where the step has one.
    pub fn timeout(mut self, ms: u64) -> Self {
        match &mut self {
            Step::Navigate { timeout_ms, .. }
            | Step::Click { timeout_ms, .. }
            | Step::Fill { timeout_ms, .. }
            | Step::Reload { timeout_ms }
            | Step::AssertVisible { timeout_ms, .. }
            | Step::AssertHidden { timeout_ms, .. }
            | Step::AssertText { timeout_ms, .. }
            | Step::AssertChecked { timeout_ms, .. }
            | Step::Wait { timeout_ms, .. } => *timeout_ms = Some(ms),
            Step::InjectState { .. } | Step::ClearState { .. } | Step::Screenshot { .. } => {}
        }
        self
    }

    /// Reload after a state step.
    pub fn and_reload(mut self) -> Self {
        if let Step::InjectState { reload, .. } | Step::ClearState { reload, .. } = &mut self {
            *reload = true;
        }
        self
    }

    pub fn pick(mut self, choice: Pick) -> Self {
        match &mut self {
            Step::Click { pick, .. }
            | Step::Fill { pick, .. }
            | Step::AssertVisible { pick, .. }
            | Step::AssertHidden { pick, .. }
            | Step::AssertText { pick, .. }
            | Step::AssertChecked { pick, .. }
            | Step::Wait { pick, .. } => *pick = Some(choice),
            _ => {}
        }
        self
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        let ms = match self {
            Step::Navigate { timeout_ms, .. }
            | Step::Click { timeout_ms, .. }
            | Step::Fill { timeout_ms, .. }
            | Step::Reload { timeout_ms }
            | Step::AssertVisible { timeout_ms, .. }
            | Step::AssertHidden { timeout_ms, .. }
            | Step::AssertText { timeout_ms, .. }
            | Step::AssertChecked { timeout_ms, .. }
            | Step::Wait { timeout_ms, .. } => *timeout_ms,
            Step::InjectState { .. } | Step::ClearState { .. } | Step::Screenshot { .. } => None,
        };
        ms.map(Duration::from_millis)
    }

    /// Short label used in logs and reports
    pub fn name(&self) -> String {
        match self {
            Step::Navigate { url, .. } => format!("navigate:{}", url),
            Step::Click { selector, .. } => format!("click:{}", selector),
            Step::Fill { selector, .. } => format!("fill:{}", selector),
            Step::InjectState { key, reload, .. } => {
                format!("inject_state:{}{}", key, if *reload { "+reload" } else { "" })
            }
            Step::ClearState { key, reload } => {
                format!("clear_state:{}{}", key, if *reload { "+reload" } else { "" })
            }
            Step::Reload { .. } => "reload".to_string(),
            Step::AssertVisible { selector, .. } => format!("assert_visible:{}", selector),
            Step::AssertHidden { selector, .. } => format!("assert_hidden:{}", selector),
            Step::AssertText { selector, .. } => format!("assert_text:{}", selector),
            Step::AssertChecked { selector, .. } => format!("assert_checked:{}", selector),
            Step::Wait {
                selector: Some(selector),
                ..
            } => format!("wait:{}", selector),
            Step::Wait { condition, .. } => {
                let c: String = condition.as_deref().unwrap_or_default().chars().take(30).collect();
                format!("wait:{}", c)
            }
            Step::Screenshot { name } => format!("screenshot:{}", name),
        }
    }

    fn validate(&self, index: usize) -> E2eResult<()> {
        match self {
            Step::Wait { selector, condition, pick, .. } => {
                if selector.is_some() == condition.is_some() {
                    return Err(E2eError::SpecParse(format!(
                        "step {}: wait needs exactly one of selector or condition",
                        index
                    )));
                }
                if condition.is_some() && pick.is_some() {
                    return Err(E2eError::SpecParse(format!(
                        "step {}: pick applies to a wait selector, not a condition",
                        index
                    )));
                }
            }
            Step::AssertVisible { selector, exact: true, .. } if !selector.starts_with("text=") => {
                return Err(E2eError::SpecParse(format!(
                    "step {}: exact only applies to text= selectors, got '{}'",
                    index, selector
                )));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Mock response as written in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseSpec {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub json: Option<serde_json::Value>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_status() -> u16 {
    200
}

impl ResponseSpec {
    pub fn to_response(&self) -> E2eResult<MockResponse> {
        let response = match (&self.json, &self.body) {
            (Some(_), Some(_)) => {
                return Err(E2eError::SpecParse("response has both json and body".into()));
            }
            (Some(json), None) => MockResponse::json(json.clone()).with_status(self.status),
            (None, body) => MockResponse::text(self.status, "text/plain", body.clone().unwrap_or_default()),
        };
        Ok(match &self.content_type {
            Some(ct) => MockResponse {
                content_type: ct.clone(),
                ..response
            },
            None => response,
        })
    }
}

/// Route as written in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default, rename = "match")]
    pub kind: MatchKind,
    pub response: ResponseSpec,
}

fn default_method() -> String {
    "*".to_string()
}

impl RouteSpec {
    pub fn compile(&self) -> E2eResult<(RoutePattern, MockHandler)> {
        let url = UrlMatcher::compile(self.kind, &self.url)?;
        Ok((RoutePattern::new(&self.method, url), MockHandler::Static(self.response.to_response()?)))
    }
}

/// Scenario file layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScenarioFile {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    routes: Vec<RouteSpec>,
    /// Default per-step timeout for this scenario
    #[serde(default)]
    timeout_ms: Option<u64>,
    steps: Vec<Step>,
}

/// A complete, validated scenario
#[derive(Debug, Clone)]
pub struct Scenario {
    name: String,
    description: String,
    tags: Vec<String>,
    routes: Vec<(RoutePattern, MockHandler)>,
    step_timeout: Option<Duration>,
    steps: Vec<Step>,
}

impl Scenario {
    pub fn builder(name: &str) -> ScenarioBuilder {
        ScenarioBuilder {
            scenario: Scenario {
                name: name.to_string(),
                description: String::new(),
                tags: Vec::new(),
                routes: Vec::new(),
                step_timeout: None,
                steps: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout
    }

    /// Register every route in declaration order and freeze the table.
    pub fn router(&self) -> Router {
        let mut builder = RouterBuilder::new();
        for (pattern, handler) in &self.routes {
            builder.register(pattern.clone(), handler.clone());
        }
        builder.freeze()
    }

    /// Parse a scenario from a YAML string
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let file: ScenarioFile = serde_yaml::from_str(yaml)?;
        let mut builder = Scenario::builder(&file.name)
            .description(&file.description)
            .steps(file.steps);
        for tag in &file.tags {
            builder = builder.tag(tag);
        }
        if let Some(ms) = file.timeout_ms {
            builder = builder.step_timeout(Duration::from_millis(ms));
        }
        for route in &file.routes {
            let (pattern, handler) = route.compile()?;
            builder = builder.route(pattern, handler);
        }
        builder.build()
    }

    /// Parse a scenario from a YAML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| E2eError::SpecParse(format!("{}: {}", path.display(), e)))
    }

    /// Load all scenarios under a directory, ordered by path
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        let mut paths: Vec<_> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .collect();
        paths.sort();

        paths.iter().map(|p| Self::from_file(p)).collect()
    }

    /// Filter scenarios by tag
    pub fn filter_by_tag<'a>(scenarios: &'a [Self], tag: &str) -> Vec<&'a Self> {
        scenarios.iter().filter(|s| s.tags.iter().any(|t| t == tag)).collect()
    }

    fn validate(&self) -> E2eResult<()> {
        if self.name.trim().is_empty() {
            return Err(E2eError::SpecParse("scenario name is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(E2eError::SpecParse(format!("scenario '{}' has no steps", self.name)));
        }

        // Checked on the file name, not the raw label
        let mut shots = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            step.validate(i)?;
            if let Step::Screenshot { name } = step {
                let file_name = sanitize(name);
                if file_name == "error" || file_name == "report" {
                    return Err(E2eError::SpecParse(format!(
                        "step {}: screenshot name '{}' is reserved",
                        i, name
                    )));
                }
                if !shots.insert(file_name) {
                    return Err(E2eError::SpecParse(format!(
                        "step {}: screenshot name '{}' collides with an earlier screenshot",
                        i, name
                    )));
                }
            }
        }
        Ok(())
    }
}

pub struct ScenarioBuilder {
    scenario: Scenario,
}

impl ScenarioBuilder {
    pub fn description(mut self, description: &str) -> Self {
        self.scenario.description = description.to_string();
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.scenario.tags.push(tag.to_string());
        self
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.scenario.step_timeout = Some(timeout);
        self
    }

    pub fn route(mut self, pattern: RoutePattern, handler: MockHandler) -> Self {
        self.scenario.routes.push((pattern, handler));
        self
    }

    /// Static JSON response for a glob pattern
    pub fn mock_json(self, method: &str, pattern: &str, value: serde_json::Value) -> E2eResult<Self> {
        let pattern = RoutePattern::glob(method, pattern)?;
        Ok(self.route(pattern, MockHandler::Static(MockResponse::json(value))))
    }

    pub fn step(mut self, step: Step) -> Self {
        self.scenario.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scenario.steps.extend(steps);
        self
    }

    pub fn build(self) -> E2eResult<Scenario> {
        self.scenario.validate()?;
        Ok(self.scenario)
    }
}
