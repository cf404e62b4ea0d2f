//! Scenario execution
//!
//! One [`ScenarioExecutor::run`] call is one run: it freezes the scenario's
//! routes, acquires a page, executes the steps strictly in order and
//! releases the page exactly once whatever happens. A step error becomes a
//! failed verdict with an error screenshot and the interception log; only
//! [`E2eError::ExecutorInternal`] escapes as an `Err`.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::artifacts::{ArtifactRecord, ArtifactStore};
use crate::browser::{BrowserControl, ElementTarget, PageLauncher, PageLease};
use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::poll::{poll_until, Condition, Locator, Pick, PollEngine};
use crate::routes::{InterceptionRecord, Router};
use crate::session::SessionInjector;
use crate::spec::{Scenario, Step};

/// Settings a run inherits unless a scenario or step overrides them
#[derive(Debug, Clone)]
pub struct RunContext {
    pub base_url: url::Url,
    pub step_timeout: Duration,
    pub poll_interval: Duration,
    pub navigation_timeout: Duration,
    pub scenario_timeout: Duration,
    pub artifact_dir: PathBuf,
}

impl RunContext {
    pub fn from_config(config: &HarnessConfig) -> E2eResult<Self> {
        config.validate()?;
        Ok(Self {
            base_url: config.require_base_url()?,
            step_timeout: config.default_timeout(),
            poll_interval: config.poll_interval(),
            navigation_timeout: config.navigation_timeout(),
            scenario_timeout: config.scenario_timeout(),
            artifact_dir: config.artifact_dir.clone(),
        })
    }

    /// Resolve a step URL against the base URL.
    pub fn resolve(&self, url: &str) -> E2eResult<String> {
        Ok(self.base_url.join(url)?.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
    TimedOut,
}

/// Lifecycle of a run: `Pending -> Running -> {Passed, Failed, TimedOut}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running { step: usize },
    Concluded { verdict: Verdict },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub screenshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailure {
    pub index: usize,
    pub step: String,
    pub kind: String,
    pub message: String,
}

/// Outcome of one run, also written as `{scenario}_report.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub scenario: String,
    pub verdict: Verdict,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub steps: Vec<StepRecord>,
    pub failure: Option<StepFailure>,
    pub interceptions: Vec<InterceptionRecord>,
    pub artifacts: Vec<ArtifactRecord>,
    pub error_screenshot: Option<PathBuf>,
}

impl RunResult {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Passed
    }

    /// Multi-line diagnostic text for terminals
    pub fn diagnostics(&self) -> String {
        let mut out = format!("Scenario '{}': {:?} ({} ms)\n", self.scenario, self.verdict, self.duration_ms);
        if let Some(failure) = &self.failure {
            out.push_str(&format!(
                "  failed at step {} ({}): {}: {}\n",
                failure.index, failure.step, failure.kind, failure.message
            ));
        }
        if let Some(path) = &self.error_screenshot {
            out.push_str(&format!("  error screenshot: {}\n", path.display()));
        }
        if self.interceptions.is_empty() {
            out.push_str("  interception log: (empty)\n");
        } else {
            out.push_str("  interception log:\n");
            for record in &self.interceptions {
                out.push_str(&format!("    {}\n", record));
            }
        }
        out
    }
}

/// Bookkeeping owned by the executor for one run
struct Run {
    state: RunState,
    steps: Vec<StepRecord>,
}

impl Run {
    fn new() -> Self {
        Self {
            state: RunState::Pending,
            steps: Vec::new(),
        }
    }

    fn enter_step(&mut self, index: usize) -> E2eResult<()> {
        match self.state {
            RunState::Pending | RunState::Running { .. } => {
                self.state = RunState::Running { step: index };
                Ok(())
            }
            RunState::Concluded { verdict } => Err(E2eError::ExecutorInternal(format!(
                "step {} started after run concluded as {:?}",
                index, verdict
            ))),
        }
    }

    fn current_step(&self) -> Option<usize> {
        match self.state {
            RunState::Running { step } => Some(step),
            _ => None,
        }
    }

    fn conclude(&mut self, verdict: Verdict) -> E2eResult<()> {
        if let RunState::Concluded { verdict: previous } = self.state {
            return Err(E2eError::ExecutorInternal(format!(
                "run concluded twice ({:?} then {:?})",
                previous, verdict
            )));
        }
        self.state = RunState::Concluded { verdict };
        Ok(())
    }
}

/// How the step loop ended
enum Drive {
    AllPassed,
    StepFailed { index: usize, error: E2eError },
}

pub struct ScenarioExecutor {
    launcher: Arc<dyn PageLauncher>,
}

impl ScenarioExecutor {
    pub fn new(launcher: Arc<dyn PageLauncher>) -> Self {
        Self { launcher }
    }

    /// Execute `scenario` on a freshly launched page.
    pub async fn run(&self, scenario: &Scenario, ctx: &RunContext) -> E2eResult<RunResult> {
        let started_at = Utc::now();
        let start = Instant::now();
        info!("Running scenario: {}", scenario.name());

        // Registration ends here; the page only ever sees the frozen table.
        let router = scenario.router();
        let mut artifacts = ArtifactStore::new(&ctx.artifact_dir, scenario.name())
            .map_err(|e| E2eError::ExecutorInternal(format!("artifact dir: {}", e)))?;

        let page = self
            .launcher
            .launch(router.clone())
            .await
            .map_err(|e| E2eError::ExecutorInternal(format!("launching page: {}", e)))?;
        let mut lease = PageLease::new(page);
        let mut run = Run::new();

        let (driven, timed_out) = {
            let page = lease
                .page()
                .ok_or_else(|| E2eError::ExecutorInternal("page lease empty".into()))?;
            let steps = AssertUnwindSafe(drive(&mut run, scenario, ctx, page, &router, &mut artifacts)).catch_unwind();
            let outcome = tokio::time::timeout(ctx.scenario_timeout, steps).await;
            match outcome {
                Ok(Ok(result)) => (result, false),
                Ok(Err(panic)) => (
                    Err(E2eError::ExecutorInternal(format!(
                        "step loop panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                    false,
                ),
                Err(_) => (
                    Ok(Drive::StepFailed {
                        index: run.current_step().unwrap_or(0),
                        error: E2eError::AssertionTimeout {
                            condition: format!("scenario '{}' to finish", scenario.name()),
                            timeout_ms: ctx.scenario_timeout.as_millis() as u64,
                            last_observed: "scenario deadline exceeded".into(),
                        },
                    }),
                    true,
                ),
            }
        };

        let (verdict, failure) = match driven {
            Ok(Drive::AllPassed) => (Verdict::Passed, None),
            Ok(Drive::StepFailed { index, error }) => {
                let verdict = if timed_out { Verdict::TimedOut } else { Verdict::Failed };
                let step = scenario.steps().get(index).map(Step::name).unwrap_or_default();
                error!("✗ {} - step {} ({}): {}", scenario.name(), index, step, error);
                let failure = StepFailure {
                    index,
                    step,
                    kind: error.kind().to_string(),
                    message: error.to_string(),
                };
                (verdict, Some(failure))
            }
            Err(fatal) => {
                error!("Executor error in '{}': {}", scenario.name(), fatal);
                for record in router.log().snapshot() {
                    error!("  {}", record);
                }
                if let Err(e) = lease.release().await {
                    warn!("Closing page after executor error failed: {}", e);
                }
                return Err(fatal);
            }
        };

        let error_screenshot = match (&failure, lease.page()) {
            (Some(_), Some(page)) => capture_error_screenshot(page, &mut artifacts, ctx).await,
            _ => None,
        };

        let concluded = run.conclude(verdict);
        if let Err(e) = lease.release().await {
            warn!("Closing page for '{}' failed: {}", scenario.name(), e);
        }
        concluded?;

        let duration_ms = start.elapsed().as_millis() as u64;
        if verdict == Verdict::Passed {
            info!("✓ {} ({} ms)", scenario.name(), duration_ms);
        }

        let result = RunResult {
            scenario: scenario.name().to_string(),
            verdict,
            started_at,
            duration_ms,
            steps: run.steps,
            failure,
            interceptions: router.log().snapshot(),
            artifacts: artifacts.records().to_vec(),
            error_screenshot,
        };
        if let Err(e) = artifacts.write_report(&result) {
            warn!("Writing report for '{}' failed: {}", scenario.name(), e);
        }
        Ok(result)
    }
}

async fn capture_error_screenshot(
    page: &dyn BrowserControl,
    artifacts: &mut ArtifactStore,
    ctx: &RunContext,
) -> Option<PathBuf> {
    let path = artifacts.error_screenshot_path();
    let shot = with_deadline(ctx.navigation_timeout, page.screenshot(&path), || {
        E2eError::Bridge("error screenshot timed out".into())
    })
    .await
    .and_then(|_| artifacts.record("error", &path).map(|_| ()));

    match shot {
        Ok(()) => Some(path),
        Err(e) => {
            warn!("Could not capture error screenshot: {}", e);
            None
        }
    }
}

async fn drive(
    run: &mut Run,
    scenario: &Scenario,
    ctx: &RunContext,
    page: &dyn BrowserControl,
    router: &Router,
    artifacts: &mut ArtifactStore,
) -> E2eResult<Drive> {
    let default_timeout = scenario.step_timeout().unwrap_or(ctx.step_timeout);

    for (index, step) in scenario.steps().iter().enumerate() {
        run.enter_step(index)?;
        let name = step.name();
        let timeout = step.timeout_override().unwrap_or(default_timeout);
        let log_cursor = router.log().len();
        let step_start = Instant::now();
        debug!("Step {}: {}", index, name);

        let mut result = execute_step(step, page, ctx, timeout, artifacts).await;
        if result.is_ok() {
            if let Some(failed) = router.log().failures_since(log_cursor).into_iter().next() {
                result = Err(E2eError::InterceptionHandler {
                    method: failed.method.clone(),
                    url: failed.url.clone(),
                    reason: failed.handler_error().unwrap_or_default().to_string(),
                });
            }
        }

        let duration_ms = step_start.elapsed().as_millis() as u64;
        match result {
            Ok(screenshot_path) => run.steps.push(StepRecord {
                index,
                name,
                success: true,
                duration_ms,
                error: None,
                screenshot_path,
            }),
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                run.steps.push(StepRecord {
                    index,
                    name,
                    success: false,
                    duration_ms,
                    error: Some(error.to_string()),
                    screenshot_path: None,
                });
                return Ok(Drive::StepFailed { index, error });
            }
        }
    }
    Ok(Drive::AllPassed)
}

async fn execute_step(
    step: &Step,
    page: &dyn BrowserControl,
    ctx: &RunContext,
    timeout: Duration,
    artifacts: &mut ArtifactStore,
) -> E2eResult<Option<PathBuf>> {
    let engine = PollEngine::new(timeout, ctx.poll_interval);
    let session = SessionInjector::new(page, ctx.navigation_timeout);
    let nav_timeout = step.timeout_override().unwrap_or(ctx.navigation_timeout);

    match step {
        Step::Navigate { url, .. } => {
            let target = ctx.resolve(url)?;
            let nav = page.navigate(&target, nav_timeout);
            with_deadline(nav_timeout, nav, || E2eError::Navigation {
                url: target.clone(),
                reason: format!("no load event within {} ms", nav_timeout.as_millis()),
            })
            .await?;
        }
        Step::Click { selector, pick, .. } => {
            let target = await_actionable(page, selector, *pick, timeout, ctx.poll_interval).await?;
            with_deadline(timeout, page.click(&target, timeout), || E2eError::Interaction {
                selector: selector.clone(),
                reason: format!("click did not complete within {} ms", timeout.as_millis()),
            })
            .await?;
        }
        Step::Fill { selector, value, pick, .. } => {
            let target = await_actionable(page, selector, *pick, timeout, ctx.poll_interval).await?;
            with_deadline(timeout, page.fill(&target, value, timeout), || E2eError::Interaction {
                selector: selector.clone(),
                reason: format!("fill did not complete within {} ms", timeout.as_millis()),
            })
            .await?;
        }
        Step::InjectState { key, value, reload } => {
            if *reload {
                session.inject_and_reload(&[(key.clone(), value.clone())]).await?;
            } else {
                session.inject(key, value).await?;
            }
        }
        Step::ClearState { key, reload } => {
            if *reload {
                session.clear_and_reload(std::slice::from_ref(key)).await?;
            } else {
                session.clear(key).await?;
            }
        }
        Step::Reload { .. } => {
            with_deadline(nav_timeout, page.reload(nav_timeout), || E2eError::Navigation {
                url: "(reload)".into(),
                reason: format!("no load event within {} ms", nav_timeout.as_millis()),
            })
            .await?;
        }
        Step::AssertVisible { selector, pick, exact, .. } => {
            let mut locator = Locator::new(selector.as_str()).with_pick(*pick);
            if *exact {
                locator = locator.exact_text();
            }
            engine.wait_for(page, &Condition::Visible(locator), None).await?;
        }
        Step::AssertHidden { selector, pick, .. } => {
            let locator = Locator::new(selector.as_str()).with_pick(*pick);
            engine.wait_for(page, &Condition::Hidden(locator), None).await?;
        }
        Step::AssertText {
            selector,
            text,
            contains,
            pick,
            ..
        } => {
            let locator = Locator::new(selector.as_str()).with_pick(*pick);
            let condition = if *contains {
                Condition::TextContains(locator, text.clone())
            } else {
                Condition::TextEquals(locator, text.clone())
            };
            engine.wait_for(page, &condition, None).await?;
        }
        Step::AssertChecked { selector, checked, pick, .. } => {
            let locator = Locator::new(selector.as_str()).with_pick(*pick);
            engine.wait_for(page, &Condition::Checked(locator, *checked), None).await?;
        }
        Step::Wait {
            selector, condition, pick, ..
        } => {
            let condition = match (selector, condition) {
                (Some(selector), _) => Condition::Visible(Locator::new(selector.as_str()).with_pick(*pick)),
                (None, Some(expr)) => Condition::Script(expr.clone()),
                (None, None) => {
                    return Err(E2eError::ExecutorInternal("wait step without target passed validation".into()))
                }
            };
            engine.wait_for(page, &condition, None).await?;
        }
        Step::Screenshot { name } => {
            let path = artifacts.screenshot_path(name);
            let shot = page.screenshot(&path);
            with_deadline(timeout, shot, || E2eError::Bridge(format!("screenshot '{}' timed out", name))).await?;
            artifacts.record(name, &path)?;
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Poll until the target is visible and enabled; a timeout here is an
/// interaction error rather than an assertion failure.
async fn await_actionable(
    page: &dyn BrowserControl,
    selector: &str,
    pick: Option<Pick>,
    timeout: Duration,
    interval: Duration,
) -> E2eResult<ElementTarget> {
    let condition = Condition::Actionable(Locator::new(selector).with_pick(pick));
    let description = condition.to_string();
    let outcome = poll_until(&description, timeout, interval, || condition.observe(page))
        .await
        .map_err(|e| match e {
            E2eError::AssertionTimeout { last_observed, .. } => E2eError::Interaction {
                selector: selector.to_string(),
                reason: format!("not visible and enabled within {} ms ({})", timeout.as_millis(), last_observed),
            },
            other => other,
        })?;

    Ok(ElementTarget {
        selector: selector.to_string(),
        index: outcome.observation.index.unwrap_or(0),
    })
}

/// Bound a browser primitive by a deadline, with a small grace period so
/// the backend's own timeout error wins when it has one.
async fn with_deadline<T, F, E>(deadline: Duration, fut: F, on_timeout: E) -> E2eResult<T>
where
    F: Future<Output = E2eResult<T>>,
    E: FnOnce() -> E2eError,
{
    match tokio::time::timeout(deadline + Duration::from_millis(500), fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Write a suite summary file.
pub fn write_summary<T: Serialize>(dir: &Path, summary: &T) -> E2eResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("results.json");
    std::fs::write(&path, serde_json::to_string_pretty(summary)?)?;
    info!("Results written to: {}", path.display());
    Ok(path)
}
