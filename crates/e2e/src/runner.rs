//! Suite runner: runs a set of scenarios one after another

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::browser::PageLauncher;
use crate::error::{E2eError, E2eResult};
use crate::executor::{write_summary, RunContext, RunResult, ScenarioExecutor, Verdict};
use crate::spec::Scenario;

/// A scenario whose run ended in an executor error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteError {
    pub scenario: String,
    pub message: String,
}

/// Result of running all selected scenarios
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub duration_ms: u64,
    pub results: Vec<RunResult>,
    pub errors: Vec<SuiteError>,
}

impl SuiteResult {
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }

    /// 0 passed, 1 failed, 2 timed out, 3 executor error.
    pub fn exit_code(&self) -> i32 {
        if !self.errors.is_empty() {
            3
        } else if self.timed_out > 0 {
            2
        } else if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

pub struct ScenarioRunner {
    executor: ScenarioExecutor,
    ctx: RunContext,
}

impl ScenarioRunner {
    pub fn new(launcher: Arc<dyn PageLauncher>, ctx: RunContext) -> Self {
        Self {
            executor: ScenarioExecutor::new(launcher),
            ctx,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Run scenarios carrying `tag`
    pub async fn run_tagged(&self, scenarios: &[Scenario], tag: &str) -> SuiteResult {
        self.run_all(Scenario::filter_by_tag(scenarios, tag)).await
    }

    /// Run a specific scenario by name
    pub async fn run_named(&self, scenarios: &[Scenario], name: &str) -> E2eResult<RunResult> {
        let scenario = scenarios
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| E2eError::SpecParse(format!("Scenario not found: {}", name)))?;
        self.executor.run(scenario, &self.ctx).await
    }

    pub async fn run_all<'a, I>(&self, scenarios: I) -> SuiteResult
    where
        I: IntoIterator<Item = &'a Scenario>,
    {
        let start = Instant::now();
        let mut suite = SuiteResult::default();

        for scenario in scenarios {
            suite.total += 1;
            match self.executor.run(scenario, &self.ctx).await {
                Ok(result) => {
                    match result.verdict {
                        Verdict::Passed => suite.passed += 1,
                        Verdict::Failed => suite.failed += 1,
                        Verdict::TimedOut => suite.timed_out += 1,
                    }
                    suite.results.push(result);
                }
                Err(e) => {
                    error!("✗ {} - {}", scenario.name(), e);
                    suite.errors.push(SuiteError {
                        scenario: scenario.name().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        suite.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Scenario results: {} passed, {} failed, {} timed out, {} errored ({} ms)",
            suite.passed,
            suite.failed,
            suite.timed_out,
            suite.errors.len(),
            suite.duration_ms
        );
        suite
    }

    /// Write the suite summary next to the run artifacts
    pub fn write_results(&self, results: &SuiteResult) -> E2eResult<PathBuf> {
        write_summary(&self.ctx.artifact_dir, results)
    }
}

/// Load one scenario file or every scenario under a directory.
pub fn load_scenarios(path: &Path) -> E2eResult<Vec<Scenario>> {
    if path.is_dir() {
        Scenario::load_all(path)
    } else {
        Ok(vec![Scenario::from_file(path)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suite(failed: usize, timed_out: usize, errors: usize) -> SuiteResult {
        SuiteResult {
            total: 4,
            passed: 4 - failed - timed_out - errors,
            failed,
            timed_out,
            errors: (0..errors)
                .map(|i| SuiteError {
                    scenario: format!("s{}", i),
                    message: "boom".into(),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn exit_codes_rank_errors_first() {
        assert_eq!(suite(0, 0, 0).exit_code(), 0);
        assert!(suite(0, 0, 0).all_passed());
        assert_eq!(suite(1, 0, 0).exit_code(), 1);
        assert_eq!(suite(1, 1, 0).exit_code(), 2);
        assert_eq!(suite(1, 1, 1).exit_code(), 3);
    }
}
