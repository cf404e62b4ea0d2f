//! Harness configuration
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `E2E_*` environment variables. The CLI applies its own flags last.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{E2eError, E2eResult};

/// Browser engine to launch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl std::str::FromStr for Browser {
    type Err = E2eError;

    fn from_str(s: &str) -> E2eResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" => Ok(Browser::Webkit),
            other => Err(E2eError::Config(format!("unknown browser '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Configuration shared by every run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Base URL of the application under test
    pub base_url: Option<String>,

    /// Per-step timeout unless a step overrides it
    pub default_timeout_ms: u64,

    /// Interval between poll attempts
    pub poll_interval_ms: u64,

    /// Deadline for a single navigation or reload
    pub navigation_timeout_ms: u64,

    /// Deadline for a whole scenario
    pub scenario_timeout_ms: u64,

    /// Where screenshots and reports are written
    pub artifact_dir: PathBuf,

    pub browser: Browser,

    pub headless: bool,

    pub viewport: Viewport,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            default_timeout_ms: 5000,
            poll_interval_ms: 100,
            navigation_timeout_ms: 30_000,
            scenario_timeout_ms: 120_000,
            artifact_dir: PathBuf::from("test-results/artifacts"),
            browser: Browser::Chromium,
            headless: true,
            viewport: Viewport::default(),
        }
    }
}

impl HarnessConfig {
    /// Load defaults, overlay the TOML file (if given) and the environment.
    pub fn load(path: Option<&Path>) -> E2eResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> E2eResult<Self> {
        toml::from_str(content).map_err(|e| E2eError::Config(e.to_string()))
    }

    /// Apply `E2E_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> E2eResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("E2E_BASE_URL") {
            self.base_url = Some(url);
        }
        if let Some(ms) = lookup("E2E_DEFAULT_TIMEOUT_MS") {
            self.default_timeout_ms = parse_ms("E2E_DEFAULT_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("E2E_POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_ms("E2E_POLL_INTERVAL_MS", &ms)?;
        }
        if let Some(dir) = lookup("E2E_ARTIFACT_DIR") {
            self.artifact_dir = PathBuf::from(dir);
        }
        if let Some(browser) = lookup("E2E_BROWSER") {
            self.browser = browser.parse()?;
        }
        if let Some(headless) = lookup("E2E_HEADLESS") {
            self.headless = !matches!(headless.as_str(), "0" | "false" | "no");
        }
        Ok(())
    }

    pub fn validate(&self) -> E2eResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(E2eError::Config("poll_interval_ms must be positive".into()));
        }
        if self.poll_interval_ms > self.default_timeout_ms {
            return Err(E2eError::Config(format!(
                "poll_interval_ms ({}) exceeds default_timeout_ms ({})",
                self.poll_interval_ms, self.default_timeout_ms
            )));
        }
        if let Some(base) = &self.base_url {
            url::Url::parse(base)
                .map_err(|e| E2eError::Config(format!("invalid base_url '{}': {}", base, e)))?;
        }
        Ok(())
    }

    /// The configured base URL, or a configuration error.
    pub fn require_base_url(&self) -> E2eResult<url::Url> {
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| E2eError::Config("base URL not configured (set E2E_BASE_URL or --base-url)".into()))?;
        Ok(url::Url::parse(base)?)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn scenario_timeout(&self) -> Duration {
        Duration::from_millis(self.scenario_timeout_ms)
    }
}

fn parse_ms(key: &str, value: &str) -> E2eResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| E2eError::Config(format!("{} must be a number of milliseconds, got '{}'", key, value)))
}
