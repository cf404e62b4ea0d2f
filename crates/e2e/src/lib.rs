//! Audio Editor E2E Verification Harness
//!
//! This crate drives a real browser against the TTS audio editor and checks
//! rendered UI state:
//! - Mocks backend endpoints with a frozen, first-match route table
//! - Seeds `localStorage` login/preference state and reloads
//! - Replaces fixed sleeps with deadline-bounded condition polling
//! - Runs declarative YAML scenarios with a single verdict per run
//! - Captures screenshots and a JSON report for every run
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Scenario Runner (Rust)                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ScenarioExecutor                                           │
//! │    ├── scenario.router() -> Router (frozen)                 │
//! │    ├── launcher.launch(router) -> PageLease                 │
//! │    ├── steps, in order:                                     │
//! │    │     ├── navigate / reload / click / fill               │
//! │    │     ├── inject_state / clear_state  (SessionInjector)  │
//! │    │     ├── assert_* / wait             (PollEngine)       │
//! │    │     └── screenshot                  (ArtifactStore)    │
//! │    └── verdict -> RunResult + {scenario}_report.json        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  BrowserControl                                             │
//! │    ├── PlaywrightPage  (node bridge, JSON lines over stdio) │
//! │    └── FakeBrowser     (in-memory, for harness tests)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod artifacts;
pub mod browser;
pub mod config;
pub mod error;
pub mod executor;
pub mod playwright;
pub mod poll;
pub mod probe;
pub mod routes;
pub mod runner;
pub mod session;
pub mod spec;
pub mod testing;

pub use browser::{BrowserControl, PageLauncher, PageLease};
pub use config::HarnessConfig;
pub use error::{E2eError, E2eResult};
pub use executor::{RunContext, RunResult, ScenarioExecutor, Verdict};
pub use poll::{Condition, Locator, PollEngine};
pub use routes::{MockHandler, MockResponse, RoutePattern, Router};
pub use runner::{ScenarioRunner, SuiteResult};
pub use session::SessionInjector;
pub use spec::{Scenario, Step};
