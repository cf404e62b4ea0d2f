//! Deadline-and-interval polling of page state
//!
//! A condition is evaluated immediately, then every `interval` until it
//! holds or the deadline passes. The final attempt lands exactly on the
//! deadline, so a condition that becomes true at `timeout` still succeeds
//! no matter how coarse the interval is.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::browser::{BrowserControl, ElementSnapshot, PageScript};
use crate::error::{E2eError, E2eResult};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Explicit choice among several matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PickRepr", into = "PickRepr")]
pub enum Pick {
    First,
    Last,
    Nth(usize),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum PickRepr {
    Index(usize),
    Name(String),
}

impl TryFrom<PickRepr> for Pick {
    type Error = String;

    fn try_from(repr: PickRepr) -> Result<Self, String> {
        match repr {
            PickRepr::Index(i) => Ok(Pick::Nth(i)),
            PickRepr::Name(name) => match name.as_str() {
                "first" => Ok(Pick::First),
                "last" => Ok(Pick::Last),
                other => other
                    .parse()
                    .map(Pick::Nth)
                    .map_err(|_| format!("pick must be first, last or an index, got '{}'", other)),
            },
        }
    }
}

impl From<Pick> for PickRepr {
    fn from(pick: Pick) -> Self {
        match pick {
            Pick::First => PickRepr::Name("first".into()),
            Pick::Last => PickRepr::Name("last".into()),
            Pick::Nth(i) => PickRepr::Index(i),
        }
    }
}

/// A selector plus an optional disambiguation choice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub selector: String,
    pub pick: Option<Pick>,
}

impl Locator {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            pick: None,
        }
    }

    pub fn with_pick(mut self, pick: Option<Pick>) -> Self {
        self.pick = pick;
        self
    }

    pub fn first(self) -> Self {
        self.with_pick(Some(Pick::First))
    }

    pub fn last(self) -> Self {
        self.with_pick(Some(Pick::Last))
    }

    pub fn nth(self, index: usize) -> Self {
        self.with_pick(Some(Pick::Nth(index)))
    }

    /// `text=Foo` becomes the exact-match form `text="Foo"`.
    pub fn exact_text(mut self) -> Self {
        if let Some(text) = self.selector.strip_prefix("text=") {
            if !text.starts_with('"') {
                self.selector = format!("text=\"{}\"", text);
            }
        }
        self
    }

    /// Pick one element out of `matches`.
    ///
    /// More than one match without a pick is an error, never an implicit
    /// choice of the first element.
    pub fn resolve<'a>(&self, matches: &'a [ElementSnapshot]) -> E2eResult<Option<(usize, &'a ElementSnapshot)>> {
        let index = match (self.pick, matches.len()) {
            (_, 0) => return Ok(None),
            (None, 1) => 0,
            (None, count) => {
                return Err(E2eError::AmbiguousSelector {
                    selector: self.selector.clone(),
                    count,
                })
            }
            (Some(Pick::First), _) => 0,
            (Some(Pick::Last), n) => n - 1,
            (Some(Pick::Nth(i)), _) => i,
        };
        Ok(matches.get(index).map(|el| (index, el)))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.selector)?;
        match self.pick {
            Some(Pick::First) => f.write_str(" >> first"),
            Some(Pick::Last) => f.write_str(" >> last"),
            Some(Pick::Nth(i)) => write!(f, " >> nth={}", i),
            None => Ok(()),
        }
    }
}

/// Built-in conditions over page state
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Visible(Locator),
    /// Absent elements count as hidden
    Hidden(Locator),
    TextEquals(Locator, String),
    TextContains(Locator, String),
    Checked(Locator, bool),
    /// Visible and enabled, the precondition for click and fill
    Actionable(Locator),
    /// Script expression polled for truthiness
    Script(String),
}

/// Result of evaluating a condition once
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub satisfied: bool,
    /// Index of the element the condition looked at
    pub index: Option<usize>,
    pub detail: String,
}

impl Observation {
    fn of(satisfied: bool, index: Option<usize>, detail: impl Into<String>) -> Self {
        Self {
            satisfied,
            index,
            detail: detail.into(),
        }
    }
}

impl Condition {
    pub fn visible(selector: &str) -> Self {
        Condition::Visible(Locator::new(selector))
    }

    pub fn hidden(selector: &str) -> Self {
        Condition::Hidden(Locator::new(selector))
    }

    pub fn text_equals(selector: &str, text: &str) -> Self {
        Condition::TextEquals(Locator::new(selector), text.to_string())
    }

    pub fn text_contains(selector: &str, text: &str) -> Self {
        Condition::TextContains(Locator::new(selector), text.to_string())
    }

    pub fn checked(selector: &str) -> Self {
        Condition::Checked(Locator::new(selector), true)
    }

    fn locator(&self) -> Option<&Locator> {
        match self {
            Condition::Visible(l)
            | Condition::Hidden(l)
            | Condition::TextEquals(l, _)
            | Condition::TextContains(l, _)
            | Condition::Checked(l, _)
            | Condition::Actionable(l) => Some(l),
            Condition::Script(_) => None,
        }
    }

    /// Evaluate once against the current page state.
    pub async fn observe(&self, page: &dyn BrowserControl) -> E2eResult<Observation> {
        let Some(locator) = self.locator() else {
            let Condition::Script(expr) = self else {
                unreachable!("only script conditions lack a locator")
            };
            let value = page.evaluate(&PageScript::Expression(expr.clone())).await?;
            return Ok(Observation::of(is_truthy(&value), None, format!("evaluated to {}", value)));
        };

        let matches = page.inspect(&locator.selector).await?;
        let resolved = locator.resolve(&matches)?;
        let Some((index, el)) = resolved else {
            let satisfied = matches!(self, Condition::Hidden(_));
            return Ok(Observation::of(satisfied, None, format!("{} matching element(s), none selected", matches.len())));
        };

        let satisfied = match self {
            Condition::Visible(_) => el.visible,
            Condition::Hidden(_) => !el.visible,
            Condition::TextEquals(_, text) => normalize_ws(&el.text) == normalize_ws(text),
            Condition::TextContains(_, text) => normalize_ws(&el.text).contains(&normalize_ws(text)),
            Condition::Checked(_, expected) => el.checked == Some(*expected),
            Condition::Actionable(_) => el.visible && el.enabled,
            Condition::Script(_) => unreachable!(),
        };
        Ok(Observation::of(satisfied, Some(index), describe(index, matches.len(), el)))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Visible(l) => write!(f, "visible({})", l),
            Condition::Hidden(l) => write!(f, "hidden({})", l),
            Condition::TextEquals(l, t) => write!(f, "textEquals({}, {:?})", l, t),
            Condition::TextContains(l, t) => write!(f, "textContains({}, {:?})", l, t),
            Condition::Checked(l, true) => write!(f, "checked({})", l),
            Condition::Checked(l, false) => write!(f, "unchecked({})", l),
            Condition::Actionable(l) => write!(f, "actionable({})", l),
            Condition::Script(e) => write!(f, "script({})", e),
        }
    }
}

fn describe(index: usize, count: usize, el: &ElementSnapshot) -> String {
    format!(
        "element {} of {}: visible={} enabled={} checked={:?} text={:?}",
        index + 1,
        count,
        el.visible,
        el.enabled,
        el.checked,
        el.text
    )
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// How a successful poll went
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub attempts: u32,
    pub elapsed: Duration,
    pub observation: Observation,
}

/// Evaluate `probe` until it reports satisfied or `timeout` elapses.
///
/// Errors from the probe end the poll immediately; only an unsatisfied
/// observation is retried.
pub async fn poll_until<F, Fut>(
    description: &str,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> E2eResult<PollOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = E2eResult<Observation>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let observation = probe().await?;
        if observation.satisfied {
            debug!("{} satisfied after {} attempt(s)", description, attempts);
            return Ok(PollOutcome {
                attempts,
                elapsed: start.elapsed(),
                observation,
            });
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(E2eError::AssertionTimeout {
                condition: description.to_string(),
                timeout_ms: timeout.as_millis() as u64,
                last_observed: observation.detail,
            });
        }
        sleep_until((now + interval).min(deadline)).await;
    }
}

/// Polls built-in conditions against a page
#[derive(Debug, Clone, Copy)]
pub struct PollEngine {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for PollEngine {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl PollEngine {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Wait for `condition`, with an optional per-call timeout.
    pub async fn wait_for(
        &self,
        page: &dyn BrowserControl,
        condition: &Condition,
        timeout: Option<Duration>,
    ) -> E2eResult<PollOutcome> {
        let description = condition.to_string();
        poll_until(&description, timeout.unwrap_or(self.timeout), self.interval, || {
            condition.observe(page)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn el(visible: bool, text: &str) -> ElementSnapshot {
        ElementSnapshot {
            visible,
            enabled: true,
            checked: None,
            text: text.to_string(),
        }
    }

    #[test]
    fn resolve_refuses_to_guess() {
        let matches = vec![el(true, "a"), el(false, "b")];
        let err = Locator::new(".item").resolve(&matches).unwrap_err();
        assert!(matches!(err, E2eError::AmbiguousSelector { count: 2, .. }));

        let (i, chosen) = Locator::new(".item").last().resolve(&matches).unwrap().unwrap();
        assert_eq!(i, 1);
        assert_eq!(chosen.text, "b");
        assert!(Locator::new(".item").nth(5).resolve(&matches).unwrap().is_none());
    }

    #[test]
    fn single_match_needs_no_pick() {
        let matches = vec![el(true, "only")];
        assert_eq!(Locator::new("#x").resolve(&matches).unwrap().unwrap().0, 0);
        assert!(Locator::new("#x").resolve(&[]).unwrap().is_none());
    }

    #[test]
    fn exact_text_quotes_text_selectors_only() {
        assert_eq!(Locator::new("text=Test Script").exact_text().selector, "text=\"Test Script\"");
        assert_eq!(Locator::new("#import").exact_text().selector, "#import");
    }

    #[test]
    fn pick_parses_names_and_indexes() {
        let first: Pick = serde_yaml::from_str("first").unwrap();
        let nth: Pick = serde_yaml::from_str("2").unwrap();
        assert_eq!(first, Pick::First);
        assert_eq!(nth, Pick::Nth(2));
        assert!(serde_yaml::from_str::<Pick>("middle").is_err());
    }

    fn observation(satisfied: bool) -> E2eResult<Observation> {
        Ok(Observation::of(satisfied, None, if satisfied { "yes" } else { "not yet" }))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_as_soon_as_condition_holds() {
        let calls = Cell::new(0);
        let outcome = poll_until("third try", Duration::from_secs(5), Duration::from_millis(100), || {
            calls.set(calls.get() + 1);
            let ready = calls.get() >= 3;
            async move { observation(ready) }
        })
        .await
        .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.elapsed, Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn true_exactly_at_deadline_counts() {
        let start = Instant::now();
        let outcome = poll_until("at deadline", Duration::from_millis(300), Duration::from_millis(100), || {
            let ready = start.elapsed() >= Duration::from_millis(300);
            async move { observation(ready) }
        })
        .await
        .unwrap();
        assert_eq!(outcome.elapsed, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn coarse_interval_still_checks_at_deadline() {
        let start = Instant::now();
        let outcome = poll_until("coarse", Duration::from_millis(250), Duration::from_secs(10), || {
            let ready = start.elapsed() >= Duration::from_millis(250);
            async move { observation(ready) }
        })
        .await
        .unwrap();
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn never_true_times_out_with_last_observation() {
        let err = poll_until("never", Duration::from_millis(500), Duration::from_millis(100), || async {
            observation(false)
        })
        .await
        .unwrap_err();

        match err {
            E2eError::AssertionTimeout {
                condition,
                timeout_ms,
                last_observed,
            } => {
                assert_eq!(condition, "never");
                assert_eq!(timeout_ms, 500);
                assert_eq!(last_observed, "not yet");
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_are_not_retried() {
        let calls = Cell::new(0);
        let err = poll_until("ambiguous", Duration::from_secs(1), Duration::from_millis(100), || {
            calls.set(calls.get() + 1);
            async {
                Err(E2eError::AmbiguousSelector {
                    selector: ".row".into(),
                    count: 2,
                })
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, E2eError::AmbiguousSelector { .. }));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn truthiness_follows_js() {
        assert!(!is_truthy(&serde_json::json!(null)));
        assert!(!is_truthy(&serde_json::json!(0)));
        assert!(!is_truthy(&serde_json::json!("")));
        assert!(is_truthy(&serde_json::json!("x")));
        assert!(is_truthy(&serde_json::json!({})));
    }
}
