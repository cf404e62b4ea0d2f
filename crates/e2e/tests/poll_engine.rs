//! Poll engine against a live (in-memory) page

mod common;

use std::time::Duration;

use audio_editor_e2e::browser::{BrowserControl, ElementTarget};
use audio_editor_e2e::poll::{Condition, Locator, PollEngine};
use audio_editor_e2e::routes::Router;
use audio_editor_e2e::testing::{FakeBrowser, FakeElement, FakeSite};
use audio_editor_e2e::E2eError;

fn corpus_site() -> FakeSite {
    FakeSite::new()
        .page("/", |page| {
            page.dom.add(FakeElement::new(".corpus", "Corpus 1"));
            page.dom.add(FakeElement::new(".corpus", "Corpus 12"));
            page.dom.add(FakeElement::new(".corpus", "Corpus 2").hidden());
            page.dom.add(FakeElement::new("#select-current", "追选当前"));
        })
        .on_click("#select-current", Duration::from_millis(750), |page| {
            page.dom.add(FakeElement::new("#selection-count", "已选择 1 个语料"));
        })
        .on_expression("window.__loaded === true", |dom, _| {
            serde_json::json!(!dom.matching(".corpus").is_empty())
        })
}

async fn open(site: FakeSite) -> FakeBrowser {
    let page = FakeBrowser::new(site, Router::empty());
    page.navigate(common::BASE_URL, Duration::from_secs(1)).await.unwrap();
    page
}

#[tokio::test(start_paused = true)]
async fn ambiguous_selector_fails_without_retrying() {
    let page = open(corpus_site()).await;
    let engine = PollEngine::new(Duration::from_secs(5), Duration::from_millis(100));

    let start = tokio::time::Instant::now();
    let err = engine
        .wait_for(&page, &Condition::visible("text=Corpus 1"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, E2eError::AmbiguousSelector { count: 2, .. }));
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn exact_text_and_explicit_pick_disambiguate() {
    let page = open(corpus_site()).await;
    let engine = PollEngine::default();

    let exact = Condition::Visible(Locator::new("text=Corpus 1").exact_text());
    let outcome = engine.wait_for(&page, &exact, None).await.unwrap();
    assert_eq!(outcome.attempts, 1);

    let last = Condition::TextEquals(Locator::new(".corpus").last(), "Corpus 2".into());
    engine.wait_for(&page, &last, None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn hidden_covers_invisible_and_absent_elements() {
    let page = open(corpus_site()).await;
    let engine = PollEngine::default();

    engine
        .wait_for(&page, &Condition::Hidden(Locator::new("text=Corpus 2").exact_text()), None)
        .await
        .unwrap();
    engine
        .wait_for(&page, &Condition::hidden("#not-rendered"), None)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn waits_for_late_content() {
    let page = open(corpus_site()).await;
    page.click(
        &ElementTarget {
            selector: "#select-current".into(),
            index: 0,
        },
        Duration::from_secs(1),
    )
    .await
    .unwrap();

    let engine = PollEngine::new(Duration::from_secs(2), Duration::from_millis(100));
    let outcome = engine
        .wait_for(&page, &Condition::text_contains("#selection-count", "已选择 1"), None)
        .await
        .unwrap();

    assert!(outcome.attempts > 1);
    assert!(outcome.elapsed >= Duration::from_millis(750));
}

#[tokio::test(start_paused = true)]
async fn late_content_past_the_deadline_times_out() {
    let page = open(corpus_site()).await;
    page.click(
        &ElementTarget {
            selector: "#select-current".into(),
            index: 0,
        },
        Duration::from_secs(1),
    )
    .await
    .unwrap();

    let engine = PollEngine::new(Duration::from_millis(500), Duration::from_millis(100));
    let err = engine
        .wait_for(&page, &Condition::visible("#selection-count"), None)
        .await
        .unwrap_err();

    match err {
        E2eError::AssertionTimeout {
            timeout_ms,
            last_observed,
            ..
        } => {
            assert_eq!(timeout_ms, 500);
            assert!(last_observed.contains("0 matching"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn script_conditions_poll_for_truthiness() {
    let page = open(corpus_site()).await;
    PollEngine::default()
        .wait_for(&page, &Condition::Script("window.__loaded === true".into()), None)
        .await
        .unwrap();
}
