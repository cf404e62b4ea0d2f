//! End-to-end runs of scenarios against the in-memory editor

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use audio_editor_e2e::poll::Pick;
use audio_editor_e2e::routes::{InterceptionOutcome, MockHandler, MockResponse, RoutePattern};
use audio_editor_e2e::testing::{FakeLauncher, FakeSite};
use audio_editor_e2e::{E2eError, Scenario, ScenarioExecutor, Step, Verdict};

fn scripts_body() -> serde_json::Value {
    json!({
        "code": "2000",
        "data": [{ "id": "s1", "scriptName": "Test Script", "primaryIndustry": "Test" }]
    })
}

fn import_steps() -> Vec<Step> {
    vec![
        Step::navigate("/"),
        Step::click("#import"),
        Step::assert_visible("text=Test Script"),
    ]
}

fn executor(site: FakeSite) -> (ScenarioExecutor, Arc<audio_editor_e2e::testing::FakeStats>) {
    let launcher = FakeLauncher::new(site);
    let stats = launcher.stats();
    (ScenarioExecutor::new(Arc::new(launcher)), stats)
}

#[tokio::test(start_paused = true)]
async fn mocked_script_list_passes() {
    let dir = tempfile::tempdir().unwrap();
    let scenario = Scenario::builder("import-mocked")
        .mock_json("GET", "/api/scripts", scripts_body())
        .unwrap()
        .steps(import_steps())
        .build()
        .unwrap();

    let (executor, stats) = executor(common::audio_editor());
    let result = executor.run(&scenario, &common::context(dir.path())).await.unwrap();

    assert_eq!(result.verdict, Verdict::Passed, "{}", result.diagnostics());
    assert!(result.failure.is_none());
    assert!(result.error_screenshot.is_none());
    assert_eq!(result.steps.len(), 3);
    assert_eq!(result.interceptions.len(), 1);
    assert_eq!(
        result.interceptions[0].outcome,
        InterceptionOutcome::Mocked { route: 0, status: 200 }
    );
    assert_eq!(stats.launches(), 1);
    assert_eq!(stats.closes(), 1);
    assert!(dir.path().join("import-mocked_report.json").exists());
}

#[tokio::test(start_paused = true)]
async fn unmocked_script_list_fails_with_pass_through_log() {
    let dir = tempfile::tempdir().unwrap();
    let scenario = Scenario::builder("import-unmocked")
        .steps(import_steps())
        .step(Step::screenshot("never_taken"))
        .build()
        .unwrap();

    let (executor, stats) = executor(common::audio_editor());
    let result = executor.run(&scenario, &common::context(dir.path())).await.unwrap();

    assert_eq!(result.verdict, Verdict::Failed);
    let failure = result.failure.as_ref().unwrap();
    assert_eq!(failure.index, 2);
    assert_eq!(failure.kind, "AssertionTimeoutError");
    assert!(failure.message.contains("Test Script"));

    // Halted at the failing step
    assert_eq!(result.steps.len(), 3);
    assert!(!result.steps[2].success);

    let record = &result.interceptions[0];
    assert!(record.url.ends_with("/api/scripts"));
    assert_eq!(
        record.outcome,
        InterceptionOutcome::PassThrough {
            status: Some(404),
            content_type: Some("text/html".into()),
        }
    );
    assert!(result.diagnostics().contains("pass-through 404 text/html"));

    let shot = result.error_screenshot.as_ref().unwrap();
    assert!(shot.exists());
    assert_eq!(shot, &dir.path().join("import-unmocked_error.png"));
    assert!(!dir.path().join("import-unmocked_never_taken.png").exists());
    assert_eq!(stats.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn poll_absorbs_response_latency_up_to_the_step_timeout() {
    // The list renders 1.5 s after the click returns; no sleep needed.
    let slow = Duration::from_millis(1500);
    let scenario = |name: &str, assert_timeout: u64| {
        Scenario::builder(name)
            .mock_json("GET", "**/api/scripts", scripts_body())
            .unwrap()
            .steps([
                Step::navigate("/"),
                Step::click("#import"),
                Step::assert_visible("text=Test Script").timeout(assert_timeout),
            ])
            .build()
            .unwrap()
    };

    let dir = tempfile::tempdir().unwrap();
    let (executor, _) = executor(common::audio_editor_with_import_latency(slow));
    let result = executor
        .run(&scenario("slow-import", 2000), &common::context(dir.path()))
        .await
        .unwrap();
    assert!(result.passed(), "{}", result.diagnostics());

    let result = executor
        .run(&scenario("slow-import-short-timeout", 1000), &common::context(dir.path()))
        .await
        .unwrap();
    assert_eq!(result.verdict, Verdict::Failed);
    let failure = result.failure.unwrap();
    assert_eq!(failure.index, 2);
    assert_eq!(failure.kind, "AssertionTimeoutError");
}

#[tokio::test(start_paused = true)]
async fn injected_login_renders_user_menu_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    let scenario = Scenario::builder("login")
        .steps([
            Step::navigate("/"),
            Step::assert_visible(r#"button[aria-label="login"]"#),
            Step::inject_state("audioEditor_user", r#"{"account":"TestUser"}"#),
            Step::inject_state("audioEditor_token", "fake-token").and_reload(),
            Step::assert_visible(r#"button[aria-label="user-menu"]"#),
            Step::click(r#"button[aria-label="user-menu"]"#),
            Step::assert_text(".menu-item", "TestUser"),
            Step::screenshot("logged_in"),
        ])
        .build()
        .unwrap();

    let (executor, stats) = executor(common::audio_editor());
    let result = executor.run(&scenario, &common::context(dir.path())).await.unwrap();

    assert!(result.passed(), "{}", result.diagnostics());
    assert_eq!(result.artifacts.len(), 1);
    assert_eq!(result.artifacts[0].path, dir.path().join("login_logged_in.png"));
    assert_eq!(result.steps[7].screenshot_path.as_ref(), Some(&result.artifacts[0].path));
    // navigate + reload
    assert_eq!(stats.loads(), 2);
}

#[tokio::test(start_paused = true)]
async fn injected_login_without_reload_is_not_observed() {
    let dir = tempfile::tempdir().unwrap();
    let scenario = Scenario::builder("login-no-reload")
        .steps([
            Step::navigate("/"),
            Step::inject_state("audioEditor_user", r#"{"account":"TestUser"}"#),
            Step::inject_state("audioEditor_token", "fake-token"),
            Step::assert_visible(r#"button[aria-label="user-menu"]"#).timeout(500),
        ])
        .build()
        .unwrap();

    let (executor, _) = executor(common::audio_editor());
    let result = executor.run(&scenario, &common::context(dir.path())).await.unwrap();

    assert_eq!(result.verdict, Verdict::Failed);
    assert_eq!(result.failure.unwrap().index, 3);
}

#[tokio::test(start_paused = true)]
async fn cleared_marker_shows_update_dialog() {
    let dir = tempfile::tempdir().unwrap();
    let scenario = Scenario::builder("update-dialog")
        .steps([
            Step::navigate("/tts-editor"),
            Step::inject_state("update_acknowledged_version", "1.4.0").and_reload(),
            Step::assert_hidden("text=系统更新说明"),
            Step::clear_state("update_acknowledged_version").and_reload(),
            Step::assert_visible("text=系统更新说明"),
            Step::assert_visible("text=新增了更新提示功能"),
            Step::assert_checked("#dont-show-again", true),
            Step::click("#update-confirm"),
            Step::assert_hidden("#update-title"),
        ])
        .build()
        .unwrap();

    let (executor, _) = executor(common::audio_editor());
    let result = executor.run(&scenario, &common::context(dir.path())).await.unwrap();
    assert!(result.passed(), "{}", result.diagnostics());
}

#[tokio::test(start_paused = true)]
async fn failing_handler_fails_the_triggering_step() {
    let dir = tempfile::tempdir().unwrap();
    let scenario = Scenario::builder("handler-failure")
        .route(
            RoutePattern::glob("GET", "/api/scripts").unwrap(),
            MockHandler::dynamic(|_| Err("fixture file missing".into())),
        )
        .steps(import_steps())
        .build()
        .unwrap();

    let (executor, stats) = executor(common::audio_editor_instant_import());
    let result = executor.run(&scenario, &common::context(dir.path())).await.unwrap();

    assert_eq!(result.verdict, Verdict::Failed);
    let failure = result.failure.as_ref().unwrap();
    assert_eq!(failure.index, 1);
    assert_eq!(failure.kind, "InterceptionHandlerError");
    assert!(failure.message.contains("fixture file missing"));
    assert!(matches!(
        result.interceptions[0].outcome,
        InterceptionOutcome::HandlerFailed { route: 0, .. }
    ));
    assert!(result.error_screenshot.is_some());
    assert_eq!(stats.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_serves_500_and_fails_step() {
    let dir = tempfile::tempdir().unwrap();
    let scenario = Scenario::builder("handler-panic")
        .route(
            RoutePattern::glob("*", "/api/scripts").unwrap(),
            MockHandler::dynamic(|_| -> Result<MockResponse, _> { panic!("bad fixture") }),
        )
        .steps(import_steps())
        .build()
        .unwrap();

    let (executor, _) = executor(common::audio_editor_instant_import());
    let result = executor.run(&scenario, &common::context(dir.path())).await.unwrap();

    assert_eq!(result.failure.unwrap().kind, "InterceptionHandlerError");
    assert_eq!(result.interceptions[0].handler_error(), Some("bad fixture"));
}

#[tokio::test(start_paused = true)]
async fn scenario_deadline_yields_timed_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = common::context(dir.path());
    ctx.scenario_timeout = Duration::from_secs(1);

    let scenario = Scenario::builder("deadline")
        .steps([Step::navigate("/"), Step::assert_visible("#never").timeout(10_000)])
        .build()
        .unwrap();

    let (executor, stats) = executor(common::audio_editor());
    let result = executor.run(&scenario, &ctx).await.unwrap();

    assert_eq!(result.verdict, Verdict::TimedOut);
    assert_eq!(result.failure.unwrap().index, 1);
    assert!(result.error_screenshot.is_some());
    assert_eq!(stats.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn internal_error_still_releases_page() {
    let dir = tempfile::tempdir().unwrap();
    let site = FakeSite::new()
        .page("/", |page| {
            page.dom.add(audio_editor_e2e::testing::FakeElement::new("#boom", "Boom"));
        })
        .on_click("#boom", Duration::ZERO, |_| panic!("renderer crashed"));
    let scenario = Scenario::builder("internal")
        .steps([Step::navigate("/"), Step::click("#boom"), Step::assert_visible("#never")])
        .build()
        .unwrap();

    let (executor, stats) = executor(site);
    let err = executor.run(&scenario, &common::context(dir.path())).await.unwrap_err();

    assert!(matches!(err, E2eError::ExecutorInternal(ref msg) if msg.contains("renderer crashed")));
    assert_eq!(stats.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn ambiguous_click_target_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let scenario = Scenario::builder("ambiguous")
        .mock_json(
            "GET",
            "/api/scripts",
            json!({ "data": [{ "scriptName": "Script A" }, { "scriptName": "Script B" }] }),
        )
        .unwrap()
        .steps([
            Step::navigate("/"),
            Step::click("#import"),
            Step::click(".script-item"),
        ])
        .build()
        .unwrap();

    let (executor, _) = executor(common::audio_editor_instant_import());
    let result = executor.run(&scenario, &common::context(dir.path())).await.unwrap();

    let failure = result.failure.unwrap();
    assert_eq!(failure.index, 2);
    assert_eq!(failure.kind, "AmbiguousSelectorError");
}

#[tokio::test(start_paused = true)]
async fn every_run_gets_a_fresh_router() {
    let dir = tempfile::tempdir().unwrap();
    let scenario = Scenario::builder("rerun")
        .mock_json("GET", "/api/scripts", scripts_body())
        .unwrap()
        .steps(import_steps())
        .build()
        .unwrap();

    let (executor, stats) = executor(common::audio_editor());
    let ctx = common::context(dir.path());
    let first = executor.run(&scenario, &ctx).await.unwrap();
    let second = executor.run(&scenario, &ctx).await.unwrap();

    assert!(first.passed() && second.passed());
    assert_eq!(second.interceptions.len(), 1);
    assert_eq!(second.interceptions[0].seq, 0);
    assert_eq!(stats.launches(), 2);
    assert_eq!(stats.closes(), 2);
}

#[tokio::test(start_paused = true)]
async fn repeated_inject_and_reload_renders_each_key() {
    let dir = tempfile::tempdir().unwrap();
    let menu = r#"button[aria-label="user-menu"]"#;
    let scenario = Scenario::builder("relogin")
        .steps([
            Step::navigate("/"),
            Step::inject_state("audioEditor_user", r#"{"account":"TestUser"}"#).and_reload(),
            // Token still missing
            Step::assert_visible(r#"button[aria-label="login"]"#),
            Step::inject_state("audioEditor_token", "fake-token").and_reload(),
            Step::assert_text(menu, "TestUser"),
            Step::inject_state("audioEditor_user", r#"{"account":"SecondUser"}"#).and_reload(),
            Step::assert_text(menu, "SecondUser"),
        ])
        .build()
        .unwrap();

    let (executor, stats) = executor(common::audio_editor());
    let result = executor.run(&scenario, &common::context(dir.path())).await.unwrap();

    assert!(result.passed(), "{}", result.diagnostics());
    // navigate + three reloads
    assert_eq!(stats.loads(), 4);
}

#[tokio::test(start_paused = true)]
async fn wait_on_repeated_elements_needs_a_pick() {
    let two_scripts = json!({ "data": [{ "scriptName": "Script A" }, { "scriptName": "Script B" }] });
    let scenario = |name: &str, wait: Step| {
        Scenario::builder(name)
            .mock_json("GET", "/api/scripts", two_scripts.clone())
            .unwrap()
            .steps([
                Step::navigate("/"),
                Step::click("#import"),
                wait,
                Step::assert_text(".script-item", "Script B").pick(Pick::Last),
            ])
            .build()
            .unwrap()
    };
    let dir = tempfile::tempdir().unwrap();
    let (executor, _) = executor(common::audio_editor_instant_import());

    let picked = scenario("wait-last", Step::wait_for(".script-item").pick(Pick::Last));
    let result = executor.run(&picked, &common::context(dir.path())).await.unwrap();
    assert!(result.passed(), "{}", result.diagnostics());

    let unpicked = scenario("wait-any", Step::wait_for(".script-item"));
    let result = executor.run(&unpicked, &common::context(dir.path())).await.unwrap();
    let failure = result.failure.unwrap();
    assert_eq!(failure.index, 2);
    assert_eq!(failure.kind, "AmbiguousSelectorError");
}

#[tokio::test(start_paused = true)]
async fn screenshot_labels_map_to_distinct_files() {
    let dir = tempfile::tempdir().unwrap();
    let scenario = Scenario::builder("shots")
        .steps([
            Step::navigate("/tts-editor"),
            Step::screenshot("更新"),
            Step::screenshot("弹窗"),
            Step::assert_visible("#never").timeout(300),
        ])
        .build()
        .unwrap();

    let (executor, _) = executor(common::audio_editor());
    let result = executor.run(&scenario, &common::context(dir.path())).await.unwrap();

    assert_eq!(result.verdict, Verdict::Failed);
    let mut paths: Vec<_> = result.artifacts.iter().map(|a| a.path.clone()).collect();
    paths.push(result.error_screenshot.clone().unwrap());
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 3, "{:?}", paths);
    assert!(paths.iter().all(|p| p.exists()));

    assert!(Scenario::builder("shots")
        .steps([Step::navigate("/"), Step::screenshot(" error")])
        .build()
        .is_err());
}
