//! A miniature audio editor served by the in-memory browser

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use audio_editor_e2e::executor::RunContext;
use audio_editor_e2e::testing::{FakeElement, FakeSite, PageScope};

pub const BASE_URL: &str = "http://app.test/";

/// How long the app takes to render the script list after "导入话术"
pub const IMPORT_LATENCY: Duration = Duration::from_millis(300);

pub fn context(artifacts: &Path) -> RunContext {
    RunContext {
        base_url: url::Url::parse(BASE_URL).unwrap(),
        step_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(100),
        navigation_timeout: Duration::from_secs(5),
        scenario_timeout: Duration::from_secs(60),
        artifact_dir: artifacts.to_path_buf(),
    }
}

fn render_home(page: &mut PageScope<'_>) {
    page.dom.add(FakeElement::new("h1", "语音合成"));
    page.dom.add(FakeElement::new("#tab-baize", "从白泽导入"));
    page.dom.add(FakeElement::new("#import", "导入话术"));

    let account = page
        .session("audioEditor_user")
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        .and_then(|user| user["account"].as_str().map(str::to_string));

    match (page.session("audioEditor_token"), account) {
        (Some(_), Some(account)) => {
            page.dom.add(FakeElement::new(r#"button[aria-label="user-menu"]"#, &account));
        }
        _ => page.dom.add(FakeElement::new(r#"button[aria-label="login"]"#, "登录")),
    }
}

fn render_editor(page: &mut PageScope<'_>) {
    page.dom.add(FakeElement::new("h1", "语音合成"));
    if page.session("update_acknowledged_version").is_none() {
        page.dom.add(FakeElement::new("#update-title", "系统更新说明"));
        page.dom.add(FakeElement::new("#update-notes", "1. 新增了更新提示功能"));
        page.dom.add(FakeElement::new("#dont-show-again", "本次更新不再提示").checkbox(true));
        page.dom.add(FakeElement::new("#update-confirm", "知道了"));
    }
}

fn load_scripts(page: &mut PageScope<'_>) {
    let response = page.fetch("GET", "/api/scripts");
    let scripts = response
        .json()
        .filter(|_| response.status == 200)
        .and_then(|body| body["data"].as_array().cloned());

    match scripts {
        Some(scripts) => {
            for script in scripts {
                let name = script["scriptName"].as_str().unwrap_or_default();
                page.dom.add(FakeElement::new(".script-item", name));
            }
        }
        None => {
            let reason = if response.content_type.starts_with("text/html") {
                "Unexpected token '<', \"<!doctype \"... is not valid JSON".to_string()
            } else {
                format!("HTTP {}", response.status)
            };
            page.dom.add(FakeElement::new("#import-error", &format!("获取话术列表失败: {}", reason)));
        }
    }
}

/// The editor: a home page with login state and a script import button,
/// plus the TTS editor page with its update notification dialog.
pub fn audio_editor() -> FakeSite {
    audio_editor_with_import_latency(IMPORT_LATENCY)
}

pub fn audio_editor_with_import_latency(latency: Duration) -> FakeSite {
    FakeSite::new()
        .page("/", render_home)
        .page("/tts-editor", render_editor)
        .on_click("#import", latency, load_scripts)
        .on_click(r#"button[aria-label="user-menu"]"#, Duration::ZERO, |page| {
            let account = page
                .dom
                .matching(r#"button[aria-label="user-menu"]"#)
                .first()
                .map(|el| el.text.clone())
                .unwrap_or_default();
            page.dom.add(FakeElement::new(".menu-item", &account));
        })
        .on_click("#update-confirm", Duration::ZERO, |page| {
            page.dom.set_visible("#update-title", false);
            page.dom.set_visible("#update-notes", false);
        })
        .on_expression("document.title", |_, _| serde_json::json!("语音合成"))
}

/// Same editor, but the import button loads scripts without delay.
pub fn audio_editor_instant_import() -> FakeSite {
    FakeSite::new()
        .page("/", render_home)
        .on_click("#import", Duration::ZERO, load_scripts)
}
