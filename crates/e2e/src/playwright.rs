//! Playwright browser automation
//!
//! Each launched page is one long-lived `node` process running the bridge
//! script in `bridge.js`. Requests and replies are single JSON lines over
//! stdio, correlated by id. The bridge forwards every network request the
//! page makes as a `route` event; the reader task answers it from the frozen
//! [`Router`] without involving the executor.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command as TokioCommand};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserControl, ElementSnapshot, ElementTarget, PageLauncher, PageScript};
use crate::config::{Browser, HarnessConfig, Viewport};
use crate::error::{E2eError, E2eResult};
use crate::routes::{InterceptedRequest, RouteAction, Router};

const BRIDGE_SCRIPT: &str = include_str!("bridge.js");

/// Deadline for calls that carry no timeout of their own
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const READY_TIMEOUT: Duration = Duration::from_secs(60);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// Configuration for launching Playwright pages
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub browser: Browser,
    pub headless: bool,
    pub viewport: Viewport,
}

impl From<&HarnessConfig> for PlaywrightConfig {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            browser: config.browser,
            headless: config.headless,
            viewport: config.viewport,
        }
    }
}

pub struct PlaywrightLauncher {
    config: PlaywrightConfig,
}

impl PlaywrightLauncher {
    /// Verify Playwright is installed before handing out a launcher.
    pub async fn new(config: PlaywrightConfig) -> E2eResult<Self> {
        check_playwright_installed().await?;
        Ok(Self { config })
    }
}

#[async_trait]
impl PageLauncher for PlaywrightLauncher {
    async fn launch(&self, router: Router) -> E2eResult<Box<dyn BrowserControl>> {
        let page = PlaywrightPage::spawn(&self.config, router).await?;
        Ok(Box::new(page))
    }
}

/// Check if Playwright is installed
async fn check_playwright_installed() -> E2eResult<()> {
    let status = TokioCommand::new("npx")
        .args(["playwright", "--version"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => Ok(()),
        _ => Err(E2eError::PlaywrightNotFound),
    }
}

/// Requests understood by the bridge
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum BridgeCommand {
    Navigate { url: String, timeout: u64 },
    Reload { timeout: u64 },
    Click { selector: String, index: usize, timeout: u64 },
    Fill { selector: String, index: usize, value: String, timeout: u64 },
    Evaluate { script: String },
    Inspect { selector: String },
    Screenshot { path: String },
    Close,
}

impl BridgeCommand {
    fn op(&self) -> &'static str {
        match self {
            BridgeCommand::Navigate { .. } => "navigate",
            BridgeCommand::Reload { .. } => "reload",
            BridgeCommand::Click { .. } => "click",
            BridgeCommand::Fill { .. } => "fill",
            BridgeCommand::Evaluate { .. } => "evaluate",
            BridgeCommand::Inspect { .. } => "inspect",
            BridgeCommand::Screenshot { .. } => "screenshot",
            BridgeCommand::Close => "close",
        }
    }
}

/// One line from the bridge's stdout
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Inbound {
    Reply {
        id: u64,
        ok: bool,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Event(BridgeEvent),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BridgeEvent {
    Ready,
    Fatal {
        error: String,
    },
    Console {
        level: String,
        text: String,
    },
    Route {
        rid: u64,
        method: String,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<String>,
    },
    PassthroughDone {
        seq: u64,
        status: u16,
        #[serde(rename = "contentType", default)]
        content_type: Option<String>,
    },
}

/// Route decision sent back for a `route` event
fn route_reply(rid: u64, action: RouteAction, seq: u64) -> Value {
    match action {
        RouteAction::Fulfill(response) => json!({
            "op": "route_reply",
            "rid": rid,
            "action": "fulfill",
            "status": response.status,
            "contentType": response.content_type,
            "body": response.body_string(),
        }),
        RouteAction::Continue => json!({
            "op": "route_reply",
            "rid": rid,
            "action": "continue",
            "seq": seq,
        }),
    }
}

/// A page driven through the node bridge
pub struct PlaywrightPage {
    child: tokio::sync::Mutex<Child>,
    outbox: mpsc::UnboundedSender<String>,
    pending: Pending,
    next_id: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
    // Holds bridge.js on disk for the lifetime of the process.
    _script_dir: tempfile::TempDir,
}

impl PlaywrightPage {
    pub async fn spawn(config: &PlaywrightConfig, router: Router) -> E2eResult<Self> {
        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("bridge.js");
        std::fs::write(&script_path, BRIDGE_SCRIPT)?;

        info!("Launching {} via Playwright bridge", config.browser.as_str());

        let mut child = TokioCommand::new("node")
            .arg(&script_path)
            .env("E2E_BROWSER", config.browser.as_str())
            .env("E2E_HEADLESS", if config.headless { "1" } else { "0" })
            .env("E2E_VIEWPORT_WIDTH", config.viewport.width.to_string())
            .env("E2E_VIEWPORT_HEIGHT", config.viewport.height.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| E2eError::Bridge(format!("Failed to spawn node: {}", e)))?;

        let stdin = child.stdin.take().ok_or_else(|| E2eError::Bridge("bridge stdin unavailable".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| E2eError::Bridge("bridge stdout unavailable".into()))?;
        let stderr = child.stderr.take().ok_or_else(|| E2eError::Bridge("bridge stderr unavailable".into()))?;

        let (outbox, mut inbox) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = inbox.recv().await {
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                };
                if let Err(e) = written.await {
                    debug!("Bridge stdin closed: {}", e);
                    break;
                }
            }
        });

        let pending: Pending = Arc::default();
        let (ready_tx, ready_rx) = oneshot::channel();
        let reader = tokio::spawn(read_bridge(stdout, pending.clone(), outbox.clone(), router, ready_tx));
        let stderr_task = tokio::spawn(forward_stderr(stderr));

        let page = Self {
            child: tokio::sync::Mutex::new(child),
            outbox,
            pending,
            next_id: AtomicU64::new(1),
            tasks: vec![writer, reader, stderr_task],
            _script_dir: script_dir,
        };

        let ready = match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(E2eError::Bridge(format!("bridge failed to start: {}", reason))),
            Ok(Err(_)) => Err(E2eError::Bridge("bridge exited during startup".into())),
            Err(_) => Err(E2eError::Bridge(format!(
                "bridge not ready within {} s",
                READY_TIMEOUT.as_secs()
            ))),
        };
        if let Err(e) = ready {
            page.terminate().await;
            return Err(e);
        }
        Ok(page)
    }

    async fn request(&self, command: BridgeCommand, deadline: Duration) -> E2eResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let op = command.op();
        let mut msg = serde_json::to_value(&command)?;
        msg["id"] = json!(id);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if self.outbox.send(msg.to_string()).is_err() {
            self.pending.lock().remove(&id);
            return Err(E2eError::Bridge("bridge is not running".into()));
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(reason))) => Err(E2eError::Bridge(reason)),
            Ok(Err(_)) => Err(E2eError::Bridge(format!("bridge exited before answering {}", op))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(E2eError::Bridge(format!(
                    "no answer to {} within {} ms",
                    op,
                    deadline.as_millis()
                )))
            }
        }
    }

    /// SIGTERM, a short grace period, then kill.
    async fn terminate(&self) {
        let mut child = self.child.lock().await;

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        if tokio::time::timeout(Duration::from_millis(500), child.wait()).await.is_err() {
            warn!("Bridge ignored SIGTERM, killing");
            let _ = child.kill().await;
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Bridge deadline: the page-side timeout plus room for the reply.
fn with_margin(d: Duration) -> Duration {
    d + Duration::from_secs(1)
}

#[async_trait]
impl BrowserControl for PlaywrightPage {
    async fn navigate(&self, url: &str, timeout: Duration) -> E2eResult<()> {
        let command = BridgeCommand::Navigate {
            url: url.to_string(),
            timeout: millis(timeout),
        };
        self.request(command, with_margin(timeout))
            .await
            .map(|_| ())
            .map_err(|e| E2eError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }

    async fn reload(&self, timeout: Duration) -> E2eResult<()> {
        self.request(BridgeCommand::Reload { timeout: millis(timeout) }, with_margin(timeout))
            .await
            .map(|_| ())
            .map_err(|e| E2eError::Navigation {
                url: "(reload)".into(),
                reason: e.to_string(),
            })
    }

    async fn click(&self, target: &ElementTarget, timeout: Duration) -> E2eResult<()> {
        let command = BridgeCommand::Click {
            selector: target.selector.clone(),
            index: target.index,
            timeout: millis(timeout),
        };
        self.request(command, with_margin(timeout))
            .await
            .map(|_| ())
            .map_err(|e| E2eError::Interaction {
                selector: target.selector.clone(),
                reason: e.to_string(),
            })
    }

    async fn fill(&self, target: &ElementTarget, value: &str, timeout: Duration) -> E2eResult<()> {
        let command = BridgeCommand::Fill {
            selector: target.selector.clone(),
            index: target.index,
            value: value.to_string(),
            timeout: millis(timeout),
        };
        self.request(command, with_margin(timeout))
            .await
            .map(|_| ())
            .map_err(|e| E2eError::Interaction {
                selector: target.selector.clone(),
                reason: e.to_string(),
            })
    }

    async fn evaluate(&self, script: &PageScript) -> E2eResult<Value> {
        self.request(BridgeCommand::Evaluate { script: script.to_js() }, REQUEST_TIMEOUT)
            .await
    }

    async fn inspect(&self, selector: &str) -> E2eResult<Vec<ElementSnapshot>> {
        let value = self
            .request(
                BridgeCommand::Inspect {
                    selector: selector.to_string(),
                },
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn screenshot(&self, path: &Path) -> E2eResult<()> {
        let command = BridgeCommand::Screenshot {
            path: path.to_string_lossy().to_string(),
        };
        self.request(command, REQUEST_TIMEOUT).await.map(|_| ())
    }

    async fn close(&self) -> E2eResult<()> {
        let graceful = self.request(BridgeCommand::Close, CLOSE_TIMEOUT).await;
        if let Err(e) = &graceful {
            warn!("Graceful browser close failed: {}", e);
        }
        self.terminate().await;
        debug!("Bridge process stopped");
        graceful.map(|_| ())
    }
}

async fn read_bridge(
    stdout: ChildStdout,
    pending: Pending,
    outbox: mpsc::UnboundedSender<String>,
    router: Router,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let inbound = match serde_json::from_str::<Inbound>(&line) {
            Ok(inbound) => inbound,
            Err(_) => {
                debug!(target: "browser", "{}", line);
                continue;
            }
        };

        match inbound {
            Inbound::Reply { id, ok, value, error } => {
                let Some(tx) = pending.lock().remove(&id) else {
                    debug!("Late bridge reply #{} dropped", id);
                    continue;
                };
                let result = if ok {
                    Ok(value)
                } else {
                    Err(error.unwrap_or_else(|| "unknown bridge error".into()))
                };
                let _ = tx.send(result);
            }
            Inbound::Event(BridgeEvent::Ready) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Inbound::Event(BridgeEvent::Fatal { error: reason }) => match ready.take() {
                Some(tx) => {
                    let _ = tx.send(Err(reason));
                }
                None => error!("Bridge failed: {}", reason),
            },
            Inbound::Event(BridgeEvent::Console { level, text }) => {
                debug!(target: "browser", "[{}] {}", level, text);
            }
            Inbound::Event(BridgeEvent::Route {
                rid,
                method,
                url,
                headers,
                body,
            }) => {
                let request = InterceptedRequest {
                    method,
                    url,
                    headers,
                    body,
                };
                let decision = router.handle(&request);
                let reply = route_reply(rid, decision.action, decision.seq);
                if outbox.send(reply.to_string()).is_err() {
                    break;
                }
            }
            Inbound::Event(BridgeEvent::PassthroughDone {
                seq,
                status,
                content_type,
            }) => {
                router.log().complete_pass_through(seq, status, content_type);
            }
        }
    }

    for (_, tx) in pending.lock().drain() {
        let _ = tx.send(Err("bridge exited".into()));
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "browser", "stderr: {}", line);
    }
}
