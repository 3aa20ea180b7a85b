//! JS oracle backed by a headless Chrome driven over the DevTools protocol.
//!
//! The browser is started (or attached to) lazily on the first evaluation and
//! then shared by every caller until its connection is lost, at which point
//! the next evaluation starts over. Each evaluation runs in its own tab which
//! is closed again whatever the outcome.

use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::util::Wait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::Mutex;

use crate::error::{ProxyError, Result};
use crate::upstream::{ACCEPT_LANGUAGE, USER_AGENT_STRING};

pub const EVALUATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DEVTOOLS_URL: &str = "ws://127.0.0.1:9222";

// headless_chrome drops the connection after this long without events
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

const DUCKDUCKGO_PAGE: &str = "https://duckduckgo.com/?q=DuckDuckGo&ia=chat";

/// Something that can run a JS expression and hand back its JSON value.
#[async_trait]
pub trait JsOracle: Send + Sync {
    /// Evaluate `js`, awaiting it if it yields a Promise. A `null` or
    /// `undefined` result is reported as [`ProxyError::EmptyResult`].
    async fn evaluate(&self, js: &str) -> Result<Value>;

    /// Release whatever the oracle holds. Further evaluations fail.
    async fn shutdown(&self) {}
}

/// Page the challenge is evaluated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OraclePage {
    /// `about:blank`, no site globals.
    Blank,
    /// The real duckduckgo.com chat page, with its cookies and globals.
    #[default]
    #[value(name = "duckduckgo")]
    DuckDuckGo,
}

impl OraclePage {
    pub fn url(self) -> &'static str {
        match self {
            OraclePage::Blank => "about:blank",
            OraclePage::DuckDuckGo => DUCKDUCKGO_PAGE,
        }
    }
}

#[derive(Debug, Clone)]
pub enum OracleMode {
    /// Launch a private headless browser.
    Embedded { chrome_path: Option<PathBuf> },
    /// Attach to an already running browser.
    Remote { devtools_url: String },
}

struct BrowserSession {
    browser: Browser,
    // dropped after the browser so the profile is no longer in use
    _profile: Option<TempDir>,
}

enum SessionState<S> {
    Idle,
    Ready(S),
    Failed(String),
    Closed,
}

struct SlotInner<S> {
    state: SessionState<S>,
    // bumped on every successful start, identifies the live session
    generation: u64,
}

/// Owns the shared session. A session that went bad is discarded and the
/// next caller starts a fresh one; only a start failure can be made final.
struct SessionSlot<S> {
    inner: Mutex<SlotInner<S>>,
}

impl<S> SessionSlot<S> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: SessionState::Idle,
                generation: 0,
            }),
        }
    }

    /// Hand out the live session through `handle`, starting one first when
    /// there is none. Returns the handle with the session's generation.
    async fn acquire<H, F, Fut>(
        &self,
        start: F,
        failure_is_final: bool,
        handle: impl FnOnce(&S) -> H,
    ) -> Result<(H, u64)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        let mut inner = self.inner.lock().await;
        match &inner.state {
            SessionState::Ready(session) => return Ok((handle(session), inner.generation)),
            SessionState::Failed(reason) => {
                return Err(ProxyError::OracleFailure(format!(
                    "browser failed to start earlier: {}",
                    reason
                )));
            }
            SessionState::Closed => {
                return Err(ProxyError::OracleFailure(
                    "browser session has been shut down".to_string(),
                ));
            }
            SessionState::Idle => {}
        }

        match start().await {
            Ok(session) => {
                let handed_out = handle(&session);
                inner.generation += 1;
                inner.state = SessionState::Ready(session);
                Ok((handed_out, inner.generation))
            }
            Err(err) => {
                if failure_is_final {
                    inner.state = SessionState::Failed(err.to_string());
                }
                Err(err)
            }
        }
    }

    /// Take the session of `generation` out so the next `acquire` starts a
    /// new one. A session started since then is left alone.
    async fn discard(&self, generation: u64) -> Option<S> {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || !matches!(inner.state, SessionState::Ready(_)) {
            return None;
        }
        match std::mem::replace(&mut inner.state, SessionState::Idle) {
            SessionState::Ready(session) => Some(session),
            _ => None,
        }
    }

    async fn close(&self) -> Option<S> {
        let mut inner = self.inner.lock().await;
        match std::mem::replace(&mut inner.state, SessionState::Closed) {
            SessionState::Ready(session) => Some(session),
            _ => None,
        }
    }
}

pub struct ChromeOracle {
    mode: OracleMode,
    page: OraclePage,
    session: SessionSlot<BrowserSession>,
}

impl ChromeOracle {
    pub fn new(mode: OracleMode, page: OraclePage) -> Self {
        Self {
            mode,
            page,
            session: SessionSlot::new(),
        }
    }

    /// Remote mode when `devtools_url` is set (an empty value means the
    /// default local port), embedded otherwise.
    pub fn from_settings(
        devtools_url: Option<String>,
        chrome_path: Option<PathBuf>,
        page: OraclePage,
    ) -> Self {
        let mode = match devtools_url {
            Some(url) if url.trim().is_empty() => OracleMode::Remote {
                devtools_url: DEFAULT_DEVTOOLS_URL.to_string(),
            },
            Some(url) => OracleMode::Remote { devtools_url: url },
            None => OracleMode::Embedded { chrome_path },
        };
        Self::new(mode, page)
    }

    async fn start(&self) -> Result<BrowserSession> {
        match &self.mode {
            OracleMode::Embedded { chrome_path } => launch(chrome_path.clone()).await,
            OracleMode::Remote { devtools_url } => attach(devtools_url).await,
        }
    }

    async fn browser(&self) -> Result<(Browser, u64)> {
        // a remote browser may come up later, a local launch failure is final
        let failure_is_final = matches!(self.mode, OracleMode::Embedded { .. });
        self.session
            .acquire(|| self.start(), failure_is_final, |session| session.browser.clone())
            .await
    }

    /// Drop a session whose connection went away; the next evaluation
    /// launches or attaches again.
    async fn discard(&self, generation: u64) {
        if let Some(session) = self.session.discard(generation).await {
            tracing::warn!(
                "Browser connection lost, starting a new session on the next evaluation"
            );
            release(session).await;
        }
    }
}

#[async_trait]
impl JsOracle for ChromeOracle {
    async fn evaluate(&self, js: &str) -> Result<Value> {
        let (browser, generation) = self.browser().await?;

        let opened = blocking_with_limit("opening a tab", EVALUATION_TIMEOUT, move || {
            browser.new_tab()
        })
        .await;
        let tab = match opened {
            Ok(Ok(tab)) => tab,
            Ok(Err(e)) => {
                self.discard(generation).await;
                return Err(ProxyError::OracleFailure(format!("failed to open a tab: {:#}", e)));
            }
            Err(err) => {
                self.discard(generation).await;
                return Err(err);
            }
        };

        let page = self.page;
        let script = wrap_script(js);
        let worker = Arc::clone(&tab);
        let outcome = blocking_with_limit("evaluation", EVALUATION_TIMEOUT, move || {
            run_on_page(&worker, page, &script)
        })
        .await;

        close_tab(tab).await;
        outcome?
    }

    async fn shutdown(&self) {
        if let Some(session) = self.session.close().await {
            tracing::info!("Shutting down browser session");
            release(session).await;
        }
    }
}

async fn release(session: BrowserSession) {
    // dropping the last handle kills an embedded browser and joins its threads
    let _ = tokio::task::spawn_blocking(move || drop(session)).await;
}

/// Run blocking DevTools work on the blocking pool and stop waiting after
/// `limit`. An overrunning worker is left to finish on its own.
async fn blocking_with_limit<T, F>(what: &str, limit: Duration, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(work)).await {
        Err(_) => Err(ProxyError::OracleFailure(format!(
            "{} timed out after {}s",
            what,
            limit.as_secs()
        ))),
        Ok(Err(join)) => Err(ProxyError::OracleFailure(format!("{} task failed: {}", what, join))),
        Ok(Ok(value)) => Ok(value),
    }
}

async fn close_tab(tab: Arc<Tab>) {
    // Target.closeTarget destroys the page without waiting on beforeunload
    match blocking_with_limit("closing the tab", EVALUATION_TIMEOUT, move || tab.close_target())
        .await
    {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::debug!("Closing tab failed: {:#}", e),
        Err(err) => tracing::warn!("Leaving tab behind: {}", err),
    }
}

/// Whether `document.body` is rendered with a non-empty box.
const BODY_VISIBLE_CHECK: &str = "(() => {
  const body = document.body;
  if (!body) return false;
  const style = getComputedStyle(body);
  const rect = body.getBoundingClientRect();
  return style.display !== 'none' && style.visibility !== 'hidden'
    && rect.width > 0 && rect.height > 0;
})()";

const BODY_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn reports_visible(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::Bool(true)))
}

fn wait_for_visible_body(tab: &Tab) -> anyhow::Result<()> {
    Wait::new(EVALUATION_TIMEOUT, BODY_POLL_INTERVAL).until(|| {
        match tab.evaluate(BODY_VISIBLE_CHECK, false) {
            Ok(remote) if reports_visible(remote.value.as_ref()) => Some(()),
            Ok(_) => None,
            Err(e) => {
                tracing::trace!("Visibility check failed, retrying: {:#}", e);
                None
            }
        }
    })?;
    Ok(())
}

fn run_on_page(tab: &Tab, page: OraclePage, script: &str) -> Result<Value> {
    let failure =
        |what: &str, e: anyhow::Error| ProxyError::OracleFailure(format!("{}: {:#}", what, e));

    tab.set_default_timeout(EVALUATION_TIMEOUT);
    if let Err(e) = tab.set_user_agent(USER_AGENT_STRING, Some(ACCEPT_LANGUAGE), None) {
        tracing::debug!("Could not override tab user agent: {:#}", e);
    }

    tab.navigate_to(page.url()).map_err(|e| failure("navigation failed", e))?;
    tab.wait_until_navigated().map_err(|e| failure("navigation did not finish", e))?;
    if page == OraclePage::DuckDuckGo {
        wait_for_visible_body(tab).map_err(|e| failure("page body never became visible", e))?;
    }

    let remote = tab.evaluate(script, true).map_err(|e| failure("evaluation failed", e))?;
    match remote.value {
        Some(Value::String(envelope)) => decode_envelope(&envelope),
        _ => Err(ProxyError::OracleFailure(format!(
            "evaluation produced no JSON: {}",
            remote.description.unwrap_or_else(|| "no description".to_string())
        ))),
    }
}

/// Wrap the challenge so the page returns a JSON string envelope:
/// `{"ok": value}` on success, `{"thrown": message}` if it threw.
pub(crate) fn wrap_script(js: &str) -> String {
    let body = js.trim().trim_end_matches(';');
    format!(
        r"(async () => {{
  try {{
    const value = await (
{}
    );
    return JSON.stringify({{ ok: value === undefined ? null : value }});
  }} catch (e) {{
    return JSON.stringify({{ thrown: String((e && e.stack) || e) }});
  }}
}})()",
        body
    )
}

pub(crate) fn decode_envelope(envelope: &str) -> Result<Value> {
    let mut parsed: Value = serde_json::from_str(envelope).map_err(|e| {
        ProxyError::OracleFailure(format!("evaluation returned malformed JSON: {}", e))
    })?;

    if let Some(thrown) = parsed.get("thrown") {
        let message = thrown
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| thrown.to_string());
        return Err(ProxyError::OracleFailure(format!("evaluation threw: {}", message)));
    }

    match parsed.get_mut("ok").map(Value::take) {
        None | Some(Value::Null) => Err(ProxyError::EmptyResult),
        Some(value) => Ok(value),
    }
}

async fn launch(chrome_path: Option<PathBuf>) -> Result<BrowserSession> {
    let executable = match chrome_path {
        Some(path) => path,
        None => find_chrome_executable().ok_or_else(|| {
            ProxyError::OracleFailure(
                "no Chrome or Chromium executable found in the standard locations".to_string(),
            )
        })?,
    };
    if !executable.is_file() {
        return Err(ProxyError::OracleFailure(format!(
            "browser executable {} does not exist",
            executable.display()
        )));
    }

    kill_stray_browsers().await;

    let profile = tempfile::Builder::new()
        .prefix("chrome_user_data_")
        .tempdir()
        .map_err(|e| {
            ProxyError::OracleFailure(format!("failed to create browser profile directory: {}", e))
        })?;
    let profile_path = profile.path().to_path_buf();

    tracing::info!("Launching headless browser {}", executable.display());
    let browser = blocking_with_limit("browser startup", STARTUP_TIMEOUT, move || {
        launch_browser(executable, profile_path)
    })
    .await??;

    tracing::info!("Headless browser ready");
    Ok(BrowserSession {
        browser,
        _profile: Some(profile),
    })
}

fn launch_browser(executable: PathBuf, profile: PathBuf) -> Result<Browser> {
    let user_agent = OsString::from(format!("--user-agent={}", USER_AGENT_STRING));
    let mut args: Vec<&OsStr> = [
        "--disable-gpu",
        "--disable-dev-shm-usage",
        "--ignore-certificate-errors",
        "--ignore-ssl-errors",
        "--ignore-certificate-errors-spki-list",
        "--disable-background-timer-throttling",
        "--disable-backgrounding-occluded-windows",
        "--disable-renderer-backgrounding",
        "--disable-background-networking",
        "--disable-ipc-flooding-protection",
        "--disable-extensions",
        "--disable-plugins",
        "--disable-default-apps",
        "--disable-sync",
        "--disable-translate",
        "--no-first-run",
        "--no-default-browser-check",
    ]
    .into_iter()
    .map(OsStr::new)
    .collect();
    args.push(user_agent.as_os_str());

    let options = LaunchOptions::default_builder()
        .headless(true)
        .sandbox(false)
        .window_size(Some((1200, 800)))
        .path(Some(executable))
        .user_data_dir(Some(profile))
        .idle_browser_timeout(SESSION_IDLE_TIMEOUT)
        .args(args)
        .build()
        .map_err(|e| ProxyError::OracleFailure(format!("invalid launch options: {}", e)))?;

    Browser::new(options)
        .map_err(|e| ProxyError::OracleFailure(format!("failed to launch browser: {:#}", e)))
}

async fn attach(devtools_url: &str) -> Result<BrowserSession> {
    let ws_url = resolve_devtools_url(devtools_url).await?;
    tracing::info!("Attaching to browser at {}", ws_url);

    let browser = blocking_with_limit("attaching to the browser", STARTUP_TIMEOUT, move || {
        Browser::connect_with_timeout(ws_url, SESSION_IDLE_TIMEOUT)
    })
    .await?
    .map_err(|e| ProxyError::OracleFailure(format!("failed to attach to browser: {:#}", e)))?;

    Ok(BrowserSession {
        browser,
        _profile: None,
    })
}

/// A bare `ws://host:port` is expanded to the browser endpoint advertised on
/// `/json/version`; full `/devtools/...` URLs are used as-is.
pub async fn resolve_devtools_url(url: &str) -> Result<String> {
    if url.contains("/devtools/") {
        return Ok(url.to_string());
    }

    let http_base = if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        url.to_string()
    };
    let endpoint = format!("{}/json/version", http_base.trim_end_matches('/'));

    let unreachable = |e: reqwest::Error| {
        ProxyError::OracleFailure(format!("browser at {} unreachable: {}", endpoint, e))
    };
    let info: Value = reqwest::get(&endpoint)
        .await
        .map_err(unreachable)?
        .json()
        .await
        .map_err(unreachable)?;

    info.get("webSocketDebuggerUrl")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ProxyError::OracleFailure(format!(
                "{} did not advertise webSocketDebuggerUrl",
                endpoint
            ))
        })
}

fn candidate_paths() -> Vec<PathBuf> {
    if cfg!(target_os = "macos") {
        [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/usr/bin/google-chrome",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    } else if cfg!(target_os = "windows") {
        let mut paths = Vec::new();
        for var in ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"] {
            if let Ok(root) = std::env::var(var) {
                let root = PathBuf::from(root);
                paths.push(
                    root.join("Google")
                        .join("Chrome")
                        .join("Application")
                        .join("chrome.exe"),
                );
                paths.push(root.join("Chromium").join("Application").join("chrome.exe"));
            }
        }
        paths
    } else if cfg!(target_os = "linux") {
        [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium-browser",
            "/usr/bin/chromium",
            "/opt/google/chrome/google-chrome",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    } else {
        Vec::new()
    }
}

/// First existing browser executable among the usual install locations.
pub fn find_chrome_executable() -> Option<PathBuf> {
    candidate_paths().into_iter().find(|path| path.is_file())
}

/// Best-effort removal of browsers left behind by an earlier crash.
#[cfg(unix)]
pub async fn kill_stray_browsers() {
    use tokio::process::Command;

    let output = match Command::new("pgrep").arg("chrome|chromium").output().await {
        Ok(output) => output,
        Err(e) => {
            tracing::debug!("pgrep unavailable, skipping stray browser cleanup: {}", e);
            return;
        }
    };
    let pids: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| line.parse::<u32>().is_ok())
        .map(str::to_string)
        .collect();
    if pids.is_empty() {
        return;
    }

    tracing::info!("Cleaning up {} stray browser processes", pids.len());
    for pid in &pids {
        let terminated = Command::new("kill").args(["-TERM", pid]).status().await;
        if !matches!(terminated, Ok(status) if status.success()) {
            let _ = Command::new("kill").args(["-KILL", pid]).status().await;
        }
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    for pid in &pids {
        // -0 only checks the pid; anything still alive after the grace period is killed
        let alive = Command::new("kill").args(["-0", pid]).status().await;
        if matches!(alive, Ok(status) if status.success()) {
            let _ = Command::new("kill").args(["-KILL", pid]).status().await;
        }
    }
}

#[cfg(windows)]
pub async fn kill_stray_browsers() {
    use tokio::process::Command;

    let listed = Command::new("tasklist")
        .args(["/FI", "IMAGENAME eq chrome.exe", "/FO", "CSV"])
        .output()
        .await;
    let Ok(listed) = listed else {
        return;
    };
    if !String::from_utf8_lossy(&listed.stdout).contains("chrome.exe") {
        return;
    }

    tracing::info!("Cleaning up stray chrome.exe processes");
    let _ = Command::new("taskkill").args(["/IM", "chrome.exe"]).status().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    let _ = Command::new("taskkill").args(["/F", "/IM", "chrome.exe"]).status().await;
}

#[cfg(not(any(unix, windows)))]
pub async fn kill_stray_browsers() {}
