//! Chrome over the DevTools protocol.
//!
//! `headless_chrome` is synchronous, so every call into a tab runs on the
//! blocking pool. Element-addressed calls resolve through the injected query
//! engine, tag the element with [`dom::REF_ATTR`], and let the protocol act on
//! it by CSS.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::{CaptureScreenshotFormatOption, Viewport as Clip};
use headless_chrome::{Browser, Element, LaunchOptions, Tab};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::dom;
use crate::error::{EngineError, EngineResult};
use crate::locator::LocatorSpec;
use crate::options::{RunOptions, SessionMode};
use crate::page::{BoundingBox, ElementState, Locator, Page, Shot};
use crate::runner::Session;

const MARK_POLL: Duration = Duration::from_millis(100);
const READY_POLL: Duration = Duration::from_millis(50);
const NET_POLL: Duration = Duration::from_millis(250);
/// Nothing may be in flight, and the resource count must hold still, this
/// long to call the network idle.
const NET_QUIET_WINDOW: Duration = Duration::from_millis(500);
const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);
/// Covers long keep-open holds, during which the browser sends no events.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
struct EngineReply {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Decode the `JSON.stringify({ok, value | error})` an engine call returns.
fn parse_engine_reply(op: &str, raw: Option<Value>) -> EngineResult<Value> {
    let Some(Value::String(text)) = raw else {
        return Err(EngineError::Browser(format!("{op}: query engine returned nothing")));
    };
    let reply: EngineReply = serde_json::from_str(&text)?;
    if reply.ok {
        Ok(reply.value)
    } else {
        Err(EngineError::Browser(
            reply.error.unwrap_or_else(|| format!("{op} failed")),
        ))
    }
}

fn call_engine(tab: &Tab, op: &str, args: Value) -> EngineResult<Value> {
    let remote = tab.evaluate(&dom::engine_call(op, args), false)?;
    parse_engine_reply(op, remote.value)
}

/// `document.readyState` once the initial HTML has been parsed.
fn parsed(ready: Option<&str>) -> bool {
    matches!(ready, Some("interactive" | "complete"))
}

#[derive(Debug, Deserialize)]
struct NetStatus {
    ready: String,
    inflight: u64,
    resources: u64,
}

/// Tracks how long the network has looked idle across polls.
#[derive(Debug, Default)]
struct QuietWindow {
    since: Option<(u64, Instant)>,
}

impl QuietWindow {
    /// True once the document is loaded, nothing is in flight, and the
    /// resource count has held still for [`NET_QUIET_WINDOW`].
    fn observe(&mut self, status: &NetStatus, now: Instant) -> bool {
        if status.ready != "complete" || status.inflight > 0 {
            self.since = None;
            return false;
        }
        match self.since {
            Some((count, since)) if count == status.resources => now - since >= NET_QUIET_WINDOW,
            _ => {
                self.since = Some((status.resources, now));
                false
            }
        }
    }

    fn reset(&mut self) {
        self.since = None;
    }
}

/// [`Page`] backed by one Chrome tab.
pub struct ChromePage {
    tab: Arc<Tab>,
    slow_mo: Duration,
    action_timeout: Duration,
    init_scripts: Mutex<Vec<String>>,
    next_ref: AtomicU64,
}

impl ChromePage {
    pub fn new(tab: Arc<Tab>, options: &RunOptions) -> Self {
        tab.set_default_timeout(options.action_timeout());
        Self {
            tab,
            slow_mo: options.slow_mo(),
            action_timeout: options.action_timeout(),
            init_scripts: Mutex::new(Vec::new()),
            next_ref: AtomicU64::new(1),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> EngineResult<T> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| EngineError::Browser(format!("browser task failed: {e}")))?
    }

    async fn engine(&self, op: &'static str, args: Value) -> EngineResult<Value> {
        self.blocking(move |tab| call_engine(tab, op, args)).await
    }

    async fn pace(&self) {
        if !self.slow_mo.is_zero() {
            tokio::time::sleep(self.slow_mo).await;
        }
    }

    fn scripts(&self) -> Vec<String> {
        self.init_scripts
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Re-run init scripts in the current document. Scripts are idempotent.
    async fn apply_init_scripts(&self) -> EngineResult<()> {
        for script in self.scripts() {
            self.evaluate(&script).await?;
        }
        Ok(())
    }

    /// Wait for the locator's element, tag it, and run `f` on the protocol
    /// handle for it.
    async fn with_element<T, F>(&self, action: &'static str, locator: &Locator, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab, &Element<'_>) -> anyhow::Result<T> + Send + 'static,
    {
        let token = format!("r{}", self.next_ref.fetch_add(1, Ordering::Relaxed));
        let target = dom::target_args(locator);
        let described = locator.to_string();
        let timeout = self.action_timeout;

        self.blocking(move |tab| {
            let mark_args = json!({
                "target": target["target"],
                "attr": dom::REF_ATTR,
                "token": token,
            });
            let deadline = Instant::now() + timeout;
            loop {
                if call_engine(tab, "mark", mark_args.clone())?.as_bool() == Some(true) {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(EngineError::interaction(
                        action,
                        format!(
                            "no element matches {} after {}ms",
                            described,
                            timeout.as_millis()
                        ),
                    ));
                }
                std::thread::sleep(MARK_POLL);
            }

            let css = format!("[{}=\"{}\"]", dom::REF_ATTR, token);
            let outcome = tab
                .find_element(&css)
                .and_then(|el| f(tab, &el))
                .map_err(|e| EngineError::interaction(action, format!("{e:#}")));
            let unmark = json!({ "attr": dom::REF_ATTR, "token": token });
            if let Err(err) = call_engine(tab, "unmark", unmark) {
                debug!("unmark {} failed: {}", described, err);
            }
            outcome
        })
        .await
    }
}

#[async_trait]
impl Page for ChromePage {
    async fn goto(&self, url: &str) -> EngineResult<()> {
        self.pace().await;
        let url = url.to_string();
        let timeout = self.action_timeout;
        self.blocking(move |tab| {
            tab.navigate_to(&url)
                .map_err(|e| EngineError::interaction("navigate", format!("{url}: {e:#}")))?;
            let deadline = Instant::now() + timeout;
            loop {
                match tab.evaluate("document.readyState", false) {
                    Ok(remote) if parsed(remote.value.as_ref().and_then(Value::as_str)) => {
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(err) => debug!("readyState of {} unavailable: {:#}", url, err),
                }
                if Instant::now() >= deadline {
                    return Err(EngineError::timeout(
                        format!("{url} to be parsed"),
                        timeout.as_millis() as u64,
                    ));
                }
                std::thread::sleep(READY_POLL);
            }
        })
        .await?;
        if let Err(err) = self.engine("netTrack", json!({})).await {
            debug!("network tracker not installed: {}", err);
        }
        self.apply_init_scripts().await
    }

    async fn count(&self, spec: &LocatorSpec) -> EngineResult<usize> {
        let value = self.engine("count", json!({ "spec": spec })).await?;
        value
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| EngineError::Browser(format!("count returned {value}")))
    }

    async fn element_state(&self, locator: &Locator) -> EngineResult<ElementState> {
        let value = self.engine("state", dom::target_args(locator)).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn bounding_box(&self, locator: &Locator) -> EngineResult<Option<BoundingBox>> {
        let value = self.engine("box", dom::target_args(locator)).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn set_value(&self, locator: &Locator, value: &str) -> EngineResult<()> {
        self.pace().await;
        let args = json!({ "target": locator, "value": value });
        let deadline = tokio::time::Instant::now() + self.action_timeout;
        loop {
            if self.engine("setValue", args.clone()).await?.as_bool() == Some(true) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::interaction(
                    "fill",
                    format!("no element matches {}", locator),
                ));
            }
            tokio::time::sleep(MARK_POLL).await;
        }
    }

    async fn type_text(&self, locator: &Locator, text: &str, delay: Duration) -> EngineResult<()> {
        self.pace().await;
        self.with_element("type", locator, |_, el| {
            el.focus()?;
            Ok(())
        })
        .await?;
        for ch in text.chars() {
            let key = ch.to_string();
            self.blocking(move |tab| {
                tab.type_str(&key)
                    .map(|_| ())
                    .map_err(|e| EngineError::interaction("type", format!("{e:#}")))
            })
            .await?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    async fn click(&self, locator: &Locator) -> EngineResult<()> {
        self.pace().await;
        self.with_element("click", locator, |_, el| {
            el.click()?;
            Ok(())
        })
        .await
    }

    async fn press(&self, locator: &Locator, key: &str) -> EngineResult<()> {
        self.pace().await;
        let key = key.to_string();
        self.with_element("press", locator, move |tab, el| {
            el.focus()?;
            tab.press_key(&key)?;
            Ok(())
        })
        .await
    }

    async fn wait_network_idle(&self, timeout: Duration) -> EngineResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut window = QuietWindow::default();
        let mut last_err: Option<EngineError> = None;
        loop {
            let status = self
                .engine("netStatus", json!({}))
                .await
                .and_then(|value| Ok(serde_json::from_value::<NetStatus>(value)?));
            match status {
                Ok(status) => {
                    last_err = None;
                    if window.observe(&status, Instant::now()) {
                        return Ok(());
                    }
                }
                Err(err) => {
                    // The document may be navigating away under us.
                    debug!("network status unavailable: {}", err);
                    window.reset();
                    last_err = Some(err);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let what = match last_err {
                    Some(err) => format!("network idle (last error: {err})"),
                    None => "network idle".to_string(),
                };
                return Err(EngineError::timeout(what, timeout.as_millis() as u64));
            }
            tokio::time::sleep(NET_POLL).await;
        }
    }

    async fn evaluate(&self, script: &str) -> EngineResult<()> {
        let script = script.to_string();
        self.blocking(move |tab| {
            tab.evaluate(&script, false)?;
            Ok(())
        })
        .await
    }

    async fn add_init_script(&self, script: &str) -> EngineResult<()> {
        if let Ok(mut scripts) = self.init_scripts.lock() {
            scripts.push(script.to_string());
        }
        self.evaluate(script).await
    }

    async fn screenshot(&self, shot: Shot<'_>) -> EngineResult<Vec<u8>> {
        self.apply_init_scripts().await?;
        match shot {
            Shot::Viewport => {
                self.blocking(|tab| {
                    Ok(tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)?)
                })
                .await
            }
            Shot::FullPage => {
                #[derive(Deserialize)]
                struct Size {
                    width: f64,
                    height: f64,
                }
                let size: Size = serde_json::from_value(self.engine("pageSize", json!({})).await?)?;
                self.blocking(move |tab| {
                    let clip = Clip {
                        x: 0.0,
                        y: 0.0,
                        width: size.width,
                        height: size.height,
                        scale: 1.0,
                    };
                    Ok(tab.capture_screenshot(
                        CaptureScreenshotFormatOption::Png,
                        None,
                        Some(clip),
                        true,
                    )?)
                })
                .await
            }
            Shot::Element(locator) => {
                self.with_element("screenshot", locator, |_, el| {
                    el.capture_screenshot(CaptureScreenshotFormatOption::Png)
                })
                .await
            }
        }
    }

    async fn url(&self) -> EngineResult<String> {
        Ok(self.tab.get_url())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    web_socket_debugger_url: String,
}

/// `ws://` endpoints are used as given; `http(s)://host:port` is resolved
/// through the DevTools `/json/version` document.
pub async fn resolve_ws_endpoint(endpoint: &str) -> EngineResult<String> {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        return Ok(endpoint.to_string());
    }
    let base = url::Url::parse(endpoint)
        .map_err(|e| EngineError::Browser(format!("bad endpoint {endpoint:?}: {e}")))?;
    let version_url = base
        .join("/json/version")
        .map_err(|e| EngineError::Browser(format!("bad endpoint {endpoint:?}: {e}")))?;
    let info: VersionInfo = reqwest::get(version_url.as_str())
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| EngineError::Browser(format!("cannot reach {version_url}: {e}")))?
        .json()
        .await
        .map_err(|e| EngineError::Browser(format!("bad /json/version reply: {e}")))?;
    Ok(info.web_socket_debugger_url)
}

/// Look for a Chrome install in the usual places.
pub fn find_chrome() -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/usr/bin/google-chrome-stable"),
        PathBuf::from("/usr/bin/chromium"),
        PathBuf::from("/usr/bin/chromium-browser"),
    ];
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(
            local
                .join("Google")
                .join("Chrome")
                .join("Application")
                .join("chrome.exe"),
        );
    }
    candidates.into_iter().find(|p| p.exists())
}

/// A browser plus the tab this run drives.
pub struct BrowserSession {
    browser: Mutex<Option<Browser>>,
    page: ChromePage,
    mode: SessionMode,
}

impl BrowserSession {
    /// Attach to a running browser, launch with a persistent profile, or
    /// launch a fresh one, in that order of preference.
    pub async fn open(options: &RunOptions) -> EngineResult<Self> {
        let mode = options.session_mode();
        let browser = match &mode {
            SessionMode::Attach(endpoint) => {
                let ws = resolve_ws_endpoint(endpoint).await?;
                info!("attaching to {}", ws);
                tokio::task::spawn_blocking(move || {
                    Browser::connect_with_timeout(ws, IDLE_BROWSER_TIMEOUT)
                })
                .await
                .map_err(|e| EngineError::Browser(format!("attach task failed: {e}")))??
            }
            SessionMode::Persistent(dir) => {
                info!("launching with profile {}", dir.display());
                std::fs::create_dir_all(dir)?;
                launch(options, Some(dir.clone())).await?
            }
            SessionMode::Launch { headless } => {
                info!("launching {} browser", if *headless { "headless" } else { "headful" });
                launch(options, None).await?
            }
        };

        let tab = {
            let browser = browser.clone();
            let wait = if matches!(mode, SessionMode::Attach(_)) {
                ATTACH_TIMEOUT
            } else {
                options.action_timeout()
            };
            tokio::task::spawn_blocking(move || {
                let tab = browser.new_tab()?;
                tab.set_default_timeout(wait);
                Ok::<_, anyhow::Error>(tab)
            })
            .await
            .map_err(|e| EngineError::Browser(format!("tab task failed: {e}")))??
        };

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            page: ChromePage::new(tab, options),
            mode,
        })
    }
}

async fn launch(options: &RunOptions, user_data_dir: Option<PathBuf>) -> EngineResult<Browser> {
    let path = options.executable_path.clone().or_else(find_chrome);
    if path.is_none() {
        debug!("no Chrome found in the usual places, letting the driver look");
    }
    let headless = options.headless;
    let window = (options.viewport.width, options.viewport.height);

    tokio::task::spawn_blocking(move || {
        let launch_options = LaunchOptions {
            headless,
            path,
            user_data_dir,
            window_size: Some(window),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
            ],
            idle_browser_timeout: IDLE_BROWSER_TIMEOUT,
            ..Default::default()
        };
        Browser::new(launch_options)
    })
    .await
    .map_err(|e| EngineError::Browser(format!("launch task failed: {e}")))?
    .map_err(|e| EngineError::Browser(format!("browser launch failed: {e:#}")))
}

#[async_trait]
impl Session for BrowserSession {
    fn page(&self) -> &dyn Page {
        &self.page
    }

    fn mode(&self) -> String {
        self.mode.to_string()
    }

    async fn release(&self) -> EngineResult<()> {
        let tab = Arc::clone(&self.page.tab);
        let browser = self.browser.lock().ok().and_then(|mut b| b.take());
        tokio::task::spawn_blocking(move || {
            if let Err(err) = tab.close(true) {
                warn!("closing tab failed: {:#}", err);
            }
            // Dropping a launched browser stops its process; an attached one
            // keeps running.
            drop(browser);
        })
        .await
        .map_err(|e| EngineError::Browser(format!("release task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_reply_success_and_failure() {
        let ok = parse_engine_reply("count", Some(json!(r#"{"ok":true,"value":3}"#))).unwrap();
        assert_eq!(ok, json!(3));

        let err = parse_engine_reply(
            "count",
            Some(json!(r#"{"ok":false,"error":"':::bad' is not a valid selector"}"#)),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "browser error: ':::bad' is not a valid selector");

        assert!(matches!(
            parse_engine_reply("count", None),
            Err(EngineError::Browser(_))
        ));
    }

    fn status(ready: &str, inflight: u64, resources: u64) -> NetStatus {
        NetStatus {
            ready: ready.to_string(),
            inflight,
            resources,
        }
    }

    #[test]
    fn quiet_window_needs_no_requests_in_flight() {
        let start = Instant::now();
        let at = |ms| start + Duration::from_millis(ms);
        let mut window = QuietWindow::default();

        assert!(!window.observe(&status("complete", 2, 300), at(0)));
        assert!(!window.observe(&status("complete", 1, 300), at(600)));
        // A frozen resource count alone is not enough while requests run.
        assert!(!window.observe(&status("complete", 0, 300), at(1200)));
        assert!(!window.observe(&status("complete", 0, 300), at(1450)));
        assert!(window.observe(&status("complete", 0, 300), at(1700)));
    }

    #[test]
    fn quiet_window_restarts_on_new_activity() {
        let start = Instant::now();
        let at = |ms| start + Duration::from_millis(ms);
        let mut window = QuietWindow::default();

        assert!(!window.observe(&status("loading", 0, 0), at(0)));
        assert!(!window.observe(&status("complete", 0, 10), at(100)));
        assert!(!window.observe(&status("complete", 0, 11), at(700)));
        assert!(!window.observe(&status("complete", 0, 11), at(1000)));
        window.reset();
        assert!(!window.observe(&status("complete", 0, 11), at(1300)));
        assert!(window.observe(&status("complete", 0, 11), at(1800)));
    }

    #[test]
    fn status_reply_shape() {
        let s: NetStatus =
            serde_json::from_value(json!({"ready": "complete", "inflight": 0, "resources": 412}))
                .unwrap();
        assert_eq!((s.ready.as_str(), s.inflight, s.resources), ("complete", 0, 412));
    }

    #[test]
    fn parsed_once_past_loading() {
        assert!(!parsed(Some("loading")));
        assert!(parsed(Some("interactive")));
        assert!(parsed(Some("complete")));
        assert!(!parsed(None));
    }

    #[tokio::test]
    async fn websocket_endpoints_pass_through() {
        let ws = "ws://127.0.0.1:9222/devtools/browser/abc";
        assert_eq!(resolve_ws_endpoint(ws).await.unwrap(), ws);
    }

    #[tokio::test]
    async fn malformed_endpoint_is_a_browser_error() {
        let err = resolve_ws_endpoint("not a url").await.unwrap_err();
        assert!(matches!(err, EngineError::Browser(_)));
    }

    #[test]
    fn version_info_shape() {
        let info: VersionInfo = serde_json::from_str(
            r#"{"Browser":"Chrome/126","webSocketDebuggerUrl":"ws://127.0.0.1:9222/devtools/browser/x"}"#,
        )
        .unwrap();
        assert_eq!(info.web_socket_debugger_url, "ws://127.0.0.1:9222/devtools/browser/x");
    }
}
