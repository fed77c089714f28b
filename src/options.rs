use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

pub const ENV_CDP_ENDPOINT: &str = "CHROME_CDP";
pub const ENV_ARTIFACTS_DIR: &str = "PLAN_RUNNER_ARTIFACTS";

const HEADFUL_SLOW_MO_MS: u64 = 1200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum ScreenshotMode {
    /// The acted-on element, or the viewport when the step has none.
    #[default]
    Element,
    Viewport,
    #[value(name = "fullPage")]
    FullPage,
    /// Element (or viewport) plus full page.
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1600,
            height: 1000,
        }
    }
}

/// How a session is acquired. Derived from [`RunOptions`], one per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    Attach(String),
    Persistent(PathBuf),
    Launch { headless: bool },
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Attach(_) => write!(f, "cdp-attach"),
            SessionMode::Persistent(_) => write!(f, "persistent-chrome"),
            SessionMode::Launch { headless: true } => write!(f, "headless"),
            SessionMode::Launch { headless: false } => write!(f, "headful"),
        }
    }
}

/// Per-run configuration. Fixed for the duration of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunOptions {
    pub headless: bool,
    /// Pause before every interaction; defaults to 0 headless, 1200ms headful.
    pub slow_mo_ms: Option<u64>,
    pub step_delay_ms: u64,
    pub viewport: Viewport,
    pub keep_open: bool,
    pub keep_open_ms: Option<u64>,
    pub screenshot_mode: ScreenshotMode,
    pub screenshot_settle_ms: u64,
    pub disable_animations: bool,
    pub enable_tracing: bool,
    pub enable_highlight: bool,
    pub human_typing: bool,
    pub typing_delay_ms: u64,
    /// How long element-addressed interactions wait for their target.
    pub action_timeout_ms: u64,
    pub user_data_dir: Option<PathBuf>,
    pub executable_path: Option<PathBuf>,
    /// Remote-debugging endpoint (`http://host:port` or `ws://...`).
    pub connect_endpoint: Option<String>,
    pub artifacts_dir: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            headless: true,
            slow_mo_ms: None,
            step_delay_ms: 800,
            viewport: Viewport::default(),
            keep_open: false,
            keep_open_ms: None,
            screenshot_mode: ScreenshotMode::Element,
            screenshot_settle_ms: 160,
            disable_animations: true,
            enable_tracing: true,
            enable_highlight: true,
            human_typing: false,
            typing_delay_ms: 100,
            action_timeout_ms: crate::plan::DEFAULT_WAIT_TIMEOUT_MS,
            user_data_dir: None,
            executable_path: None,
            connect_endpoint: None,
            artifacts_dir: PathBuf::from("artifacts"),
        }
    }
}

impl RunOptions {
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Layer environment settings under anything already set explicitly.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if self.connect_endpoint.is_none()
            && let Some(endpoint) = var(ENV_CDP_ENDPOINT).filter(|v| !v.trim().is_empty())
        {
            self.connect_endpoint = Some(endpoint.trim().to_string());
        }
        if let Some(dir) = var(ENV_ARTIFACTS_DIR).filter(|v| !v.trim().is_empty()) {
            self.artifacts_dir = PathBuf::from(dir);
        }
    }

    /// Attach endpoint beats a persistent profile, which beats a fresh launch.
    pub fn session_mode(&self) -> SessionMode {
        if let Some(endpoint) = &self.connect_endpoint {
            return SessionMode::Attach(endpoint.clone());
        }
        if let Some(dir) = &self.user_data_dir {
            return SessionMode::Persistent(dir.clone());
        }
        SessionMode::Launch {
            headless: self.headless,
        }
    }

    pub fn slow_mo(&self) -> Duration {
        let default = if self.headless { 0 } else { HEADFUL_SLOW_MO_MS };
        Duration::from_millis(self.slow_mo_ms.unwrap_or(default))
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub fn typing_delay(&self) -> Duration {
        Duration::from_millis(self.typing_delay_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}
