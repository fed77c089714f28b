use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::dom;
use crate::error::EngineResult;
use crate::options::{RunOptions, ScreenshotMode};
use crate::page::{Locator, Page, Shot};
use crate::plan::Action;

const HIGHLIGHT_COLORS: [&str; 5] = [
    "rgba(255,0,0,.85)",
    "rgba(0,200,0,.85)",
    "rgba(0,0,255,.85)",
    "rgba(255,165,0,.85)",
    "rgba(128,0,128,.85)",
];

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("static regex"));

pub fn highlight_color(step_index: usize) -> &'static str {
    HIGHLIGHT_COLORS[step_index % HIGHLIGHT_COLORS.len()]
}

/// Outline the element `locator` points at. Cosmetic: an element without a
/// box is silently skipped.
pub async fn highlight(
    page: &dyn Page,
    locator: &Locator,
    step_index: usize,
    enabled: bool,
) -> EngineResult<()> {
    if !enabled {
        return Ok(());
    }
    let Some(bbox) = page.bounding_box(locator).await? else {
        return Ok(());
    };
    page.evaluate(&dom::overlay_script(&bbox, highlight_color(step_index)))
        .await
}

pub fn safe_slug(input: &str) -> String {
    UNSAFE_CHARS.replace_all(input, "_").into_owned()
}

/// `step-<NN>-<action>[-<selector>]`, with a 1-based, two-digit index.
pub fn step_base(step_index: usize, action_type: &str, selector: Option<&str>) -> String {
    let mut base = format!("step-{:02}-{}", step_index + 1, action_type);
    if let Some(sel) = selector.filter(|s| !s.is_empty()) {
        base.push('-');
        base.push_str(&safe_slug(sel));
    }
    base
}

pub fn error_file_name(step_number: usize) -> String {
    format!("error-step-{:02}.png", step_number)
}

/// Writes per-step screenshots into the artifacts directory.
#[derive(Debug, Clone)]
pub struct ArtifactSink {
    dir: PathBuf,
    mode: ScreenshotMode,
    settle: Duration,
}

impl ArtifactSink {
    pub fn new(dir: impl Into<PathBuf>, mode: ScreenshotMode, settle: Duration) -> Self {
        Self {
            dir: dir.into(),
            mode,
            settle,
        }
    }

    pub fn from_options(options: &RunOptions) -> Self {
        Self::new(
            options.artifacts_dir.clone(),
            options.screenshot_mode,
            Duration::from_millis(options.screenshot_settle_ms),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn prepare(&self) -> EngineResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn save(&self, page: &dyn Page, shot: Shot<'_>, name: String) -> EngineResult<PathBuf> {
        let bytes = page.screenshot(shot).await?;
        let path = self.dir.join(name);
        tokio::fs::write(&path, bytes).await?;
        info!("   saved {}", path.display());
        Ok(path)
    }

    /// Capture evidence for one step according to the screenshot mode.
    pub async fn capture(
        &self,
        page: &dyn Page,
        step_index: usize,
        action_type: &str,
        selector: Option<&str>,
        locator: Option<&Locator>,
    ) -> EngineResult<Vec<PathBuf>> {
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        let base = step_base(step_index, action_type, selector);
        let mut saved = Vec::new();

        if matches!(self.mode, ScreenshotMode::Element | ScreenshotMode::Both) {
            match locator {
                Some(loc) => {
                    saved.push(
                        self.save(page, Shot::Element(loc), format!("{base}-elem.png"))
                            .await?,
                    );
                }
                None => {
                    saved.push(self.save(page, Shot::Viewport, format!("{base}-view.png")).await?);
                }
            }
        }
        if self.mode == ScreenshotMode::Viewport {
            saved.push(self.save(page, Shot::Viewport, format!("{base}-view.png")).await?);
        }
        if matches!(self.mode, ScreenshotMode::FullPage | ScreenshotMode::Both) {
            saved.push(self.save(page, Shot::FullPage, format!("{base}-full.png")).await?);
        }
        Ok(saved)
    }

    /// Viewport capture for a failed step, regardless of mode.
    pub async fn capture_error(&self, page: &dyn Page, step_number: usize) -> EngineResult<PathBuf> {
        self.save(page, Shot::Viewport, error_file_name(step_number))
            .await
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub step: usize,
    pub action: Action,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: String,
    pub artifacts: Vec<PathBuf>,
    pub url: Option<String>,
}

/// Session-long step trace, written as `trace.json` on flush.
#[derive(Debug, Default)]
pub struct TraceRecorder {
    path: Option<PathBuf>,
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    pub fn new(enabled: bool, dir: &Path) -> Self {
        Self {
            path: enabled.then(|| dir.join("trace.json")),
            entries: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn record(&mut self, entry: TraceEntry) {
        if self.is_enabled() {
            self.entries.push(entry);
        }
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub async fn flush(&self) -> EngineResult<Option<PathBuf>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let json = serde_json::to_vec_pretty(&self.entries)?;
        if let Err(err) = tokio::fs::write(path, json).await {
            warn!("could not write trace {}: {}", path.display(), err);
            return Err(err.into());
        }
        info!("trace saved {}", path.display());
        Ok(Some(path.clone()))
    }
}
