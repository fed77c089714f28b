use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::locator::LocatorSpec;
use crate::plan::WaitState;

const STATE_POLL: Duration = Duration::from_millis(100);

/// A lazily evaluated query against the live document.
///
/// Holds no element handles: every operation re-runs the query, because the
/// document may have changed since the locator was built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Locator {
    #[serde(skip)]
    pub candidate: String,
    pub spec: LocatorSpec,
    /// `None` addresses every match; `Some(k)` only the k-th.
    pub nth: Option<usize>,
}

impl Locator {
    pub fn new(candidate: &str) -> Self {
        Self {
            candidate: candidate.trim().to_string(),
            spec: LocatorSpec::parse(candidate),
            nth: None,
        }
    }

    pub fn first(&self) -> Self {
        self.nth(0)
    }

    pub fn nth(&self, k: usize) -> Self {
        Self {
            nth: Some(k),
            ..self.clone()
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.nth {
            Some(k) => write!(f, "{} >> nth={}", self.spec, k),
            None => write!(f, "{}", self.spec),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ElementState {
    pub attached: bool,
    pub visible: bool,
}

impl ElementState {
    pub fn satisfies(&self, state: WaitState) -> bool {
        match state {
            WaitState::Visible => self.attached && self.visible,
            WaitState::Attached => self.attached,
            WaitState::Hidden => !self.attached || !self.visible,
            WaitState::Detached => !self.attached,
        }
    }
}

/// What a screenshot covers.
#[derive(Debug, Clone, Copy)]
pub enum Shot<'a> {
    Viewport,
    FullPage,
    Element(&'a Locator),
}

/// The live document a run drives.
///
/// Element-addressed operations act on the first element the locator
/// currently matches and fail with [`EngineError::Interaction`] when there is
/// none.
#[async_trait]
pub trait Page: Send + Sync {
    /// Load `url` and return once the initial document has been parsed.
    async fn goto(&self, url: &str) -> EngineResult<()>;

    /// Number of elements `spec` currently matches.
    async fn count(&self, spec: &LocatorSpec) -> EngineResult<usize>;

    async fn element_state(&self, locator: &Locator) -> EngineResult<ElementState>;

    async fn bounding_box(&self, locator: &Locator) -> EngineResult<Option<BoundingBox>>;

    /// Replace the element's value in one shot (no per-key events).
    async fn set_value(&self, locator: &Locator, value: &str) -> EngineResult<()>;

    /// Focus the element and send `text` as discrete keystrokes.
    async fn type_text(&self, locator: &Locator, text: &str, delay: Duration) -> EngineResult<()>;

    async fn click(&self, locator: &Locator) -> EngineResult<()>;

    async fn press(&self, locator: &Locator, key: &str) -> EngineResult<()>;

    /// Block until the network has been quiet for the idle window.
    async fn wait_network_idle(&self, timeout: Duration) -> EngineResult<()>;

    /// Run a script in the current document, ignoring its result.
    async fn evaluate(&self, script: &str) -> EngineResult<()>;

    /// Run `script` in every document loaded from now on.
    async fn add_init_script(&self, script: &str) -> EngineResult<()>;

    /// PNG bytes.
    async fn screenshot(&self, shot: Shot<'_>) -> EngineResult<Vec<u8>>;

    async fn url(&self) -> EngineResult<String>;
}

/// Poll until the located element reaches `state`, or fail with a timeout.
///
/// A failed read counts as "not yet": the document may be mid-navigation.
/// The last such error is reported with the timeout.
pub async fn wait_for_state(
    page: &dyn Page,
    locator: &Locator,
    state: WaitState,
    timeout: Duration,
) -> EngineResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_err: Option<EngineError> = None;
    loop {
        match page.element_state(locator).await {
            Ok(current) if current.satisfies(state) => return Ok(()),
            Ok(_) => last_err = None,
            Err(err) => {
                debug!("state of {} unavailable: {}", locator, err);
                last_err = Some(err);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            let mut what = format!("{} to be {}", locator, state.as_str());
            if let Some(err) = last_err {
                what.push_str(&format!(" (last error: {err})"));
            }
            return Err(EngineError::timeout(what, timeout.as_millis() as u64));
        }
        tokio::time::sleep(STATE_POLL).await;
    }
}

pub async fn is_visible(page: &dyn Page, locator: &Locator) -> EngineResult<bool> {
    Ok(page.element_state(locator).await?.visible)
}
