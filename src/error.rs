use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Failures surfaced by the execution engine.
///
/// Resolution misses never appear here: a candidate that matches nothing is
/// skipped, and the miss shows up downstream as a `Timeout` or `Interaction`
/// failure against an empty locator.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A wait did not reach its target state in time.
    #[error("timed out after {timeout_ms}ms waiting for {what}")]
    Timeout { what: String, timeout_ms: u64 },

    /// An interaction with a resolved element (or navigation) failed.
    #[error("{action} failed: {reason}")]
    Interaction { action: String, reason: String },

    /// The plan is structurally invalid; raised before execution starts.
    #[error("invalid plan: {0}")]
    PlanStructure(String),

    /// Session acquisition or browser protocol failure.
    #[error("browser error: {0}")]
    Browser(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The failure that aborted a run, tagged with the 1-based step index.
    #[error("step {index} ({action}) failed: {source}")]
    Step {
        index: usize,
        action: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    pub fn interaction(action: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        EngineError::Interaction {
            action: action.into(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(what: impl Into<String>, timeout_ms: u64) -> Self {
        EngineError::Timeout {
            what: what.into(),
            timeout_ms,
        }
    }

    /// The innermost failure, looking through `Step` wrappers.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Step { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), EngineError::Timeout { .. })
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Browser(format!("{:#}", err))
    }
}

/// Why a single locator candidate produced no usable match.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CandidateMiss {
    #[error("no element matched")]
    NoMatch,
    #[error("engine error: {0}")]
    Engine(String),
}
