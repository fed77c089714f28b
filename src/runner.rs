//! Run orchestration: session lifecycle, step loop, failure evidence and the
//! optional keep-open hold.

use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::diagnostics::{ArtifactSink, TraceEntry, TraceRecorder};
use crate::dom;
use crate::error::{EngineError, EngineResult};
use crate::hands::BrowserSession;
use crate::interpreter::Interpreter;
use crate::options::RunOptions;
use crate::page::Page;
use crate::plan::Plan;
use crate::selectors::{FormDataBag, SelectorMap, keys};

/// Auto-close delay for keep-open when no terminal is attached.
const NO_TTY_GRACE: Duration = Duration::from_secs(15);

/// A browser page owned for the duration of one run.
#[async_trait]
pub trait Session: Send + Sync {
    fn page(&self) -> &dyn Page;

    /// Human-readable acquisition mode, for the run banner.
    fn mode(&self) -> String;

    /// Close whatever the session owns. Called exactly once per run.
    async fn release(&self) -> EngineResult<()>;
}

/// Releases a session at most once, whichever path gets there first.
pub struct ReleaseGuard<'a> {
    session: &'a dyn Session,
    released: AtomicBool,
}

impl<'a> ReleaseGuard<'a> {
    pub fn new(session: &'a dyn Session) -> Self {
        Self {
            session,
            released: AtomicBool::new(false),
        }
    }

    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.session.release().await {
            Ok(()) => info!("session closed"),
            Err(err) => warn!("session release failed: {}", err),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub steps_completed: usize,
    pub artifacts: Vec<PathBuf>,
    pub trace: Option<PathBuf>,
    pub duration: Duration,
}

/// Acquire a browser session for `options` and execute `plan` in it.
pub async fn run_plan(
    plan: &Plan,
    selectors: &SelectorMap,
    data: &FormDataBag,
    options: &RunOptions,
) -> EngineResult<RunReport> {
    plan.validate()?;
    let session = BrowserSession::open(options).await?;
    drive(&session, plan, selectors, data, options).await
}

/// Execute `plan` in an already acquired session, then release it.
pub async fn drive(
    session: &dyn Session,
    plan: &Plan,
    selectors: &SelectorMap,
    data: &FormDataBag,
    options: &RunOptions,
) -> EngineResult<RunReport> {
    let guard = ReleaseGuard::new(session);
    let started = Instant::now();
    info!(
        "running {:?} on {} | mode={} viewport={}x{} steps={}",
        plan.meta.goal,
        plan.meta.site,
        session.mode(),
        options.viewport.width,
        options.viewport.height,
        plan.steps.len()
    );

    let sink = ArtifactSink::from_options(options);
    let mut trace = TraceRecorder::new(options.enable_tracing, sink.dir());
    let outcome = execute_steps(session.page(), plan, selectors, data, options, &sink, &mut trace).await;

    let trace_path = match trace.flush().await {
        Ok(path) => path,
        Err(err) => {
            warn!("trace not saved: {}", err);
            None
        }
    };

    let result = match outcome {
        Ok((steps_completed, artifacts)) => {
            info!(
                "completed {} steps in {}ms",
                steps_completed,
                started.elapsed().as_millis()
            );
            hold(options, &guard, std::io::stdin().is_terminal()).await;
            Ok(RunReport {
                steps_completed,
                artifacts,
                trace: trace_path,
                duration: started.elapsed(),
            })
        }
        Err(err) => Err(err),
    };
    guard.release().await;
    result
}

async fn execute_steps(
    page: &dyn Page,
    plan: &Plan,
    selectors: &SelectorMap,
    data: &FormDataBag,
    options: &RunOptions,
    sink: &ArtifactSink,
    trace: &mut TraceRecorder,
) -> EngineResult<(usize, Vec<PathBuf>)> {
    sink.prepare().await?;
    if options.disable_animations {
        page.add_init_script(dom::SUPPRESS_ANIMATIONS_JS).await?;
    }

    let explicit_confirm = plan.fills(keys::CONFIRM_PASSWORD);
    let mut interpreter = Interpreter::new(page, selectors, data, sink, options, explicit_confirm);
    let mut artifacts = Vec::new();
    let total = plan.steps.len();

    for (i, action) in plan.steps.iter().enumerate() {
        info!("[{}/{}] {} -> {}", i + 1, total, action.kind(), action.to_log_json());
        let started_at = Utc::now();
        let started = Instant::now();

        match interpreter.execute(i, action).await {
            Ok(saved) => {
                let elapsed = started.elapsed();
                info!("   step done in {}ms", elapsed.as_millis());
                trace.record(TraceEntry {
                    step: i + 1,
                    action: action.clone(),
                    started_at,
                    duration_ms: elapsed.as_millis() as u64,
                    outcome: "ok".to_string(),
                    artifacts: saved.clone(),
                    url: page.url().await.ok(),
                });
                artifacts.extend(saved);
                if !options.step_delay().is_zero() {
                    tokio::time::sleep(options.step_delay()).await;
                }
            }
            Err(err) => {
                let elapsed = started.elapsed();
                error!(
                    "   step {} failed after {}ms: {} | action={}",
                    i + 1,
                    elapsed.as_millis(),
                    err,
                    action.to_log_json()
                );
                let mut evidence = Vec::new();
                match sink.capture_error(page, i + 1).await {
                    Ok(path) => {
                        error!("   saved {}", path.display());
                        evidence.push(path);
                    }
                    Err(shot_err) => warn!("   error screenshot failed: {}", shot_err),
                }
                trace.record(TraceEntry {
                    step: i + 1,
                    action: action.clone(),
                    started_at,
                    duration_ms: elapsed.as_millis() as u64,
                    outcome: format!("error: {}", err),
                    artifacts: evidence,
                    url: page.url().await.ok(),
                });
                return Err(EngineError::Step {
                    index: i + 1,
                    action: action.kind().to_string(),
                    source: Box::new(err),
                });
            }
        }
    }
    Ok((total, artifacts))
}

/// Post-run hold. Keep-open waits for the operator (or the no-terminal
/// grace period); a fixed hold just sleeps. Either way an interrupt ends it
/// early.
async fn hold(options: &RunOptions, guard: &ReleaseGuard<'_>, interactive: bool) {
    if options.keep_open {
        let stop = CancellationToken::new();
        spawn_close_triggers(stop.clone(), interactive);
        stop.cancelled().await;
        guard.release().await;
        return;
    }
    if let Some(ms) = options.keep_open_ms.filter(|ms| *ms > 0) {
        info!("keeping browser open for {}ms", ms);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            _ = tokio::signal::ctrl_c() => info!("interrupted, closing"),
        }
    }
}

/// Cancel `stop` on Ctrl+C, on `q`/Enter from an interactive terminal, or
/// after a grace period when stdin is not a terminal.
fn spawn_close_triggers(stop: CancellationToken, interactive: bool) {
    let on_signal = stop.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = on_signal.cancelled() => {}
            res = tokio::signal::ctrl_c() => {
                if res.is_ok() {
                    info!("interrupted, closing");
                }
                on_signal.cancel();
            }
        }
    });

    if interactive {
        info!("keep-open: press 'q' or Enter to close, or Ctrl+C");
        // A detached thread: a blocking read must not hold up runtime shutdown.
        let on_key = stop;
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if is_quit_input(&line) {
                    break;
                }
                if on_key.is_cancelled() {
                    return;
                }
            }
            on_key.cancel();
        });
    } else {
        info!(
            "keep-open: no terminal attached, closing in {}s",
            NO_TTY_GRACE.as_secs()
        );
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(NO_TTY_GRACE) => stop.cancel(),
            }
        });
    }
}

fn is_quit_input(line: &str) -> bool {
    matches!(line.trim(), "" | "q" | "Q")
}
