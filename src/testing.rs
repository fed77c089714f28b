//! In-memory page and session used by the unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::locator::LocatorSpec;
use crate::page::{BoundingBox, ElementState, Locator, Page, Shot};
use crate::runner::Session;

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Goto(String),
    SetValue { element: String, value: String },
    Type { element: String, text: String },
    Click(String),
    Press { element: String, key: String },
    NetworkIdle(u64),
    Script(String),
    InitScript(String),
    Screenshot(String),
}

#[derive(Debug, Clone)]
struct FakeElement {
    visible: bool,
    value: String,
}

#[derive(Debug, Default)]
struct State {
    elements: BTreeMap<String, FakeElement>,
    /// Canonical spec -> element names, in document order.
    specs: BTreeMap<String, Vec<String>>,
    broken: BTreeSet<String>,
    failing_clicks: BTreeSet<String>,
    /// Upcoming `element_state` calls that fail before reading the document.
    state_errors: usize,
    url: Option<String>,
    ops: Vec<Op>,
}

/// Scripted [`Page`]. Candidates are registered per element; a locator
/// matches whatever elements were registered under its canonical form.
#[derive(Debug, Default)]
pub struct FakePage {
    state: Mutex<State>,
}

fn key(candidate: &str) -> String {
    LocatorSpec::parse(candidate).to_string()
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, name: &str, visible: bool, candidates: &[&str]) -> String {
        let mut st = self.state.lock().unwrap();
        st.elements.insert(
            name.to_string(),
            FakeElement {
                visible,
                value: String::new(),
            },
        );
        for cand in candidates {
            st.specs.entry(key(cand)).or_default().push(name.to_string());
        }
        name.to_string()
    }

    pub fn element(&self, name: &str, candidates: &[&str]) -> String {
        self.add(name, true, candidates)
    }

    pub fn hidden_element(&self, name: &str, candidates: &[&str]) -> String {
        self.add(name, false, candidates)
    }

    /// `n` visible elements named `name#1..=n`, all matched by `candidates`.
    pub fn group(&self, name: &str, n: usize, candidates: &[&str]) -> Vec<String> {
        (1..=n)
            .map(|k| self.element(&format!("{name}#{k}"), candidates))
            .collect()
    }

    /// Make counting this candidate fail the way an invalid selector does.
    pub fn broken_candidate(&self, candidate: &str) {
        self.state.lock().unwrap().broken.insert(key(candidate));
    }

    pub fn fail_clicks_on(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_clicks
            .insert(name.to_string());
    }

    /// Fail the next `n` state reads the way a navigating document does.
    pub fn fail_state_reads(&self, n: usize) {
        self.state.lock().unwrap().state_errors = n;
    }

    pub fn set_initial_value(&self, name: &str, value: &str) {
        if let Some(el) = self.state.lock().unwrap().elements.get_mut(name) {
            el.value = value.to_string();
        }
    }

    pub fn value(&self, name: &str) -> String {
        self.state
            .lock()
            .unwrap()
            .elements
            .get(name)
            .map(|el| el.value.clone())
            .unwrap_or_default()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn count_ops(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.state.lock().unwrap().ops.iter().filter(|op| pred(op)).count()
    }

    fn record(&self, op: Op) {
        self.state.lock().unwrap().ops.push(op);
    }

    fn resolve(&self, locator: &Locator) -> Option<String> {
        let st = self.state.lock().unwrap();
        let names = st.specs.get(&locator.spec.to_string())?;
        names.get(locator.nth.unwrap_or(0)).cloned()
    }

    fn require(&self, action: &str, locator: &Locator) -> EngineResult<String> {
        self.resolve(locator).ok_or_else(|| {
            EngineError::interaction(action, format!("no element matches {}", locator))
        })
    }
}

#[async_trait]
impl Page for FakePage {
    async fn goto(&self, url: &str) -> EngineResult<()> {
        self.state.lock().unwrap().url = Some(url.to_string());
        self.record(Op::Goto(url.to_string()));
        Ok(())
    }

    async fn count(&self, spec: &LocatorSpec) -> EngineResult<usize> {
        let st = self.state.lock().unwrap();
        let canonical = spec.to_string();
        if st.broken.contains(&canonical) {
            return Err(EngineError::Browser(format!("invalid selector {canonical}")));
        }
        Ok(st.specs.get(&canonical).map_or(0, Vec::len))
    }

    async fn element_state(&self, locator: &Locator) -> EngineResult<ElementState> {
        {
            let mut st = self.state.lock().unwrap();
            if st.state_errors > 0 {
                st.state_errors -= 1;
                return Err(EngineError::Browser(
                    "Execution context was destroyed".to_string(),
                ));
            }
        }
        let Some(name) = self.resolve(locator) else {
            return Ok(ElementState::default());
        };
        let st = self.state.lock().unwrap();
        Ok(ElementState {
            attached: true,
            visible: st.elements.get(&name).is_some_and(|el| el.visible),
        })
    }

    async fn bounding_box(&self, locator: &Locator) -> EngineResult<Option<BoundingBox>> {
        let state = self.element_state(locator).await?;
        Ok(state.visible.then_some(BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 120.0,
            height: 32.0,
        }))
    }

    async fn set_value(&self, locator: &Locator, value: &str) -> EngineResult<()> {
        let name = self.require("fill", locator)?;
        if let Some(el) = self.state.lock().unwrap().elements.get_mut(&name) {
            el.value = value.to_string();
        }
        self.record(Op::SetValue {
            element: name,
            value: value.to_string(),
        });
        Ok(())
    }

    async fn type_text(&self, locator: &Locator, text: &str, _delay: Duration) -> EngineResult<()> {
        let name = self.require("type", locator)?;
        if let Some(el) = self.state.lock().unwrap().elements.get_mut(&name) {
            el.value.push_str(text);
        }
        self.record(Op::Type {
            element: name,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn click(&self, locator: &Locator) -> EngineResult<()> {
        let name = self.require("click", locator)?;
        if self.state.lock().unwrap().failing_clicks.contains(&name) {
            return Err(EngineError::interaction("click", "element is not clickable"));
        }
        self.record(Op::Click(name));
        Ok(())
    }

    async fn press(&self, locator: &Locator, key: &str) -> EngineResult<()> {
        let name = self.require("press", locator)?;
        self.record(Op::Press {
            element: name,
            key: key.to_string(),
        });
        Ok(())
    }

    async fn wait_network_idle(&self, timeout: Duration) -> EngineResult<()> {
        self.record(Op::NetworkIdle(timeout.as_millis() as u64));
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> EngineResult<()> {
        self.record(Op::Script(script.to_string()));
        Ok(())
    }

    async fn add_init_script(&self, script: &str) -> EngineResult<()> {
        self.record(Op::InitScript(script.to_string()));
        Ok(())
    }

    async fn screenshot(&self, shot: Shot<'_>) -> EngineResult<Vec<u8>> {
        let label = match shot {
            Shot::Viewport => "viewport".to_string(),
            Shot::FullPage => "full".to_string(),
            Shot::Element(loc) => self.require("screenshot", loc)?,
        };
        self.record(Op::Screenshot(label));
        Ok(PNG_MAGIC.to_vec())
    }

    async fn url(&self) -> EngineResult<String> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .url
            .clone()
            .unwrap_or_else(|| "about:blank".to_string()))
    }
}

/// Session over a [`FakePage`] that counts releases.
#[derive(Debug, Default)]
pub struct FakeSession {
    pub page: FakePage,
    releases: AtomicUsize,
}

impl FakeSession {
    pub fn new(page: FakePage) -> Self {
        Self {
            page,
            releases: AtomicUsize::new(0),
        }
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for FakeSession {
    fn page(&self) -> &dyn Page {
        &self.page
    }

    fn mode(&self) -> String {
        "fake".to_string()
    }

    async fn release(&self) -> EngineResult<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
