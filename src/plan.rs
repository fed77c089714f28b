use serde::{Deserialize, Serialize};
use serde_json::Number;

use crate::error::{EngineError, EngineResult};

pub const MAX_PLAN_STEPS: usize = 50;
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 15_000;

/// Presence state a `waitFor` step blocks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitState {
    #[default]
    Visible,
    Attached,
    Hidden,
    Detached,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Visible => "visible",
            WaitState::Attached => "attached",
            WaitState::Hidden => "hidden",
            WaitState::Detached => "detached",
        }
    }
}

/// A single typed step of a plan.
///
/// Selectors are logical keys into a [`SelectorMap`](crate::selectors::SelectorMap),
/// never raw locators. `timeout: None` means "use the engine default".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub enum Action {
    Navigate {
        url: String,
    },
    WaitFor {
        selector: String,
        state: WaitState,
        timeout: Option<u64>,
    },
    Fill {
        selector: String,
        value_key: String,
    },
    Click {
        selector: String,
    },
    Press {
        selector: String,
        key: String,
    },
    WaitNetworkIdle {
        timeout: Option<u64>,
    },
}

impl Action {
    /// Wire name of the action type, also used in artifact names.
    pub fn kind(&self) -> &'static str {
        self.action_kind().as_str()
    }

    pub fn selector(&self) -> Option<&str> {
        match self {
            Action::WaitFor { selector, .. }
            | Action::Fill { selector, .. }
            | Action::Click { selector }
            | Action::Press { selector, .. } => Some(selector),
            Action::Navigate { .. } | Action::WaitNetworkIdle { .. } => None,
        }
    }

    fn action_kind(&self) -> ActionKind {
        match self {
            Action::Navigate { .. } => ActionKind::Navigate,
            Action::WaitFor { .. } => ActionKind::WaitFor,
            Action::Fill { .. } => ActionKind::Fill,
            Action::Click { .. } => ActionKind::Click,
            Action::Press { .. } => ActionKind::Press,
            Action::WaitNetworkIdle { .. } => ActionKind::WaitNetworkIdle,
        }
    }

    /// Compact JSON for log lines.
    pub fn to_log_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum ActionKind {
    Navigate,
    WaitFor,
    Fill,
    Click,
    Press,
    WaitNetworkIdle,
}

impl ActionKind {
    fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Navigate => "navigate",
            ActionKind::WaitFor => "waitFor",
            ActionKind::Fill => "fill",
            ActionKind::Click => "click",
            ActionKind::Press => "press",
            ActionKind::WaitNetworkIdle => "waitNetworkIdle",
        }
    }
}

/// Uniform wire shape of a step: every field present, `null` when it does
/// not apply. Parsing also accepts the minimal tagged shape with fields
/// omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawStep {
    #[serde(rename = "type")]
    kind: ActionKind,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    state: Option<WaitState>,
    #[serde(default, rename = "valueKey")]
    value_key: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    timeout: Option<Number>,
}

impl RawStep {
    fn empty(kind: ActionKind) -> Self {
        Self {
            kind,
            url: None,
            selector: None,
            state: None,
            value_key: None,
            key: None,
            timeout: None,
        }
    }
}

fn required(field: Option<String>, name: &str, kind: ActionKind) -> Result<String, String> {
    field.ok_or_else(|| format!("{} step is missing `{}`", kind.as_str(), name))
}

fn timeout_ms(value: Option<Number>) -> Result<Option<u64>, String> {
    let Some(n) = value else {
        return Ok(None);
    };
    if let Some(ms) = n.as_u64() {
        return Ok(Some(ms));
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f >= 0.0 => Ok(Some(f.round() as u64)),
        _ => Err(format!("timeout must be a non-negative number, got {}", n)),
    }
}

impl TryFrom<RawStep> for Action {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let kind = raw.kind;
        Ok(match kind {
            ActionKind::Navigate => Action::Navigate {
                url: required(raw.url, "url", kind)?,
            },
            ActionKind::WaitFor => Action::WaitFor {
                selector: required(raw.selector, "selector", kind)?,
                state: raw.state.unwrap_or_default(),
                timeout: timeout_ms(raw.timeout)?,
            },
            ActionKind::Fill => Action::Fill {
                selector: required(raw.selector, "selector", kind)?,
                value_key: required(raw.value_key, "valueKey", kind)?,
            },
            ActionKind::Click => Action::Click {
                selector: required(raw.selector, "selector", kind)?,
            },
            ActionKind::Press => Action::Press {
                selector: required(raw.selector, "selector", kind)?,
                key: required(raw.key, "key", kind)?,
            },
            ActionKind::WaitNetworkIdle => Action::WaitNetworkIdle {
                timeout: timeout_ms(raw.timeout)?,
            },
        })
    }
}

impl From<Action> for RawStep {
    fn from(action: Action) -> Self {
        let mut raw = RawStep::empty(action.action_kind());
        match action {
            Action::Navigate { url } => raw.url = Some(url),
            Action::WaitFor {
                selector,
                state,
                timeout,
            } => {
                raw.selector = Some(selector);
                raw.state = Some(state);
                raw.timeout = timeout.map(Number::from);
            }
            Action::Fill {
                selector,
                value_key,
            } => {
                raw.selector = Some(selector);
                raw.value_key = Some(value_key);
            }
            Action::Click { selector } => raw.selector = Some(selector),
            Action::Press { selector, key } => {
                raw.selector = Some(selector);
                raw.key = Some(key);
            }
            Action::WaitNetworkIdle { timeout } => raw.timeout = timeout.map(Number::from),
        }
        raw
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMeta {
    pub site: String,
    pub goal: String,
}

/// An ordered sequence of actions plus metadata; the unit of execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub meta: PlanMeta,
    pub steps: Vec<Action>,
}

impl Plan {
    /// Parse the external JSON contract and reject structurally invalid plans.
    pub fn from_json(input: &str) -> EngineResult<Self> {
        let plan = Self::parse(input)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Like [`Plan::from_json`], but a plan that never navigates first gets
    /// a step to `meta.site`. Validation sees the plan as it will run.
    pub fn from_json_at_site(input: &str) -> EngineResult<Self> {
        let mut plan = Self::parse(input)?;
        plan.start_at_site()?;
        plan.validate()?;
        Ok(plan)
    }

    fn parse(input: &str) -> EngineResult<Self> {
        serde_json::from_str(input).map_err(|e| EngineError::PlanStructure(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Structural checks that must pass before any step runs.
    pub fn validate(&self) -> EngineResult<()> {
        if self.steps.is_empty() || self.steps.len() > MAX_PLAN_STEPS {
            return Err(EngineError::PlanStructure(format!(
                "plan must have 1..={} steps, got {}",
                MAX_PLAN_STEPS,
                self.steps.len()
            )));
        }
        for (i, step) in self.steps.iter().enumerate() {
            match step {
                Action::Navigate { url } => {
                    url::Url::parse(url).map_err(|e| {
                        EngineError::PlanStructure(format!(
                            "step {}: invalid url {:?}: {}",
                            i + 1,
                            url,
                            e
                        ))
                    })?;
                }
                other => {
                    if other.selector().is_some_and(|s| s.trim().is_empty()) {
                        return Err(EngineError::PlanStructure(format!(
                            "step {}: empty selector",
                            i + 1
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Prepend a navigate step when the plan never navigates anywhere.
    /// Fails when the plan has no room left for it.
    pub fn ensure_leading_navigate(&mut self, url: &str) -> EngineResult<()> {
        let navigates = self
            .steps
            .iter()
            .any(|s| matches!(s, Action::Navigate { .. }));
        if navigates {
            return Ok(());
        }
        if self.steps.len() >= MAX_PLAN_STEPS {
            return Err(EngineError::PlanStructure(format!(
                "plan never navigates and already has {} steps; starting at {} would exceed {}. \
                 Add a navigate step or drop one",
                self.steps.len(),
                url,
                MAX_PLAN_STEPS
            )));
        }
        self.steps.insert(
            0,
            Action::Navigate {
                url: url.to_string(),
            },
        );
        Ok(())
    }

    /// Start at `meta.site` when it is a URL and the plan never navigates.
    pub fn start_at_site(&mut self) -> EngineResult<()> {
        if url::Url::parse(&self.meta.site).is_err() {
            return Ok(());
        }
        let site = self.meta.site.clone();
        self.ensure_leading_navigate(&site)
    }

    /// True if some `fill` step targets `selector` directly.
    pub fn fills(&self, selector: &str) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, Action::Fill { selector: sel, .. } if sel == selector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Plan {
        Plan {
            meta: PlanMeta {
                site: "https://ui.chaicode.com".into(),
                goal: "signup".into(),
            },
            steps: vec![
                Action::Navigate {
                    url: "https://ui.chaicode.com".into(),
                },
                Action::WaitFor {
                    selector: "auth_menu".into(),
                    state: WaitState::Visible,
                    timeout: None,
                },
                Action::Fill {
                    selector: "email".into(),
                    value_key: "email".into(),
                },
                Action::Press {
                    selector: "email".into(),
                    key: "Enter".into(),
                },
                Action::WaitNetworkIdle {
                    timeout: Some(20000),
                },
            ],
        }
    }

    #[test]
    fn round_trip_preserves_steps() {
        let plan = sample();
        let text = plan.to_json_pretty().unwrap();
        let back = Plan::from_json(&text).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn serializes_uniform_shape_with_nulls() {
        let value = serde_json::to_value(Action::Click {
            selector: "submit".into(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "click",
                "url": null,
                "selector": "submit",
                "state": null,
                "valueKey": null,
                "key": null,
                "timeout": null
            })
        );
    }

    #[test]
    fn omitted_optionals_take_defaults() {
        let action: Action =
            serde_json::from_value(json!({"type": "waitFor", "selector": "submit"})).unwrap();
        assert_eq!(
            action,
            Action::WaitFor {
                selector: "submit".into(),
                state: WaitState::Visible,
                timeout: None,
            }
        );

        let flat: Action = serde_json::from_value(json!({
            "type": "waitFor", "url": null, "selector": "otp_input", "state": null,
            "valueKey": null, "key": null, "timeout": 15000.0
        }))
        .unwrap();
        assert_eq!(
            flat,
            Action::WaitFor {
                selector: "otp_input".into(),
                state: WaitState::Visible,
                timeout: Some(15000),
            }
        );
    }

    #[test]
    fn rejects_unknown_type_and_missing_fields() {
        let unknown = r#"{"meta":{"site":"s","goal":"g"},"steps":[{"type":"hover","selector":"x"}]}"#;
        assert!(matches!(
            Plan::from_json(unknown),
            Err(EngineError::PlanStructure(_))
        ));

        let missing = r#"{"meta":{"site":"s","goal":"g"},"steps":[{"type":"fill","selector":"email"}]}"#;
        let err = Plan::from_json(missing).unwrap_err();
        assert!(err.to_string().contains("valueKey"), "{err}");
    }

    #[test]
    fn rejects_empty_and_oversized_plans() {
        let mut plan = sample();
        plan.steps.clear();
        assert!(plan.validate().is_err());

        plan.steps = vec![
            Action::Click {
                selector: "submit".into()
            };
            MAX_PLAN_STEPS + 1
        ];
        assert!(plan.validate().is_err());
    }

    #[test]
    fn rejects_bad_navigate_url() {
        let mut plan = sample();
        plan.steps[0] = Action::Navigate {
            url: "not a url".into(),
        };
        assert!(matches!(
            plan.validate(),
            Err(EngineError::PlanStructure(_))
        ));
    }

    #[test]
    fn leading_navigate_only_added_when_missing() {
        let mut plan = sample();
        plan.ensure_leading_navigate("https://example.com").unwrap();
        assert_eq!(plan.steps.len(), 5);

        plan.steps.remove(0);
        plan.ensure_leading_navigate("https://example.com").unwrap();
        assert_eq!(
            plan.steps[0],
            Action::Navigate {
                url: "https://example.com".into()
            }
        );
    }

    fn clicks(n: usize) -> String {
        let steps = vec![json!({"type": "click", "selector": "submit"}); n];
        json!({"meta": {"site": "https://ui.chaicode.com", "goal": "g"}, "steps": steps}).to_string()
    }

    #[test]
    fn full_plan_without_navigate_is_rejected_at_load() {
        let text = clicks(MAX_PLAN_STEPS);
        assert!(Plan::from_json(&text).is_ok());

        let err = Plan::from_json_at_site(&text).unwrap_err();
        assert!(matches!(err, EngineError::PlanStructure(_)));
        assert!(err.to_string().contains("never navigates"), "{err}");
    }

    #[test]
    fn site_start_is_added_before_validation() {
        let plan = Plan::from_json_at_site(&clicks(MAX_PLAN_STEPS - 1)).unwrap();
        assert_eq!(plan.steps.len(), MAX_PLAN_STEPS);
        assert_eq!(
            plan.steps[0],
            Action::Navigate {
                url: "https://ui.chaicode.com".into()
            }
        );

        let mut no_site = Plan::from_json(&clicks(3)).unwrap();
        no_site.meta.site = "chaicode".into();
        no_site.start_at_site().unwrap();
        assert_eq!(no_site.steps.len(), 3);
    }

    #[test]
    fn kind_names_match_wire_names() {
        let plan = sample();
        let kinds: Vec<_> = plan.steps.iter().map(Action::kind).collect();
        assert_eq!(
            kinds,
            ["navigate", "waitFor", "fill", "press", "waitNetworkIdle"]
        );
        assert!(plan.fills("email"));
        assert!(!plan.fills("confirm_password"));
    }
}
