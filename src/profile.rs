//! Site profiles: what a plan for a given site may reference.
//!
//! A profile bundles the selector table for a site, the value keys a plan may
//! read from the data bag, optional default data, and an optional plan
//! template. Plans are checked against a profile before they run.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::plan::{Action, Plan};
use crate::selectors::{FormDataBag, SelectorMap};

const BUILTIN: [(&str, &str); 3] = [
    ("chaicode", include_str!("../profiles/chaicode.json")),
    ("gmail", include_str!("../profiles/gmail.json")),
    ("twitter", include_str!("../profiles/twitter.json")),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteProfile {
    pub name: String,
    pub site: String,
    pub selectors: SelectorMap,
    pub value_keys: Vec<String>,
    #[serde(default)]
    pub data: FormDataBag,
    #[serde(default)]
    pub template: Option<Plan>,
}

impl SiteProfile {
    pub fn from_json(input: &str) -> EngineResult<Self> {
        let profile: SiteProfile = serde_json::from_str(input)?;
        if let Some(plan) = profile.plan()? {
            plan.validate()?;
            plan.validate_against(&profile)?;
        }
        Ok(profile)
    }

    pub fn from_file(path: &Path) -> EngineResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Logical keys this profile can resolve.
    pub fn logical_keys(&self) -> impl Iterator<Item = &str> {
        self.selectors.keys().map(String::as_str)
    }

    /// The template, starting at the site root when it never navigates.
    pub fn plan(&self) -> EngineResult<Option<Plan>> {
        let Some(mut plan) = self.template.clone() else {
            return Ok(None);
        };
        plan.ensure_leading_navigate(&self.site)?;
        Ok(Some(plan))
    }
}

/// Look up a built-in profile by name.
pub fn builtin(name: &str) -> EngineResult<Option<SiteProfile>> {
    BUILTIN
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, json)| SiteProfile::from_json(json))
        .transpose()
}

pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTIN.iter().map(|(name, _)| *name)
}

pub fn builtins() -> EngineResult<Vec<SiteProfile>> {
    BUILTIN
        .iter()
        .map(|(_, json)| SiteProfile::from_json(json))
        .collect()
}

impl Plan {
    /// Reject steps that name a logical key or value key the profile lacks.
    pub fn validate_against(&self, profile: &SiteProfile) -> EngineResult<()> {
        for (i, step) in self.steps.iter().enumerate() {
            if let Some(selector) = step.selector()
                && !profile.selectors.contains_key(selector)
            {
                return Err(EngineError::PlanStructure(format!(
                    "step {}: unknown logical key {:?} for profile {}",
                    i + 1,
                    selector,
                    profile.name
                )));
            }
            if let Action::Fill { value_key, .. } = step
                && !profile.value_keys.iter().any(|k| k == value_key)
            {
                return Err(EngineError::PlanStructure(format!(
                    "step {}: unknown value key {:?} for profile {}",
                    i + 1,
                    value_key,
                    profile.name
                )));
            }
        }
        Ok(())
    }
}
