use std::collections::{BTreeMap, HashSet};

use crate::error::EngineResult;

/// Logical key -> candidate locator strings, most robust first.
pub type SelectorMap = BTreeMap<String, Vec<String>>;

/// Value key -> string value substituted into fill/press steps.
pub type FormDataBag = BTreeMap<String, String>;

/// Logical keys the interpreter treats specially.
pub mod keys {
    pub const FULL_NAME: &str = "full_name";
    pub const FIRST_NAME: &str = "first_name";
    pub const LAST_NAME: &str = "last_name";
    pub const PASSWORD: &str = "password";
    pub const CONFIRM_PASSWORD: &str = "confirm_password";
    pub const OTP_INPUT: &str = "otp_input";
    pub const AUTH_MENU: &str = "auth_menu";
    pub const SIGNUP_MENU: &str = "signup_menu";
}

/// Candidates for `key`, or an empty slice when the map lacks it.
pub fn candidates<'a>(map: &'a SelectorMap, key: &str) -> &'a [String] {
    map.get(key).map(Vec::as_slice).unwrap_or(&[])
}

/// Merge oracle suggestions in front of a baseline map.
///
/// Every key of either map is kept. For shared keys the suggested
/// candidates come first; duplicates (compared trimmed) are dropped, first
/// occurrence wins.
pub fn merge_selector_maps(base: &SelectorMap, suggested: &SelectorMap) -> SelectorMap {
    let mut out = base.clone();
    for (key, proposed) in suggested {
        let existing = out.remove(key).unwrap_or_default();
        let mut seen = HashSet::new();
        let merged = proposed
            .iter()
            .chain(existing.iter())
            .filter(|c| seen.insert(c.trim().to_string()))
            .cloned()
            .collect();
        out.insert(key.clone(), merged);
    }
    out
}

pub fn load_selector_map(path: &std::path::Path) -> EngineResult<SelectorMap> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

pub fn load_data_bag(path: &std::path::Path) -> EngineResult<FormDataBag> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
