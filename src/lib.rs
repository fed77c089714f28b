//! Deterministic browser plan execution.
//!
//! A [`Plan`] names elements by logical key; a [`SelectorMap`] turns each key
//! into ranked locator candidates; a [`FormDataBag`] supplies the values
//! typed into fields. [`run_plan`] drives one browser session through the
//! plan and leaves screenshots (and optionally a step trace) behind.

pub mod diagnostics;
pub mod dom;
pub mod error;
pub mod fields;
pub mod hands;
pub mod interpreter;
pub mod locator;
pub mod options;
pub mod page;
pub mod plan;
pub mod profile;
pub mod resolver;
pub mod runner;
pub mod selectors;

#[cfg(test)]
pub mod testing;

pub use error::{EngineError, EngineResult};
pub use options::{RunOptions, ScreenshotMode};
pub use plan::{Action, Plan, PlanMeta, WaitState};
pub use profile::SiteProfile;
pub use runner::{RunReport, drive, run_plan};
pub use selectors::{FormDataBag, SelectorMap, merge_selector_maps};
