//! Fill strategies.
//!
//! Workflow-specific field handling lives here as a chain tried in a fixed
//! order; the first strategy that reports [`FillOutcome::Handled`] wins. The
//! last link, [`DefaultFill`], always handles the step.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::diagnostics::{ArtifactSink, highlight};
use crate::error::EngineResult;
use crate::page::{Locator, Page};
use crate::resolver::{best_group_locator, first_existing_locator, get_locator};
use crate::selectors::{FormDataBag, SelectorMap, candidates, keys};

/// Element counts accepted as a one-character-per-box passcode group.
const OTP_GROUP_SIZES: std::ops::RangeInclusive<usize> = 2..=8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Handled,
    Declined,
}

#[derive(Debug, Clone, Copy)]
pub struct Typing {
    /// Send keystrokes instead of setting the value at once.
    pub human: bool,
    pub delay: Duration,
}

/// Tracks whether the confirm-password field has been dealt with.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfirmState {
    /// The plan fills `confirm_password` itself somewhere.
    pub explicit_in_plan: bool,
    pub filled: bool,
}

pub struct FillContext<'a> {
    pub page: &'a dyn Page,
    pub selectors: &'a SelectorMap,
    pub data: &'a FormDataBag,
    pub sink: &'a ArtifactSink,
    pub step_index: usize,
    pub typing: Typing,
    pub highlight: bool,
    pub confirm: &'a mut ConfirmState,
    pub artifacts: Vec<PathBuf>,
}

impl FillContext<'_> {
    /// Bag value for `key`; a missing key reads as empty.
    pub fn value(&self, key: &str) -> String {
        self.data.get(key).cloned().unwrap_or_default()
    }

    pub fn candidates(&self, key: &str) -> &[String] {
        candidates(self.selectors, key)
    }

    /// Highlight, clear, then type or set `value`, and capture the field.
    pub async fn commit(&mut self, locator: &Locator, value: &str, label: &str) -> EngineResult<()> {
        highlight(self.page, locator, self.step_index, self.highlight).await?;
        self.page.set_value(locator, "").await?;
        if self.typing.human {
            self.page
                .type_text(locator, value, self.typing.delay)
                .await?;
        } else {
            self.page.set_value(locator, value).await?;
        }
        let saved = self
            .sink
            .capture(self.page, self.step_index, "fill", Some(label), Some(locator))
            .await?;
        self.artifacts.extend(saved);
        Ok(())
    }
}

#[async_trait]
pub trait FieldStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fill(
        &self,
        cx: &mut FillContext<'_>,
        selector: &str,
        value_key: &str,
    ) -> EngineResult<FillOutcome>;
}

/// The built-in chain, in priority order.
pub fn default_chain() -> Vec<Box<dyn FieldStrategy>> {
    vec![
        Box::new(FullNameSplit),
        Box::new(ConfirmPassword),
        Box::new(OtpGroup),
        Box::new(DefaultFill),
    ]
}

/// Split a full name across separate first/last fields when the page has
/// both; otherwise let the generic fill target the full-name field.
pub struct FullNameSplit;

/// First token, then the remaining tokens joined by single spaces.
pub fn split_full_name(value: &str) -> (String, String) {
    let mut parts = value.split_whitespace();
    let first = parts.next().unwrap_or_default().to_string();
    let rest = parts.collect::<Vec<_>>().join(" ");
    (first, rest)
}

#[async_trait]
impl FieldStrategy for FullNameSplit {
    fn name(&self) -> &'static str {
        "full-name-split"
    }

    async fn fill(
        &self,
        cx: &mut FillContext<'_>,
        selector: &str,
        value_key: &str,
    ) -> EngineResult<FillOutcome> {
        if selector != keys::FULL_NAME {
            return Ok(FillOutcome::Declined);
        }
        let first_loc = first_existing_locator(cx.page, cx.candidates(keys::FIRST_NAME)).await;
        let last_loc = first_existing_locator(cx.page, cx.candidates(keys::LAST_NAME)).await;
        let (Some(first_loc), Some(last_loc)) = (first_loc, last_loc) else {
            return Ok(FillOutcome::Declined);
        };

        let (first, last) = split_full_name(&cx.value(value_key));
        cx.commit(&first_loc, &first, keys::FIRST_NAME).await?;
        cx.commit(&last_loc, &last, keys::LAST_NAME).await?;
        Ok(FillOutcome::Handled)
    }
}

/// Explicit confirm-password step; marks confirmation as done so the
/// password step never synthesizes a second fill.
pub struct ConfirmPassword;

#[async_trait]
impl FieldStrategy for ConfirmPassword {
    fn name(&self) -> &'static str {
        "confirm-password"
    }

    async fn fill(
        &self,
        cx: &mut FillContext<'_>,
        selector: &str,
        value_key: &str,
    ) -> EngineResult<FillOutcome> {
        if selector != keys::CONFIRM_PASSWORD {
            return Ok(FillOutcome::Declined);
        }
        let locator = get_locator(cx.page, cx.candidates(selector)).await;
        let value = cx
            .data
            .get(value_key)
            .or_else(|| cx.data.get(keys::CONFIRM_PASSWORD))
            .cloned()
            .unwrap_or_default();
        cx.commit(&locator, &value, selector).await?;
        cx.confirm.filled = true;
        Ok(FillOutcome::Handled)
    }
}

/// One character per box for passcode inputs split across several elements.
pub struct OtpGroup;

#[async_trait]
impl FieldStrategy for OtpGroup {
    fn name(&self) -> &'static str {
        "otp-group"
    }

    async fn fill(
        &self,
        cx: &mut FillContext<'_>,
        selector: &str,
        value_key: &str,
    ) -> EngineResult<FillOutcome> {
        if selector != keys::OTP_INPUT {
            return Ok(FillOutcome::Declined);
        }
        let code = cx.value(value_key);
        if code.is_empty() {
            return Ok(FillOutcome::Declined);
        }
        let Some(group) = best_group_locator(cx.page, cx.candidates(selector)).await else {
            return Ok(FillOutcome::Declined);
        };
        if !OTP_GROUP_SIZES.contains(&group.count) {
            return Ok(FillOutcome::Declined);
        }

        let digits: Vec<char> = code.chars().collect();
        let n = group.count.min(digits.len());
        info!("   otp group of {} boxes, typing {} characters", group.count, n);
        let keystroke_delay = if cx.typing.human {
            cx.typing.delay
        } else {
            Duration::ZERO
        };
        for (k, digit) in digits.iter().take(n).enumerate() {
            let digit_box = group.locator.nth(k);
            highlight(cx.page, &digit_box, cx.step_index, cx.highlight).await?;
            cx.page.set_value(&digit_box, "").await?;
            cx.page
                .type_text(&digit_box, &digit.to_string(), keystroke_delay)
                .await?;
            let label = format!("otp_digit_{}", k + 1);
            let saved = cx
                .sink
                .capture(cx.page, cx.step_index, "fill", Some(label.as_str()), Some(&digit_box))
                .await?;
            cx.artifacts.extend(saved);
            tokio::time::sleep(cx.typing.delay).await;
        }
        Ok(FillOutcome::Handled)
    }
}

/// Generic single-field fill. After the password field, also fills the
/// confirm field when the plan leaves it out and the bag has a value for it.
pub struct DefaultFill;

#[async_trait]
impl FieldStrategy for DefaultFill {
    fn name(&self) -> &'static str {
        "default"
    }

    async fn fill(
        &self,
        cx: &mut FillContext<'_>,
        selector: &str,
        value_key: &str,
    ) -> EngineResult<FillOutcome> {
        let locator = get_locator(cx.page, cx.candidates(selector)).await;
        let value = cx.value(value_key);
        cx.commit(&locator, &value, selector).await?;

        let confirm_value = cx.value(keys::CONFIRM_PASSWORD);
        if selector == keys::PASSWORD
            && !confirm_value.is_empty()
            && !cx.confirm.explicit_in_plan
            && !cx.confirm.filled
            && let Some(confirm_loc) =
                first_existing_locator(cx.page, cx.candidates(keys::CONFIRM_PASSWORD)).await
        {
            info!("   plan has no confirm step, filling confirm_password");
            cx.commit(&confirm_loc, &confirm_value, keys::CONFIRM_PASSWORD)
                .await?;
            cx.confirm.filled = true;
        }
        Ok(FillOutcome::Handled)
    }
}
