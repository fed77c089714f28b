use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::diagnostics::{ArtifactSink, highlight};
use crate::error::{EngineError, EngineResult};
use crate::fields::{ConfirmState, FieldStrategy, FillContext, FillOutcome, Typing, default_chain};
use crate::options::RunOptions;
use crate::page::{Page, is_visible, wait_for_state};
use crate::plan::{Action, DEFAULT_WAIT_TIMEOUT_MS, WaitState};
use crate::resolver::{first_existing_locator, get_locator};
use crate::selectors::{FormDataBag, SelectorMap, candidates, keys};

/// Executes single plan actions against a page. Holds the little state that
/// spans steps (confirm-password bookkeeping).
pub struct Interpreter<'a> {
    page: &'a dyn Page,
    selectors: &'a SelectorMap,
    data: &'a FormDataBag,
    sink: &'a ArtifactSink,
    typing: Typing,
    highlight: bool,
    strategies: Vec<Box<dyn FieldStrategy>>,
    confirm: ConfirmState,
}

fn timeout_or_default(timeout: Option<u64>) -> Duration {
    Duration::from_millis(timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS))
}

impl<'a> Interpreter<'a> {
    pub fn new(
        page: &'a dyn Page,
        selectors: &'a SelectorMap,
        data: &'a FormDataBag,
        sink: &'a ArtifactSink,
        options: &RunOptions,
        explicit_confirm: bool,
    ) -> Self {
        Self {
            page,
            selectors,
            data,
            sink,
            typing: Typing {
                human: options.human_typing,
                delay: options.typing_delay(),
            },
            highlight: options.enable_highlight,
            strategies: default_chain(),
            confirm: ConfirmState {
                explicit_in_plan: explicit_confirm,
                filled: false,
            },
        }
    }

    /// Replace the fill strategy chain.
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn FieldStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    fn candidates(&self, key: &str) -> &'a [String] {
        candidates(self.selectors, key)
    }

    /// Run one action; returns the artifacts it captured.
    pub async fn execute(&mut self, step_index: usize, action: &Action) -> EngineResult<Vec<PathBuf>> {
        match action {
            Action::Navigate { url } => {
                self.page.goto(url).await?;
                self.sink
                    .capture(self.page, step_index, action.kind(), None, None)
                    .await
            }
            Action::WaitFor {
                selector,
                state,
                timeout,
            } => self.wait_for(step_index, selector, *state, *timeout).await,
            Action::Fill {
                selector,
                value_key,
            } => self.fill(step_index, selector, value_key).await,
            Action::Click { selector } => self.click(step_index, selector).await,
            Action::Press { selector, key } => {
                let locator = get_locator(self.page, self.candidates(selector)).await;
                highlight(self.page, &locator, step_index, self.highlight).await?;
                self.page.press(&locator, key).await?;
                self.sink
                    .capture(self.page, step_index, action.kind(), Some(selector.as_str()), Some(&locator))
                    .await
            }
            Action::WaitNetworkIdle { timeout } => {
                self.page
                    .wait_network_idle(timeout_or_default(*timeout))
                    .await?;
                self.sink
                    .capture(self.page, step_index, action.kind(), None, None)
                    .await
            }
        }
    }

    async fn wait_for(
        &self,
        step_index: usize,
        selector: &str,
        state: WaitState,
        timeout: Option<u64>,
    ) -> EngineResult<Vec<PathBuf>> {
        // Sites that split the name field still satisfy a full-name wait.
        let mut list = self.candidates(selector).to_vec();
        if selector == keys::FULL_NAME {
            list.extend_from_slice(self.candidates(keys::FIRST_NAME));
        }
        let locator = get_locator(self.page, &list).await;
        highlight(self.page, &locator, step_index, self.highlight).await?;
        wait_for_state(self.page, &locator, state, timeout_or_default(timeout))
            .await
            .map_err(|err| match err {
                EngineError::Timeout { timeout_ms, .. } => EngineError::timeout(
                    format!("{} ({}) to be {}", selector, locator, state.as_str()),
                    timeout_ms,
                ),
                other => other,
            })?;
        // A hidden or detached element has nothing to crop to.
        let target = matches!(state, WaitState::Visible | WaitState::Attached).then_some(&locator);
        self.sink
            .capture(self.page, step_index, "waitFor", Some(selector), target)
            .await
    }

    async fn fill(
        &mut self,
        step_index: usize,
        selector: &str,
        value_key: &str,
    ) -> EngineResult<Vec<PathBuf>> {
        let mut cx = FillContext {
            page: self.page,
            selectors: self.selectors,
            data: self.data,
            sink: self.sink,
            step_index,
            typing: self.typing,
            highlight: self.highlight,
            confirm: &mut self.confirm,
            artifacts: Vec::new(),
        };
        for strategy in &self.strategies {
            if strategy.fill(&mut cx, selector, value_key).await? == FillOutcome::Handled {
                if strategy.name() != "default" {
                    info!("   fill handled by {}", strategy.name());
                }
                return Ok(cx.artifacts);
            }
        }
        Err(EngineError::interaction(
            "fill",
            format!("no fill strategy accepted {:?}", selector),
        ))
    }

    async fn click(&self, step_index: usize, selector: &str) -> EngineResult<Vec<PathBuf>> {
        // Clicking the menu toggle again would collapse an expanded menu.
        if selector == keys::AUTH_MENU
            && let Some(signup) =
                first_existing_locator(self.page, self.candidates(keys::SIGNUP_MENU)).await
            && is_visible(self.page, &signup).await?
        {
            info!("   {} already open, skipping click", keys::AUTH_MENU);
            return Ok(Vec::new());
        }
        let locator = get_locator(self.page, self.candidates(selector)).await;
        highlight(self.page, &locator, step_index, self.highlight).await?;
        self.page.click(&locator).await?;
        self.sink
            .capture(self.page, step_index, "click", Some(selector), Some(&locator))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ScreenshotMode;
    use crate::testing::{FakePage, Op};

    struct Fixture {
        page: FakePage,
        selectors: SelectorMap,
        data: FormDataBag,
        sink: ArtifactSink,
        options: RunOptions,
        _dir: tempfile::TempDir,
    }

    fn fixture(selectors: &[(&str, &[&str])], data: &[(&str, &str)]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let options = RunOptions {
            step_delay_ms: 0,
            screenshot_settle_ms: 0,
            typing_delay_ms: 0,
            enable_highlight: false,
            artifacts_dir: dir.path().to_path_buf(),
            ..RunOptions::default()
        };
        Fixture {
            page: FakePage::new(),
            selectors: selectors
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            sink: ArtifactSink::new(dir.path(), ScreenshotMode::Element, Duration::ZERO),
            options,
            _dir: dir,
        }
    }

    impl Fixture {
        fn interpreter(&self, explicit_confirm: bool) -> Interpreter<'_> {
            Interpreter::new(
                &self.page,
                &self.selectors,
                &self.data,
                &self.sink,
                &self.options,
                explicit_confirm,
            )
        }
    }

    fn fill(selector: &str, value_key: &str) -> Action {
        Action::Fill {
            selector: selector.into(),
            value_key: value_key.into(),
        }
    }

    const NAME_SELECTORS: &[(&str, &[&str])] = &[
        ("full_name", &["label=/full\\s*name/i"]),
        ("first_name", &["label=/first\\s*name/i"]),
        ("last_name", &["label=/last\\s*name/i"]),
    ];

    #[tokio::test]
    async fn full_name_splits_into_first_and_last() {
        let fx = fixture(NAME_SELECTORS, &[("full_name", "Ada Lovelace")]);
        fx.page.element("first", &["label=/first\\s*name/i"]);
        fx.page.element("last", &["label=/last\\s*name/i"]);

        let saved = fx
            .interpreter(false)
            .execute(0, &fill("full_name", "full_name"))
            .await
            .unwrap();

        assert_eq!(fx.page.value("first"), "Ada");
        assert_eq!(fx.page.value("last"), "Lovelace");
        let names: Vec<_> = saved
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            [
                "step-01-fill-first_name-elem.png",
                "step-01-fill-last_name-elem.png"
            ]
        );
    }

    #[tokio::test]
    async fn single_token_name_leaves_last_empty() {
        let fx = fixture(NAME_SELECTORS, &[("full_name", "Madonna")]);
        fx.page.element("first", &["label=/first\\s*name/i"]);
        fx.page.element("last", &["label=/last\\s*name/i"]);
        fx.page.set_initial_value("last", "stale");

        fx.interpreter(false)
            .execute(0, &fill("full_name", "full_name"))
            .await
            .unwrap();

        assert_eq!(fx.page.value("first"), "Madonna");
        assert_eq!(fx.page.value("last"), "");
    }

    #[tokio::test]
    async fn full_name_without_split_fields_fills_single_field() {
        let fx = fixture(NAME_SELECTORS, &[("full_name", "Ada Lovelace")]);
        fx.page.element("full", &["label=/full\\s*name/i"]);
        fx.page.element("first", &["label=/first\\s*name/i"]);

        fx.interpreter(false)
            .execute(0, &fill("full_name", "full_name"))
            .await
            .unwrap();

        assert_eq!(fx.page.value("full"), "Ada Lovelace");
        assert_eq!(fx.page.value("first"), "");
    }

    #[tokio::test]
    async fn human_typing_sends_keystrokes() {
        let mut fx = fixture(&[("email", &["css=#email"])], &[("email", "a@b.co")]);
        fx.options.human_typing = true;
        fx.page.element("email", &["css=#email"]);

        fx.interpreter(false)
            .execute(0, &fill("email", "email"))
            .await
            .unwrap();

        assert_eq!(fx.page.value("email"), "a@b.co");
        assert_eq!(
            fx.page.count_ops(|op| matches!(op, Op::Type { text, .. } if text == "a@b.co")),
            1
        );
    }

    #[tokio::test]
    async fn missing_value_key_fills_empty_string() {
        let fx = fixture(&[("email", &["css=#email"])], &[]);
        fx.page.element("email", &["css=#email"]);
        fx.page.set_initial_value("email", "old");

        fx.interpreter(false)
            .execute(0, &fill("email", "email"))
            .await
            .unwrap();
        assert_eq!(fx.page.value("email"), "");
    }

    const OTP_SELECTORS: &[(&str, &[&str])] = &[(
        "otp_input",
        &["label=/otp|verification code/i", "css=input[name*='otp' i]"],
    )];

    #[tokio::test]
    async fn otp_group_gets_one_digit_per_box() {
        let fx = fixture(OTP_SELECTORS, &[("otp", "234567")]);
        let boxes = fx.page.group("otp", 6, &["css=input[name*='otp' i]"]);

        let saved = fx
            .interpreter(false)
            .execute(4, &fill("otp_input", "otp"))
            .await
            .unwrap();

        let digits: Vec<_> = boxes.iter().map(|b| fx.page.value(b)).collect();
        assert_eq!(digits, ["2", "3", "4", "5", "6", "7"]);
        assert_eq!(saved.len(), 6);
        assert!(saved[5].ends_with("step-05-fill-otp_digit_6-elem.png"));
    }

    #[tokio::test]
    async fn short_otp_group_takes_prefix() {
        let fx = fixture(OTP_SELECTORS, &[("otp", "234567")]);
        let boxes = fx.page.group("otp", 4, &["css=input[name*='otp' i]"]);

        fx.interpreter(false)
            .execute(0, &fill("otp_input", "otp"))
            .await
            .unwrap();

        let digits: Vec<_> = boxes.iter().map(|b| fx.page.value(b)).collect();
        assert_eq!(digits, ["2", "3", "4", "5"]);
        assert_eq!(fx.page.count_ops(|op| matches!(op, Op::Type { .. })), 4);
    }

    #[tokio::test]
    async fn single_otp_input_uses_plain_fill() {
        let fx = fixture(OTP_SELECTORS, &[("otp", "234567")]);
        fx.page.element("otp", &["label=/otp|verification code/i"]);

        fx.interpreter(false)
            .execute(0, &fill("otp_input", "otp"))
            .await
            .unwrap();
        assert_eq!(fx.page.value("otp"), "234567");
    }

    const PASSWORD_SELECTORS: &[(&str, &[&str])] = &[
        ("password", &["css=input[type='password']"]),
        ("confirm_password", &["label=/confirm\\s*password/i"]),
    ];

    #[tokio::test]
    async fn password_fill_synthesizes_confirm() {
        let fx = fixture(
            PASSWORD_SELECTORS,
            &[("password", "S3cret!"), ("confirm_password", "S3cret!")],
        );
        fx.page.element("pw", &["css=input[type='password']"]);
        fx.page.element("confirm", &["label=/confirm\\s*password/i"]);

        let mut interp = fx.interpreter(false);
        interp.execute(0, &fill("password", "password")).await.unwrap();

        assert_eq!(fx.page.value("pw"), "S3cret!");
        assert_eq!(fx.page.value("confirm"), "S3cret!");

        // Synthesized once only.
        interp.execute(1, &fill("password", "password")).await.unwrap();
        assert_eq!(
            fx.page.count_ops(|op| matches!(op, Op::SetValue { element, value } if element == "confirm" && !value.is_empty())),
            1
        );
    }

    #[tokio::test]
    async fn explicit_confirm_step_suppresses_synthesis() {
        let fx = fixture(
            PASSWORD_SELECTORS,
            &[("password", "S3cret!"), ("confirm_password", "S3cret!")],
        );
        fx.page.element("pw", &["css=input[type='password']"]);
        fx.page.element("confirm", &["label=/confirm\\s*password/i"]);

        let mut interp = fx.interpreter(true);
        interp.execute(0, &fill("password", "password")).await.unwrap();
        assert_eq!(fx.page.value("confirm"), "");
        assert_eq!(
            fx.page.count_ops(|op| matches!(op, Op::SetValue { element, .. } if element == "confirm")),
            0
        );

        interp
            .execute(1, &fill("confirm_password", "confirm_password"))
            .await
            .unwrap();
        assert_eq!(fx.page.value("confirm"), "S3cret!");
    }

    #[tokio::test]
    async fn auth_menu_click_skipped_when_signup_visible() {
        let fx = fixture(
            &[
                ("auth_menu", &["role=link[name=/authentication/i]"]),
                ("signup_menu", &["role=link[name=/sign\\s*up/i]"]),
            ],
            &[],
        );
        fx.page.element("auth", &["role=link[name=/authentication/i]"]);
        fx.page.element("signup", &["role=link[name=/sign\\s*up/i]"]);

        let saved = fx
            .interpreter(false)
            .execute(
                2,
                &Action::Click {
                    selector: "auth_menu".into(),
                },
            )
            .await
            .unwrap();
        assert!(saved.is_empty());
        assert_eq!(fx.page.count_ops(|op| matches!(op, Op::Click(_))), 0);
    }

    #[tokio::test]
    async fn auth_menu_clicked_when_signup_hidden() {
        let fx = fixture(
            &[
                ("auth_menu", &["role=link[name=/authentication/i]"]),
                ("signup_menu", &["role=link[name=/sign\\s*up/i]"]),
            ],
            &[],
        );
        fx.page.element("auth", &["role=link[name=/authentication/i]"]);
        fx.page.hidden_element("signup", &["role=link[name=/sign\\s*up/i]"]);

        fx.interpreter(false)
            .execute(
                2,
                &Action::Click {
                    selector: "auth_menu".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            fx.page.count_ops(|op| matches!(op, Op::Click(el) if el == "auth")),
            1
        );
    }

    #[tokio::test]
    async fn wait_for_full_name_accepts_first_name_field() {
        let fx = fixture(NAME_SELECTORS, &[]);
        fx.page.element("first", &["label=/first\\s*name/i"]);

        let saved = fx
            .interpreter(false)
            .execute(
                5,
                &Action::WaitFor {
                    selector: "full_name".into(),
                    state: WaitState::Visible,
                    timeout: Some(200),
                },
            )
            .await
            .unwrap();
        assert!(saved[0].ends_with("step-06-waitFor-full_name-elem.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_detached_captures_the_viewport() {
        let fx = fixture(&[("spinner", &["css=.spinner"])], &[]);

        let saved = fx
            .interpreter(false)
            .execute(
                0,
                &Action::WaitFor {
                    selector: "spinner".into(),
                    state: WaitState::Detached,
                    timeout: Some(1000),
                },
            )
            .await
            .unwrap();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].ends_with("step-01-waitFor-spinner-view.png"));
        assert_eq!(fx.page.ops(), [Op::Screenshot("viewport".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_hidden_captures_the_viewport() {
        let fx = fixture(&[("spinner", &["css=.spinner"])], &[]);
        fx.page.hidden_element("spinner", &["css=.spinner"]);

        let saved = fx
            .interpreter(false)
            .execute(
                2,
                &Action::WaitFor {
                    selector: "spinner".into(),
                    state: WaitState::Hidden,
                    timeout: Some(1000),
                },
            )
            .await
            .unwrap();
        assert!(saved[0].ends_with("step-03-waitFor-spinner-view.png"));
        assert_eq!(fx.page.count_ops(|op| matches!(op, Op::Screenshot(s) if s == "viewport")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_missing_key_times_out() {
        let fx = fixture(&[("submit", &["css=button[type='submit']"])], &[]);
        let err = fx
            .interpreter(false)
            .execute(
                0,
                &Action::WaitFor {
                    selector: "submit".into(),
                    state: WaitState::Visible,
                    timeout: Some(1000),
                },
            )
            .await
            .unwrap_err();
        match err {
            EngineError::Timeout { what, timeout_ms } => {
                assert_eq!(timeout_ms, 1000);
                assert!(what.starts_with("submit"), "{what}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn press_and_navigate_and_idle() {
        let fx = fixture(&[("search", &["role=textbox[name=/search/i]"])], &[]);
        fx.page.element("search", &["role=textbox[name=/search/i]"]);
        let mut interp = fx.interpreter(false);

        interp
            .execute(
                0,
                &Action::Navigate {
                    url: "https://example.com".into(),
                },
            )
            .await
            .unwrap();
        interp
            .execute(
                1,
                &Action::Press {
                    selector: "search".into(),
                    key: "Enter".into(),
                },
            )
            .await
            .unwrap();
        interp
            .execute(2, &Action::WaitNetworkIdle { timeout: None })
            .await
            .unwrap();

        let ops = fx.page.ops();
        assert!(ops.contains(&Op::Goto("https://example.com".into())));
        assert!(ops.contains(&Op::Press {
            element: "search".into(),
            key: "Enter".into()
        }));
        assert!(ops.contains(&Op::NetworkIdle(DEFAULT_WAIT_TIMEOUT_MS)));
    }
}
