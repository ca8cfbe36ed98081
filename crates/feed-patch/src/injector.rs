//! Installs the side-channel hooks into the current page.
//!
//! Injection runs in three steps, each one evaluation of the same page
//! template with a different action: `bootstrap` always reports the settings
//! snapshot, then, when the page names a room, `hook` and `dispose` are
//! retried independently until the page reports them installed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use cdp_adapter::Evaluation;

use crate::codec::PatchPrefix;
use crate::config::PatchConfig;
use crate::retry::{RetryPolicy, RetryState};
use crate::runner::ScriptRunner;
use crate::template::{params, ScriptTemplate};

pub const PATCH_SCRIPT: &str = include_str!("../scripts/patch.js");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchAction {
    Bootstrap,
    Hook,
    Dispose,
}

impl PatchAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchAction::Bootstrap => "bootstrap",
            PatchAction::Hook => "hook",
            PatchAction::Dispose => "dispose",
        }
    }
}

/// What the bootstrap step found on the page.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageProbe {
    pub room: Option<String>,
    pub has_websocket: bool,
    pub has_player: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct InjectionReport {
    pub probe: Option<PageProbe>,
    pub hooks: Option<RetryState>,
    pub disposal: Option<RetryState>,
}

pub struct Injector {
    prefix: PatchPrefix,
    policy: RetryPolicy,
    dispose_player: bool,
    template: ScriptTemplate,
}

impl Injector {
    pub fn new(prefix: PatchPrefix, config: &PatchConfig) -> Self {
        Self {
            prefix,
            policy: config.retry_policy(),
            dispose_player: config.dispose_player,
            template: ScriptTemplate::new(PATCH_SCRIPT),
        }
    }

    pub fn from_config(config: &PatchConfig) -> Self {
        Self::new(config.patch_prefix(), config)
    }

    pub fn prefix(&self) -> &PatchPrefix {
        &self.prefix
    }

    pub fn script_for(&self, action: PatchAction) -> String {
        self.template.render(&params([
            ("PATCH_PREFIX", self.prefix.as_str()),
            ("ACTION", action.as_str()),
        ]))
    }

    /// Emits the `init` snapshot and reports what the page exposes. `None`
    /// when the evaluation failed.
    pub async fn bootstrap<R>(&self, runner: &R) -> Option<PageProbe>
    where
        R: ScriptRunner + ?Sized,
    {
        let script = self.script_for(PatchAction::Bootstrap);
        match runner.evaluate(&script, false, true).await {
            Evaluation::Value(value) => match serde_json::from_value(value) {
                Ok(probe) => Some(probe),
                Err(err) => {
                    debug!(target: "feed-patch", %err, "unexpected bootstrap result");
                    None
                }
            },
            _ => None,
        }
    }

    /// Runs `action` under the retry policy; an attempt succeeds when the
    /// page answers `true`.
    pub async fn install<R>(&self, runner: &R, action: PatchAction) -> RetryState
    where
        R: ScriptRunner + ?Sized,
    {
        let script = self.script_for(action);
        let script = script.as_str();
        self.policy
            .run(action.as_str(), |_| async move {
                matches!(
                    runner.evaluate(script, false, true).await,
                    Evaluation::Value(Value::Bool(true))
                )
            })
            .await
    }

    pub async fn inject<R>(&self, runner: &R) -> InjectionReport
    where
        R: ScriptRunner + ?Sized,
    {
        let probe = self.bootstrap(runner).await;
        let Some(room) = probe.as_ref().and_then(|probe| probe.room.clone()) else {
            info!(target: "feed-patch", "page exposes no room; skipping hooks");
            return InjectionReport {
                probe,
                ..InjectionReport::default()
            };
        };
        info!(target: "feed-patch", %room, "installing hooks");

        let (hooks, disposal) = if self.dispose_player {
            let (hooks, disposal) = tokio::join!(
                self.install(runner, PatchAction::Hook),
                self.install(runner, PatchAction::Dispose)
            );
            (hooks, Some(disposal))
        } else {
            (self.install(runner, PatchAction::Hook).await, None)
        };
        InjectionReport {
            probe,
            hooks: Some(hooks),
            disposal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;
    use serde_json::json;

    const BOOTSTRAP: &str = "'bootstrap'";
    const HOOK: &str = "'hook'";
    const DISPOSE: &str = "'dispose'";

    fn injector() -> Injector {
        Injector::new(PatchPrefix::new("__t__:"), &PatchConfig::default())
    }

    fn probe(room: Option<&str>) -> Evaluation {
        Evaluation::Value(json!({ "room": room, "hasWebsocket": true, "hasPlayer": true }))
    }

    #[test]
    fn scripts_are_fully_rendered() {
        let injector = injector();
        for action in [PatchAction::Bootstrap, PatchAction::Hook, PatchAction::Dispose] {
            let script = injector.script_for(action);
            assert!(!script.contains("<PATCH_PREFIX>"));
            assert!(!script.contains("<ACTION>"));
            assert!(script.contains("'__t__:'"));
            assert!(script.contains(&format!("'{}'", action.as_str())));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_room_skips_hooks() {
        let runner = FakeRunner::default();
        runner.answer(BOOTSTRAP, vec![], probe(None));
        let report = injector().inject(&runner).await;
        assert_eq!(report.hooks, None);
        assert_eq!(report.disposal, None);
        assert_eq!(runner.scripts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hooks_and_disposal_retry_independently() {
        let runner = FakeRunner::default();
        runner.answer(BOOTSTRAP, vec![], probe(Some("alice")));
        runner.answer(HOOK, vec![], Evaluation::Value(json!(false)));
        runner.answer(DISPOSE, vec![Evaluation::Failed], Evaluation::Value(json!(true)));

        let report = injector().inject(&runner).await;
        assert_eq!(report.probe.and_then(|p| p.room).as_deref(), Some("alice"));
        assert_eq!(report.hooks, Some(RetryState::Abandoned(10)));
        assert_eq!(report.disposal, Some(RetryState::Succeeded(2)));
        assert_eq!(runner.count(HOOK), 10);
        assert_eq!(runner.count(DISPOSE), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hook_installed_on_fourth_attempt() {
        let runner = FakeRunner::default();
        runner.answer(BOOTSTRAP, vec![], probe(Some("bob")));
        runner.answer(
            HOOK,
            vec![
                Evaluation::Value(json!(false)),
                Evaluation::Failed,
                Evaluation::Empty,
            ],
            Evaluation::Value(json!(true)),
        );
        let config = PatchConfig {
            dispose_player: false,
            ..PatchConfig::default()
        };
        let report = Injector::new(PatchPrefix::new("__t__:"), &config)
            .inject(&runner)
            .await;
        assert_eq!(report.hooks, Some(RetryState::Succeeded(4)));
        assert_eq!(report.disposal, None);
        assert_eq!(runner.count(HOOK), 4);
        assert_eq!(runner.count(DISPOSE), 0);
    }

    #[tokio::test]
    async fn failed_bootstrap_reports_nothing() {
        let runner = FakeRunner::default();
        assert_eq!(injector().bootstrap(&runner).await, None);
    }
}
