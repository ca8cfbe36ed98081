//! Page-context HTTP fetches.
//!
//! Requests run inside the page so they carry its origin and, on request,
//! its cookies.

use cdp_adapter::{Evaluation, Session};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::PatchError;
use crate::runner::ScriptRunner;
use crate::template::{params, ScriptTemplate, TemplateParams};

pub const FETCH_SCRIPT: &str = include_str!("../scripts/fetch.js");

#[derive(Deserialize)]
struct FetchOutcome {
    ok: bool,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Fetches `url` (absolute or page-relative) with a `_=<epoch millis>`
/// cache-buster and returns the body text. `None` on any failure.
pub async fn fetch_text<R>(runner: &R, url: &str, with_credentials: bool) -> Option<String>
where
    R: ScriptRunner + ?Sized,
{
    let url_literal = serde_json::to_string(url).ok()?;
    let credentials = if with_credentials {
        "'include'"
    } else {
        "'same-origin'"
    };
    let script = ScriptTemplate::new(FETCH_SCRIPT).render(&params([
        ("URL", url_literal.as_str()),
        ("CREDENTIALS", credentials),
    ]));

    let value = match runner.evaluate(&script, true, true).await {
        Evaluation::Value(value) => value,
        other => {
            debug!(target: "feed-patch", %url, ?other, "fetch evaluation produced no value");
            return None;
        }
    };
    match serde_json::from_value::<FetchOutcome>(value) {
        Ok(FetchOutcome {
            ok: true,
            status,
            text,
            ..
        }) => {
            debug!(target: "feed-patch", %url, ?status, "page fetch completed");
            text
        }
        Ok(FetchOutcome { error, .. }) => {
            debug!(target: "feed-patch", %url, ?error, "page fetch failed");
            None
        }
        Err(err) => {
            debug!(target: "feed-patch", %url, %err, "unexpected fetch result");
            None
        }
    }
}

/// Navigates to `path`, then evaluates a templated script there, awaiting
/// any promise it returns. The building block for scripted page flows.
pub async fn run_flow(
    session: &Session,
    path: &str,
    template: &ScriptTemplate,
    params: &TemplateParams,
) -> Result<Option<Value>, PatchError> {
    session.navigate(path).await?;
    let script = template.render(params);
    Ok(ScriptRunner::evaluate(session, &script, true, true)
        .await
        .into_value())
}
