use anyhow::{anyhow, Context, Result};
use chromiumoxide::async_process::Child;
use futures::io::{AsyncBufReadExt, BufReader};
use futures::stream::StreamExt;
use serde::Deserialize;
use tokio::time::{timeout, Duration};
use url::Url;

const BANNER_TIMEOUT: Duration = Duration::from_secs(20);
const STDERR_PREVIEW: usize = 8;

/// Reads the browser's stderr until it announces its debugging websocket.
pub async fn extract_ws_url(child: &mut Child) -> Result<String> {
    let stderr = child
        .stderr
        .take()
        .context("browser was started without a piped stderr")?;
    let mut lines = BufReader::new(stderr).lines();
    let mut preview: Vec<String> = Vec::with_capacity(STDERR_PREVIEW);

    let scan = async {
        while let Some(line) = lines.next().await {
            let line = line.context("reading browser stderr")?;
            if let Some(url) = parse_listening_line(&line) {
                return Ok(url);
            }
            if preview.len() < STDERR_PREVIEW {
                preview.push(line);
            }
        }
        Err(anyhow!(
            "browser exited without announcing a debugging endpoint; stderr: {}",
            preview.join(" | ")
        ))
    };

    timeout(BANNER_TIMEOUT, scan)
        .await
        .map_err(|_| anyhow!("no debugging endpoint announced within {BANNER_TIMEOUT:?}"))?
}

fn parse_listening_line(line: &str) -> Option<String> {
    let (_, ws) = line.rsplit_once("listening on ")?;
    let ws = ws.trim();
    (ws.starts_with("ws") && ws.contains("devtools/browser")).then(|| ws.to_string())
}

/// Port the DevTools endpoint is bound to, as reported in its websocket URL.
pub fn port_from_ws_url(ws_url: &str) -> Option<u16> {
    Url::parse(ws_url).ok()?.port()
}

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// Resolve the browser websocket endpoint for a debug port via `/json/version`.
pub async fn resolve_ws_url(port: u16, deadline: Duration) -> Result<String> {
    let endpoint = format!("http://127.0.0.1:{port}/json/version");
    let client = reqwest::Client::builder()
        .timeout(deadline)
        .build()
        .context("failed to build http client")?;
    let info: VersionInfo = client
        .get(&endpoint)
        .send()
        .await
        .with_context(|| format!("devtools endpoint unreachable at {endpoint}"))?
        .error_for_status()?
        .json()
        .await
        .context("malformed /json/version response")?;
    Ok(info.web_socket_debugger_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_devtools_banner() {
        let line = "DevTools listening on ws://127.0.0.1:9222/devtools/browser/abc-123";
        assert_eq!(
            parse_listening_line(line).as_deref(),
            Some("ws://127.0.0.1:9222/devtools/browser/abc-123")
        );
        assert_eq!(parse_listening_line("[1234:5678] some other output"), None);
    }

    #[test]
    fn extracts_port_from_ws_url() {
        assert_eq!(
            port_from_ws_url("ws://127.0.0.1:9333/devtools/browser/abc"),
            Some(9333)
        );
        assert_eq!(port_from_ws_url("not a url"), None);
    }
}
