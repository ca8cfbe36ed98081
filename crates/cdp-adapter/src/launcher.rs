//! Browser process collaborators.
//!
//! The session controller only needs a reachable debug endpoint and a way to
//! tear the process down again; everything else about launching is opaque.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::util::{extract_ws_url, port_from_ws_url};

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Flags applied to every launched browser on top of chromiumoxide's defaults.
pub const DEFAULT_FLAGS: &[&str] = &[
    "--start-maximized",
    "--disable-save-password-bubble",
    "--disable-presentation-api",
    "--disable-file-system",
    "--disable-contextual-search",
    "--disable-translate",
    "--disable-background-mode",
    "--disable-plugins-discovery",
    "--disable-webgl",
    "--disable-speech-api",
    "--disable-print-preview",
    "--disable-password-generation",
    "--disable-default-apps",
    "--disable-sync",
    "--disable-component-cloud-policy",
    "--disable-plugins",
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--mute-audio",
    "--no-first-run",
    "--no-default-browser-check",
    "--remote-allow-origins=*",
    "--incognito",
];

/// Handle to a running browser exposing its debug endpoint.
#[async_trait]
pub trait BrowserProcess: Send + Sync {
    /// Debug port actually bound by the browser.
    fn port(&self) -> u16;
    /// Browser-level websocket endpoint, when the launcher already knows it.
    fn ws_url(&self) -> Option<&str>;
    async fn terminate(&mut self) -> Result<(), AdapterError>;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        port: u16,
        flags: &[String],
    ) -> Result<Box<dyn BrowserProcess>, AdapterError>;
}

/// Launches a local Chromium through chromiumoxide.
pub struct ChromeLauncher {
    cfg: CdpConfig,
}

impl ChromeLauncher {
    pub fn new(cfg: CdpConfig) -> Self {
        Self { cfg }
    }

    fn profile_dir(&self) -> Result<PathBuf, AdapterError> {
        let dir = &self.cfg.user_data_dir;
        let dir = if dir.is_absolute() {
            dir.clone()
        } else {
            std::env::current_dir()
                .map_err(|err| launch_error(format!("cannot resolve profile directory: {err}")))?
                .join(dir)
        };
        fs::create_dir_all(&dir).map_err(|err| {
            launch_error(format!("cannot create profile {}: {err}", dir.display()))
        })?;
        Ok(dir)
    }

    fn browser_config(&self, port: u16, flags: &[String]) -> Result<BrowserConfig, AdapterError> {
        let executable = &self.cfg.executable;
        let pinned = !executable.as_os_str().is_empty();
        if pinned && !executable.exists() {
            return Err(launch_error(format!("no browser binary at {}", executable.display()))
                .with_data(json!({
                    "expected": executable,
                    "hint": "point FEEDTAP_CHROME at a chrome or chromium binary",
                })));
        }

        let args = DEFAULT_FLAGS
            .iter()
            .map(|flag| flag.to_string())
            .chain(flags.iter().cloned());
        let mut builder = BrowserConfig::builder()
            .port(port)
            .user_data_dir(self.profile_dir()?)
            .request_timeout(Duration::from_millis(self.cfg.default_deadline_ms))
            .launch_timeout(LAUNCH_TIMEOUT)
            .args(args);
        if pinned {
            builder = builder.chrome_executable(executable.clone());
        }
        if !self.cfg.headless {
            builder = builder.with_head();
        }
        if sandbox_disabled() {
            builder = builder.no_sandbox();
        }
        builder
            .build()
            .map_err(|err| launch_error(format!("invalid browser options: {err}")))
    }
}

fn sandbox_disabled() -> bool {
    std::env::var("FEEDTAP_DISABLE_SANDBOX")
        .is_ok_and(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

fn launch_error(hint: String) -> AdapterError {
    AdapterError::new(AdapterErrorKind::Launch).with_hint(hint)
}

#[async_trait]
impl Launcher for ChromeLauncher {
    async fn launch(
        &self,
        port: u16,
        flags: &[String],
    ) -> Result<Box<dyn BrowserProcess>, AdapterError> {
        let mut child = self
            .browser_config(port, flags)?
            .launch()
            .map_err(|err| launch_error(format!("browser did not start: {err}")))?;

        let ws_url = match extract_ws_url(&mut child).await {
            Ok(url) => url,
            Err(err) => {
                reap(child).await;
                return Err(launch_error(format!("{err:#}")));
            }
        };
        let bound = port_from_ws_url(&ws_url).unwrap_or(port);
        info!(target: "cdp-launcher", port = bound, url = %ws_url, "chromium launched");

        Ok(Box::new(ChromeProcess {
            child: Some(child),
            port: bound,
            ws_url,
        }))
    }
}

struct ChromeProcess {
    child: Option<Child>,
    port: u16,
    ws_url: String,
}

#[async_trait]
impl BrowserProcess for ChromeProcess {
    fn port(&self) -> u16 {
        self.port
    }

    fn ws_url(&self) -> Option<&str> {
        Some(&self.ws_url)
    }

    async fn terminate(&mut self) -> Result<(), AdapterError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        debug!(target: "cdp-launcher", port = self.port, "terminating browser");
        child.kill().await.map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("browser refused to die: {err}"))
        })
    }
}

async fn reap(mut child: Child) {
    if let Err(err) = child.kill().await {
        warn!(target: "cdp-launcher", %err, "orphaned browser process");
    }
}

impl Drop for ChromeProcess {
    fn drop(&mut self) {
        let Some(child) = self.child.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(reap(child));
            }
            Err(_) => debug!(target: "cdp-launcher", "browser left running: no runtime to reap it"),
        }
    }
}

/// Launcher used when attaching to a browser somebody else started.
pub struct AttachLauncher {
    ws_url: Option<String>,
}

impl AttachLauncher {
    pub fn new(ws_url: Option<String>) -> Self {
        Self { ws_url }
    }
}

#[async_trait]
impl Launcher for AttachLauncher {
    async fn launch(
        &self,
        port: u16,
        _flags: &[String],
    ) -> Result<Box<dyn BrowserProcess>, AdapterError> {
        let port = self
            .ws_url
            .as_deref()
            .and_then(port_from_ws_url)
            .unwrap_or(port);
        Ok(Box::new(AttachedBrowser {
            port,
            ws_url: self.ws_url.clone(),
        }))
    }
}

/// Externally owned browser; terminating it only forgets the handle.
pub struct AttachedBrowser {
    port: u16,
    ws_url: Option<String>,
}

#[async_trait]
impl BrowserProcess for AttachedBrowser {
    fn port(&self) -> u16 {
        self.port
    }

    fn ws_url(&self) -> Option<&str> {
        self.ws_url.as_deref()
    }

    async fn terminate(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Picks the launcher matching the configuration.
pub fn launcher_for(cfg: &CdpConfig) -> Box<dyn Launcher> {
    match &cfg.websocket_url {
        Some(url) => Box::new(AttachLauncher::new(Some(url.clone()))),
        None => Box::new(ChromeLauncher::new(cfg.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attach_launcher_reports_port_from_url() {
        let launcher = AttachLauncher::new(Some("ws://127.0.0.1:9444/devtools/browser/x".into()));
        let mut process = launcher.launch(9222, &[]).await.expect("attach");
        assert_eq!(process.port(), 9444);
        assert_eq!(process.ws_url(), Some("ws://127.0.0.1:9444/devtools/browser/x"));
        process.terminate().await.expect("terminate is a no-op");
        process.terminate().await.expect("terminate twice");
    }

    #[tokio::test]
    async fn attach_without_url_keeps_preferred_port() {
        let launcher = AttachLauncher::new(None);
        let process = launcher.launch(9555, &[]).await.expect("attach");
        assert_eq!(process.port(), 9555);
        assert!(process.ws_url().is_none());
    }

    #[test]
    fn missing_executable_is_a_launch_error() {
        let mut cfg = CdpConfig::default();
        cfg.executable = "/definitely/not/here/chrome".into();
        let launcher = ChromeLauncher::new(cfg);
        let err = launcher
            .browser_config(9222, &[])
            .expect_err("config must fail");
        assert_eq!(err.kind, AdapterErrorKind::Launch);
    }
}
