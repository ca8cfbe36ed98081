//! Session configuration and Chromium executable detection.

use serde::{Deserialize, Serialize};
use std::{
    env,
    path::{Path, PathBuf},
};
use which::which;

pub const DEFAULT_BASE_URL: &str = "https://chaturbate.com";
pub const DEFAULT_DEBUG_PORT: u16 = 9222;

/// Configuration for launching the browser and driving its debugging session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CdpConfig {
    pub executable: PathBuf,
    pub user_data_dir: PathBuf,
    pub headless: bool,
    /// Debug port preference handed to the launcher.
    pub port: u16,
    pub extra_flags: Vec<String>,
    /// Target application base address; `navigate` joins paths onto it.
    pub base_url: String,
    pub default_deadline_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Attach to an already running browser instead of launching one.
    pub websocket_url: Option<String>,
    /// Enable the DOM domain and child-insertion observation.
    pub observe_dom: bool,
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            executable: default_chrome_path(),
            user_data_dir: default_profile_dir(),
            headless: resolve_headless_default(),
            port: DEFAULT_DEBUG_PORT,
            extra_flags: Vec::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_deadline_ms: 30_000,
            heartbeat_interval_ms: 15_000,
            websocket_url: None,
            observe_dom: false,
        }
    }
}

impl CdpConfig {
    /// Joins `path` onto the base address, tolerating slashes on either side.
    pub fn resolve_url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            format!("{base}/")
        } else {
            format!("{base}/{path}")
        }
    }
}

const PROFILE_DIR: &str = "./.feedtap-profile";

#[cfg(target_os = "windows")]
const CHROME_BINARIES: &[&str] = &["chrome.exe", "chromium.exe", "msedge.exe"];
#[cfg(not(target_os = "windows"))]
const CHROME_BINARIES: &[&str] = &[
    "google-chrome-stable",
    "google-chrome",
    "chromium",
    "chromium-browser",
];

#[cfg(target_os = "macos")]
const CHROME_INSTALLS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];
#[cfg(any(target_os = "linux", target_os = "freebsd"))]
const CHROME_INSTALLS: &[&str] = &[
    "/usr/bin/google-chrome-stable",
    "/usr/bin/google-chrome",
    "/usr/bin/chromium-browser",
    "/usr/bin/chromium",
];
#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "freebsd")))]
const CHROME_INSTALLS: &[&str] = &[];

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `FEEDTAP_HEADLESS=0|false|no|off` opens a visible window.
fn resolve_headless_default() -> bool {
    env_value("FEEDTAP_HEADLESS").map_or(true, |value| {
        !["0", "false", "no", "off"]
            .iter()
            .any(|off| value.eq_ignore_ascii_case(off))
    })
}

fn default_chrome_path() -> PathBuf {
    detect_chrome_executable().unwrap_or_default()
}

fn default_profile_dir() -> PathBuf {
    env_value("FEEDTAP_CHROME_PROFILE").map_or_else(|| PathBuf::from(PROFILE_DIR), PathBuf::from)
}

/// Looks for a browser binary: `FEEDTAP_CHROME` first, then `PATH`, then
/// the usual install locations unless `FEEDTAP_SKIP_OS_PATHS` is set.
pub(crate) fn detect_chrome_executable() -> Option<PathBuf> {
    let explicit = env_value("FEEDTAP_CHROME")
        .map(PathBuf::from)
        .filter(|path| path.exists());
    if explicit.is_some() {
        return explicit;
    }
    if let Some(found) = CHROME_BINARIES.iter().find_map(|name| which(name).ok()) {
        return Some(found);
    }
    if env_value("FEEDTAP_SKIP_OS_PATHS").is_some() {
        return None;
    }
    CHROME_INSTALLS
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_url_joins_without_doubling_slashes() {
        let mut cfg = CdpConfig::default();
        cfg.base_url = "https://example.test/".into();
        assert_eq!(cfg.resolve_url("/room/"), "https://example.test/room/");
        assert_eq!(cfg.resolve_url("room"), "https://example.test/room");
        assert_eq!(cfg.resolve_url(""), "https://example.test/");
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg: CdpConfig =
            serde_json::from_str(r#"{"port": 9333, "observe_dom": true}"#).expect("parse");
        assert_eq!(cfg.port, 9333);
        assert!(cfg.observe_dom);
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.default_deadline_ms, 30_000);
    }
}
