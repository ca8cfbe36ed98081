use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::PatchPrefix;
use crate::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    pub max_attempts: u32,
    pub retry_unit_ms: u64,
    /// Side-channel prefix; a fresh one is generated per run when unset.
    pub prefix: Option<String>,
    pub dispose_player: bool,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_unit_ms: 1000,
            prefix: None,
            dispose_player: true,
        }
    }
}

impl PatchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.retry_unit_ms))
    }

    pub fn patch_prefix(&self) -> PatchPrefix {
        match self.prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => PatchPrefix::new(prefix),
            _ => PatchPrefix::generate(),
        }
    }
}
