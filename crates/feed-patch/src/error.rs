use cdp_adapter::AdapterError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to read script template {path}: {source}")]
    Template {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed side-channel payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("session error: {0}")]
    Session(#[from] AdapterError),
}
