//! In-page instrumentation for the feed socket.
//!
//! The [`Injector`] renders `scripts/patch.js` and installs it through any
//! [`ScriptRunner`]; the page reports back over the console side channel,
//! which [`codec`] decodes and [`EventRelay`] republishes as [`RelayEvent`]s.

pub mod codec;
pub mod config;
pub mod error;
pub mod fetch;
pub mod injector;
pub mod normalize;
pub mod relay;
pub mod retry;
pub mod runner;
pub mod template;

pub use codec::{ClosePayload, FeedEvent, MessageKind, PatchMessage, PatchPrefix, SettingsSnapshot};
pub use config::PatchConfig;
pub use error::PatchError;
pub use fetch::{fetch_text, run_flow};
pub use injector::{InjectionReport, Injector, PageProbe, PatchAction};
pub use normalize::{normalize_arg, ArgValue};
pub use relay::{EventRelay, RelayEvent};
pub use retry::{RetryPolicy, RetryState};
pub use runner::ScriptRunner;
pub use template::{ScriptTemplate, TemplateEngine, TemplateParams, TokenTemplate};
