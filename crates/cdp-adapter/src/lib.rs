//! Chromium DevTools session controller.
//!
//! A [`Session`] owns exactly one browser process and one debugging
//! connection attached to its page target. It exposes navigation with a
//! page-load barrier, script evaluation that never throws page exceptions at
//! the caller, cookie lookup, and a broadcast stream of page loads, console
//! calls and DOM insertions.

pub mod config;
pub mod dom;
pub mod error;
pub mod events;
pub mod launcher;
pub mod metrics;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod util;

pub use config::CdpConfig;
pub use dom::{DomObserver, NodeInserted};
pub use error::{AdapterError, AdapterErrorKind};
pub use events::{ChildInserted, Cookie, LogEntry, SessionEvent};
pub use launcher::{AttachLauncher, BrowserProcess, ChromeLauncher, Launcher};
pub use metrics::AdapterMetricsSnapshot;
pub use session::{Evaluation, PageHandle, Session};
pub use transport::{CdpTransport, CommandTarget, TransportConnector, TransportEvent};
