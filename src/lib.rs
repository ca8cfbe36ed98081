//! feedtap: drives a headless browser into a live chat room and taps the
//! page's own socket feed.
//!
//! The library half holds everything the `feedtap` binary wires together so
//! it can be exercised from integration tests.

pub mod config;
pub mod cookies;
pub mod output;
pub mod watcher;

pub use config::{load_config, AppConfig, LoadedConfig};
pub use cookies::has_session_cookie;
pub use watcher::{room_path, WatchError, Watcher};
