//! Application loop: start the session, open the room, re-inject after every
//! page load and relay feed events until shutdown or a lost connection.

use std::future::Future;
use std::sync::Arc;

use cdp_adapter::{AdapterError, Session, SessionEvent};
use feed_patch::{EventRelay, InjectionReport, Injector, RelayEvent};
use feedtap_event_bus::InMemoryBus;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to start browser session: {0}")]
    Start(#[source] AdapterError),
    #[error("failed to open room: {0}")]
    Navigate(#[source] AdapterError),
    #[error("browser connection lost: {reason}")]
    Disconnected { reason: String },
}

pub struct Watcher {
    session: Arc<Session>,
    injector: Arc<Injector>,
    bus: Arc<InMemoryBus<RelayEvent>>,
}

impl Watcher {
    pub fn new(
        session: Arc<Session>,
        injector: Arc<Injector>,
        bus: Arc<InMemoryBus<RelayEvent>>,
    ) -> Self {
        Self {
            session,
            injector,
            bus,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn bus(&self) -> Arc<InMemoryBus<RelayEvent>> {
        self.bus.clone()
    }

    /// Watches `room` until `shutdown` resolves or the browser connection is
    /// lost. The session is stopped before this returns, whatever the outcome.
    pub async fn run<F>(&self, room: &str, shutdown: F) -> Result<(), WatchError>
    where
        F: Future<Output = ()>,
    {
        self.session.start().await.map_err(WatchError::Start)?;
        let relay = EventRelay::spawn(
            self.session.subscribe(),
            self.injector.prefix().clone(),
            self.bus.clone(),
        );
        let events = self.session.subscribe();

        let outcome = self.supervise(room, events, shutdown).await;

        relay.stop().await;
        match &outcome {
            Err(err @ WatchError::Disconnected { .. }) => self.session.stop_on_fatal(err).await,
            _ => self.session.stop().await,
        }
        outcome
    }

    async fn supervise<F>(
        &self,
        room: &str,
        mut events: broadcast::Receiver<SessionEvent>,
        shutdown: F,
    ) -> Result<(), WatchError>
    where
        F: Future<Output = ()>,
    {
        let path = room_path(room);
        info!(target: "feedtap", %path, "opening room");
        let navigate = self.session.navigate(&path);
        tokio::pin!(navigate);
        tokio::pin!(shutdown);
        let mut navigated = false;
        let mut injection: Option<JoinHandle<InjectionReport>> = None;

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(target: "feedtap", "shutdown requested");
                    break Ok(());
                }
                result = &mut navigate, if !navigated => {
                    navigated = true;
                    if let Err(err) = result {
                        break Err(WatchError::Navigate(err));
                    }
                    info!(target: "feedtap", %path, "room loaded");
                }
                event = events.recv() => match event {
                    Ok(SessionEvent::PageLoaded) => {
                        if let Some(previous) = injection.take() {
                            previous.abort();
                        }
                        injection = Some(self.spawn_injection());
                    }
                    Ok(SessionEvent::Disconnected { reason }) => {
                        break Err(WatchError::Disconnected { reason });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "feedtap", skipped, "watcher lagged behind session events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break Err(WatchError::Disconnected {
                            reason: "session event stream closed".into(),
                        });
                    }
                },
            }
        };

        if let Some(task) = injection {
            task.abort();
        }
        outcome
    }

    fn spawn_injection(&self) -> JoinHandle<InjectionReport> {
        let session = self.session.clone();
        let injector = self.injector.clone();
        tokio::spawn(async move {
            let report = injector.inject(session.as_ref()).await;
            info!(
                target: "feedtap",
                room = ?report.probe.as_ref().and_then(|probe| probe.room.as_deref()),
                hooks = ?report.hooks,
                disposal = ?report.disposal,
                "injection finished"
            );
            report
        })
    }
}

/// Page path of a room, e.g. `alice` → `alice/`.
pub fn room_path(room: &str) -> String {
    format!("{}/", room.trim_matches('/'))
}
