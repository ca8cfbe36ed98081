//! Turns the session's console stream into typed feed events on a bus.
//!
//! The relay only holds a subscription to the session; it never keeps the
//! session alive. Messages are decoded and published in console order.

use std::sync::Arc;

use cdp_adapter::SessionEvent;
use feedtap_event_bus::{BusError, EventBus, InMemoryBus};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{self, ClosePayload, FeedEvent, MessageKind, PatchMessage, PatchPrefix, SettingsSnapshot};
use crate::error::PatchError;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RelayEvent {
    Init(SettingsSnapshot),
    Hooked(SettingsSnapshot),
    Opened,
    Feed(FeedEvent),
    SocketError(Value),
    Closed(ClosePayload),
}

impl RelayEvent {
    /// Types a decoded message. `Ok(None)` for socket messages that are not
    /// feed traffic.
    pub fn from_message(message: PatchMessage) -> Result<Option<Self>, PatchError> {
        let event = match message.kind {
            MessageKind::Init => RelayEvent::Init(SettingsSnapshot::from_payload(message.payload)?),
            MessageKind::Hooked => {
                RelayEvent::Hooked(SettingsSnapshot::from_payload(message.payload)?)
            }
            MessageKind::Open => RelayEvent::Opened,
            MessageKind::Message => match FeedEvent::from_payload(message.payload)? {
                Some(feed) => RelayEvent::Feed(feed),
                None => return Ok(None),
            },
            MessageKind::Error => RelayEvent::SocketError(message.payload),
            MessageKind::Close => RelayEvent::Closed(ClosePayload::from_payload(message.payload)?),
        };
        Ok(Some(event))
    }
}

pub struct EventRelay {
    task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl EventRelay {
    pub fn spawn(
        events: broadcast::Receiver<SessionEvent>,
        prefix: PatchPrefix,
        bus: Arc<InMemoryBus<RelayEvent>>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Self::run(events, prefix, bus, shutdown.clone()));
        Self { task, shutdown }
    }

    /// Stops relaying and waits for the task to finish.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        let _ = (&mut self.task).await;
    }

    async fn run(
        mut events: broadcast::Receiver<SessionEvent>,
        prefix: PatchPrefix,
        bus: Arc<InMemoryBus<RelayEvent>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(SessionEvent::Console(entry)) => {
                    let Some(message) = codec::decode(&prefix, &entry) else {
                        continue;
                    };
                    let kind = message.kind;
                    match RelayEvent::from_message(message) {
                        Ok(Some(event)) => publish(&bus, event).await,
                        Ok(None) => trace!(target: "feed-relay", "non-feed socket message"),
                        Err(err) => {
                            debug!(target: "feed-relay", ?kind, %err, "dropping undecodable payload")
                        }
                    }
                }
                Ok(SessionEvent::Disconnected { reason }) => {
                    info!(target: "feed-relay", %reason, "session disconnected; relay stopping");
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "feed-relay", skipped, "relay lagged; console entries lost");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

impl Drop for EventRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn publish(bus: &InMemoryBus<RelayEvent>, event: RelayEvent) {
    match bus.publish(event).await {
        Ok(()) => {}
        Err(BusError::NoSubscribers) => trace!(target: "feed-relay", "no relay subscribers"),
        Err(err) => warn!(target: "feed-relay", %err, "failed to publish relay event"),
    }
}
