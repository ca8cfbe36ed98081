//! DOM-observation variant of interception.
//!
//! Every `DOM.childNodeInserted` starts a `DOM.getOuterHTML` fetch right away;
//! the ordered queue hands the markup back in insertion order even though
//! the fetches settle in whatever order the browser answers them.

use std::sync::Arc;

use feedtap_event_bus::{Delivered, OrderedQueue};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{AdapterError, AdapterErrorKind};
use crate::events::{ChildInserted, SessionEvent};
use crate::session::{PageHandle, Session};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInserted {
    pub node_id: i64,
    pub parent_node_id: i64,
    pub previous_node_id: i64,
    pub html: String,
}

impl From<Delivered<ChildInserted, String>> for NodeInserted {
    fn from(delivered: Delivered<ChildInserted, String>) -> Self {
        Self {
            node_id: delivered.meta.node_id,
            parent_node_id: delivered.meta.parent_node_id,
            previous_node_id: delivered.meta.previous_node_id,
            html: delivered.value,
        }
    }
}

pub struct DomObserver {
    task: JoinHandle<()>,
    output: mpsc::Receiver<Delivered<ChildInserted, String>>,
}

impl DomObserver {
    /// Subscribes to `session` and starts observing. The session must have
    /// been configured with `observe_dom`.
    pub fn spawn(session: Arc<Session>, capacity: usize) -> Self {
        let events = session.subscribe();
        let (queue, output) = OrderedQueue::spawn(capacity);
        let task = tokio::spawn(Self::observe(session, events, queue));
        Self { task, output }
    }

    /// Next inserted node, in insertion order. `None` once observation ended.
    pub async fn next(&mut self) -> Option<NodeInserted> {
        self.output.recv().await.map(NodeInserted::from)
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    async fn observe(
        session: Arc<Session>,
        mut events: broadcast::Receiver<SessionEvent>,
        queue: OrderedQueue<ChildInserted, String>,
    ) {
        loop {
            match events.recv().await {
                Ok(SessionEvent::PageLoaded) => {
                    // node ids are only reported for a document the client has requested
                    if let Err(err) = session
                        .command("DOM.getDocument", json!({ "depth": -1 }))
                        .await
                    {
                        warn!(target: "dom-observer", %err, "failed to fetch document root");
                    }
                }
                Ok(SessionEvent::ChildInserted(child)) => {
                    let Some(page) = session.page_handle() else {
                        break;
                    };
                    debug!(target: "dom-observer", node = child.node_id, "child inserted");
                    if queue.push(child, outer_html(page, child.node_id)).is_err() {
                        break;
                    }
                }
                Ok(SessionEvent::Disconnected { .. }) => break,
                Ok(SessionEvent::Console(_)) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "dom-observer", skipped, "observer lagged; insertions lost");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        queue.close().await;
    }
}

async fn outer_html(page: PageHandle, node_id: i64) -> Result<String, AdapterError> {
    let response = page
        .command("DOM.getOuterHTML", json!({ "nodeId": node_id }))
        .await?;
    response
        .get("outerHTML")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::Protocol).with_hint("getOuterHTML missing outerHTML")
        })
}
