//! Debugging-protocol transport.
//!
//! [`CdpTransport`] is the seam the session talks through; the production
//! implementation multiplexes one chromiumoxide websocket between command
//! round trips and out-of-band notifications.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::metrics;

const COMMAND_BACKLOG: usize = 128;
const EVENT_BACKLOG: usize = 512;
const PROBE_METHOD: &str = "Browser.getVersion";

/// A notification pushed by the browser, tagged with the flat-mode session
/// it belongs to (`None` for browser-level events).
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

/// One open debugging connection.
#[async_trait]
pub trait CdpTransport: Send + Sync {
    /// Next out-of-band notification; `None` once the connection is gone.
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError>;
    async fn close(&self);
}

/// Opens connections to a browser-level websocket endpoint.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, ws_url: &str) -> Result<Arc<dyn CdpTransport>, AdapterError>;
}

pub struct ChromiumConnector {
    cfg: CdpConfig,
}

impl ChromiumConnector {
    pub fn new(cfg: CdpConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl TransportConnector for ChromiumConnector {
    async fn connect(&self, ws_url: &str) -> Result<Arc<dyn CdpTransport>, AdapterError> {
        Ok(Arc::new(ChromiumTransport::connect(ws_url, &self.cfg).await?))
    }
}

type Reply = oneshot::Sender<Result<Value, AdapterError>>;

struct Outgoing {
    target: CommandTarget,
    method: String,
    params: Value,
    reply: Reply,
}

/// Transport over a chromiumoxide websocket connection.
pub struct ChromiumTransport {
    outgoing: mpsc::Sender<Outgoing>,
    incoming: Mutex<mpsc::Receiver<TransportEvent>>,
    closed: CancellationToken,
    deadline: Duration,
}

impl ChromiumTransport {
    pub async fn connect(ws_url: &str, cfg: &CdpConfig) -> Result<Self, AdapterError> {
        let conn = Connection::<CdpEventMessage>::connect(ws_url)
            .await
            .map_err(|err| io_error(err.to_string()))?;

        let (outgoing, commands) = mpsc::channel(COMMAND_BACKLOG);
        let (events, incoming) = mpsc::channel(EVENT_BACKLOG);
        let closed = CancellationToken::new();
        let deadline = Duration::from_millis(cfg.default_deadline_ms);

        let pump = Pump {
            conn,
            pending: HashMap::new(),
            events,
        };
        tokio::spawn(pump.run(commands, closed.clone()));

        if cfg.heartbeat_interval_ms > 0 {
            tokio::spawn(probe_liveness(
                outgoing.clone(),
                closed.clone(),
                Duration::from_millis(cfg.heartbeat_interval_ms),
                deadline.min(Duration::from_secs(5)),
            ));
        }

        info!(target: "cdp-transport", url = %ws_url, "debugging connection open");
        Ok(Self {
            outgoing,
            incoming: Mutex::new(incoming),
            closed,
            deadline,
        })
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn round_trip(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let (reply, answer) = oneshot::channel();
        self.outgoing
            .send(Outgoing {
                target,
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| io_error("connection closed"))?;

        match timeout(self.deadline, answer).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(io_error("connection dropped before replying")),
            Err(_) => Err(AdapterError::new(AdapterErrorKind::Timeout)
                .with_hint(format!("{method} got no reply within {:?}", self.deadline))),
        }
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn next_event(&self) -> Option<TransportEvent> {
        self.incoming.lock().await.recv().await
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        if !self.is_alive() {
            return Err(io_error("connection closed"));
        }
        metrics::record_command(method);
        let started = Instant::now();
        let result = self.round_trip(target, method, params).await;
        match &result {
            Ok(_) => metrics::record_command_success(method, started.elapsed()),
            Err(_) => metrics::record_command_failure(method),
        }
        result
    }

    async fn close(&self) {
        self.closed.cancel();
        debug!(target: "cdp-transport", "debugging connection closed");
    }
}

impl Drop for ChromiumTransport {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Owns the websocket. Commands go out as they arrive, replies are matched
/// to callers by call id, notifications are forwarded in receive order.
struct Pump {
    conn: Connection<CdpEventMessage>,
    pending: HashMap<CallId, Reply>,
    events: mpsc::Sender<TransportEvent>,
}

impl Pump {
    async fn run(mut self, mut commands: mpsc::Receiver<Outgoing>, closed: CancellationToken) {
        let outcome = loop {
            tokio::select! {
                _ = closed.cancelled() => break Ok(()),
                command = commands.recv() => match command {
                    Some(command) => self.submit(command),
                    None => break Ok(()),
                },
                message = self.conn.next() => match message {
                    Some(Ok(Message::Response(response))) => self.settle(response),
                    Some(Ok(Message::Event(event))) => self.forward(event).await,
                    Some(Err(err)) => break Err(classify(err)),
                    None => break Err(io_error("websocket closed by browser")),
                },
            }
        };
        closed.cancel();

        let reason = match outcome {
            Ok(()) => io_error("connection closed"),
            Err(err) => {
                error!(target: "cdp-transport", %err, "debugging connection failed");
                err
            }
        };
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(reason.clone()));
        }
    }

    fn submit(&mut self, command: Outgoing) {
        let session = match command.target {
            CommandTarget::Browser => None,
            CommandTarget::Session(id) => Some(CdpSessionId::from(id)),
        };
        let method: MethodId = command.method.into();
        match self.conn.submit_command(method, session, command.params) {
            Ok(call_id) => {
                self.pending.insert(call_id, command.reply);
            }
            Err(err) => {
                let _ = command.reply.send(Err(io_error(err.to_string())));
            }
        }
    }

    fn settle(&mut self, response: Response) {
        if let Some(reply) = self.pending.remove(&response.id) {
            let _ = reply.send(payload(response));
        }
    }

    async fn forward(&self, event: CdpEventMessage) {
        let raw: CdpJsonEventMessage = match event.try_into() {
            Ok(raw) => raw,
            Err(err) => {
                warn!(target: "cdp-transport", %err, "undecodable notification dropped");
                return;
            }
        };
        let event = TransportEvent {
            method: raw.method.into_owned(),
            params: raw.params,
            session_id: raw.session_id,
        };
        if self.events.send(event).await.is_err() {
            debug!(target: "cdp-transport", "no event consumer left");
        }
    }
}

/// Periodically asks the browser for its version; the first failed or
/// late answer marks the connection dead.
async fn probe_liveness(
    outgoing: mpsc::Sender<Outgoing>,
    closed: CancellationToken,
    every: Duration,
    patience: Duration,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = closed.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let (reply, answer) = oneshot::channel();
        let probe = Outgoing {
            target: CommandTarget::Browser,
            method: PROBE_METHOD.to_string(),
            params: json!({}),
            reply,
        };
        if outgoing.send(probe).await.is_err() {
            return;
        }
        match timeout(patience, answer).await {
            Ok(Ok(Ok(_))) => continue,
            Ok(Ok(Err(err))) => warn!(target: "cdp-transport", %err, "liveness probe rejected"),
            Ok(Err(_)) => debug!(target: "cdp-transport", "liveness probe abandoned"),
            Err(_) => warn!(target: "cdp-transport", ?patience, "liveness probe unanswered"),
        }
        closed.cancel();
        return;
    }
}

fn payload(response: Response) -> Result<Value, AdapterError> {
    match (response.result, response.error) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => Err(io_error(format!("{} ({})", error.message, error.code))
            .retriable(error.code >= 500)),
        (None, None) => {
            Err(AdapterError::new(AdapterErrorKind::Protocol).with_hint("reply without result"))
        }
    }
}

fn classify(err: CdpError) -> AdapterError {
    let hint = err.to_string();
    match err {
        CdpError::Timeout => AdapterError::new(AdapterErrorKind::Timeout)
            .with_hint(hint)
            .retriable(true),
        CdpError::Serde(_) | CdpError::DecodeError(_) => {
            AdapterError::new(AdapterErrorKind::Protocol).with_hint(hint)
        }
        _ => io_error(hint).retriable(true),
    }
}

fn io_error(hint: impl Into<String>) -> AdapterError {
    AdapterError::new(AdapterErrorKind::CdpIo).with_hint(hint)
}
