//! Scripted stand-ins for the browser side of a [`Session`], for tests in
//! this crate and in crates built on it (enable the `testing` feature).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::launcher::{BrowserProcess, Launcher};
use crate::session::Session;
use crate::transport::{CdpTransport, CommandTarget, TransportConnector, TransportEvent};

/// Page session id the mock attaches to.
pub const MOCK_SESSION_ID: &str = "S1";

/// Transport that records commands and answers them from queued or
/// parameter-keyed responses. Unscripted commands answer `{}`.
pub struct MockTransport {
    rx: AsyncMutex<mpsc::Receiver<TransportEvent>>,
    commands: Mutex<Vec<(String, Value)>>,
    responses: Mutex<HashMap<String, VecDeque<Value>>>,
    keyed: Mutex<Vec<(String, Value, Value)>>,
    closed: AtomicBool,
    hangup: CancellationToken,
}

impl MockTransport {
    pub fn new_pair() -> (Arc<Self>, mpsc::Sender<TransportEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                rx: AsyncMutex::new(rx),
                commands: Mutex::new(Vec::new()),
                responses: Mutex::new(HashMap::new()),
                keyed: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                hangup: CancellationToken::new(),
            }),
            tx,
        )
    }

    pub fn methods(&self) -> Vec<String> {
        self.commands.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn params_for(&self, method: &str) -> Vec<Value> {
        self.commands
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Queues `value` as the next answer to `method`.
    pub fn respond(&self, method: &str, value: Value) {
        self.responses
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(value);
    }

    /// Answers `method` with `value` whenever it is called with exactly `params`.
    pub fn respond_to(&self, method: &str, params: Value, value: Value) {
        self.keyed.lock().push((method.to_string(), params, value));
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ends the event stream as if the browser went away.
    pub fn hang_up(&self) {
        self.hangup.cancel();
    }
}

#[async_trait]
impl CdpTransport for MockTransport {
    async fn next_event(&self) -> Option<TransportEvent> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.hangup.cancelled() => None,
            event = rx.recv() => event,
        }
    }

    async fn send_command(
        &self,
        _target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let keyed = self
            .keyed
            .lock()
            .iter()
            .find(|(m, p, _)| m == method && *p == params)
            .map(|(_, _, v)| v.clone());
        self.commands.lock().push((method.to_string(), params));
        if let Some(value) = keyed {
            return Ok(value);
        }
        if let Some(value) = self
            .responses
            .lock()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            return Ok(value);
        }
        Ok(match method {
            "Target.getTargets" => json!({
                "targetInfos": [{"targetId": "T1", "type": "page", "url": "about:blank"}]
            }),
            "Target.attachToTarget" => json!({ "sessionId": MOCK_SESSION_ID }),
            _ => json!({}),
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockConnector {
    transport: Arc<MockTransport>,
    fail: bool,
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self, _ws_url: &str) -> Result<Arc<dyn CdpTransport>, AdapterError> {
        if self.fail {
            return Err(AdapterError::new(AdapterErrorKind::CdpIo).with_hint("refused"));
        }
        Ok(self.transport.clone() as Arc<dyn CdpTransport>)
    }
}

#[derive(Default)]
pub struct MockLauncher {
    launches: Arc<AtomicUsize>,
    terminations: Arc<AtomicUsize>,
}

struct MockProcess {
    terminations: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserProcess for MockProcess {
    fn port(&self) -> u16 {
        9222
    }

    fn ws_url(&self) -> Option<&str> {
        Some("ws://127.0.0.1:9222/devtools/browser/mock")
    }

    async fn terminate(&mut self) -> Result<(), AdapterError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(
        &self,
        _port: u16,
        _flags: &[String],
    ) -> Result<Box<dyn BrowserProcess>, AdapterError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockProcess {
            terminations: self.terminations.clone(),
        }))
    }
}

/// A session wired to a mock launcher and transport.
pub struct Harness {
    pub session: Arc<Session>,
    pub transport: Arc<MockTransport>,
    pub events: mpsc::Sender<TransportEvent>,
    launches: Arc<AtomicUsize>,
    terminations: Arc<AtomicUsize>,
}

impl Harness {
    pub fn new(cfg: CdpConfig, fail_connect: bool) -> Self {
        let (transport, events) = MockTransport::new_pair();
        let launcher = MockLauncher::default();
        let launches = launcher.launches.clone();
        let terminations = launcher.terminations.clone();
        let connector = MockConnector {
            transport: transport.clone(),
            fail: fail_connect,
        };
        let session = Arc::new(Session::with_parts(
            cfg,
            Arc::new(launcher),
            Arc::new(connector),
        ));
        Self {
            session,
            transport,
            events,
            launches,
            terminations,
        }
    }

    /// Delivers a page-session event. Returns `false` once the session's
    /// event pump is gone.
    pub async fn emit(&self, method: &str, params: Value) -> bool {
        self.events
            .send(TransportEvent {
                method: method.to_string(),
                params,
                session_id: Some(MOCK_SESSION_ID.into()),
            })
            .await
            .is_ok()
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}
