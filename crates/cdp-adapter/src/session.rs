//! Session controller: one browser process plus one debugging connection.
//!
//! The process handle and the connection are acquired together by
//! [`Session::start`] and released together by [`Session::stop`]; both live in
//! a single `Option<Live>`, so one can never exist without the other.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::events::{ChildInserted, Cookie, LogEntry, SessionEvent};
use crate::launcher::{launcher_for, BrowserProcess, Launcher};
use crate::metrics;
use crate::transport::{ChromiumConnector, CdpTransport, CommandTarget, TransportConnector};
use crate::util::resolve_ws_url;

/// Outcome of a page script evaluation. Page-side exceptions never surface as
/// errors; they come back as [`Evaluation::Failed`].
#[derive(Clone, Debug, PartialEq)]
pub enum Evaluation {
    Value(Value),
    Empty,
    Failed,
}

impl Evaluation {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Evaluation::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Evaluation::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Evaluation::Failed)
    }
}

/// Borrowed view of the live page connection, valid for a single call chain.
#[derive(Clone)]
pub struct PageHandle {
    transport: Arc<dyn CdpTransport>,
    session_id: String,
}

impl PageHandle {
    pub async fn command(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        self.transport
            .send_command(CommandTarget::Session(self.session_id.clone()), method, params)
            .await
    }
}

struct Live {
    transport: Arc<dyn CdpTransport>,
    process: Box<dyn BrowserProcess>,
    page_session: String,
    shutdown: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

impl Drop for Live {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

type LoadWaiters = Arc<Mutex<Vec<oneshot::Sender<()>>>>;

pub struct Session {
    cfg: CdpConfig,
    launcher: Arc<dyn Launcher>,
    connector: Arc<dyn TransportConnector>,
    live: Mutex<Option<Live>>,
    events: broadcast::Sender<SessionEvent>,
    load_waiters: LoadWaiters,
}

impl Session {
    /// Session wired to a real Chromium (launched, or attached via `websocket_url`).
    pub fn new(cfg: CdpConfig) -> Self {
        let launcher: Arc<dyn Launcher> = Arc::from(launcher_for(&cfg));
        let connector: Arc<dyn TransportConnector> = Arc::new(ChromiumConnector::new(cfg.clone()));
        Self::with_parts(cfg, launcher, connector)
    }

    pub fn with_parts(
        cfg: CdpConfig,
        launcher: Arc<dyn Launcher>,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            cfg,
            launcher,
            connector,
            live: Mutex::new(None),
            events,
            load_waiters: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn config(&self) -> &CdpConfig {
        &self.cfg
    }

    pub fn is_running(&self) -> bool {
        self.live.lock().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Current page connection, or `None` when the session is inert.
    pub fn page_handle(&self) -> Option<PageHandle> {
        self.live.lock().as_ref().map(|live| PageHandle {
            transport: Arc::clone(&live.transport),
            session_id: live.page_session.clone(),
        })
    }

    /// Launches the browser, connects, attaches to the page and enables the
    /// page, runtime and network domains. Calling it on a running session is
    /// a no-op. On failure nothing stays registered and the process is torn
    /// down again.
    pub async fn start(&self) -> Result<(), AdapterError> {
        if self.is_running() {
            debug!(target: "cdp-session", "start called on running session");
            return Ok(());
        }

        info!(target: "cdp-session", port = self.cfg.port, "launching browser");
        let mut process = self
            .launcher
            .launch(self.cfg.port, &self.cfg.extra_flags)
            .await?;

        let transport = match self.connect(process.as_ref()).await {
            Ok(transport) => transport,
            Err(err) => {
                Self::release_process(process.as_mut()).await;
                return Err(err);
            }
        };

        let page_session = match self.prepare_page(&transport).await {
            Ok(session_id) => session_id,
            Err(err) => {
                transport.close().await;
                Self::release_process(process.as_mut()).await;
                return Err(err);
            }
        };

        let shutdown = CancellationToken::new();
        let pump = spawn(Self::pump(
            Arc::clone(&transport),
            page_session.clone(),
            self.events.clone(),
            Arc::clone(&self.load_waiters),
            shutdown.clone(),
        ));

        *self.live.lock() = Some(Live {
            transport,
            process,
            page_session,
            shutdown,
            pump: Some(pump),
        });
        info!(target: "cdp-session", "debugging session ready");
        Ok(())
    }

    async fn connect(
        &self,
        process: &dyn BrowserProcess,
    ) -> Result<Arc<dyn CdpTransport>, AdapterError> {
        let ws_url = match process.ws_url() {
            Some(url) => url.to_string(),
            None => resolve_ws_url(process.port(), self.deadline())
                .await
                .map_err(|err| {
                    AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string())
                })?,
        };
        debug!(target: "cdp-session", url = %ws_url, "opening debugging connection");
        self.connector.connect(&ws_url).await
    }

    async fn prepare_page(&self, transport: &Arc<dyn CdpTransport>) -> Result<String, AdapterError> {
        let target_id = Self::page_target(transport).await?;
        let attached = transport
            .send_command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Protocol)
                    .with_hint("attachToTarget missing sessionId")
            })?
            .to_string();

        let mut domains = vec!["Page.enable", "Runtime.enable", "Network.enable"];
        if self.cfg.observe_dom {
            domains.push("DOM.enable");
        }
        for method in domains {
            debug!(target: "cdp-session", method, "enabling domain");
            transport
                .send_command(CommandTarget::Session(session_id.clone()), method, json!({}))
                .await?;
        }
        Ok(session_id)
    }

    async fn page_target(transport: &Arc<dyn CdpTransport>) -> Result<String, AdapterError> {
        let targets = transport
            .send_command(CommandTarget::Browser, "Target.getTargets", json!({}))
            .await?;
        let existing = targets
            .get("targetInfos")
            .and_then(Value::as_array)
            .and_then(|infos| {
                infos.iter().find_map(|info| {
                    (info.get("type").and_then(Value::as_str) == Some("page"))
                        .then(|| info.get("targetId").and_then(Value::as_str))
                        .flatten()
                })
            });
        if let Some(target_id) = existing {
            return Ok(target_id.to_string());
        }

        let created = transport
            .send_command(
                CommandTarget::Browser,
                "Target.createTarget",
                json!({ "url": "about:blank" }),
            )
            .await?;
        created
            .get("targetId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Protocol)
                    .with_hint("createTarget missing targetId")
            })
    }

    async fn pump(
        transport: Arc<dyn CdpTransport>,
        page_session: String,
        events: broadcast::Sender<SessionEvent>,
        waiters: LoadWaiters,
        shutdown: CancellationToken,
    ) {
        debug!(target: "cdp-session", "event pump entered");
        loop {
            select! {
                _ = shutdown.cancelled() => break,
                event = transport.next_event() => {
                    let Some(event) = event else {
                        if !shutdown.is_cancelled() {
                            let _ = events.send(SessionEvent::Disconnected {
                                reason: "debugging connection closed".into(),
                            });
                        }
                        break;
                    };
                    if event
                        .session_id
                        .as_deref()
                        .is_some_and(|id| id != page_session)
                    {
                        continue;
                    }
                    metrics::record_event();
                    match event.method.as_str() {
                        "Page.loadEventFired" => {
                            let pending: Vec<_> = waiters.lock().drain(..).collect();
                            debug!(target: "cdp-session", waiters = pending.len(), "page load completed");
                            for waiter in pending {
                                let _ = waiter.send(());
                            }
                            let _ = events.send(SessionEvent::PageLoaded);
                        }
                        "Runtime.consoleAPICalled" => {
                            let _ = events.send(SessionEvent::Console(LogEntry::from_params(&event.params)));
                        }
                        "DOM.childNodeInserted" => {
                            if let Some(child) = ChildInserted::from_params(&event.params) {
                                let _ = events.send(SessionEvent::ChildInserted(child));
                            }
                        }
                        "Inspector.detached" => {
                            let reason = event
                                .params
                                .get("reason")
                                .and_then(Value::as_str)
                                .unwrap_or("inspector detached")
                                .to_string();
                            let _ = events.send(SessionEvent::Disconnected { reason });
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
        waiters.lock().clear();
        debug!(target: "cdp-session", "event pump exited");
    }

    /// Runs `action` and resolves once the next page load completes after it
    /// was started. Every call owns its own single-use load signal.
    pub async fn wait_for<F, Fut, T>(&self, action: F) -> Result<T, AdapterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        if !self.is_running() {
            return Err(AdapterError::inert());
        }
        let (tx, rx) = oneshot::channel();
        self.load_waiters.lock().push(tx);

        let value = action().await?;
        rx.await.map_err(|_| {
            AdapterError::inert().with_hint("session stopped before the page finished loading")
        })?;
        Ok(value)
    }

    /// Navigates to `path` relative to the configured base address and waits
    /// for the resulting load.
    pub async fn navigate(&self, path: &str) -> Result<(), AdapterError> {
        let url = self.cfg.resolve_url(path);
        info!(target: "cdp-session", %url, "navigating");
        self.wait_for(|| async {
            let response = self.command("Page.navigate", json!({ "url": url })).await?;
            if let Some(error_text) = response.get("errorText").and_then(Value::as_str) {
                return Err(AdapterError::new(AdapterErrorKind::CdpIo)
                    .with_hint(format!("navigation to {url} failed: {error_text}")));
            }
            Ok(())
        })
        .await
    }

    /// Sends a command to the attached page.
    pub async fn command(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        let handle = self.page_handle().ok_or_else(AdapterError::inert)?;
        handle.command(method, params).await
    }

    /// Evaluates `script` in the current page context.
    pub async fn evaluate(
        &self,
        script: &str,
        await_promise: bool,
        return_by_value: bool,
    ) -> Evaluation {
        let response = match self
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": script,
                    "awaitPromise": await_promise,
                    "returnByValue": return_by_value,
                }),
            )
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_inert() => {
                debug!(target: "cdp-session", "evaluate on inert session");
                return Evaluation::Failed;
            }
            Err(err) => {
                warn!(target: "cdp-session", %err, "evaluate command failed");
                metrics::record_evaluation_failure();
                return Evaluation::Failed;
            }
        };

        if let Some(details) = response.get("exceptionDetails") {
            metrics::record_evaluation_failure();
            let description = details
                .get("exception")
                .and_then(|exc| exc.get("description"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let text = details.get("text").and_then(Value::as_str).unwrap_or_default();
            let line = details.get("lineNumber").and_then(Value::as_i64).unwrap_or_default();
            let column = details.get("columnNumber").and_then(Value::as_i64).unwrap_or_default();
            warn!(
                target: "cdp-session",
                text,
                line,
                column,
                description,
                "page raised during evaluation"
            );
            return Evaluation::Failed;
        }

        if !return_by_value {
            return Evaluation::Empty;
        }
        match response.get("result").and_then(|result| result.get("value")) {
            Some(value) => Evaluation::Value(value.clone()),
            None => Evaluation::Empty,
        }
    }

    /// Cookies visible to the configured base address.
    pub async fn cookies(&self) -> Result<Vec<Cookie>, AdapterError> {
        let response = self
            .command("Network.getCookies", json!({ "urls": [self.cfg.resolve_url("")] }))
            .await?;
        let cookies = response.get("cookies").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(cookies).map_err(|err| {
            AdapterError::new(AdapterErrorKind::Protocol)
                .with_hint(format!("malformed cookie list: {err}"))
        })
    }

    /// Closes the connection and terminates the process. Safe to call at any
    /// time, any number of times.
    pub async fn stop(&self) {
        self.load_waiters.lock().clear();
        let Some(mut live) = self.live.lock().take() else {
            debug!(target: "cdp-session", "stop on inert session");
            return;
        };

        live.shutdown.cancel();
        info!(target: "cdp-session", "closing debugging connection");
        live.transport.close().await;
        if let Some(pump) = live.pump.take() {
            let _ = pump.await;
        }
        info!(target: "cdp-session", "terminating browser");
        Self::release_process(live.process.as_mut()).await;
    }

    /// Teardown path for unexpected fatal conditions; the cause is logged
    /// before anything is released.
    pub async fn stop_on_fatal(&self, cause: &(dyn std::fmt::Display + Sync)) {
        error!(target: "cdp-session", %cause, "fatal condition; stopping session");
        self.stop().await;
    }

    async fn release_process(process: &mut dyn BrowserProcess) {
        if let Err(err) = process.terminate().await {
            warn!(target: "cdp-session", %err, "failed to terminate browser process");
        }
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.cfg.default_deadline_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use crate::transport::TransportEvent;
    use tokio::time::{timeout, Duration as TokioDuration};

    fn test_config() -> CdpConfig {
        CdpConfig {
            base_url: "https://example.test".into(),
            heartbeat_interval_ms: 0,
            ..CdpConfig::default()
        }
    }

    #[tokio::test]
    async fn start_attaches_and_enables_domains() {
        let harness = Harness::new(test_config(), false);
        harness.session.start().await.expect("start");

        assert!(harness.session.is_running());
        assert_eq!(
            harness.transport.methods(),
            vec![
                "Target.getTargets",
                "Target.attachToTarget",
                "Page.enable",
                "Runtime.enable",
                "Network.enable"
            ]
        );
        harness.session.stop().await;
    }

    #[tokio::test]
    async fn observe_dom_enables_dom_domain() {
        let mut cfg = test_config();
        cfg.observe_dom = true;
        let harness = Harness::new(cfg, false);
        harness.session.start().await.expect("start");
        assert!(harness.transport.methods().contains(&"DOM.enable".to_string()));
        harness.session.stop().await;
    }

    #[tokio::test]
    async fn failed_connect_propagates_and_releases_process() {
        let harness = Harness::new(test_config(), true);
        let err = harness.session.start().await.expect_err("connect must fail");

        assert_eq!(err.kind, AdapterErrorKind::CdpIo);
        assert!(!harness.session.is_running());
        assert_eq!(harness.launches(), 1);
        assert_eq!(harness.terminations(), 1);
        assert!(harness.transport.methods().is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_safe_before_start() {
        let harness = Harness::new(test_config(), false);
        harness.session.stop().await;
        harness.session.stop().await;
        assert!(!harness.session.is_running());

        harness.session.start().await.expect("start");
        harness.session.stop().await;
        harness.session.stop().await;

        assert!(!harness.session.is_running());
        assert!(harness.transport.closed());
        assert_eq!(harness.terminations(), 1);
    }

    #[tokio::test]
    async fn stopped_session_is_inert() {
        let harness = Harness::new(test_config(), false);
        harness.session.start().await.expect("start");
        harness.session.stop().await;

        let err = harness.session.navigate("room").await.expect_err("inert");
        assert!(err.is_inert());
        assert_eq!(
            harness.session.evaluate("1 + 1", false, true).await,
            Evaluation::Failed
        );
        assert!(harness.session.page_handle().is_none());
    }

    #[tokio::test]
    async fn navigate_resolves_after_next_load() {
        let harness = Harness::new(test_config(), false);
        harness.session.start().await.expect("start");

        let session = harness.session.clone();
        let nav = tokio::spawn(async move { session.navigate("/someroom/").await });

        tokio::time::sleep(TokioDuration::from_millis(20)).await;
        assert!(!nav.is_finished(), "navigate must wait for the load event");
        assert_eq!(
            harness.transport.params_for("Page.navigate"),
            vec![json!({ "url": "https://example.test/someroom/" })]
        );

        harness.emit("Page.loadEventFired", json!({ "timestamp": 1.0 })).await;
        timeout(TokioDuration::from_secs(1), nav)
            .await
            .expect("navigate resolves")
            .expect("join")
            .expect("navigate ok");
        harness.session.stop().await;
    }

    #[tokio::test]
    async fn nested_wait_ignores_loads_before_it_started() {
        let harness = Harness::new(test_config(), false);
        harness.session.start().await.expect("start");
        let mut events = harness.session.subscribe();

        let session = harness.session.clone();
        let transport_events = harness.events.clone();
        let outer = tokio::spawn(async move {
            session
                .wait_for(|| async {
                    // this load satisfies only the outer waiter
                    transport_events
                        .send(TransportEvent {
                            method: "Page.loadEventFired".into(),
                            params: json!({}),
                            session_id: Some("S1".into()),
                        })
                        .await
                        .expect("emit");
                    Ok(())
                })
                .await
        });
        timeout(TokioDuration::from_secs(1), outer)
            .await
            .expect("outer resolves")
            .expect("join")
            .expect("outer ok");
        assert_eq!(events.recv().await.expect("event"), SessionEvent::PageLoaded);

        let session = harness.session.clone();
        let inner = tokio::spawn(async move { session.wait_for(|| async { Ok(()) }).await });
        tokio::time::sleep(TokioDuration::from_millis(20)).await;
        assert!(!inner.is_finished(), "a consumed load must not resolve a later wait");

        harness.emit("Page.loadEventFired", json!({})).await;
        timeout(TokioDuration::from_secs(1), inner)
            .await
            .expect("inner resolves")
            .expect("join")
            .expect("inner ok");
        harness.session.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_pending_waits() {
        let harness = Harness::new(test_config(), false);
        harness.session.start().await.expect("start");

        let session = harness.session.clone();
        let pending = tokio::spawn(async move { session.wait_for(|| async { Ok(()) }).await });
        tokio::time::sleep(TokioDuration::from_millis(20)).await;
        harness.session.stop().await;

        let err = timeout(TokioDuration::from_secs(1), pending)
            .await
            .expect("wait released")
            .expect("join")
            .expect_err("stopped");
        assert!(err.is_inert());
    }

    #[tokio::test]
    async fn evaluate_maps_results_and_exceptions() {
        let harness = Harness::new(test_config(), false);
        harness.session.start().await.expect("start");

        harness.transport.respond(
            "Runtime.evaluate",
            json!({ "result": { "type": "number", "value": 2 } }),
        );
        harness
            .transport
            .respond("Runtime.evaluate", json!({ "result": { "type": "undefined" } }));
        harness.transport.respond(
            "Runtime.evaluate",
            json!({
                "result": { "type": "object", "subtype": "error" },
                "exceptionDetails": {
                    "text": "Uncaught",
                    "lineNumber": 0,
                    "columnNumber": 4,
                    "exception": { "description": "ReferenceError: ws_handler is not defined" }
                }
            }),
        );

        assert_eq!(
            harness.session.evaluate("1 + 1", false, true).await,
            Evaluation::Value(json!(2))
        );
        assert_eq!(
            harness.session.evaluate("void 0", false, true).await,
            Evaluation::Empty
        );
        assert_eq!(
            harness.session.evaluate("ws_handler.x", false, true).await,
            Evaluation::Failed
        );

        let sent = harness.transport.params_for("Runtime.evaluate");
        assert_eq!(sent[0]["returnByValue"], json!(true));
        assert_eq!(sent[0]["awaitPromise"], json!(false));
        harness.session.stop().await;
    }

    #[tokio::test]
    async fn console_and_dom_events_are_published() {
        let harness = Harness::new(test_config(), false);
        harness.session.start().await.expect("start");
        let mut events = harness.session.subscribe();

        harness
            .emit(
                "Runtime.consoleAPICalled",
                json!({ "type": "debug", "args": [{ "type": "string", "value": "hello" }] }),
            )
            .await;
        harness
            .emit(
                "DOM.childNodeInserted",
                json!({ "parentNodeId": 1, "previousNodeId": 2, "node": { "nodeId": 3 } }),
            )
            .await;
        harness
            .events
            .send(TransportEvent {
                method: "Runtime.consoleAPICalled".into(),
                params: json!({ "type": "debug", "args": [] }),
                session_id: Some("other-session".into()),
            })
            .await
            .expect("emit");

        let first = timeout(TokioDuration::from_secs(1), events.recv())
            .await
            .expect("console in time")
            .expect("console");
        assert_eq!(
            first,
            SessionEvent::Console(LogEntry::new("debug", vec!["hello".into()]))
        );
        let second = timeout(TokioDuration::from_secs(1), events.recv())
            .await
            .expect("dom in time")
            .expect("dom");
        assert_eq!(
            second,
            SessionEvent::ChildInserted(ChildInserted {
                node_id: 3,
                parent_node_id: 1,
                previous_node_id: 2
            })
        );
        harness.session.stop().await;
    }

    #[tokio::test]
    async fn dropped_connection_reports_disconnect() {
        let harness = Harness::new(test_config(), false);
        harness.session.start().await.expect("start");
        let mut events = harness.session.subscribe();

        harness.transport.hang_up();
        let session = harness.session.clone();

        let event = timeout(TokioDuration::from_secs(1), events.recv())
            .await
            .expect("disconnect in time")
            .expect("disconnect");
        assert!(matches!(event, SessionEvent::Disconnected { .. }));
        session.stop_on_fatal(&"connection lost").await;
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn fatal_teardown_runs_on_a_spawned_task() {
        let harness = Harness::new(test_config(), false);
        harness.session.start().await.expect("start");
        let session = harness.session.clone();
        let cause = String::from("browser connection lost");

        tokio::spawn(async move { session.stop_on_fatal(&cause).await })
            .await
            .expect("teardown task");
        assert!(!harness.session.is_running());
        assert_eq!(harness.terminations(), 1);
    }

    #[tokio::test]
    async fn cookies_are_typed() {
        let harness = Harness::new(test_config(), false);
        harness.session.start().await.expect("start");
        harness.transport.respond(
            "Network.getCookies",
            json!({ "cookies": [
                { "name": "sessionid", "value": "abc", "domain": ".example.test", "path": "/", "httpOnly": true, "secure": true },
                { "name": "csrftoken", "value": "tok" }
            ] }),
        );

        let cookies = harness.session.cookies().await.expect("cookies");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "sessionid");
        assert!(cookies[0].http_only);
        assert_eq!(cookies[1].value, "tok");
        assert_eq!(
            harness.transport.params_for("Network.getCookies"),
            vec![json!({ "urls": ["https://example.test/"] })]
        );
        harness.session.stop().await;
    }
}
