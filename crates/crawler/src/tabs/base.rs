//! Connection lifecycle shared by every tab implementation.
//!
//! A [`Tab`] owns exactly one remote target handle and moves through a
//! small state machine: Disconnected -> Connecting -> Connected, with a
//! Reconnecting detour when a devtools frontend steals the connection,
//! and Closing -> Closed at the end. Closure is emitted exactly once per
//! tab regardless of how many paths race to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use autocrawl_cdp::{
    NavigationError, NavigationResponse, RemoteTarget, TargetConnector, TargetEvent,
    DETACH_REPLACED_WITH_DEVTOOLS,
};
use autocrawl_core::{CloseReason, CrawlConfig, Error, Result, TabClosedInfo, TabData};

use crate::behavior::Behavior;

/// How long to wait between reconnection attempts after a devtools
/// frontend detached us.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Where a tab currently is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

/// One browser tab: the target handle, its lifecycle state, and the
/// behavior currently attached to it.
pub struct Tab {
    tab_data: TabData,
    config: Arc<CrawlConfig>,
    connector: Arc<dyn TargetConnector>,

    target: Mutex<Option<Arc<dyn RemoteTarget>>>,
    state: Mutex<TabState>,
    /// True while the tab is connected and should react to target events.
    running: AtomicBool,
    /// Close-once guard, independent of `running`: a tab that is mid
    /// reconnect (running == false) must still be closable exactly once.
    closed: AtomicBool,
    behaviors_paused: AtomicBool,

    running_behavior: Mutex<Option<Arc<dyn Behavior>>>,
    /// Every close reason ever recorded, in arrival order. The first
    /// entry is the one that counts; later writes only append.
    close_reasons: Mutex<Vec<CloseReason>>,
    closed_tx: Mutex<Option<oneshot::Sender<TabClosedInfo>>>,

    event_pump: Mutex<Option<JoinHandle<()>>>,
    /// Single supervised slot: at most one reconnect task at a time.
    reconnect_task: Mutex<Option<JoinHandle<()>>>,

    self_ref: Weak<Tab>,
}

impl Tab {
    /// Creates the tab and the channel its closure will be reported on.
    pub fn new(
        config: Arc<CrawlConfig>,
        connector: Arc<dyn TargetConnector>,
        tab_data: TabData,
    ) -> (Arc<Self>, oneshot::Receiver<TabClosedInfo>) {
        let (closed_tx, closed_rx) = oneshot::channel();
        let tab = Arc::new_cyclic(|weak| Self {
            tab_data,
            config,
            connector,
            target: Mutex::new(None),
            state: Mutex::new(TabState::Disconnected),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            behaviors_paused: AtomicBool::new(false),
            running_behavior: Mutex::new(None),
            close_reasons: Mutex::new(Vec::new()),
            closed_tx: Mutex::new(Some(closed_tx)),
            event_pump: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            self_ref: weak.clone(),
        });
        (tab, closed_rx)
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_data.id
    }

    pub fn tab_data(&self) -> &TabData {
        &self.tab_data
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    pub fn state(&self) -> TabState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn behaviors_paused(&self) -> bool {
        self.behaviors_paused.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: TabState) {
        *self.state.lock().unwrap() = next;
    }

    fn target(&self) -> Result<Arc<dyn RemoteTarget>> {
        self.target
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Connection("tab is not connected".to_string()))
    }

    /// Connects to the target and applies the session setup every tab
    /// needs. Also used verbatim by the reconnect path.
    pub async fn init(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Connection("tab is already closed".to_string()));
        }
        if self.is_running() {
            return Ok(());
        }
        self.set_state(TabState::Connecting);
        info!(tab_id = %self.tab_data.id, "connecting to the tab");

        let target = self
            .connector
            .connect(&self.tab_data)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let events = target.subscribe_events().await;
        *self.target.lock().unwrap() = Some(target.clone());

        target.call("Page.enable", Value::Null).await.map_err(conn_err)?;
        target
            .call("Network.enable", Value::Null)
            .await
            .map_err(conn_err)?;
        target
            .call("Runtime.enable", Value::Null)
            .await
            .map_err(conn_err)?;
        target
            .call(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": self.config.navigation_guard_script }),
            )
            .await
            .map_err(conn_err)?;
        if self.config.net_cache_disabled {
            target
                .call("Network.setCacheDisabled", json!({ "cacheDisabled": true }))
                .await
                .map_err(conn_err)?;
        }

        self.spawn_event_pump(events);
        self.running.store(true, Ordering::SeqCst);
        self.set_state(TabState::Connected);
        info!(tab_id = %self.tab_data.id, "tab connected");
        Ok(())
    }

    fn spawn_event_pump(&self, mut events: mpsc::Receiver<TargetEvent>) {
        let weak = self.self_ref.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(tab) = weak.upgrade() else { break };
                match event {
                    TargetEvent::ConnectionClosed => tab.on_connection_closed().await,
                    TargetEvent::Crashed => tab.on_target_crashed().await,
                    TargetEvent::Detached { reason } => tab.on_detached(&reason).await,
                }
            }
        });
        if let Some(old) = self.event_pump.lock().unwrap().replace(pump) {
            old.abort();
        }
    }

    async fn on_connection_closed(&self) {
        // Expected while reconnecting or closing; only a live tab cares.
        if !self.is_running() {
            return;
        }
        warn!(tab_id = %self.tab_data.id, "connection to the tab was lost");
        self.close(CloseReason::ConnectionClosed).await;
    }

    async fn on_target_crashed(&self) {
        if !self.is_running() {
            return;
        }
        warn!(tab_id = %self.tab_data.id, "the tab crashed");
        self.close(CloseReason::TargetCrashed).await;
    }

    async fn on_detached(&self, reason: &str) {
        if reason == DETACH_REPLACED_WITH_DEVTOOLS {
            self.devtools_reconnect().await;
        } else {
            debug!(tab_id = %self.tab_data.id, reason, "tab detached");
        }
    }

    /// A devtools frontend took over the target. Drop our handle and keep
    /// retrying a fresh connection until it succeeds or the tab closes.
    async fn devtools_reconnect(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(tab_id = %self.tab_data.id, "replaced by a devtools frontend, reconnecting");
        self.set_state(TabState::Reconnecting);
        // Take the handle out before awaiting; holding the guard across
        // the await would pin this future to one thread.
        let target = self.target.lock().unwrap().take();
        if let Some(target) = target {
            target.dispose().await;
        }

        let weak = self.self_ref.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(RECONNECT_DELAY).await;
                let Some(tab) = weak.upgrade() else { return };
                if tab.is_closed() {
                    return;
                }
                match tab.init().await {
                    Ok(()) => {
                        info!(tab_id = %tab.tab_data.id, "reconnected to the tab");
                        return;
                    }
                    Err(e) => {
                        debug!(tab_id = %tab.tab_data.id, error = %e, "reconnect attempt failed")
                    }
                }
            }
        });
        if let Some(old) = self.reconnect_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    /// Aborts any in-flight reconnection attempt. Safe to call when none
    /// is running.
    pub fn stop_reconnecting(&self) {
        if let Some(task) = self.reconnect_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Records a close reason. Only the first recorded reason is ever
    /// reported; the rest stay in the log for debugging.
    pub fn record_close_reason(&self, reason: CloseReason) {
        let mut log = self.close_reasons.lock().unwrap();
        if !log.is_empty() {
            debug!(
                tab_id = %self.tab_data.id,
                first = %log[0],
                late = %reason,
                "additional close reason recorded"
            );
        }
        log.push(reason);
    }

    pub fn close_reason(&self) -> CloseReason {
        self.close_reasons
            .lock()
            .unwrap()
            .first()
            .copied()
            .unwrap_or(CloseReason::None)
    }

    /// Tears the tab down and emits its closed notification. Every path
    /// funnels through here; only the first caller does any work.
    pub async fn close(&self, reason: CloseReason) {
        self.record_close_reason(reason);
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(TabState::Closing);
        info!(tab_id = %self.tab_data.id, reason = %self.close_reason(), "closing the tab");

        self.running.store(false, Ordering::SeqCst);
        self.stop_reconnecting();
        if let Some(behavior) = self.running_behavior.lock().unwrap().take() {
            behavior.end();
        }
        let target = self.target.lock().unwrap().take();
        if let Some(target) = target {
            target.dispose().await;
        }
        if let Some(pump) = self.event_pump.lock().unwrap().take() {
            pump.abort();
        }

        self.set_state(TabState::Closed);
        if let Some(tx) = self.closed_tx.lock().unwrap().take() {
            let _ = tx.send(TabClosedInfo {
                tab_id: self.tab_data.id.clone(),
                reason: self.close_reason(),
            });
        }
    }

    pub async fn shutdown_gracefully(&self) {
        self.close(CloseReason::Gracefully).await;
    }

    /// Evaluates an expression in the page's default context and returns
    /// its JSON value.
    pub async fn evaluate_in_page(&self, expression: &str) -> Result<Value> {
        self.evaluate_in_context(expression, None).await
    }

    /// Evaluates an expression, optionally in a specific execution
    /// context (e.g. an isolated world).
    pub async fn evaluate_in_context(
        &self,
        expression: &str,
        context_id: Option<i64>,
    ) -> Result<Value> {
        let mut params = json!({
            "expression": expression,
            "userGesture": true,
            "awaitPromise": true,
            "includeCommandLineAPI": true,
            "returnByValue": true,
        });
        if let Some(id) = context_id {
            params["contextId"] = json!(id);
        }
        let result = self
            .target()?
            .call("Runtime.evaluate", params)
            .await
            .map_err(|e| Error::Protocol(e.to_string()))?;
        if let Some(details) = result.get("exceptionDetails") {
            return Err(Error::Behavior(format!(
                "page evaluation raised: {}",
                details
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown exception")
            )));
        }
        Ok(result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Navigates the page's main frame.
    pub async fn goto(
        &self,
        url: &str,
        timeout: Duration,
    ) -> std::result::Result<Option<NavigationResponse>, NavigationError> {
        let target = self
            .target()
            .map_err(|_| NavigationError::Disconnected)?;
        target.navigate(url, timeout).await
    }

    /// Sends a raw protocol command on the tab's handle.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.target()?
            .call(method, params)
            .await
            .map_err(|e| Error::Protocol(e.to_string()))
    }

    /// Captures the current viewport as PNG bytes.
    pub async fn capture_screenshot(&self) -> Result<Vec<u8>> {
        let result = self
            .target()?
            .call("Page.captureScreenshot", json!({ "format": "png" }))
            .await
            .map_err(|e| Error::Protocol(e.to_string()))?;
        let data = result
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Protocol("screenshot response had no data".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| Error::Protocol(format!("screenshot was not valid base64: {}", e)))
    }

    pub async fn pause_behaviors(&self) -> Result<()> {
        self.evaluate_in_page(&self.config.pause_behavior_expression)
            .await?;
        self.behaviors_paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn resume_behaviors(&self) -> Result<()> {
        self.evaluate_in_page(&self.config.unpause_behavior_expression)
            .await?;
        self.behaviors_paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn set_running_behavior(&self, behavior: Arc<dyn Behavior>) {
        *self.running_behavior.lock().unwrap() = Some(behavior);
    }

    /// Detaches `behavior`, but only if it is still the attached one; a
    /// replacement that raced in stays put.
    pub fn unset_running_behavior(&self, behavior: &Arc<dyn Behavior>) {
        let mut slot = self.running_behavior.lock().unwrap();
        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(current, behavior) {
                *slot = None;
            }
        }
    }

    pub fn running_behavior(&self) -> Option<Arc<dyn Behavior>> {
        self.running_behavior.lock().unwrap().clone()
    }
}

fn conn_err(e: autocrawl_cdp::CdpError) -> Error {
    Error::Connection(e.to_string())
}
