//! Scriptable in-memory targets for exercising tabs without a browser.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use autocrawl_cdp::{
    CdpError, NavigationError, NavigationResponse, RemoteTarget, TargetConnector, TargetEvent,
};
use autocrawl_core::TabData;

/// The navigation outcome a scripted page produces.
#[derive(Clone)]
pub enum ScriptedNav {
    Ok(Option<NavigationResponse>),
    Disconnected,
    Timeout(Option<NavigationResponse>),
    Failed(String, Option<NavigationResponse>),
    Broken(String),
}

#[derive(Clone)]
pub struct PageScript {
    pub nav: ScriptedNav,
    pub outlinks: Vec<String>,
}

impl PageScript {
    pub fn ok_html(url: &str) -> Self {
        Self {
            nav: ScriptedNav::Ok(Some(html_response(url, 200))),
            outlinks: Vec::new(),
        }
    }

    pub fn with_outlinks(mut self, outlinks: &[&str]) -> Self {
        self.outlinks = outlinks.iter().map(|s| s.to_string()).collect();
        self
    }
}

pub fn html_response(url: &str, status: u16) -> NavigationResponse {
    NavigationResponse {
        url: url.to_string(),
        status,
        mime_type: "text/html".to_string(),
        headers: HashMap::new(),
    }
}

pub fn response_with_mime(url: &str, status: u16, mime: &str) -> NavigationResponse {
    NavigationResponse {
        url: url.to_string(),
        status,
        mime_type: mime.to_string(),
        headers: HashMap::new(),
    }
}

/// A remote target whose pages and page-script answers are scripted up
/// front by the test.
pub struct ScriptedTarget {
    pages: Mutex<HashMap<String, PageScript>>,
    pub visited: Mutex<Vec<String>>,
    current_url: Mutex<String>,
    pub evaluated: Mutex<Vec<String>>,
    /// Exact-expression answers, consulted before the built-in ones.
    pub eval_overrides: Mutex<HashMap<String, Value>>,
    events_tx: Mutex<Option<mpsc::Sender<TargetEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<TargetEvent>>>,
    pub disposed: AtomicBool,
}

impl ScriptedTarget {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(8);
        Arc::new(Self {
            pages: Mutex::new(HashMap::new()),
            visited: Mutex::new(Vec::new()),
            current_url: Mutex::new("about:blank".to_string()),
            evaluated: Mutex::new(Vec::new()),
            eval_overrides: Mutex::new(HashMap::new()),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn script_page(&self, url: &str, page: PageScript) {
        self.pages.lock().unwrap().insert(url.to_string(), page);
    }

    pub fn override_eval(&self, expression: &str, value: Value) {
        self.eval_overrides
            .lock()
            .unwrap()
            .insert(expression.to_string(), value);
    }

    pub async fn emit(&self, event: TargetEvent) {
        let tx = self.events_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    pub fn visited(&self) -> Vec<String> {
        self.visited.lock().unwrap().clone()
    }

    pub fn evaluated(&self) -> Vec<String> {
        self.evaluated.lock().unwrap().clone()
    }

    fn wrap(value: Value) -> Value {
        json!({ "result": { "value": value } })
    }

    fn evaluate(&self, expression: &str) -> Value {
        self.evaluated
            .lock()
            .unwrap()
            .push(expression.to_string());
        if let Some(value) = self.eval_overrides.lock().unwrap().get(expression) {
            return Self::wrap(value.clone());
        }
        if expression == "window.$wbOutlinks$" {
            let current = self.current_url.lock().unwrap().clone();
            let outlinks = self
                .pages
                .lock()
                .unwrap()
                .get(&current)
                .map(|p| p.outlinks.clone())
                .unwrap_or_default();
            return Self::wrap(json!(outlinks));
        }
        if expression.contains("IteratorHandler") {
            return Self::wrap(json!({ "done": true, "wait": false }));
        }
        if expression == "window.location.href" {
            return Self::wrap(json!(self.current_url.lock().unwrap().clone()));
        }
        Self::wrap(Value::Null)
    }
}

#[async_trait]
impl RemoteTarget for ScriptedTarget {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        if method == "Runtime.evaluate" {
            let expression = params
                .get("expression")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            return Ok(self.evaluate(&expression));
        }
        Ok(json!({}))
    }

    async fn navigate(
        &self,
        url: &str,
        _timeout: Duration,
    ) -> Result<Option<NavigationResponse>, NavigationError> {
        self.visited.lock().unwrap().push(url.to_string());
        *self.current_url.lock().unwrap() = url.to_string();
        let script = self.pages.lock().unwrap().get(url).cloned();
        match script.map(|p| p.nav) {
            None | Some(ScriptedNav::Ok(None)) => Ok(None),
            Some(ScriptedNav::Ok(response)) => Ok(response),
            Some(ScriptedNav::Disconnected) => Err(NavigationError::Disconnected),
            Some(ScriptedNav::Timeout(response)) => Err(NavigationError::Timeout { response }),
            Some(ScriptedNav::Failed(reason, response)) => {
                Err(NavigationError::Failed { reason, response })
            }
            Some(ScriptedNav::Broken(message)) => Err(NavigationError::Other(message)),
        }
    }

    async fn subscribe_events(&self) -> mpsc::Receiver<TargetEvent> {
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .expect("subscribed twice")
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// Hands out pre-built targets in order, one per `connect` call.
pub struct ScriptedConnector {
    targets: Mutex<Vec<Arc<ScriptedTarget>>>,
}

impl ScriptedConnector {
    pub fn single(target: Arc<ScriptedTarget>) -> Arc<Self> {
        Self::many(vec![target])
    }

    pub fn many(targets: Vec<Arc<ScriptedTarget>>) -> Arc<Self> {
        Arc::new(Self {
            targets: Mutex::new(targets),
        })
    }
}

#[async_trait]
impl TargetConnector for ScriptedConnector {
    async fn connect(&self, _tab: &TabData) -> Result<Arc<dyn RemoteTarget>, CdpError> {
        let mut targets = self.targets.lock().unwrap();
        if targets.is_empty() {
            return Err(CdpError::Connect("no scripted target left".to_string()));
        }
        Ok(targets.remove(0))
    }
}

pub fn tab_data(id: &str) -> TabData {
    TabData {
        id: id.to_string(),
        url: "about:blank".to_string(),
        ws_url: format!("ws://localhost/devtools/page/{}", id),
    }
}
