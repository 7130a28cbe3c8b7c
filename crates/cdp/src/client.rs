//! CDP WebSocket client.
//!
//! Talks to one page target over its debugging WebSocket. A writer task owns
//! the sink and drains an outgoing channel; a reader task dispatches command
//! responses by id and fans events out to subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use autocrawl_core::TabData;

use crate::target::{
    CdpError, NavigationError, NavigationResponse, RemoteTarget, TargetConnector, TargetEvent,
};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type EventListeners = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>;
type TargetListeners = Arc<Mutex<Vec<mpsc::Sender<TargetEvent>>>>;

pub struct CdpClient {
    ws_tx: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    event_listeners: EventListeners,
    target_listeners: TargetListeners,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a target's debugging WebSocket endpoint.
    pub async fn connect(ws_url: &str) -> Result<Self, CdpError> {
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| CdpError::Connect(format!("{}: {}", ws_url, e)))?;

        let (mut ws_sink, mut ws_read) = ws_stream.split();

        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let event_listeners: EventListeners = Arc::new(Mutex::new(HashMap::new()));
        let target_listeners: TargetListeners = Arc::new(Mutex::new(Vec::new()));

        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    warn!(error = %e, "CDP WebSocket write error");
                    break;
                }
            }
        });

        let pending_reader = pending.clone();
        let events_reader = event_listeners.clone();
        let targets_reader = target_listeners.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if let Ok(val) = serde_json::from_str::<Value>(&text) {
                            dispatch_message(val, &pending_reader, &events_reader, &targets_reader)
                                .await;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "CDP WebSocket read error");
                        break;
                    }
                    _ => {}
                }
            }
            // The stream is gone: fail anything still waiting and tell
            // subscribers the connection is closed.
            pending_reader.lock().await.clear();
            fan_out_target_event(&targets_reader, TargetEvent::ConnectionClosed).await;
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            event_listeners,
            target_listeners,
            reader_handle,
            writer_handle,
        })
    }

    /// Subscribe to a raw protocol event by its `Domain.event` name.
    pub async fn subscribe(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(64);
        let mut listeners = self.event_listeners.lock().await;
        listeners.entry(method.to_string()).or_default().push(tx);
        rx
    }

    async fn send_command(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({ "id": id, "method": method, "params": params });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        self.ws_tx
            .send(msg.to_string())
            .await
            .map_err(|_| CdpError::Closed)?;

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.get("error") {
                    Err(CdpError::Protocol(format!("{}: {}", method, error)))
                } else {
                    Ok(response.get("result").cloned().unwrap_or(Value::Null))
                }
            }
            // Sender dropped: the reader task cleared pending on disconnect.
            Ok(Err(_)) => Err(CdpError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(CdpError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }
}

async fn dispatch_message(
    val: Value,
    pending: &PendingMap,
    events: &EventListeners,
    targets: &TargetListeners,
) {
    if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
        if let Some(tx) = pending.lock().await.remove(&id) {
            let _ = tx.send(val);
        }
        return;
    }
    let Some(method) = val.get("method").and_then(|v| v.as_str()) else {
        return;
    };
    let params = val.get("params").cloned().unwrap_or(Value::Null);

    match method {
        "Inspector.targetCrashed" => {
            fan_out_target_event(targets, TargetEvent::Crashed).await;
        }
        "Inspector.detached" => {
            let reason = params
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            fan_out_target_event(targets, TargetEvent::Detached { reason }).await;
        }
        _ => {}
    }

    let mut listeners = events.lock().await;
    if let Some(senders) = listeners.get_mut(method) {
        senders.retain(|tx| !tx.is_closed());
        for tx in senders.iter() {
            let _ = tx.try_send(params.clone());
        }
    }
}

async fn fan_out_target_event(targets: &TargetListeners, event: TargetEvent) {
    let mut listeners = targets.lock().await;
    listeners.retain(|tx| !tx.is_closed());
    for tx in listeners.iter() {
        let _ = tx.try_send(event.clone());
    }
}

fn parse_document_response(params: &Value, frame_id: Option<&str>) -> Option<NavigationResponse> {
    if params.get("type").and_then(|v| v.as_str()) != Some("Document") {
        return None;
    }
    if let Some(expected) = frame_id {
        if params.get("frameId").and_then(|v| v.as_str()) != Some(expected) {
            return None;
        }
    }
    let response = params.get("response")?;
    let headers = response
        .get("headers")
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Some(NavigationResponse {
        url: response
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        status: response.get("status").and_then(|v| v.as_u64()).unwrap_or(0) as u16,
        mime_type: response
            .get("mimeType")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        headers,
    })
}

#[async_trait]
impl RemoteTarget for CdpClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        self.send_command(method, params).await
    }

    async fn navigate(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Option<NavigationResponse>, NavigationError> {
        // Subscribe before issuing the command so the document response
        // cannot slip past us.
        let mut responses = self.subscribe("Network.responseReceived").await;
        let mut loads = self.subscribe("Page.loadEventFired").await;

        let nav = self
            .send_command("Page.navigate", json!({ "url": url }))
            .await
            .map_err(|e| match e {
                CdpError::Closed | CdpError::Send(_) => NavigationError::Disconnected,
                CdpError::Timeout { .. } => NavigationError::Timeout { response: None },
                other => NavigationError::Other(other.to_string()),
            })?;

        if let Some(error_text) = nav.get("errorText").and_then(|v| v.as_str()) {
            if !error_text.is_empty() {
                return Err(NavigationError::Failed {
                    reason: error_text.to_string(),
                    response: None,
                });
            }
        }
        let frame_id = nav
            .get("frameId")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut document_response: Option<NavigationResponse> = None;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(NavigationError::Timeout { response: document_response });
                }
                maybe = responses.recv() => match maybe {
                    Some(params) => {
                        if let Some(resp) = parse_document_response(&params, frame_id.as_deref()) {
                            document_response = Some(resp);
                        }
                    }
                    None => return Err(NavigationError::Disconnected),
                },
                maybe = loads.recv() => match maybe {
                    Some(_) => return Ok(document_response),
                    None => return Err(NavigationError::Disconnected),
                },
            }
        }
    }

    async fn subscribe_events(&self) -> mpsc::Receiver<TargetEvent> {
        let (tx, rx) = mpsc::channel(16);
        self.target_listeners.lock().await.push(tx);
        rx
    }

    async fn dispose(&self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
        self.event_listeners.lock().await.clear();
        self.target_listeners.lock().await.clear();
        self.pending.lock().await.clear();
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

/// Opens [`CdpClient`] handles from tab metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct CdpConnector;

#[async_trait]
impl TargetConnector for CdpConnector {
    async fn connect(&self, tab: &TabData) -> Result<Arc<dyn RemoteTarget>, CdpError> {
        let client = CdpClient::connect(&tab.ws_url).await?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_response_parsing() {
        let params = json!({
            "type": "Document",
            "frameId": "F1",
            "response": {
                "url": "http://a.test/",
                "status": 200,
                "mimeType": "text/html",
                "headers": { "Content-Type": "text/html", "Memento-Datetime": "Sun, 06 Nov 1994 08:49:37 GMT" }
            }
        });
        let resp = parse_document_response(&params, Some("F1")).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.mime_type, "text/html");
        assert!(resp.ok());
        assert_eq!(
            resp.header("memento-datetime"),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
    }

    #[test]
    fn non_document_or_foreign_frame_is_ignored() {
        let sub_resource = json!({
            "type": "Image",
            "frameId": "F1",
            "response": { "url": "http://a.test/x.png", "status": 200, "mimeType": "image/png" }
        });
        assert!(parse_document_response(&sub_resource, Some("F1")).is_none());

        let other_frame = json!({
            "type": "Document",
            "frameId": "F2",
            "response": { "url": "http://a.test/frame", "status": 200, "mimeType": "text/html" }
        });
        assert!(parse_document_response(&other_frame, Some("F1")).is_none());
    }
}
