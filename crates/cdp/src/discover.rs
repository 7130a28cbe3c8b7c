//! Target discovery over the browser's HTTP debugging endpoint.
//!
//! The fleet manager hands us a host/port; everything else (which page
//! targets exist, their websocket addresses) comes from `/json`.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use autocrawl_core::TabData;

use crate::target::CdpError;

const POLL_INTERVAL: Duration = Duration::from_millis(300);

fn json_url(host: &str, port: u16) -> String {
    format!("http://{}:{}/json", host, port)
}

/// Waits for the browser's debugging endpoint to come up, polling
/// `/json/version` until it answers or `timeout` elapses.
pub async fn wait_for_cdp_ready(host: &str, port: u16, timeout: Duration) -> Result<(), CdpError> {
    let url = format!("http://{}:{}/json/version", host, port);
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout {
            return Err(CdpError::Connect(format!(
                "browser debugging endpoint not ready after {:?} on {}:{}",
                timeout, host, port
            )));
        }
        if let Ok(resp) = reqwest::get(&url).await {
            if resp.json::<Value>().await.is_ok() {
                return Ok(());
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Lists the page targets that currently have a websocket debugger address.
pub async fn list_page_tabs(host: &str, port: u16) -> Result<Vec<TabData>, CdpError> {
    let resp = reqwest::get(&json_url(host, port))
        .await
        .map_err(|e| CdpError::Connect(e.to_string()))?;
    let targets: Vec<Value> = resp
        .json()
        .await
        .map_err(|e| CdpError::Protocol(e.to_string()))?;

    let mut tabs = Vec::new();
    for target in &targets {
        if target.get("type").and_then(|v| v.as_str()) != Some("page") {
            continue;
        }
        let Some(ws_url) = target.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(id) = target.get("id").and_then(|v| v.as_str()) else {
            continue;
        };
        tabs.push(TabData {
            id: id.to_string(),
            url: target
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            ws_url: ws_url.to_string(),
        });
    }
    Ok(tabs)
}

/// Waits until at least one page target exists, then opens extra tabs via
/// `/json/new` until `num_tabs` are available.
pub async fn wait_for_tabs(host: &str, port: u16, num_tabs: usize) -> Result<Vec<TabData>, CdpError> {
    let mut tabs = loop {
        let tabs = list_page_tabs(host, port).await.unwrap_or_default();
        if !tabs.is_empty() {
            break tabs;
        }
        debug!(host, port, "waiting for the first page target");
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    while tabs.len() < num_tabs {
        let url = format!("http://{}:{}/json/new?about:blank", host, port);
        let client = reqwest::Client::new();
        // Newer Chrome requires PUT for /json/new.
        let resp = client
            .put(&url)
            .send()
            .await
            .map_err(|e| CdpError::Connect(e.to_string()))?;
        let target: Value = resp
            .json()
            .await
            .map_err(|e| CdpError::Protocol(e.to_string()))?;
        let id = target
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CdpError::Protocol("no id in /json/new response".to_string()))?;
        let ws_url = target
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CdpError::Protocol("no websocket url in /json/new response".to_string()))?;
        tabs.push(TabData {
            id: id.to_string(),
            url: target
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            ws_url: ws_url.to_string(),
        });
    }

    tabs.truncate(num_tabs.max(1));
    Ok(tabs)
}
