//! The remote target handle contract consumed by tabs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use autocrawl_core::TabData;

/// Signals a remote target can raise outside of command responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    /// The wire connection to the target went away.
    ConnectionClosed,
    /// The inspector reported the target crashed.
    Crashed,
    /// The inspector detached this client, e.g. because a devtools
    /// frontend took over the target.
    Detached { reason: String },
}

/// The detach reason the inspector reports when a devtools frontend
/// replaces our connection. This one triggers reconnection, not closure.
pub const DETACH_REPLACED_WITH_DEVTOOLS: &str = "replaced_with_devtools";

/// The main-frame document response observed during a navigation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NavigationResponse {
    pub url: String,
    pub status: u16,
    pub mime_type: String,
    pub headers: HashMap<String, String>,
}

impl NavigationResponse {
    /// True for 2xx statuses.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Error, Debug)]
pub enum CdpError {
    #[error("failed to connect to target: {0}")]
    Connect(String),

    #[error("failed to send command: {0}")]
    Send(String),

    #[error("connection to target closed")]
    Closed,

    #[error("command '{method}' timed out")]
    Timeout { method: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors raised by [`RemoteTarget::navigate`].
///
/// Timeouts and plain failures may still carry the document response that
/// was observed before the error, so callers can classify it anyway.
#[derive(Error, Debug)]
pub enum NavigationError {
    #[error("connection to the target was lost while navigating")]
    Disconnected,

    #[error("navigation timed out")]
    Timeout { response: Option<NavigationResponse> },

    #[error("navigation failed: {reason}")]
    Failed {
        reason: String,
        response: Option<NavigationResponse>,
    },

    #[error("navigation error: {0}")]
    Other(String),
}

/// A connection to one browser tab.
///
/// A tab owns its handle exclusively; no other component issues calls on it.
#[async_trait]
pub trait RemoteTarget: Send + Sync {
    /// Send a raw protocol command and wait for its result.
    async fn call(&self, method: &str, params: Value) -> Result<Value, CdpError>;

    /// Navigate the main frame and wait for the load event, collecting the
    /// document response along the way.
    async fn navigate(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Option<NavigationResponse>, NavigationError>;

    /// Subscribe to disconnect/crash/detach signals.
    async fn subscribe_events(&self) -> mpsc::Receiver<TargetEvent>;

    /// Release all resources held by the handle. The handle is unusable
    /// afterwards.
    async fn dispose(&self);
}

/// Opens remote target handles from tab metadata. Swappable so tests can
/// provide an in-memory transport.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    async fn connect(&self, tab: &TabData) -> Result<Arc<dyn RemoteTarget>, CdpError>;
}
