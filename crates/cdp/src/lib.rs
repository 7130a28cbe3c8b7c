//! Chrome DevTools Protocol transport for the crawler.
//!
//! The crawler only ever sees the [`RemoteTarget`] trait; the concrete
//! [`CdpClient`] speaks the protocol over the target's debugging WebSocket.

pub mod client;
pub mod discover;
pub mod target;

pub use client::{CdpClient, CdpConnector};
pub use target::{
    CdpError, NavigationError, NavigationResponse, RemoteTarget, TargetConnector, TargetEvent,
    DETACH_REPLACED_WITH_DEVTOOLS,
};
