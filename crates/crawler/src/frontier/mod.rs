//! The crawl frontier: which URL comes next, and which have been seen.
//!
//! Each crawler tab owns one frontier instance; cooperating workers share
//! state through the redis-backed implementation, while tests use the
//! in-memory one.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use autocrawl_core::Result;

pub mod memory;
pub mod redis;
pub mod scope;

pub use memory::MemoryFrontier;
pub use redis::RedisFrontier;
pub use scope::Scope;

/// Produces a fresh frontier per tab; the per-page cursor inside a
/// frontier instance must not be shared between tabs.
pub type FrontierFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Frontier>>> + Send + Sync>;

/// One unit of crawl work as it sits in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub url: String,
    #[serde(default)]
    pub depth: u64,
}

/// Frontier operations a crawler tab drives.
///
/// `next_url` and `remove_current_from_pending` bracket one page: the URL
/// moves into the pending set when popped and leaves it exactly once when
/// the page is finished, whatever the navigation outcome was. Links that
/// only jump within the current document are diverted by `add_all` into a
/// per-page inner-link set instead of the queue.
#[async_trait]
pub trait Frontier: Send + Sync {
    /// Loads scope state and, if configured, waits for the queue to become
    /// populated. Reports whether the crawl is starting on an empty queue.
    async fn init(&self) -> Result<bool>;

    /// True when the queue holds no more work.
    async fn exhausted(&self) -> Result<bool>;

    /// Pops the next URL and places it in the pending set.
    ///
    /// Errors when the queue stays empty, which the crawl loop treats as
    /// the end of the crawl.
    async fn next_url(&self) -> Result<String>;

    /// Queues every in-scope, unseen URL at the current depth plus one.
    /// Same-document links for the current page go to the inner-link set.
    async fn add_all(&self, urls: &[String]) -> Result<()>;

    /// Records which page's outlinks are being scoped from now on and
    /// resets the per-page inner-link state.
    async fn crawling_new_page(&self, url: &str, timestamp: &str) -> Result<()>;

    /// Removes the URL most recently handed out from the pending set.
    /// Idempotent: only the first call after `next_url` does anything.
    async fn remove_current_from_pending(&self) -> Result<()>;

    async fn have_inner_page_links(&self) -> Result<bool>;

    /// Takes one queued same-document link for the current page.
    async fn pop_inner_page_link(&self) -> Result<Option<String>>;

    /// Drops whatever is left of the current page's inner-link set.
    async fn remove_inner_page_links(&self) -> Result<()>;

    /// Announces that this worker finished its crawl.
    async fn mark_done(&self) -> Result<()>;
}
