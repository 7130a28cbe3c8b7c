//! Redis-backed frontier shared by every worker in a crawl job.
//!
//! Key layout comes from [`RedisKeys`]: one list for the queue, sets for
//! seen/pending/scope, a hash with job info, and a list the workers push
//! their done markers onto.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::json;
use tracing::{debug, info};

use autocrawl_core::{CrawlConfig, Error, RedisKeys, Result};

use super::scope::{is_inner_page_link, Scope};
use super::{Frontier, QueueEntry};

const POP_RETRY: Duration = Duration::from_millis(250);
/// Depth cap meaning "no cap": jobs that never configured one crawl
/// without a depth limit.
const UNLIMITED_DEPTH: u64 = u64::MAX;

pub struct RedisFrontier {
    conn: MultiplexedConnection,
    keys: RedisKeys,
    reqid: String,
    wait_for_q: f64,
    poll_rate: f64,
    scope: Mutex<Scope>,
    max_depth: AtomicU64,
    current: Mutex<Option<QueueEntry>>,
    current_page: Mutex<Option<String>>,
}

impl RedisFrontier {
    pub fn new(conn: MultiplexedConnection, config: &CrawlConfig) -> Self {
        Self {
            conn,
            keys: config.redis_keys(),
            reqid: config.reqid.clone(),
            wait_for_q: config.wait_for_q,
            poll_rate: config.wait_for_q_poll_rate,
            scope: Mutex::new(Scope::default()),
            max_depth: AtomicU64::new(UNLIMITED_DEPTH),
            current: Mutex::new(None),
            current_page: Mutex::new(None),
        }
    }

    /// Opens a fresh connection to the configured redis instance.
    pub async fn connect(config: &CrawlConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(frontier_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(frontier_err)?;
        Ok(Self::new(conn, config))
    }

    async fn queue_len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.llen(&self.keys.queue).await.map_err(frontier_err)
    }

    /// Polls until the queue is non-empty, for as long as `wait_for_q`
    /// allows: negative disables the wait, zero waits forever, positive
    /// waits that many seconds.
    async fn wait_for_populated_queue(&self) -> Result<()> {
        if self.wait_for_q < 0.0 {
            return Ok(());
        }
        let poll = Duration::from_secs_f64(self.poll_rate.max(0.1));
        let deadline = (self.wait_for_q > 0.0)
            .then(|| Instant::now() + Duration::from_secs_f64(self.wait_for_q));
        loop {
            if self.queue_len().await? > 0 {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    info!("the frontier queue never became populated");
                    return Ok(());
                }
            }
            debug!("waiting for the frontier queue to become populated");
            tokio::time::sleep(poll).await;
        }
    }
}

/// Entries are JSON `{url, depth}`; a bare string is accepted as a
/// depth-zero URL so hand-seeded queues keep working.
fn parse_entry(raw: &str) -> QueueEntry {
    serde_json::from_str(raw).unwrap_or_else(|_| QueueEntry {
        url: raw.to_string(),
        depth: 0,
    })
}

fn frontier_err(e: impl std::fmt::Display) -> Error {
    Error::Frontier(e.to_string())
}

/// A missing or negative `crawl_depth` means the job has no depth cap.
fn depth_limit(raw: Option<i64>) -> u64 {
    match raw {
        Some(depth) if depth >= 0 => depth as u64,
        _ => UNLIMITED_DEPTH,
    }
}

#[async_trait]
impl Frontier for RedisFrontier {
    async fn init(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let seeds: Vec<String> = conn
            .smembers(&self.keys.scope)
            .await
            .map_err(frontier_err)?;
        *self.scope.lock().unwrap() = Scope::from_seeds(&seeds);

        let depth: Option<i64> = conn
            .hget(&self.keys.info, "crawl_depth")
            .await
            .map_err(frontier_err)?;
        self.max_depth.store(depth_limit(depth), Ordering::SeqCst);

        info!(
            scope_hosts = seeds.len(),
            crawl_depth = ?depth,
            "frontier initialized"
        );
        self.wait_for_populated_queue().await?;
        Ok(self.queue_len().await? == 0)
    }

    async fn exhausted(&self) -> Result<bool> {
        Ok(self.queue_len().await? == 0)
    }

    async fn next_url(&self) -> Result<String> {
        loop {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn
                .lpop(&self.keys.queue, None)
                .await
                .map_err(frontier_err)?;
            match raw {
                Some(raw) => {
                    let entry = parse_entry(&raw);
                    conn.sadd::<_, _, ()>(&self.keys.pending, &entry.url)
                        .await
                        .map_err(frontier_err)?;
                    let url = entry.url.clone();
                    *self.current.lock().unwrap() = Some(entry);
                    return Ok(url);
                }
                None => {
                    if self.exhausted().await? {
                        return Err(Error::Frontier(
                            "the frontier queue is empty".to_string(),
                        ));
                    }
                    // Lost a race against another worker; try again.
                    tokio::time::sleep(POP_RETRY).await;
                }
            }
        }
    }

    async fn add_all(&self, urls: &[String]) -> Result<()> {
        let depth = self
            .current
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.depth)
            .unwrap_or(0)
            + 1;
        let depth_capped = depth > self.max_depth.load(Ordering::SeqCst);
        let mut conn = self.conn.clone();
        let mut queued = 0usize;
        for url in urls {
            let inner_link = self
                .current_page
                .lock()
                .unwrap()
                .as_deref()
                .map(|page| is_inner_page_link(page, url))
                .unwrap_or(false);
            if inner_link {
                conn.sadd::<_, _, ()>(&self.keys.inner_page_links, url)
                    .await
                    .map_err(frontier_err)?;
                continue;
            }
            if depth_capped || !self.scope.lock().unwrap().in_scope(url) {
                continue;
            }
            let added: i64 = conn
                .sadd(&self.keys.seen, url)
                .await
                .map_err(frontier_err)?;
            if added == 0 {
                continue;
            }
            let entry = serde_json::to_string(&QueueEntry {
                url: url.clone(),
                depth,
            })?;
            conn.rpush::<_, _, ()>(&self.keys.queue, entry)
                .await
                .map_err(frontier_err)?;
            queued += 1;
        }
        if queued > 0 {
            debug!(queued, depth, "queued outlinks");
        }
        Ok(())
    }

    async fn crawling_new_page(&self, url: &str, timestamp: &str) -> Result<()> {
        *self.current_page.lock().unwrap() = Some(url.to_string());
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&self.keys.inner_page_links)
            .await
            .map_err(frontier_err)?;
        conn.hset::<_, _, _, ()>(
            &self.keys.info,
            format!("{}:currUrl", self.reqid),
            url,
        )
        .await
        .map_err(frontier_err)?;
        conn.hset::<_, _, _, ()>(
            &self.keys.info,
            format!("{}:currTs", self.reqid),
            timestamp,
        )
        .await
        .map_err(frontier_err)?;
        Ok(())
    }

    async fn remove_current_from_pending(&self) -> Result<()> {
        let entry = self.current.lock().unwrap().take();
        if let Some(entry) = entry {
            let mut conn = self.conn.clone();
            conn.srem::<_, _, ()>(&self.keys.pending, &entry.url)
                .await
                .map_err(frontier_err)?;
        }
        Ok(())
    }

    async fn have_inner_page_links(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let count: usize = conn
            .scard(&self.keys.inner_page_links)
            .await
            .map_err(frontier_err)?;
        Ok(count > 0)
    }

    async fn pop_inner_page_link(&self) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.spop(&self.keys.inner_page_links)
            .await
            .map_err(frontier_err)
    }

    async fn remove_inner_page_links(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&self.keys.inner_page_links)
            .await
            .map_err(frontier_err)?;
        Ok(())
    }

    async fn mark_done(&self) -> Result<()> {
        let marker = json!({
            "id": self.reqid,
            "time": Utc::now().timestamp(),
        })
        .to_string();
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&self.keys.done, marker)
            .await
            .map_err(frontier_err)?;
        info!("crawl marked done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_entries_parse_from_json() {
        let entry = parse_entry(r#"{"url":"http://a.test/","depth":2}"#);
        assert_eq!(entry.url, "http://a.test/");
        assert_eq!(entry.depth, 2);
    }

    #[test]
    fn bare_urls_parse_at_depth_zero() {
        let entry = parse_entry("http://a.test/plain");
        assert_eq!(entry.url, "http://a.test/plain");
        assert_eq!(entry.depth, 0);
    }

    #[test]
    fn missing_depth_defaults_to_zero() {
        let entry = parse_entry(r#"{"url":"http://a.test/"}"#);
        assert_eq!(entry.depth, 0);
    }

    #[test]
    fn unset_crawl_depth_means_unlimited() {
        assert_eq!(depth_limit(None), UNLIMITED_DEPTH);
        assert_eq!(depth_limit(Some(-1)), UNLIMITED_DEPTH);
        assert_eq!(depth_limit(Some(0)), 0);
        assert_eq!(depth_limit(Some(3)), 3);
    }
}
