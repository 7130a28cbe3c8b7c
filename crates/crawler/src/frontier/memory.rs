//! In-process frontier used by tests and single-worker runs.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use autocrawl_core::{Error, Result};

use super::scope::{is_inner_page_link, Scope};
use super::{Frontier, QueueEntry};

#[derive(Default)]
struct Inner {
    queue: VecDeque<QueueEntry>,
    seen: HashSet<String>,
    pending: HashSet<String>,
    current: Option<QueueEntry>,
    current_page: Option<String>,
    inner_page_links: VecDeque<String>,
    /// (url, timestamp) per page started, in order.
    crawl_log: Vec<(String, String)>,
    done: bool,
}

pub struct MemoryFrontier {
    inner: Mutex<Inner>,
    scope: Scope,
    max_depth: u64,
}

impl MemoryFrontier {
    pub fn new(max_depth: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            scope: Scope::default(),
            max_depth,
        }
    }

    /// Seeds enter at depth zero, already marked seen and in scope.
    pub fn with_seeds<I, S>(seeds: I, max_depth: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = Inner::default();
        let mut scope = Scope::default();
        for seed in seeds {
            let url = seed.as_ref().to_string();
            scope.add(&url);
            if inner.seen.insert(url.clone()) {
                inner.queue.push_back(QueueEntry { url, depth: 0 });
            }
        }
        Self {
            inner: Mutex::new(inner),
            scope,
            max_depth,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    pub fn crawl_log(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().crawl_log.clone()
    }
}

#[async_trait]
impl Frontier for MemoryFrontier {
    async fn init(&self) -> Result<bool> {
        Ok(self.inner.lock().unwrap().queue.is_empty())
    }

    async fn exhausted(&self) -> Result<bool> {
        Ok(self.inner.lock().unwrap().queue.is_empty())
    }

    async fn next_url(&self) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        match inner.queue.pop_front() {
            Some(entry) => {
                inner.pending.insert(entry.url.clone());
                let url = entry.url.clone();
                inner.current = Some(entry);
                Ok(url)
            }
            None => Err(Error::Frontier("the frontier queue is empty".to_string())),
        }
    }

    async fn add_all(&self, urls: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let depth = inner.current.as_ref().map(|e| e.depth).unwrap_or(0) + 1;
        let depth_capped = depth > self.max_depth;
        for url in urls {
            let inner_link = inner
                .current_page
                .as_deref()
                .map(|page| is_inner_page_link(page, url))
                .unwrap_or(false);
            if inner_link {
                if !inner.inner_page_links.contains(url) {
                    inner.inner_page_links.push_back(url.clone());
                }
                continue;
            }
            if depth_capped || !self.scope.in_scope(url) {
                continue;
            }
            if inner.seen.insert(url.clone()) {
                inner.queue.push_back(QueueEntry {
                    url: url.clone(),
                    depth,
                });
            }
        }
        Ok(())
    }

    async fn crawling_new_page(&self, url: &str, timestamp: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.inner_page_links.clear();
        inner.current_page = Some(url.to_string());
        inner
            .crawl_log
            .push((url.to_string(), timestamp.to_string()));
        Ok(())
    }

    async fn remove_current_from_pending(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.current.take() {
            inner.pending.remove(&entry.url);
        }
        Ok(())
    }

    async fn have_inner_page_links(&self) -> Result<bool> {
        Ok(!self.inner.lock().unwrap().inner_page_links.is_empty())
    }

    async fn pop_inner_page_link(&self) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().inner_page_links.pop_front())
    }

    async fn remove_inner_page_links(&self) -> Result<()> {
        self.inner.lock().unwrap().inner_page_links.clear();
        Ok(())
    }

    async fn mark_done(&self) -> Result<()> {
        self.inner.lock().unwrap().done = true;
        Ok(())
    }
}
