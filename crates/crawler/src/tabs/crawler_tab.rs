//! The frontier-fed crawl loop.
//!
//! A crawler tab pops URLs from its frontier, navigates to each one,
//! runs the configured behavior on pages worth interacting with, and
//! feeds harvested outlinks back into the frontier until it is drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use autocrawl_cdp::{NavigationError, NavigationResponse, TargetConnector};
use autocrawl_core::{CloseReason, CrawlConfig, Result, TabClosedInfo, TabData};

use crate::behavior::{Behavior, BehaviorHost, BehaviorManager};
use crate::frontier::Frontier;
use crate::tabs::base::Tab;

/// Bound on waiting for an aborted crawl task to wind down.
const HARD_CLOSE_WAIT: Duration = Duration::from_secs(15);
/// Bound on letting the current page finish during a graceful shutdown.
const GRACEFUL_CLOSE_WAIT: Duration = Duration::from_secs(60);

/// What the crawl loop does with a page after navigating to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationResult {
    /// An HTML page answered 2xx; process it.
    Ok,
    /// Not a page worth processing; move on to the next URL.
    SkipUrl,
    /// The tab cannot usefully continue crawling.
    ExitCrawlLoop,
}

/// Classifies a navigation outcome.
///
/// A timeout is judged by whatever document response arrived before it;
/// a timeout with nothing at all, a lost connection, or an
/// unclassifiable error ends the loop, and everything non-HTML or
/// non-2xx is skipped.
pub fn determine_navigation_result(
    outcome: &std::result::Result<Option<NavigationResponse>, NavigationError>,
) -> NavigationResult {
    match outcome {
        Ok(response) => classify_response(response.as_ref()),
        Err(NavigationError::Timeout { response: Some(response) }) => {
            classify_response(Some(response))
        }
        Err(NavigationError::Timeout { response: None }) => NavigationResult::ExitCrawlLoop,
        Err(NavigationError::Failed { response, .. }) => match response {
            Some(response) => classify_response(Some(response)),
            None => NavigationResult::SkipUrl,
        },
        Err(NavigationError::Disconnected) => NavigationResult::ExitCrawlLoop,
        Err(NavigationError::Other(_)) => NavigationResult::ExitCrawlLoop,
    }
}

fn classify_response(response: Option<&NavigationResponse>) -> NavigationResult {
    match response {
        None => NavigationResult::SkipUrl,
        Some(response) if response.mime_type.to_ascii_lowercase().contains("html") => {
            if response.ok() {
                NavigationResult::Ok
            } else {
                NavigationResult::SkipUrl
            }
        }
        Some(_) => NavigationResult::SkipUrl,
    }
}

/// The 14-digit capture timestamp for a page, from its Memento-Datetime
/// header when the page came out of an archive, otherwise from the clock.
pub fn memento_timestamp(response: Option<&NavigationResponse>) -> String {
    response
        .and_then(|r| r.header("Memento-Datetime"))
        .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
        .format("%Y%m%d%H%M%S")
        .to_string()
}

pub struct CrawlerTab {
    tab: Arc<Tab>,
    frontier: Arc<dyn Frontier>,
    behavior_manager: Arc<dyn BehaviorManager>,
    crawl_task: Mutex<Option<JoinHandle<()>>>,
    graceful_shutdown: AtomicBool,
    marked_done: AtomicBool,
    self_ref: Weak<CrawlerTab>,
}

impl CrawlerTab {
    pub fn new(
        config: Arc<CrawlConfig>,
        connector: Arc<dyn TargetConnector>,
        tab_data: TabData,
        frontier: Arc<dyn Frontier>,
        behavior_manager: Arc<dyn BehaviorManager>,
    ) -> (Arc<Self>, oneshot::Receiver<TabClosedInfo>) {
        let (tab, closed_rx) = Tab::new(config, connector, tab_data);
        let crawler = Arc::new_cyclic(|weak| Self {
            tab,
            frontier,
            behavior_manager,
            crawl_task: Mutex::new(None),
            graceful_shutdown: AtomicBool::new(false),
            marked_done: AtomicBool::new(false),
            self_ref: weak.clone(),
        });
        (crawler, closed_rx)
    }

    pub fn tab(&self) -> &Arc<Tab> {
        &self.tab
    }

    /// Connects, prepares the frontier, and starts the crawl task.
    pub async fn init(&self) -> Result<()> {
        self.tab.init().await?;
        let started_empty = self.frontier.init().await?;
        if started_empty {
            info!(tab_id = %self.tab.tab_id(), "starting the crawl on an empty queue");
        }
        self.navigation_reset().await;

        let weak = self.self_ref.clone();
        let task = tokio::spawn(async move {
            if let Some(crawler) = weak.upgrade() {
                crawler.crawl().await;
            }
        });
        *self.crawl_task.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn crawl(&self) {
        let reason = self.crawl_loop().await;
        self.mark_done_once().await;
        self.navigation_reset().await;
        self.tab.close(reason).await;
    }

    /// Pushes this worker's completion marker, whatever ended the crawl.
    /// Every close path funnels through here; only the first call pushes.
    async fn mark_done_once(&self) {
        if self.marked_done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.frontier.mark_done().await {
            warn!(error = %e, "failed to mark the crawl done");
        }
    }

    /// Runs until the frontier drains, the tab stops being usable, or a
    /// graceful shutdown is requested. Returns the reason to close with.
    async fn crawl_loop(&self) -> CloseReason {
        loop {
            if self.tab.is_closed() {
                return self.tab.close_reason();
            }
            if self.graceful_shutdown.load(Ordering::SeqCst) {
                return CloseReason::Gracefully;
            }
            match self.frontier.exhausted().await {
                Ok(true) => return CloseReason::CrawlEnd,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "could not check the frontier, ending the crawl");
                    return CloseReason::CrawlEnd;
                }
            }
            let url = match self.frontier.next_url().await {
                Ok(url) => url,
                Err(_) => return CloseReason::CrawlEnd,
            };

            match self.crawl_one_page(&url).await {
                NavigationResult::Ok => {
                    self.run_behavior(&url).await;
                    self.harvest_outlinks().await;
                    self.visit_inner_page_links().await;
                    self.finish_page().await;
                }
                NavigationResult::SkipUrl => {
                    debug!(url, "skipping page");
                    self.finish_page().await;
                }
                NavigationResult::ExitCrawlLoop => {
                    warn!(url, "the tab can no longer crawl");
                    self.finish_page().await;
                    // A lost connection already recorded its reason; any
                    // other fatal error leaves the reason unclaimed.
                    return self.tab.close_reason();
                }
            }
            tokio::task::yield_now().await;
        }
    }

    async fn crawl_one_page(&self, url: &str) -> NavigationResult {
        info!(tab_id = %self.tab.tab_id(), url, "crawling page");
        let timeout = self.tab.config().navigation_timeout_duration();
        let outcome = self.tab.goto(url, timeout).await;

        let result = determine_navigation_result(&outcome);
        match result {
            // Only pages that will actually be processed get recorded.
            NavigationResult::Ok => {
                let timestamp = memento_timestamp(navigation_response(&outcome));
                if let Err(e) = self.frontier.crawling_new_page(url, &timestamp).await {
                    warn!(error = %e, "could not record the new page");
                }
            }
            NavigationResult::ExitCrawlLoop => {
                if matches!(outcome, Err(NavigationError::Disconnected)) {
                    self.tab.record_close_reason(CloseReason::ConnectionClosed);
                }
            }
            NavigationResult::SkipUrl => {}
        }
        result
    }

    async fn run_behavior(&self, url: &str) {
        let host: Weak<dyn BehaviorHost> = self.self_ref.clone();
        let Some(behavior) = self
            .behavior_manager
            .behavior_for_url(url, host, true)
            .await
        else {
            return;
        };
        let max_run_time = self.tab.config().max_behavior_time;
        if max_run_time < 0.0 {
            behavior.run().await;
        } else {
            behavior.timed_run(max_run_time).await;
        }
    }

    /// Pulls the accumulated outlinks out of the page, queues them, and
    /// clears the page-side set. Each step tolerates failure on its own:
    /// a page that breaks one must not cost us the other two.
    async fn harvest_outlinks(&self) {
        let outlinks: Vec<String> = match self
            .tab
            .evaluate_in_page(&self.tab.config().outlinks_expression)
            .await
        {
            Ok(Value::Array(values)) => values
                .into_iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!(error = %e, "could not read the page's outlinks");
                Vec::new()
            }
        };

        if !outlinks.is_empty() {
            if let Err(e) = self.frontier.add_all(&outlinks).await {
                warn!(error = %e, "could not queue outlinks");
            }
        }

        if let Err(e) = self
            .tab
            .evaluate_in_page(&self.tab.config().clear_outlinks_expression)
            .await
        {
            debug!(error = %e, "could not clear the page's outlink set");
        }
    }

    /// Drains the frontier's queued same-document links, jumping to each
    /// in place; the states they reveal get captured without a
    /// navigation. Any error aborts this phase only.
    async fn visit_inner_page_links(&self) {
        match self.frontier.have_inner_page_links().await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                debug!(error = %e, "could not check for inner page links");
                return;
            }
        }
        loop {
            let link = match self.frontier.pop_inner_page_link().await {
                Ok(Some(link)) => link,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "could not pop an inner page link");
                    break;
                }
            };
            let expression =
                format!("window.location.href = {}", Value::String(link.clone()));
            if let Err(e) = self.tab.evaluate_in_page(&expression).await {
                debug!(link, error = %e, "could not visit an inner page link");
                break;
            }
        }
        if let Err(e) = self.frontier.remove_inner_page_links().await {
            debug!(error = %e, "could not clear the inner page links");
        }
    }

    /// Releases the page's claim in the frontier. Runs once per popped
    /// URL, whatever the navigation outcome was.
    async fn finish_page(&self) {
        if let Err(e) = self.frontier.remove_current_from_pending().await {
            warn!(error = %e, "could not release the page from pending");
        }
    }

    async fn navigation_reset(&self) {
        let timeout = self.tab.config().navigation_timeout_duration();
        if let Err(e) = self.tab.goto("about:blank", timeout).await {
            debug!(error = %e, "could not reset the page");
        }
    }

    /// Hard close: abort the crawl mid-page.
    pub async fn close(&self) {
        self.tab.record_close_reason(CloseReason::Closed);
        if let Some(behavior) = self.tab.running_behavior() {
            behavior.end();
        }
        let task = self.crawl_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = tokio::time::timeout(HARD_CLOSE_WAIT, task).await;
        }
        self.mark_done_once().await;
        self.navigation_reset().await;
        self.tab.close(CloseReason::Closed).await;
    }

    /// Lets the current page finish before closing.
    pub async fn shutdown_gracefully(&self) {
        self.tab.record_close_reason(CloseReason::Gracefully);
        self.graceful_shutdown.store(true, Ordering::SeqCst);
        if let Some(behavior) = self.tab.running_behavior() {
            behavior.end();
        }
        let task = self.crawl_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(GRACEFUL_CLOSE_WAIT, task).await;
        }
        self.mark_done_once().await;
        self.tab.shutdown_gracefully().await;
    }
}

fn navigation_response(
    outcome: &std::result::Result<Option<NavigationResponse>, NavigationError>,
) -> Option<&NavigationResponse> {
    match outcome {
        Ok(response) => response.as_ref(),
        Err(NavigationError::Timeout { response })
        | Err(NavigationError::Failed { response, .. }) => response.as_ref(),
        Err(_) => None,
    }
}

#[async_trait]
impl BehaviorHost for CrawlerTab {
    async fn evaluate_in_page(&self, expression: &str) -> Result<Value> {
        self.tab.evaluate_in_page(expression).await
    }

    async fn collect_outlinks(&self) {
        self.harvest_outlinks().await;
    }

    fn set_running_behavior(&self, behavior: Arc<dyn Behavior>) {
        self.tab.set_running_behavior(behavior);
    }

    fn unset_running_behavior(&self, behavior: &Arc<dyn Behavior>) {
        self.tab.unset_running_behavior(behavior);
    }
}
