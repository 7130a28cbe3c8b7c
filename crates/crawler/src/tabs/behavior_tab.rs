//! On-demand behavior driving for an externally navigated tab.
//!
//! Something else (an operator, a recording proxy) steers where the page
//! goes; this tab watches the page URL and keeps the right behavior
//! running on whatever document is currently loaded.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use autocrawl_cdp::TargetConnector;
use autocrawl_core::{CloseReason, CrawlConfig, Result, TabClosedInfo, TabData};

use crate::behavior::{Behavior, BehaviorHost, BehaviorManager};
use crate::tabs::base::Tab;

/// How often the page URL is checked for a document change.
const BEHAVIOR_POLL: Duration = Duration::from_secs(1);
/// Bound on waiting for an ended behavior task to wind down.
const BEHAVIOR_END_WAIT: Duration = Duration::from_secs(5);

pub struct BehaviorTab {
    tab: Arc<Tab>,
    behavior_manager: Arc<dyn BehaviorManager>,
    current_behavior: Mutex<Option<Arc<dyn Behavior>>>,
    behavior_task: Mutex<Option<JoinHandle<()>>>,
    last_url: Mutex<String>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<BehaviorTab>,
}

impl BehaviorTab {
    pub fn new(
        config: Arc<CrawlConfig>,
        connector: Arc<dyn TargetConnector>,
        tab_data: TabData,
        behavior_manager: Arc<dyn BehaviorManager>,
    ) -> (Arc<Self>, oneshot::Receiver<TabClosedInfo>) {
        let (tab, closed_rx) = Tab::new(config, connector, tab_data);
        let behavior_tab = Arc::new_cyclic(|weak| Self {
            tab,
            behavior_manager,
            current_behavior: Mutex::new(None),
            behavior_task: Mutex::new(None),
            last_url: Mutex::new(String::new()),
            loop_task: Mutex::new(None),
            self_ref: weak.clone(),
        });
        (behavior_tab, closed_rx)
    }

    pub fn tab(&self) -> &Arc<Tab> {
        &self.tab
    }

    /// Connects and starts watching the page for documents to run
    /// behaviors on.
    pub async fn init(&self) -> Result<()> {
        self.tab.init().await?;

        let weak = self.self_ref.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(BEHAVIOR_POLL).await;
                let Some(tab) = weak.upgrade() else { return };
                if tab.tab.is_closed() {
                    return;
                }
                if !tab.tab.is_running() {
                    // Mid reconnect; check again on the next tick.
                    continue;
                }
                tab.resume_behaviors().await;
            }
        });
        *self.loop_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// One restart-policy decision.
    ///
    /// Clears the page-side pause flag, then starts a new behavior when
    /// nothing is running anymore, or when the page moved to a new
    /// document and no page script has re-planted the flag there.
    pub async fn resume_behaviors(&self) {
        if let Err(e) = self.tab.resume_behaviors().await {
            debug!(error = %e, "could not clear the pause flag");
        }
        let current_url = match self
            .tab
            .evaluate_in_page(&self.tab.config().page_url_expression)
            .await
        {
            Ok(Value::String(url)) => url,
            Ok(_) => return,
            Err(e) => {
                debug!(error = %e, "could not read the page url");
                return;
            }
        };
        let url_changed = *self.last_url.lock().unwrap() != current_url;

        let not_running = match self.current_behavior.lock().unwrap().as_ref() {
            Some(behavior) => behavior.done(),
            None => true,
        };

        let mut should_restart = not_running;
        if !should_restart && url_changed {
            should_restart = !self.pause_flag_present().await;
        }
        if !should_restart {
            return;
        }

        debug!(url = %current_url, url_changed, "starting a behavior");
        *self.last_url.lock().unwrap() = current_url.clone();
        self.start_behavior(&current_url).await;
    }

    async fn pause_flag_present(&self) -> bool {
        match self
            .tab
            .evaluate_in_page(&self.tab.config().pause_flag_exists_expression)
            .await
        {
            Ok(Value::Bool(present)) => present,
            Ok(_) => false,
            Err(e) => {
                debug!(error = %e, "could not check the pause flag");
                false
            }
        }
    }

    async fn start_behavior(&self, url: &str) {
        self.ensure_behavior_task_end().await;

        let host: Weak<dyn BehaviorHost> = self.self_ref.clone();
        let Some(behavior) = self
            .behavior_manager
            .behavior_for_url(url, host, false)
            .await
        else {
            return;
        };
        *self.current_behavior.lock().unwrap() = Some(behavior.clone());

        let max_run_time = self.tab.config().max_behavior_time;
        let task = tokio::spawn(async move {
            if max_run_time < 0.0 {
                behavior.run().await;
            } else {
                behavior.timed_run(max_run_time).await;
            }
        });
        *self.behavior_task.lock().unwrap() = Some(task);
    }

    /// Ends the running behavior, if any, and waits for its task.
    pub async fn ensure_behavior_task_end(&self) {
        if let Some(behavior) = self.current_behavior.lock().unwrap().take() {
            behavior.end();
        }
        let task = self.behavior_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            if tokio::time::timeout(BEHAVIOR_END_WAIT, task).await.is_err() {
                warn!("a behavior task did not stop in time");
            }
        }
    }

    fn stop_watching(&self) {
        if let Some(task) = self.loop_task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub async fn close(&self) {
        self.tab.record_close_reason(CloseReason::Closed);
        self.stop_watching();
        self.ensure_behavior_task_end().await;
        self.tab.close(CloseReason::Closed).await;
    }

    pub async fn shutdown_gracefully(&self) {
        self.tab.record_close_reason(CloseReason::Gracefully);
        self.stop_watching();
        self.ensure_behavior_task_end().await;
        self.tab.shutdown_gracefully().await;
    }
}

#[async_trait]
impl BehaviorHost for BehaviorTab {
    async fn evaluate_in_page(&self, expression: &str) -> Result<Value> {
        self.tab.evaluate_in_page(expression).await
    }

    async fn collect_outlinks(&self) {
        // No frontier to feed; behavior tabs never ask for collection.
    }

    fn set_running_behavior(&self, behavior: Arc<dyn Behavior>) {
        self.tab.set_running_behavior(behavior);
    }

    fn unset_running_behavior(&self, behavior: &Arc<dyn Behavior>) {
        self.tab.unset_running_behavior(behavior);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tabs::testutil::*;
    use autocrawl_cdp::RemoteTarget;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Stays running until ended, counting instances handed out.
    struct NeverDoneBehavior {
        done: AtomicBool,
    }

    #[async_trait]
    impl Behavior for NeverDoneBehavior {
        async fn run(&self) {
            while !self.done() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        async fn timed_run(&self, _max_run_time: f64) {
            self.run().await;
        }

        fn done(&self) -> bool {
            self.done.load(Ordering::SeqCst)
        }

        fn end(&self) {
            self.done.store(true, Ordering::SeqCst);
        }
    }

    struct CountingManager {
        started: AtomicUsize,
    }

    impl CountingManager {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BehaviorManager for CountingManager {
        async fn behavior_for_url(
            &self,
            _url: &str,
            _host: Weak<dyn BehaviorHost>,
            _collect_outlinks: bool,
        ) -> Option<Arc<dyn Behavior>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(NeverDoneBehavior {
                done: AtomicBool::new(false),
            }))
        }
    }

    async fn build(
        target: Arc<ScriptedTarget>,
        manager: Arc<CountingManager>,
    ) -> (Arc<BehaviorTab>, oneshot::Receiver<TabClosedInfo>) {
        let (tab, closed) = BehaviorTab::new(
            Arc::new(CrawlConfig::default()),
            ScriptedConnector::single(target),
            tab_data("tab-1"),
            manager,
        );
        tab.tab().init().await.unwrap();
        (tab, closed)
    }

    #[tokio::test]
    async fn first_check_starts_a_behavior() {
        let target = ScriptedTarget::new();
        let manager = CountingManager::new();
        let (tab, _closed) = build(target, manager.clone()).await;

        tab.resume_behaviors().await;
        assert_eq!(manager.started.load(Ordering::SeqCst), 1);
        tab.ensure_behavior_task_end().await;
    }

    #[tokio::test]
    async fn same_url_with_a_live_behavior_does_not_restart() {
        let target = ScriptedTarget::new();
        let manager = CountingManager::new();
        let (tab, _closed) = build(target, manager.clone()).await;

        tab.resume_behaviors().await;
        tab.resume_behaviors().await;
        tab.resume_behaviors().await;
        assert_eq!(manager.started.load(Ordering::SeqCst), 1);
        tab.ensure_behavior_task_end().await;
    }

    #[tokio::test]
    async fn url_change_restarts_exactly_one_behavior() {
        let target = ScriptedTarget::new();
        let manager = CountingManager::new();
        let (tab, _closed) = build(target.clone(), manager.clone()).await;

        tab.resume_behaviors().await;
        assert_eq!(manager.started.load(Ordering::SeqCst), 1);

        // The page navigates somewhere new out from under us.
        let _ = target.navigate("http://a.test/next", Duration::from_secs(1)).await;
        tab.resume_behaviors().await;
        tab.resume_behaviors().await;
        assert_eq!(manager.started.load(Ordering::SeqCst), 2);
        tab.ensure_behavior_task_end().await;
    }

    #[tokio::test]
    async fn pause_flag_blocks_a_url_change_restart() {
        let target = ScriptedTarget::new();
        let manager = CountingManager::new();
        let (tab, _closed) = build(target.clone(), manager.clone()).await;

        tab.resume_behaviors().await;
        target.override_eval(
            "typeof window.$WBBehaviorPaused !== 'undefined'",
            serde_json::json!(true),
        );
        let _ = target.navigate("http://a.test/next", Duration::from_secs(1)).await;
        tab.resume_behaviors().await;
        assert_eq!(manager.started.load(Ordering::SeqCst), 1);
        tab.ensure_behavior_task_end().await;
    }

    #[tokio::test]
    async fn done_behavior_is_replaced_on_the_same_url() {
        let target = ScriptedTarget::new();
        let manager = CountingManager::new();
        let (tab, _closed) = build(target, manager.clone()).await;

        tab.resume_behaviors().await;
        if let Some(behavior) = tab.current_behavior.lock().unwrap().clone() {
            behavior.end();
        }
        tab.resume_behaviors().await;
        assert_eq!(manager.started.load(Ordering::SeqCst), 2);
        tab.ensure_behavior_task_end().await;
    }

    #[tokio::test]
    async fn close_ends_the_behavior_and_reports_once() {
        let target = ScriptedTarget::new();
        let manager = CountingManager::new();
        let (tab, closed) = build(target, manager).await;

        tab.resume_behaviors().await;
        tab.close().await;
        let info = closed.await.unwrap();
        assert_eq!(info.reason, CloseReason::Closed);
        assert!(tab.current_behavior.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn connection_loss_still_reports_through_the_channel() {
        let target = ScriptedTarget::new();
        let manager = CountingManager::new();
        let (_tab, closed) = build(target.clone(), manager).await;

        target
            .emit(autocrawl_cdp::TargetEvent::ConnectionClosed)
            .await;
        let info = closed.await.unwrap();
        assert_eq!(info.reason, CloseReason::ConnectionClosed);
    }
}
