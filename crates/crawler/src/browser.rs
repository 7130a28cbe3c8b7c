//! One browser process worth of tabs and its exit aggregation.
//!
//! The browser fans tabs out at startup and then only listens: every tab
//! reports its closure exactly once, the reports are appended in arrival
//! order, and once all of them are in, the aggregate is published for the
//! driver to turn into a process exit code.

use std::sync::{Arc, Mutex};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use autocrawl_cdp::TargetConnector;
use autocrawl_core::{BrowserExitInfo, CrawlConfig, Result, TabData};

use crate::behavior::BehaviorManager;
use crate::frontier::FrontierFactory;
use crate::tabs::{create_tab, TabDriver};

pub struct Browser {
    config: Arc<CrawlConfig>,
    connector: Arc<dyn TargetConnector>,
    behavior_manager: Arc<dyn BehaviorManager>,
    frontier_factory: FrontierFactory,
    tabs: tokio::sync::Mutex<Vec<TabDriver>>,
    exit_tx: watch::Sender<Option<BrowserExitInfo>>,
    exit_rx: watch::Receiver<Option<BrowserExitInfo>>,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl Browser {
    pub fn new(
        config: Arc<CrawlConfig>,
        connector: Arc<dyn TargetConnector>,
        behavior_manager: Arc<dyn BehaviorManager>,
        frontier_factory: FrontierFactory,
    ) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            config,
            connector,
            behavior_manager,
            frontier_factory,
            tabs: tokio::sync::Mutex::new(Vec::new()),
            exit_tx,
            exit_rx,
            collector: Mutex::new(None),
        }
    }

    /// Builds and starts one tab per entry, then starts collecting their
    /// closure reports.
    pub async fn init(&self, tab_datas: Vec<TabData>) -> Result<()> {
        let mut receivers = FuturesUnordered::new();
        {
            let mut tabs = self.tabs.lock().await;
            for tab_data in tab_datas {
                let (tab, closed_rx) = create_tab(
                    self.config.clone(),
                    self.connector.clone(),
                    tab_data,
                    self.behavior_manager.clone(),
                    &self.frontier_factory,
                )
                .await?;
                tab.init().await?;
                info!(tab_id = %tab.tab_id(), "tab started");
                receivers.push(closed_rx);
                tabs.push(tab);
            }
        }

        let exit_tx = self.exit_tx.clone();
        let config = self.config.clone();
        let collector = tokio::spawn(async move {
            let mut tab_closed_reasons = Vec::new();
            while let Some(report) = receivers.next().await {
                match report {
                    Ok(info) => {
                        info!(tab_id = %info.tab_id, reason = %info.reason, "tab closed");
                        tab_closed_reasons.push(info);
                    }
                    Err(_) => warn!("a tab went away without reporting its closure"),
                }
            }
            let _ = exit_tx.send(Some(BrowserExitInfo {
                config: (*config).clone(),
                tab_closed_reasons,
            }));
        });
        *self.collector.lock().unwrap() = Some(collector);
        Ok(())
    }

    /// Hard-closes every tab.
    pub async fn close(&self) {
        for tab in self.tabs.lock().await.iter() {
            tab.close().await;
        }
    }

    /// Lets every tab finish its current page before closing.
    pub async fn shutdown_gracefully(&self) {
        for tab in self.tabs.lock().await.iter() {
            tab.shutdown_gracefully().await;
        }
    }

    /// Resolves once every tab has reported. Cancel-safe: the aggregate
    /// is published on a watch channel, so callers can race this against
    /// a shutdown signal and ask again later.
    pub async fn wait_for_exit(&self) -> BrowserExitInfo {
        let mut rx = self.exit_rx.clone();
        loop {
            {
                let current = rx.borrow();
                if let Some(info) = current.as_ref() {
                    return info.clone();
                }
            }
            if rx.changed().await.is_err() {
                return BrowserExitInfo {
                    config: (*self.config).clone(),
                    tab_closed_reasons: Vec::new(),
                };
            }
        }
    }
}
