//! Tab implementations and the closed registry that picks between them.

use std::sync::Arc;

use tokio::sync::oneshot;

use autocrawl_cdp::TargetConnector;
use autocrawl_core::{CrawlConfig, Result, TabClosedInfo, TabData, TabKind};

use crate::behavior::BehaviorManager;
use crate::frontier::FrontierFactory;

pub mod base;
pub mod behavior_tab;
pub mod crawler_tab;
#[cfg(test)]
pub(crate) mod testutil;

pub use base::{Tab, TabState};
pub use behavior_tab::BehaviorTab;
pub use crawler_tab::{determine_navigation_result, CrawlerTab, NavigationResult};

/// A running tab of whichever kind the job configured.
pub enum TabDriver {
    Behavior(Arc<BehaviorTab>),
    Crawler(Arc<CrawlerTab>),
}

impl TabDriver {
    pub async fn init(&self) -> Result<()> {
        match self {
            TabDriver::Behavior(tab) => tab.init().await,
            TabDriver::Crawler(tab) => tab.init().await,
        }
    }

    pub async fn close(&self) {
        match self {
            TabDriver::Behavior(tab) => tab.close().await,
            TabDriver::Crawler(tab) => tab.close().await,
        }
    }

    pub async fn shutdown_gracefully(&self) {
        match self {
            TabDriver::Behavior(tab) => tab.shutdown_gracefully().await,
            TabDriver::Crawler(tab) => tab.shutdown_gracefully().await,
        }
    }

    pub fn tab_id(&self) -> String {
        match self {
            TabDriver::Behavior(tab) => tab.tab().tab_id().to_string(),
            TabDriver::Crawler(tab) => tab.tab().tab_id().to_string(),
        }
    }
}

/// Builds the tab the configuration asks for. Crawler tabs get their own
/// frontier instance; behavior tabs need none.
pub async fn create_tab(
    config: Arc<CrawlConfig>,
    connector: Arc<dyn TargetConnector>,
    tab_data: TabData,
    behavior_manager: Arc<dyn BehaviorManager>,
    frontier_factory: &FrontierFactory,
) -> Result<(TabDriver, oneshot::Receiver<TabClosedInfo>)> {
    match config.tab_kind {
        TabKind::Behavior => {
            let (tab, closed_rx) =
                BehaviorTab::new(config, connector, tab_data, behavior_manager);
            Ok((TabDriver::Behavior(tab), closed_rx))
        }
        TabKind::Crawler => {
            let frontier = frontier_factory().await?;
            let (tab, closed_rx) =
                CrawlerTab::new(config, connector, tab_data, frontier, behavior_manager);
            Ok((TabDriver::Crawler(tab), closed_rx))
        }
    }
}
