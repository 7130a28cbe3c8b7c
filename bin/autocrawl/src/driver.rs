//! Wires discovery, the frontier, and the browser together for one run.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use tracing::info;

use autocrawl_cdp::{discover, CdpConnector};
use autocrawl_core::CrawlConfig;
use autocrawl_crawler::{
    Browser, FixedBehaviorManager, Frontier, FrontierFactory, NoopBehaviorManager,
    RedisFrontier, ShutdownCondition,
};

const CDP_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the whole job and returns the process exit code.
pub async fn run(config: CrawlConfig, behavior_file: Option<&Path>) -> anyhow::Result<i32> {
    let config = Arc::new(config);
    info!(
        autoid = %config.autoid,
        reqid = %config.reqid,
        tab_kind = ?config.tab_kind,
        num_tabs = config.num_tabs,
        "starting"
    );

    discover::wait_for_cdp_ready(&config.cdp_host, config.cdp_port, CDP_READY_TIMEOUT)
        .await
        .context("the browser's debugging endpoint never came up")?;
    let tabs = discover::wait_for_tabs(&config.cdp_host, config.cdp_port, config.num_tabs)
        .await
        .context("could not gather page targets")?;
    info!(num_tabs = tabs.len(), "page targets ready");

    let shutdown = ShutdownCondition::new();
    shutdown
        .install_signal_handlers()
        .context("could not install signal handlers")?;

    let behavior_manager: Arc<dyn autocrawl_crawler::BehaviorManager> = match behavior_file {
        Some(path) => {
            let behavior_js = std::fs::read_to_string(path)
                .with_context(|| format!("could not read {}", path.display()))?;
            Arc::new(FixedBehaviorManager::new(
                behavior_js,
                config.behavior_action_expression.clone(),
                config.unpause_behavior_expression.clone(),
            ))
        }
        None => Arc::new(NoopBehaviorManager),
    };

    let factory_config = config.clone();
    let frontier_factory: FrontierFactory = Arc::new(move || {
        let config = factory_config.clone();
        async move {
            let frontier: Arc<dyn Frontier> = Arc::new(RedisFrontier::connect(&config).await?);
            Ok(frontier)
        }
        .boxed()
    });

    let browser = Browser::new(
        config.clone(),
        Arc::new(CdpConnector),
        behavior_manager,
        frontier_factory,
    );
    browser.init(tabs).await.context("could not start the tabs")?;

    let exit = tokio::select! {
        exit = browser.wait_for_exit() => exit,
        _ = shutdown.wait() => {
            info!("shutdown requested, closing tabs gracefully");
            browser.shutdown_gracefully().await;
            browser.wait_for_exit().await
        }
    };

    let code = exit.exit_reason_code();
    info!(
        exit_code = code,
        reasons = exit.tab_closed_reasons.len(),
        "all tabs closed"
    );
    Ok(code)
}
