mod driver;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use autocrawl_core::CrawlConfig;

/// Drives one already-running browser through a crawl or behavior job.
///
/// Everything is configured through the environment (AUTO_ID, REQ_ID,
/// TAB_TYPE, NUM_TABS, REDIS_URL, ...); the flags below override the few
/// knobs useful when running by hand.
#[derive(Parser)]
#[command(name = "autocrawl")]
#[command(about = "Drive a browser's tabs through crawls and page behaviors", long_about = None)]
#[command(version)]
struct Cli {
    /// Browser debugging host (overrides CDP_HOST)
    #[arg(long)]
    cdp_host: Option<String>,

    /// Browser debugging port (overrides CDP_PORT)
    #[arg(long)]
    cdp_port: Option<u16>,

    /// Tab type to run: behavior or crawler (overrides TAB_TYPE)
    #[arg(long)]
    tab_type: Option<String>,

    /// Number of tabs to drive (overrides NUM_TABS)
    #[arg(long)]
    num_tabs: Option<usize>,

    /// Behavior script file to inject on every crawlable page
    #[arg(long)]
    behavior_file: Option<std::path::PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let mut config = CrawlConfig::from_env()?;
    if let Some(host) = cli.cdp_host {
        config.cdp_host = host;
    }
    if let Some(port) = cli.cdp_port {
        config.cdp_port = port;
    }
    if let Some(kind) = cli.tab_type {
        config.tab_kind = kind.parse()?;
    }
    if let Some(num_tabs) = cli.num_tabs {
        config.num_tabs = num_tabs;
    }

    let code = match driver::run(config, cli.behavior_file.as_deref()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "the driver failed");
            2
        }
    };
    std::process::exit(code);
}
