//! Tab control plane and crawl loop.
//!
//! A [`browser::Browser`] owns a set of tabs; each tab owns one remote
//! target handle and runs either the frontier-fed crawl loop or the
//! on-demand behavior driver. All cross-process coordination goes through
//! the [`frontier::Frontier`] interface.

pub mod behavior;
pub mod browser;
pub mod frontier;
pub mod shutdown;
pub mod tabs;

pub use behavior::{
    Behavior, BehaviorHost, BehaviorManager, FixedBehaviorManager, NoopBehaviorManager,
    WrBehaviorRunner,
};
pub use browser::Browser;
pub use frontier::{Frontier, FrontierFactory, MemoryFrontier, RedisFrontier};
pub use shutdown::ShutdownCondition;
pub use tabs::{
    create_tab, BehaviorTab, CrawlerTab, NavigationResult, Tab, TabDriver, TabState,
};
