pub mod config;
pub mod error;
pub mod types;

pub use config::{CrawlConfig, RedisKeys, TabKind};
pub use error::{Error, Result};
pub use types::{
    exit_code_from_reason, BrowserExitInfo, CloseReason, TabClosedInfo, TabData,
};
