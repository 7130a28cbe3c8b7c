use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The closed set of tab implementations a driver can run.
///
/// Resolved once at startup from `TAB_TYPE`; there is no runtime string
/// dispatch beyond this point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabKind {
    /// Connects and runs page behaviors on demand.
    Behavior,
    /// Drives the frontier-fed crawl loop.
    Crawler,
}

impl FromStr for TabKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BehaviorTab" | "behavior" => Ok(TabKind::Behavior),
            "CrawlerTab" | "crawler" => Ok(TabKind::Crawler),
            other => Err(Error::Config(format!("unknown tab type: {}", other))),
        }
    }
}

/// Single source of truth for a running crawl job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlConfig {
    /// The id of the logical job shared by all cooperating workers.
    #[serde(default)]
    pub autoid: String,
    /// The id of this worker process within the job.
    #[serde(default)]
    pub reqid: String,
    #[serde(default = "default_tab_kind")]
    pub tab_kind: TabKind,
    #[serde(default = "default_num_tabs")]
    pub num_tabs: usize,
    /// Maximum behavior run time in seconds; -1 runs behaviors unbounded.
    #[serde(default = "default_max_behavior_time")]
    pub max_behavior_time: f64,
    /// Navigation timeout in seconds.
    #[serde(default = "default_navigation_timeout")]
    pub navigation_timeout: f64,
    /// How long to wait for the frontier queue to become populated before
    /// starting, in seconds; -1 disables the wait.
    #[serde(default = "default_wait_for_q")]
    pub wait_for_q: f64,
    #[serde(default = "default_wait_for_q_poll_rate")]
    pub wait_for_q_poll_rate: f64,
    #[serde(default = "default_true")]
    pub net_cache_disabled: bool,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_cdp_host")]
    pub cdp_host: String,
    #[serde(default = "default_cdp_port")]
    pub cdp_port: u16,

    // Page-side expressions shared with the behavior scripts.
    #[serde(default = "default_behavior_action_expression")]
    pub behavior_action_expression: String,
    #[serde(default = "default_behavior_paused_expression")]
    pub behavior_paused_expression: String,
    #[serde(default = "default_pause_behavior_expression")]
    pub pause_behavior_expression: String,
    #[serde(default = "default_unpause_behavior_expression")]
    pub unpause_behavior_expression: String,
    #[serde(default = "default_pause_flag_exists_expression")]
    pub pause_flag_exists_expression: String,
    #[serde(default = "default_page_url_expression")]
    pub page_url_expression: String,
    #[serde(default = "default_outlinks_expression")]
    pub outlinks_expression: String,
    #[serde(default = "default_clear_outlinks_expression")]
    pub clear_outlinks_expression: String,
    /// Injected on every new document so page scripts cannot trap
    /// navigation with dialogs or onbeforeunload handlers.
    #[serde(default = "default_navigation_guard_script")]
    pub navigation_guard_script: String,
}

fn default_tab_kind() -> TabKind {
    TabKind::Behavior
}

fn default_num_tabs() -> usize {
    1
}

fn default_max_behavior_time() -> f64 {
    60.0
}

fn default_navigation_timeout() -> f64 {
    30.0
}

fn default_wait_for_q() -> f64 {
    -1.0
}

fn default_wait_for_q_poll_rate() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://localhost".to_string()
}

fn default_cdp_host() -> String {
    "localhost".to_string()
}

fn default_cdp_port() -> u16 {
    9222
}

fn default_behavior_action_expression() -> String {
    "window.$WRIteratorHandler$()".to_string()
}

fn default_behavior_paused_expression() -> String {
    "window.$WBBehaviorPaused === true".to_string()
}

fn default_pause_behavior_expression() -> String {
    "window.$WBBehaviorPaused = true".to_string()
}

fn default_unpause_behavior_expression() -> String {
    "window.$WBBehaviorPaused = false".to_string()
}

fn default_pause_flag_exists_expression() -> String {
    "typeof window.$WBBehaviorPaused !== 'undefined'".to_string()
}

fn default_page_url_expression() -> String {
    "window.location.href".to_string()
}

fn default_outlinks_expression() -> String {
    "window.$wbOutlinks$".to_string()
}

fn default_clear_outlinks_expression() -> String {
    "window.$wbOutlinkSet$.clear()".to_string()
}

fn default_navigation_guard_script() -> String {
    concat!(
        "window.alert = function() {}; ",
        "window.confirm = function() { return true; }; ",
        "window.prompt = function() { return null; }; ",
        "window.onbeforeunload = null; ",
        "window.addEventListener('beforeunload', function(e) { e.stopImmediatePropagation(); }, true);",
    )
    .to_string()
}

impl Default for CrawlConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config object must deserialize")
    }
}

impl CrawlConfig {
    /// Builds the configuration from the process environment, falling back
    /// to the defaults above for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = CrawlConfig::default();
        config.autoid = env_str("AUTO_ID").unwrap_or_default();
        config.reqid = env_str("REQ_ID").unwrap_or_default();
        if let Some(kind) = env_str("TAB_TYPE") {
            config.tab_kind = kind.parse()?;
        }
        if let Some(n) = env_parse::<usize>("NUM_TABS")? {
            config.num_tabs = n;
        }
        if let Some(t) = env_parse::<f64>("BEHAVIOR_RUN_TIME")? {
            config.max_behavior_time = t;
        }
        if let Some(t) = env_parse::<f64>("NAV_TO")? {
            config.navigation_timeout = t;
        }
        if let Some(t) = env_parse::<f64>("WAIT_FOR_Q")? {
            config.wait_for_q = t;
        }
        if let Some(t) = env_parse::<f64>("WAIT_FOR_Q_POLL_RATE")? {
            config.wait_for_q_poll_rate = t;
        }
        if let Some(b) = env_bool("CRAWL_NO_NETCACHE")? {
            config.net_cache_disabled = b;
        }
        if let Some(s) = env_str("REDIS_URL") {
            config.redis_url = s;
        }
        if let Some(s) = env_str("CDP_HOST") {
            config.cdp_host = s;
        }
        if let Some(p) = env_parse::<u16>("CDP_PORT")? {
            config.cdp_port = p;
        }
        if let Some(s) = env_str("BEHAVIOR_ACTION_EXPRESSION") {
            config.behavior_action_expression = s;
        }
        if let Some(s) = env_str("BEHAVIOR_PAUSED_EXPRESSION") {
            config.behavior_paused_expression = s;
        }
        if let Some(s) = env_str("PAUSE_BEHAVIOR_EXPRESSION") {
            config.pause_behavior_expression = s;
        }
        if let Some(s) = env_str("UNPAUSE_BEHAVIOR_EXPRESSION") {
            config.unpause_behavior_expression = s;
        }
        if let Some(s) = env_str("PAGE_URL_EXPRESSION") {
            config.page_url_expression = s;
        }
        if let Some(s) = env_str("OUTLINKS_EXPRESSION") {
            config.outlinks_expression = s;
        }
        if let Some(s) = env_str("CLEAR_OUTLINKS_EXPRESSION") {
            config.clear_outlinks_expression = s;
        }
        Ok(config)
    }

    pub fn navigation_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.navigation_timeout.max(0.0))
    }

    pub fn redis_keys(&self) -> RedisKeys {
        RedisKeys::new(&self.autoid, &self.reqid)
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_str(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value for {}: '{}'", key, raw))),
        None => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match env_str(key) {
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "ok" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "n" | "nok" | "off" => Ok(Some(false)),
            _ => Err(Error::Config(format!(
                "invalid value for {} (expected a boolean): '{}'",
                key, raw
            ))),
        },
        None => Ok(None),
    }
}

/// The redis keys used by one crawl job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    pub info: String,
    pub queue: String,
    pub pending: String,
    pub seen: String,
    pub scope: String,
    pub done: String,
    /// Inner page links are tracked per worker process, not per job.
    pub inner_page_links: String,
}

impl RedisKeys {
    pub fn new(autoid: &str, reqid: &str) -> Self {
        let prefix = format!("a:{}", autoid);
        Self {
            info: format!("{}:info", prefix),
            queue: format!("{}:q", prefix),
            pending: format!("{}:qp", prefix),
            seen: format!("{}:seen", prefix),
            scope: format!("{}:scope", prefix),
            done: format!("{}:br:done", prefix),
            inner_page_links: format!("{}:{}:ipls", prefix, reqid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = CrawlConfig::default();
        assert_eq!(config.num_tabs, 1);
        assert_eq!(config.max_behavior_time, 60.0);
        assert_eq!(config.navigation_timeout, 30.0);
        assert!(config.net_cache_disabled);
        assert_eq!(config.tab_kind, TabKind::Behavior);
        assert_eq!(config.page_url_expression, "window.location.href");
    }

    #[test]
    fn tab_kind_parses_both_spellings() {
        assert_eq!("CrawlerTab".parse::<TabKind>().unwrap(), TabKind::Crawler);
        assert_eq!("behavior".parse::<TabKind>().unwrap(), TabKind::Behavior);
        assert!("ReflectoTab".parse::<TabKind>().is_err());
    }

    #[test]
    fn redis_keys_follow_job_prefix() {
        let keys = RedisKeys::new("job1", "req1");
        assert_eq!(keys.queue, "a:job1:q");
        assert_eq!(keys.pending, "a:job1:qp");
        assert_eq!(keys.seen, "a:job1:seen");
        assert_eq!(keys.done, "a:job1:br:done");
        assert_eq!(keys.inner_page_links, "a:job1:req1:ipls");
    }
}
