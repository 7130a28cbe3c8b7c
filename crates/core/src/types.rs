use serde::{Deserialize, Serialize};

use crate::config::CrawlConfig;

/// Why a tab ended up closed.
///
/// Set exactly once per tab (first write wins) and never overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    /// The tab was asked to shut down gracefully and did so.
    Gracefully,
    /// The client connection to the remote target was lost.
    ConnectionClosed,
    /// The inspector reported the target crashed.
    TargetCrashed,
    /// A plain (non-graceful) close was requested.
    Closed,
    /// The crawl frontier was exhausted.
    CrawlEnd,
    /// No reason was recorded.
    None,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CloseReason::Gracefully => "GRACEFULLY",
            CloseReason::ConnectionClosed => "CONNECTION_CLOSED",
            CloseReason::TargetCrashed => "TARGET_CRASHED",
            CloseReason::Closed => "CLOSED",
            CloseReason::CrawlEnd => "CRAWL_END",
            CloseReason::None => "NONE",
        };
        write!(f, "{}", name)
    }
}

/// Maps a close reason to the process exit code it implies.
///
/// Crash and connection loss are the only failures visible to the
/// process supervisor; everything else exits clean.
pub fn exit_code_from_reason(reason: CloseReason) -> i32 {
    match reason {
        CloseReason::TargetCrashed | CloseReason::ConnectionClosed => 2,
        _ => 0,
    }
}

/// Emitted exactly once per tab when it has closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabClosedInfo {
    pub tab_id: String,
    pub reason: CloseReason,
}

/// Metadata describing one remote browser tab, as reported by the
/// CDP `/json` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabData {
    pub id: String,
    pub url: String,
    /// The per-target websocket debugger address.
    pub ws_url: String,
}

/// Produced when a browser has closed all of its tabs.
///
/// The close reasons are an append-only log in arrival order; the log is
/// only aggregated here, after every tab has reported.
#[derive(Debug, Clone)]
pub struct BrowserExitInfo {
    pub config: CrawlConfig,
    pub tab_closed_reasons: Vec<TabClosedInfo>,
}

impl BrowserExitInfo {
    /// Derives the process exit code from the collected close reasons.
    ///
    /// 0 tabs -> 0, 1 tab -> its reason's code, otherwise the code of the
    /// most frequent reason. Ties resolve to the reason observed first.
    pub fn exit_reason_code(&self) -> i32 {
        match self.tab_closed_reasons.len() {
            0 => 0,
            1 => exit_code_from_reason(self.tab_closed_reasons[0].reason),
            _ => {
                let mut counts: Vec<(CloseReason, usize)> = Vec::new();
                for info in &self.tab_closed_reasons {
                    match counts.iter_mut().find(|(r, _)| *r == info.reason) {
                        Some(entry) => entry.1 += 1,
                        None => counts.push((info.reason, 1)),
                    }
                }
                let mut best = counts[0];
                for candidate in &counts[1..] {
                    if candidate.1 > best.1 {
                        best = *candidate;
                    }
                }
                exit_code_from_reason(best.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(id: &str, reason: CloseReason) -> TabClosedInfo {
        TabClosedInfo {
            tab_id: id.to_string(),
            reason,
        }
    }

    fn exit_info(reasons: Vec<TabClosedInfo>) -> BrowserExitInfo {
        BrowserExitInfo {
            config: CrawlConfig::default(),
            tab_closed_reasons: reasons,
        }
    }

    #[test]
    fn exit_code_mapping_is_pure() {
        assert_eq!(exit_code_from_reason(CloseReason::TargetCrashed), 2);
        assert_eq!(exit_code_from_reason(CloseReason::ConnectionClosed), 2);
        assert_eq!(exit_code_from_reason(CloseReason::Gracefully), 0);
        assert_eq!(exit_code_from_reason(CloseReason::Closed), 0);
        assert_eq!(exit_code_from_reason(CloseReason::CrawlEnd), 0);
        assert_eq!(exit_code_from_reason(CloseReason::None), 0);
    }

    #[test]
    fn no_tabs_exits_zero() {
        assert_eq!(exit_info(vec![]).exit_reason_code(), 0);
    }

    #[test]
    fn single_tab_uses_its_reason() {
        let info = exit_info(vec![closed("t1", CloseReason::TargetCrashed)]);
        assert_eq!(info.exit_reason_code(), 2);
        let info = exit_info(vec![closed("t1", CloseReason::CrawlEnd)]);
        assert_eq!(info.exit_reason_code(), 0);
    }

    #[test]
    fn majority_reason_wins() {
        let info = exit_info(vec![
            closed("t1", CloseReason::CrawlEnd),
            closed("t2", CloseReason::ConnectionClosed),
            closed("t3", CloseReason::ConnectionClosed),
        ]);
        assert_eq!(info.exit_reason_code(), 2);
    }

    #[test]
    fn ties_resolve_to_first_observed() {
        let info = exit_info(vec![
            closed("t1", CloseReason::ConnectionClosed),
            closed("t2", CloseReason::CrawlEnd),
        ]);
        assert_eq!(info.exit_reason_code(), 2);

        let info = exit_info(vec![
            closed("t1", CloseReason::CrawlEnd),
            closed("t2", CloseReason::ConnectionClosed),
        ]);
        assert_eq!(info.exit_reason_code(), 0);
    }

    #[test]
    fn close_reason_wire_names() {
        assert_eq!(CloseReason::ConnectionClosed.to_string(), "CONNECTION_CLOSED");
        assert_eq!(CloseReason::CrawlEnd.to_string(), "CRAWL_END");
        assert_eq!(
            serde_json::to_string(&CloseReason::TargetCrashed).unwrap(),
            "\"TARGET_CRASHED\""
        );
    }
}
