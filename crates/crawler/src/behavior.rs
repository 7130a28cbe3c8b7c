//! Page behaviors: cancelable interaction routines run inside a page.
//!
//! Behavior scripts themselves come from elsewhere; this module owns the
//! contract tabs consume and the runner that steps a script to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::yield_now;
use tracing::{debug, warn};

use autocrawl_core::Result;

/// How long to let the page settle when a behavior step asks to wait.
const ACTION_SETTLE: Duration = Duration::from_secs(2);

/// A runnable, cancelable unit of page-interaction logic.
///
/// Cancellation (including hitting the `timed_run` deadline) is a normal
/// termination path, not a failure: afterwards `done()` is true.
#[async_trait]
pub trait Behavior: Send + Sync {
    /// Runs until the behavior decides it is finished.
    async fn run(&self);

    /// Runs under a deadline; when the deadline elapses the behavior is
    /// ended and treated as complete.
    async fn timed_run(&self, max_run_time: f64);

    /// True once the behavior finished naturally or was ended.
    fn done(&self) -> bool;

    /// Ends the behavior unconditionally.
    fn end(&self);
}

/// What a behavior needs from the tab hosting it.
#[async_trait]
pub trait BehaviorHost: Send + Sync {
    async fn evaluate_in_page(&self, expression: &str) -> Result<Value>;

    /// Harvest the outlinks the page script accumulated so far.
    async fn collect_outlinks(&self);

    /// Attach the behavior to the host. Idempotent.
    fn set_running_behavior(&self, behavior: Arc<dyn Behavior>);

    /// Detach, but only if `behavior` is the currently attached one.
    fn unset_running_behavior(&self, behavior: &Arc<dyn Behavior>);
}

/// Resolves the behavior to run for a page, if any.
#[async_trait]
pub trait BehaviorManager: Send + Sync {
    async fn behavior_for_url(
        &self,
        url: &str,
        host: Weak<dyn BehaviorHost>,
        collect_outlinks: bool,
    ) -> Option<Arc<dyn Behavior>>;
}

/// Steps an injected behavior script until the page reports it done.
///
/// Each iteration evaluates the action expression, which answers with
/// `{done, wait}`; `wait` asks for a settle delay before the next step.
pub struct WrBehaviorRunner {
    host: Weak<dyn BehaviorHost>,
    behavior_js: String,
    next_action_expression: String,
    unpause_expression: String,
    collect_outlinks: bool,
    done: AtomicBool,
    did_init: AtomicBool,
    self_ref: Weak<WrBehaviorRunner>,
}

impl WrBehaviorRunner {
    pub fn new(
        host: Weak<dyn BehaviorHost>,
        behavior_js: impl Into<String>,
        next_action_expression: impl Into<String>,
        unpause_expression: impl Into<String>,
        collect_outlinks: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            host,
            behavior_js: behavior_js.into(),
            next_action_expression: next_action_expression.into(),
            unpause_expression: unpause_expression.into(),
            collect_outlinks,
            done: AtomicBool::new(false),
            did_init: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    async fn init_in_page(&self, host: &Arc<dyn BehaviorHost>) -> Result<()> {
        if self.did_init.load(Ordering::SeqCst) {
            return Ok(());
        }
        debug!("injecting the behavior script");
        host.evaluate_in_page(&self.behavior_js).await?;
        host.evaluate_in_page(&self.unpause_expression).await?;
        self.did_init.store(true, Ordering::SeqCst);
        yield_now().await;
        Ok(())
    }

    /// One behavior step. Returns the raw `{done, wait}` state.
    async fn perform_action(&self, host: &Arc<dyn BehaviorHost>) -> Result<Value> {
        let state = host.evaluate_in_page(&self.next_action_expression).await?;
        if state.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
            self.done.store(true, Ordering::SeqCst);
        } else if state.get("wait").and_then(|v| v.as_bool()).unwrap_or(false) {
            tokio::time::sleep(ACTION_SETTLE).await;
        }
        Ok(state)
    }

    fn attach_pair(&self) -> Option<(Arc<dyn BehaviorHost>, Arc<dyn Behavior>)> {
        let host = self.host.upgrade()?;
        let me: Arc<dyn Behavior> = self.self_ref.upgrade()?;
        Some((host, me))
    }
}

#[async_trait]
impl Behavior for WrBehaviorRunner {
    async fn run(&self) {
        let Some((host, me)) = self.attach_pair() else {
            self.end();
            return;
        };

        if let Err(e) = self.init_in_page(&host).await {
            warn!(error = %e, "behavior initialization failed");
            self.end();
            return;
        }

        host.set_running_behavior(me.clone());
        loop {
            if let Err(e) = self.perform_action(&host).await {
                warn!(error = %e, "behavior action raised an error");
                self.end();
            }
            if self.collect_outlinks {
                host.collect_outlinks().await;
            }
            if self.done() {
                break;
            }
            // One tick so other work on the tab's task can interleave.
            yield_now().await;
        }
        host.unset_running_behavior(&me);
        debug!("behavior done");
    }

    async fn timed_run(&self, max_run_time: f64) {
        let deadline = Duration::from_secs_f64(max_run_time.max(0.0));
        if tokio::time::timeout(deadline, self.run()).await.is_err() {
            debug!(max_run_time, "behavior hit its maximum run time");
            self.end();
            // The run future was dropped mid-flight; detach explicitly.
            if let Some((host, me)) = self.attach_pair() {
                host.unset_running_behavior(&me);
            }
        }
    }

    fn done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn end(&self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

/// Runs one fixed behavior script for every crawlable page.
///
/// Stands in for a behavior-service client: selection and fetching of
/// per-site behaviors happens outside this system.
pub struct FixedBehaviorManager {
    behavior_js: String,
    next_action_expression: String,
    unpause_expression: String,
}

impl FixedBehaviorManager {
    pub fn new(
        behavior_js: impl Into<String>,
        next_action_expression: impl Into<String>,
        unpause_expression: impl Into<String>,
    ) -> Self {
        Self {
            behavior_js: behavior_js.into(),
            next_action_expression: next_action_expression.into(),
            unpause_expression: unpause_expression.into(),
        }
    }
}

#[async_trait]
impl BehaviorManager for FixedBehaviorManager {
    async fn behavior_for_url(
        &self,
        url: &str,
        host: Weak<dyn BehaviorHost>,
        collect_outlinks: bool,
    ) -> Option<Arc<dyn Behavior>> {
        if !url.starts_with("http:") && !url.starts_with("https:") {
            return None;
        }
        Some(WrBehaviorRunner::new(
            host,
            self.behavior_js.clone(),
            self.next_action_expression.clone(),
            self.unpause_expression.clone(),
            collect_outlinks,
        ))
    }
}

/// Never yields a behavior. Useful when a job only harvests outlinks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBehaviorManager;

#[async_trait]
impl BehaviorManager for NoopBehaviorManager {
    async fn behavior_for_url(
        &self,
        _url: &str,
        _host: Weak<dyn BehaviorHost>,
        _collect_outlinks: bool,
    ) -> Option<Arc<dyn Behavior>> {
        None
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Inert behavior for tests that only need attach/detach and `end`.
    #[derive(Default)]
    pub struct EndOnlyBehavior {
        done: AtomicBool,
    }

    #[async_trait]
    impl Behavior for EndOnlyBehavior {
        async fn run(&self) {}

        async fn timed_run(&self, _max_run_time: f64) {}

        fn done(&self) -> bool {
            self.done.load(Ordering::SeqCst)
        }

        fn end(&self) {
            self.done.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Host whose page reports `done` after a fixed number of actions.
    struct ScriptedHost {
        actions_until_done: Mutex<i64>,
        outlink_collections: Mutex<usize>,
        attached: Mutex<Option<Arc<dyn Behavior>>>,
        hang_forever: bool,
    }

    impl ScriptedHost {
        fn new(actions_until_done: i64) -> Arc<Self> {
            Arc::new(Self {
                actions_until_done: Mutex::new(actions_until_done),
                outlink_collections: Mutex::new(0),
                attached: Mutex::new(None),
                hang_forever: false,
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                actions_until_done: Mutex::new(i64::MAX),
                outlink_collections: Mutex::new(0),
                attached: Mutex::new(None),
                hang_forever: true,
            })
        }
    }

    #[async_trait]
    impl BehaviorHost for ScriptedHost {
        async fn evaluate_in_page(&self, expression: &str) -> Result<Value> {
            if expression.contains("Handler") {
                if self.hang_forever {
                    // Simulate a page action that never resolves quickly.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                let mut left = self.actions_until_done.lock().unwrap();
                *left -= 1;
                return Ok(json!({ "done": *left <= 0, "wait": false }));
            }
            Ok(Value::Null)
        }

        async fn collect_outlinks(&self) {
            *self.outlink_collections.lock().unwrap() += 1;
        }

        fn set_running_behavior(&self, behavior: Arc<dyn Behavior>) {
            *self.attached.lock().unwrap() = Some(behavior);
        }

        fn unset_running_behavior(&self, behavior: &Arc<dyn Behavior>) {
            let mut attached = self.attached.lock().unwrap();
            if let Some(current) = attached.as_ref() {
                if Arc::ptr_eq(current, behavior) {
                    *attached = None;
                }
            }
        }
    }

    fn runner(host: &Arc<ScriptedHost>, collect: bool) -> Arc<WrBehaviorRunner> {
        let host: Arc<dyn BehaviorHost> = host.clone();
        WrBehaviorRunner::new(
            Arc::downgrade(&host),
            "/* behavior */",
            "window.$WRIteratorHandler$()",
            "window.$WBBehaviorPaused = false",
            collect,
        )
    }

    #[tokio::test]
    async fn runs_until_page_reports_done() {
        let host = ScriptedHost::new(3);
        let behavior = runner(&host, true);
        behavior.run().await;
        assert!(behavior.done());
        // One outlink collection per action.
        assert_eq!(*host.outlink_collections.lock().unwrap(), 3);
        // Detached after completion.
        assert!(host.attached.lock().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_run_ends_a_hung_behavior() {
        let host = ScriptedHost::hanging();
        let behavior = runner(&host, false);
        behavior.timed_run(1.0).await;
        assert!(behavior.done());
        assert!(host.attached.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn end_is_observed_as_done() {
        let host = ScriptedHost::new(100);
        let behavior = runner(&host, false);
        behavior.end();
        assert!(behavior.done());
    }

    #[tokio::test]
    async fn noop_manager_yields_nothing() {
        let host: Arc<dyn BehaviorHost> = ScriptedHost::new(1);
        assert!(NoopBehaviorManager
            .behavior_for_url("http://a.test", Arc::downgrade(&host), true)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn fixed_manager_skips_uncrawlable_schemes() {
        let host: Arc<dyn BehaviorHost> = ScriptedHost::new(1);
        let manager = FixedBehaviorManager::new("js", "expr", "unpause");
        assert!(manager
            .behavior_for_url("mailto:nobody@a.test", Arc::downgrade(&host), false)
            .await
            .is_none());
    }
}
