/*!
 * Dispatch throttling.
 *
 * A [`TaskDesynchronizer`] holds a signed credit counter and a FIFO of
 * claims. Each credit lets one claim through; a claim asks its task manager
 * to dispatch the head of its queue. Credits come back through
 * [`TaskDesynchronizer::freeing_token`].
 *
 * Claims and the dispatch loop hold the desynchronizer and its managers
 * weakly: dropping the last owner ends the loop.
 */
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use gatelink_core::config::DesynchronizerConfig;
use gatelink_core::utils::{millis_to_duration, spawn_and_log};

use crate::error::ProtocolError;
use crate::task_manager::TaskManager;

/// Default idle wake-up interval of the dispatch loop
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(150);

struct Slots {
    credits: i64,
    claims: VecDeque<Weak<TaskManager>>,
    locked: bool,
}

/// Background admission controller for task dispatch
pub struct TaskDesynchronizer {
    slots: Mutex<Slots>,
    notify: Arc<Notify>,
    running: AtomicBool,
    idle_interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskDesynchronizer {
    /// Create a desynchronizer.
    ///
    /// A locked desynchronizer starts without credits and dispatches nothing
    /// until [`unlock`](Self::unlock) or [`freeing_token`](Self::freeing_token)
    /// is called.
    pub fn new(locked: bool) -> Self {
        Self {
            slots: Mutex::new(Slots {
                credits: if locked { 0 } else { 1 },
                claims: VecDeque::new(),
                locked,
            }),
            notify: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            idle_interval: DEFAULT_IDLE_INTERVAL,
            handle: Mutex::new(None),
        }
    }

    /// Create a desynchronizer from the `[bridge.desynchronizer]` settings
    pub fn from_config(config: &DesynchronizerConfig) -> Self {
        Self::new(config.locked).with_idle_interval(millis_to_duration(config.idle_interval_ms))
    }

    /// Change the idle wake-up interval
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Queue `count` dispatch claims for `manager`
    pub fn require(&self, manager: Arc<TaskManager>, count: usize) {
        {
            let mut slots = self.slots.lock();
            for _ in 0..count {
                slots.claims.push_back(Arc::downgrade(&manager));
            }
            trace!(claims = slots.claims.len(), credits = slots.credits, "Dispatch claimed");
        }
        self.notify.notify_one();
    }

    /// Give one credit back
    pub fn freeing_token(&self) {
        {
            let mut slots = self.slots.lock();
            slots.credits += 1;
            trace!(credits = slots.credits, "Dispatch slot freed");
        }
        self.notify.notify_one();
    }

    /// Release the initial lock. Does nothing unless created locked.
    pub fn unlock(&self) {
        let released = {
            let mut slots = self.slots.lock();
            let was_locked = std::mem::replace(&mut slots.locked, false);
            if was_locked {
                slots.credits += 1;
            }
            was_locked
        };
        if released {
            debug!("Desynchronizer unlocked");
            self.notify.notify_one();
        }
    }

    /// Whether the initial lock is still held
    pub fn is_locked(&self) -> bool {
        self.slots.lock().locked
    }

    /// Available credits
    pub fn credits(&self) -> i64 {
        self.slots.lock().credits
    }

    /// Queued claims
    pub fn claims(&self) -> usize {
        self.slots.lock().claims.len()
    }

    /// Whether the dispatch loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the dispatch loop on the current runtime. Does nothing if running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(idle_ms = self.idle_interval.as_millis() as u64, "Starting task desynchronizer");
        let (this, notify, idle) = (Arc::downgrade(self), self.notify.clone(), self.idle_interval);
        let handle = spawn_and_log("task-desynchronizer", async move {
            Self::run(this, notify, idle).await;
            Ok::<_, ProtocolError>(())
        });
        if let Some(previous) = self.handle.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn run(this: Weak<Self>, notify: Arc<Notify>, idle: Duration) {
        loop {
            let admitted = match this.upgrade() {
                Some(desync) if desync.is_running() => desync.admit(),
                _ => break,
            };
            match admitted {
                Some(manager) => manager.next_task().await,
                None => {
                    let _ = tokio::time::timeout(idle, notify.notified()).await;
                }
            }
        }
        debug!("Task desynchronizer loop exited");
    }

    fn admit(&self) -> Option<Arc<TaskManager>> {
        let mut slots = self.slots.lock();
        if slots.credits <= 0 {
            return None;
        }
        // Claims of dropped managers are discarded without spending a credit
        while let Some(claim) = slots.claims.pop_front() {
            if let Some(manager) = claim.upgrade() {
                slots.credits -= 1;
                return Some(manager);
            }
        }
        None
    }

    /// Stop the dispatch loop and drop pending claims. Idempotent.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        self.slots.lock().claims.clear();
        self.notify.notify_one();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        if was_running {
            info!("Task desynchronizer stopped");
        }
    }
}

impl Default for TaskDesynchronizer {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Drop for TaskDesynchronizer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for TaskDesynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("TaskDesynchronizer")
            .field("credits", &slots.credits)
            .field("claims", &slots.claims.len())
            .field("locked", &slots.locked)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::error::Result;
    use crate::task::{Task, TaskRequest, TaskStatus};
    use crate::translator::Translator;
    use async_trait::async_trait;
    use gatelink_core::config::ReleasePolicy;
    use gatelink_core::types::Value;

    #[derive(Debug, Default)]
    struct SinkTranslator {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Translator for SinkTranslator {
        async fn transmit(&self, task: &Arc<Task>) -> Result<()> {
            self.sent.lock().push(task.path().to_string());
            Ok(())
        }
    }

    fn throttled(locked: bool, release: ReleasePolicy) -> (Arc<TaskManager>, Arc<TaskDesynchronizer>, Arc<SinkTranslator>) {
        let translator = Arc::new(SinkTranslator::default());
        let desync = Arc::new(TaskDesynchronizer::new(locked).with_idle_interval(Duration::from_millis(20)));
        let manager = Arc::new(TaskManager::new(translator.clone()).with_desynchronizer(desync.clone(), release));
        (manager, desync, translator)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[test]
    fn test_initial_credits() {
        assert_eq!(TaskDesynchronizer::new(false).credits(), 1);
        assert_eq!(TaskDesynchronizer::new(true).credits(), 0);
        assert!(TaskDesynchronizer::new(true).is_locked());
    }

    #[test]
    fn test_unlock_only_once() {
        let desync = TaskDesynchronizer::new(true);
        desync.unlock();
        desync.unlock();
        assert_eq!(desync.credits(), 1);

        let open = TaskDesynchronizer::new(false);
        open.unlock();
        assert_eq!(open.credits(), 1);
    }

    #[test]
    fn test_from_config() {
        let config = DesynchronizerConfig {
            enabled: true,
            locked: true,
            idle_interval_ms: 40,
            release: ReleasePolicy::Dispatch,
        };
        let desync = TaskDesynchronizer::from_config(&config);
        assert!(desync.is_locked());
        assert_eq!(desync.idle_interval, Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_locked_holds_dispatch_until_token() {
        let (manager, desync, translator) = throttled(true, ReleasePolicy::Dispatch);
        desync.start();

        manager.execute_request(TaskRequest::new(Command::Get, "/p/svc/a")).await;
        manager.execute_request(TaskRequest::new(Command::Get, "/p/svc/b")).await;
        settle().await;
        assert!(translator.sent.lock().is_empty());
        assert_eq!(desync.claims(), 2);
        assert_eq!(manager.waiting_count(), 2);

        desync.freeing_token();
        settle().await;
        assert_eq!(*translator.sent.lock(), vec!["/p/svc/a".to_string(), "/p/svc/b".to_string()]);
        assert_eq!(desync.claims(), 0);
        desync.stop();
    }

    #[tokio::test]
    async fn test_completion_policy_waits_for_result() {
        let (manager, desync, translator) = throttled(false, ReleasePolicy::Completion);
        desync.start();

        let first = manager.execute_request(TaskRequest::new(Command::Get, "/p/svc/a")).await;
        manager.execute_request(TaskRequest::new(Command::Get, "/p/svc/b")).await;
        settle().await;
        assert_eq!(translator.sent.lock().len(), 1);
        assert_eq!(first.status(), TaskStatus::Launched);

        first.set_result(Value::from(1), None);
        settle().await;
        assert_eq!(translator.sent.lock().len(), 2);
        desync.stop();
    }

    #[tokio::test]
    async fn test_freed_credits_bound_dispatch() {
        let (manager, desync, translator) = throttled(true, ReleasePolicy::Completion);
        desync.start();

        for resource in ["a", "b", "c"] {
            manager
                .execute_request(TaskRequest::new(Command::Get, format!("/p/svc/{}", resource)))
                .await;
        }
        desync.freeing_token();
        desync.freeing_token();
        settle().await;

        assert_eq!(*translator.sent.lock(), vec!["/p/svc/a".to_string(), "/p/svc/b".to_string()]);
        assert_eq!(desync.claims(), 1);
        assert_eq!(desync.credits(), 0);
        desync.stop();
    }

    #[tokio::test]
    async fn test_restart_after_stop_dispatches_once_per_credit() {
        let (manager, desync, translator) = throttled(false, ReleasePolicy::Completion);
        desync.start();
        desync.stop();
        desync.start();
        assert!(desync.is_running());

        let first = manager.execute_request(TaskRequest::new(Command::Get, "/p/svc/a")).await;
        manager.execute_request(TaskRequest::new(Command::Get, "/p/svc/b")).await;
        settle().await;
        assert_eq!(*translator.sent.lock(), vec!["/p/svc/a".to_string()]);
        assert_eq!(desync.claims(), 1);

        first.set_result(Value::from(1), None);
        settle().await;
        assert_eq!(translator.sent.lock().len(), 2);
        desync.stop();
    }

    #[tokio::test]
    async fn test_dropped_desynchronizer_ends_its_loop() {
        let (manager, desync, _translator) = throttled(true, ReleasePolicy::Dispatch);
        desync.start();
        manager.execute_request(TaskRequest::new(Command::Get, "/p/svc/a")).await;
        assert_eq!(desync.claims(), 1);

        let weak = Arc::downgrade(&desync);
        drop(manager);
        drop(desync);
        settle().await;
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_drops_claims() {
        let (manager, desync, translator) = throttled(true, ReleasePolicy::Dispatch);
        desync.start();
        assert!(desync.is_running());

        manager.execute_request(TaskRequest::new(Command::Get, "/p/svc/a")).await;
        desync.stop();
        desync.stop();
        assert!(!desync.is_running());
        assert_eq!(desync.claims(), 0);

        desync.freeing_token();
        settle().await;
        assert!(translator.sent.lock().is_empty());
    }
}
