/*!
 * Task dispatch and correlation.
 *
 * The [`TaskManager`] queues tasks, hands them to the transport (directly or
 * through a [`TaskDesynchronizer`]) and keeps, per provider, the tasks that
 * wait for an answer so inbound values can be matched to them.
 */
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use gatelink_core::config::ReleasePolicy;

use crate::command::CommandCodes;
use crate::desynchronizer::TaskDesynchronizer;
use crate::task::{provider_of, Task, TaskRequest, DEFAULT_TIMEOUT_MS, EMPTY_RESULT};
use crate::translator::Translator;

type PendingTable = Mutex<HashMap<String, Vec<Arc<Task>>>>;

/// Queues, dispatches and correlates tasks for one transport
pub struct TaskManager {
    translator: Arc<dyn Translator>,
    command_codes: CommandCodes,
    default_timeout: Duration,
    waiting: Mutex<VecDeque<Arc<Task>>>,
    executed: Arc<PendingTable>,
    desynchronizer: Option<Arc<TaskDesynchronizer>>,
    release: ReleasePolicy,
}

impl TaskManager {
    /// Create a manager dispatching through `translator`
    pub fn new(translator: Arc<dyn Translator>) -> Self {
        Self {
            translator,
            command_codes: CommandCodes::default(),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            waiting: Mutex::new(VecDeque::new()),
            executed: Arc::new(Mutex::new(HashMap::new())),
            desynchronizer: None,
            release: ReleasePolicy::default(),
        }
    }

    /// Attach the command-code table
    pub fn with_command_codes(mut self, codes: CommandCodes) -> Self {
        self.command_codes = codes;
        self
    }

    /// Timeout given to the tasks this manager builds
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Dispatch through a desynchronizer, releasing slots per `release`
    pub fn with_desynchronizer(mut self, desynchronizer: Arc<TaskDesynchronizer>, release: ReleasePolicy) -> Self {
        self.desynchronizer = Some(desynchronizer);
        self.release = release;
        self
    }

    /// The desynchronizer, when dispatch is throttled
    pub fn desynchronizer(&self) -> Option<&Arc<TaskDesynchronizer>> {
        self.desynchronizer.as_ref()
    }

    /// Build a task for `request` through the translator.
    ///
    /// When the translator cannot identify the request the returned task is
    /// already aborted with [`EMPTY_RESULT`].
    pub fn create_task(&self, request: TaskRequest) -> Arc<Task> {
        let code = self.command_codes.code(request.command).cloned();
        let (identifier, failure) = match self.translator.identify(&request) {
            Ok(identifier) => (identifier, None),
            Err(e) => (None, Some(e)),
        };
        let task = Arc::new(
            Task::new(request, identifier, self.translator.clone())
                .with_command_code(code)
                .with_timeout(self.default_timeout),
        );
        if let Some(e) = failure {
            warn!(path = %task.path(), "Failed to translate request: {}", e);
            task.abort(EMPTY_RESULT);
        }
        task
    }

    /// Build a task for `request` and execute it
    pub async fn execute_request(self: &Arc<Self>, request: TaskRequest) -> Arc<Task> {
        let task = self.create_task(request);
        self.execute(task.clone()).await;
        task
    }

    /// Queue a task.
    ///
    /// Without a desynchronizer the task is dispatched before this returns;
    /// with one, a dispatch credit is requested and dispatch happens later.
    pub async fn execute(self: &Arc<Self>, task: Arc<Task>) {
        self.waiting.lock().push_back(task);
        match &self.desynchronizer {
            Some(desynchronizer) => desynchronizer.require(self.clone(), 1),
            None => self.next_task().await,
        }
    }

    /// Dispatch the task at the head of the queue, if any
    pub async fn next_task(self: &Arc<Self>) {
        let next = self.waiting.lock().pop_front();
        let task = match next {
            Some(task) => task,
            None => {
                self.release_slot();
                return;
            }
        };

        if !task.is_result_available() {
            match task.identifier() {
                Some(identifier) => {
                    let identifier = identifier.to_string();
                    self.track(&task, &identifier);
                    task.execute().await;
                }
                None => {
                    task.execute().await;
                    task.abort(EMPTY_RESULT);
                }
            }
        }

        match (self.release, &self.desynchronizer) {
            (ReleasePolicy::Completion, Some(desynchronizer)) => {
                let desynchronizer = desynchronizer.clone();
                task.register_callback(move |_| desynchronizer.freeing_token());
            }
            _ => self.release_slot(),
        }
    }

    fn release_slot(&self) {
        if let Some(desynchronizer) = &self.desynchronizer {
            desynchronizer.freeing_token();
        }
    }

    fn track(&self, task: &Arc<Task>, identifier: &str) {
        let provider = provider_of(identifier).to_string();
        {
            let mut executed = self.executed.lock();
            let pending = executed.entry(provider.clone()).or_default();
            if !pending.iter().any(|t| Arc::ptr_eq(t, task)) {
                pending.push(task.clone());
            }
        }
        trace!(provider = %provider, identifier = %identifier, "Tracking task");

        let table: Weak<PendingTable> = Arc::downgrade(&self.executed);
        task.register_callback(move |done| {
            if let Some(table) = table.upgrade() {
                forget(&table, &provider, done);
            }
        });
    }

    /// Take every pending task whose identifier is exactly `identifier`
    pub fn remove(&self, identifier: &str) -> Vec<Arc<Task>> {
        let provider = provider_of(identifier);
        let mut executed = self.executed.lock();
        let Some(pending) = executed.get_mut(provider) else {
            return Vec::new();
        };
        let (matched, kept): (Vec<_>, Vec<_>) = std::mem::take(pending)
            .into_iter()
            .partition(|t| t.identifier() == Some(identifier));
        if kept.is_empty() {
            executed.remove(provider);
        } else {
            *pending = kept;
        }
        debug!(identifier = %identifier, matched = matched.len(), "Correlated pending tasks");
        matched
    }

    /// Number of tasks awaiting an answer
    pub fn pending_count(&self) -> usize {
        self.executed.lock().values().map(Vec::len).sum()
    }

    /// Number of tasks awaiting an answer from `provider`
    pub fn pending_for(&self, provider: &str) -> usize {
        self.executed.lock().get(provider).map_or(0, Vec::len)
    }

    /// Number of tasks not yet dispatched
    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().len()
    }

    /// Stop throttled dispatch. Pending tasks are left as they are.
    pub fn stop(&self) {
        if let Some(desynchronizer) = &self.desynchronizer {
            desynchronizer.stop();
        }
    }
}

fn forget(table: &PendingTable, provider: &str, done: &Task) {
    let mut executed = table.lock();
    if let Some(pending) = executed.get_mut(provider) {
        pending.retain(|t| !std::ptr::eq(t.as_ref(), done));
        if pending.is_empty() {
            executed.remove(provider);
        }
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("translator", &self.translator)
            .field("waiting", &self.waiting_count())
            .field("pending", &self.pending_count())
            .field("throttled", &self.desynchronizer.is_some())
            .field("release", &self.release)
            .finish()
    }
}
