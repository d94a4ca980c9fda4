/*!
 * Asynchronous command units.
 *
 * A [`Task`] is one command sent to a provider through a transport. It is
 * correlated with the transport's answer through its identifier and carries a
 * single-assignment result slot. Callbacks registered on the task fire once,
 * in registration order, on whichever thread sets the result.
 */
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};

use gatelink_core::types::{Id, Value};
use gatelink_core::utils::{duration_to_millis, now_millis};

use crate::command::Command;
use crate::configuration::ResourceConfig;
use crate::translator::Translator;

/// Reserved character joining the segments of a task identifier
pub const IDENTIFIER_SEPARATOR: char = '#';

/// Timeout given to tasks when nothing else is configured
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Result handed back when a task is aborted or times out.
///
/// Indistinguishable from a genuine empty answer; check [`Task::status`]
/// when the difference matters.
pub const EMPTY_RESULT: Value = Value::Null;

/// Build a task identifier from its provider, command and path segments
pub fn build_identifier(provider: &str, command: Command, segments: &[&str]) -> String {
    let mut identifier = String::with_capacity(provider.len() + 16);
    identifier.push_str(provider);
    identifier.push(IDENTIFIER_SEPARATOR);
    identifier.push_str(command.as_str());
    for segment in segments.iter().filter(|s| !s.is_empty()) {
        identifier.push(IDENTIFIER_SEPARATOR);
        identifier.push_str(segment);
    }
    identifier
}

/// The provider part of a task identifier
pub fn provider_of(identifier: &str) -> &str {
    identifier
        .split(IDENTIFIER_SEPARATOR)
        .next()
        .unwrap_or(identifier)
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Built, not yet handed to the transport
    #[default]
    Initialized,
    /// Handed to the transport, waiting for an answer
    Launched,
    /// A result arrived
    Executed,
    /// Timed out, failed to transmit, or could not be correlated
    Aborted,
}

impl TaskStatus {
    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Executed | TaskStatus::Aborted)
    }
}

/// A resource operation as requested by the resource model
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// The operation
    pub command: Command,
    /// `/provider/service/resource[/attribute]` path that originated the call
    pub path: String,
    /// Profile of the target provider
    pub profile_id: Option<String>,
    /// Descriptor of the targeted resource
    pub resource_config: Option<Arc<ResourceConfig>>,
    /// Ordered call arguments
    pub parameters: Vec<Value>,
}

impl TaskRequest {
    /// Create a request with no parameters
    pub fn new<P: Into<String>>(command: Command, path: P) -> Self {
        Self {
            command,
            path: path.into(),
            profile_id: None,
            resource_config: None,
            parameters: Vec::new(),
        }
    }

    /// Set the provider profile
    pub fn with_profile<P: Into<String>>(mut self, profile: P) -> Self {
        self.profile_id = Some(profile.into());
        self
    }

    /// Set the resource descriptor
    pub fn with_resource_config(mut self, config: Option<Arc<ResourceConfig>>) -> Self {
        self.resource_config = config;
        self
    }

    /// Set the call arguments
    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Non-empty path segments
    pub fn path_segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// The provider the path points at
    pub fn provider(&self) -> Option<&str> {
        self.path.split('/').find(|s| !s.is_empty())
    }

    /// Identifier built from the path: provider, command, then the remaining segments
    pub fn default_identifier(&self) -> Option<String> {
        let segments = self.path_segments();
        let (provider, rest) = segments.split_first()?;
        Some(build_identifier(provider, self.command, rest))
    }
}

/// Extension points invoked around a task's dispatch and resolution
pub trait TaskHook: Send + Sync + fmt::Debug {
    /// Called after the task is launched, before the transport sees it
    fn before_dispatch(&self, _task: &Task) {}

    /// Called when a result is set, before the registered callbacks run
    fn on_result(&self, _task: &Task, _result: &Value) {}
}

type TaskCallback = Box<dyn FnOnce(&Task) + Send>;

#[derive(Default)]
struct TaskState {
    status: TaskStatus,
    resolving: bool,
    result: Option<Value>,
    result_timestamp: Option<i64>,
    launched_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    callbacks: VecDeque<TaskCallback>,
}

/// A single asynchronous command
pub struct Task {
    uid: Id,
    command: Command,
    identifier: Option<String>,
    path: String,
    profile_id: Option<String>,
    resource_config: Option<Arc<ResourceConfig>>,
    command_code: Option<Bytes>,
    parameters: Mutex<Vec<Value>>,
    timeout_ms: AtomicU64,
    translator: Arc<dyn Translator>,
    hook: Mutex<Option<Arc<dyn TaskHook>>>,
    state: Mutex<TaskState>,
}

/// Diagnostic view of a task
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    /// Instance id
    pub uid: String,
    /// Correlation identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Originating path
    pub path: String,
    /// Command name
    pub command: Command,
    /// Launch time, epoch milliseconds
    pub launched: Option<i64>,
    /// Completion time, epoch milliseconds
    pub completed: Option<i64>,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Result; omitted for aborted tasks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl Task {
    /// Build a task for `request`, transmitted through `translator`
    pub fn new(request: TaskRequest, identifier: Option<String>, translator: Arc<dyn Translator>) -> Self {
        Self {
            uid: Id::new(),
            command: request.command,
            identifier,
            path: request.path,
            profile_id: request.profile_id,
            resource_config: request.resource_config,
            command_code: None,
            parameters: Mutex::new(request.parameters),
            timeout_ms: AtomicU64::new(DEFAULT_TIMEOUT_MS),
            translator,
            hook: Mutex::new(None),
            state: Mutex::new(TaskState::default()),
        }
    }

    /// Attach the transport code of the command
    pub fn with_command_code(mut self, code: Option<Bytes>) -> Self {
        self.command_code = code;
        self
    }

    /// Set the initial timeout
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    /// Instance id, unique per task
    pub fn uid(&self) -> &Id {
        &self.uid
    }

    /// The command
    pub fn command(&self) -> Command {
        self.command
    }

    /// Correlation identifier; `None` for fire-and-forget commands
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Provider the task is addressed to
    pub fn provider(&self) -> Option<&str> {
        match &self.identifier {
            Some(identifier) => Some(provider_of(identifier)),
            None => self.path.split('/').find(|s| !s.is_empty()),
        }
    }

    /// Originating path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Profile of the target provider
    pub fn profile_id(&self) -> Option<&str> {
        self.profile_id.as_deref()
    }

    /// Descriptor of the targeted resource
    pub fn resource_config(&self) -> Option<&Arc<ResourceConfig>> {
        self.resource_config.as_ref()
    }

    /// Transport code of the command
    pub fn command_code(&self) -> Option<&Bytes> {
        self.command_code.as_ref()
    }

    /// Snapshot of the call arguments
    pub fn parameters(&self) -> Vec<Value> {
        self.parameters.lock().clone()
    }

    /// Append a call argument
    pub fn push_parameter(&self, value: Value) {
        self.parameters.lock().push(value);
    }

    /// Current timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Acquire))
    }

    /// Change the timeout
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms.store(duration_to_millis(timeout), Ordering::Release);
    }

    /// Current status
    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    /// Whether a result (or abort value) has been set
    pub fn is_result_available(&self) -> bool {
        self.state.lock().result.is_some()
    }

    /// The result, once available
    pub fn result(&self) -> Option<Value> {
        self.state.lock().result.clone()
    }

    /// Timestamp of the result in epoch milliseconds, once available
    pub fn timestamp(&self) -> Option<i64> {
        self.state.lock().result_timestamp
    }

    /// Attach a hook; refused when the task is already wrapped
    pub fn wrap(&self, hook: Arc<dyn TaskHook>) -> bool {
        let mut slot = self.hook.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(hook);
        true
    }

    /// Whether a hook is attached
    pub fn is_wrapped(&self) -> bool {
        self.hook.lock().is_some()
    }

    fn hook(&self) -> Option<Arc<dyn TaskHook>> {
        self.hook.lock().clone()
    }

    /// Launch the task: mark it LAUNCHED and hand it to the translator.
    ///
    /// Returns `false` when the task was not in the INITIALIZED state. A
    /// transmission failure aborts the task with [`EMPTY_RESULT`].
    pub async fn execute(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != TaskStatus::Initialized {
                warn!(
                    uid = %self.uid,
                    status = ?state.status,
                    "Refusing to execute a task twice"
                );
                return false;
            }
            state.status = TaskStatus::Launched;
            state.launched_at = Some(Utc::now());
        }

        if let Some(hook) = self.hook() {
            hook.before_dispatch(self);
        }

        debug!(
            uid = %self.uid,
            command = %self.command,
            identifier = self.identifier.as_deref().unwrap_or("-"),
            "Transmitting task"
        );
        if let Err(e) = self.translator.transmit(self).await {
            warn!(uid = %self.uid, path = %self.path, "Failed to transmit task: {}", e);
            self.abort(EMPTY_RESULT);
        }
        true
    }

    /// Store the result and fire the callbacks.
    ///
    /// A second result is ignored with a warning; returns whether this call
    /// set the result. `timestamp` defaults to now. An attached hook sees the
    /// value before the result becomes visible to other observers.
    pub fn set_result(&self, value: Value, timestamp: Option<i64>) -> bool {
        if !self.claim(TaskStatus::Executed) {
            return false;
        }
        if let Some(hook) = self.hook() {
            hook.on_result(self, &value);
        }
        let callbacks = self.publish(TaskStatus::Executed, value, timestamp);
        self.drain(callbacks);
        true
    }

    /// Abort the task with `value` and fire the callbacks.
    ///
    /// Subject to the same single-assignment rule as [`Task::set_result`].
    pub fn abort(&self, value: Value) -> bool {
        if !self.claim(TaskStatus::Aborted) {
            return false;
        }
        let callbacks = self.publish(TaskStatus::Aborted, value, None);
        debug!(uid = %self.uid, path = %self.path, "Task aborted");
        self.drain(callbacks);
        true
    }

    /// Run `callback` once the result is available; immediately if it already is
    pub fn register_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if state.result.is_none() {
                state.callbacks.push_back(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    // Reserve the result slot; the winner publishes, everyone else is refused
    fn claim(&self, status: TaskStatus) -> bool {
        let mut state = self.state.lock();
        if state.resolving || state.result.is_some() {
            warn!(
                uid = %self.uid,
                status = ?state.status,
                "Result already set, ignoring {:?}",
                status
            );
            return false;
        }
        state.resolving = true;
        true
    }

    fn publish(&self, status: TaskStatus, value: Value, timestamp: Option<i64>) -> VecDeque<TaskCallback> {
        let mut state = self.state.lock();
        state.result = Some(value);
        state.result_timestamp = Some(timestamp.unwrap_or_else(now_millis));
        state.status = status;
        state.completed_at = Some(Utc::now());
        std::mem::take(&mut state.callbacks)
    }

    fn drain(&self, callbacks: VecDeque<TaskCallback>) {
        trace!(uid = %self.uid, count = callbacks.len(), "Draining task callbacks");
        for callback in callbacks {
            callback(self);
        }
    }

    /// Diagnostic record of the task
    pub fn report(&self) -> TaskReport {
        let state = self.state.lock();
        let status = state.status;
        TaskReport {
            uid: self.uid.to_string(),
            identifier: self.identifier.clone(),
            path: self.path.clone(),
            command: self.command,
            launched: state.launched_at.map(|t| t.timestamp_millis()),
            completed: state.completed_at.map(|t| t.timestamp_millis()),
            status,
            result: match status {
                TaskStatus::Aborted => None,
                _ => state.result.as_ref().map(Value::to_json),
            },
        }
    }

    /// Diagnostic record as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.report()).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("uid", &self.uid)
            .field("command", &self.command)
            .field("identifier", &self.identifier)
            .field("path", &self.path)
            .field("status", &self.status())
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProtocolError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct CountingTranslator {
        sent: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Translator for CountingTranslator {
        async fn transmit(&self, _task: &Arc<Task>) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProtocolError::Transmission("link down".into()));
            }
            Ok(())
        }
    }

    fn task(path: &str) -> Arc<Task> {
        let request = TaskRequest::new(Command::Get, path);
        let identifier = request.default_identifier();
        Arc::new(Task::new(request, identifier, Arc::new(CountingTranslator::default())))
    }

    #[test]
    fn test_identifier_from_path() {
        let request = TaskRequest::new(Command::Get, "/providerA/svc/res");
        assert_eq!(request.default_identifier().as_deref(), Some("providerA#GET#svc#res"));
        assert_eq!(request.provider(), Some("providerA"));
        assert_eq!(provider_of("providerA#GET#svc#res"), "providerA");
        assert!(TaskRequest::new(Command::Get, "/").default_identifier().is_none());
    }

    #[test]
    fn test_result_is_set_at_most_once() {
        let task = task("/p/svc/res");
        assert!(task.set_result(Value::from(1), Some(10)));
        assert!(!task.set_result(Value::from(2), Some(20)));
        assert!(!task.abort(EMPTY_RESULT));

        assert_eq!(task.result(), Some(Value::from(1)));
        assert_eq!(task.timestamp(), Some(10));
        assert_eq!(task.status(), TaskStatus::Executed);
    }

    #[test]
    fn test_sentinels_before_result() {
        let task = task("/p/svc/res");
        assert!(!task.is_result_available());
        assert!(task.result().is_none());
        assert!(task.timestamp().is_none());
        assert_eq!(task.timeout(), Duration::from_millis(DEFAULT_TIMEOUT_MS));
    }

    #[test]
    fn test_callbacks_fire_once_in_registration_order() {
        let task = task("/p/svc/res");
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            task.register_callback(move |_| order.lock().push(n));
        }
        assert!(order.lock().is_empty());

        task.set_result(Value::from("ok"), None);
        task.set_result(Value::from("again"), None);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_late_callback_runs_immediately() {
        let task = task("/p/svc/res");
        task.abort(EMPTY_RESULT);

        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        task.register_callback(move |t| *slot.lock() = Some(t.status()));
        assert_eq!(*seen.lock(), Some(TaskStatus::Aborted));
    }

    #[test]
    fn test_callback_may_inspect_task() {
        let task = task("/p/svc/res");
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        task.register_callback(move |t| *slot.lock() = t.result());
        task.set_result(Value::from(7), None);
        assert_eq!(*seen.lock(), Some(Value::from(7)));
    }

    #[tokio::test]
    async fn test_execute_launches_once() {
        let translator = Arc::new(CountingTranslator::default());
        let request = TaskRequest::new(Command::Set, "/p/svc/res").with_parameters(vec![1.into()]);
        let task = Arc::new(Task::new(request, None, translator.clone()));

        assert!(task.execute().await);
        assert_eq!(task.status(), TaskStatus::Launched);
        assert!(!task.execute().await);
        assert_eq!(translator.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transmit_failure_aborts() {
        let translator = Arc::new(CountingTranslator {
            sent: AtomicUsize::new(0),
            fail: true,
        });
        let request = TaskRequest::new(Command::Get, "/p/svc/res");
        let task = Arc::new(Task::new(request, Some("p#GET#svc#res".into()), translator));

        task.execute().await;
        assert_eq!(task.status(), TaskStatus::Aborted);
        assert_eq!(task.result(), Some(EMPTY_RESULT));
    }

    #[derive(Debug, Default)]
    struct RecordingHook {
        events: Mutex<Vec<String>>,
    }

    impl TaskHook for RecordingHook {
        fn before_dispatch(&self, task: &Task) {
            self.events.lock().push(format!("dispatch:{}", task.status() == TaskStatus::Launched));
        }

        fn on_result(&self, _task: &Task, result: &Value) {
            self.events.lock().push(format!("result:{}", result));
        }
    }

    #[tokio::test]
    async fn test_hook_runs_before_callbacks() {
        let task = task("/p/svc/res");
        let hook = Arc::new(RecordingHook::default());
        assert!(task.wrap(hook.clone()));
        assert!(!task.wrap(Arc::new(RecordingHook::default())));

        let events = hook.clone();
        task.register_callback(move |_| events.events.lock().push("callback".into()));

        task.execute().await;
        task.set_result(Value::from("sub-1"), None);
        assert_eq!(
            *hook.events.lock(),
            vec!["dispatch:true".to_string(), "result:sub-1".into(), "callback".into()]
        );
    }

    #[derive(Debug, Default)]
    struct VisibilityHook {
        visible: Mutex<Option<bool>>,
    }

    impl TaskHook for VisibilityHook {
        fn on_result(&self, task: &Task, _result: &Value) {
            *self.visible.lock() = Some(task.is_result_available());
            assert!(!task.abort(EMPTY_RESULT));
        }
    }

    #[test]
    fn test_hook_runs_before_result_is_visible() {
        let task = task("/p/svc/res");
        let hook = Arc::new(VisibilityHook::default());
        task.wrap(hook.clone());

        assert!(task.set_result(Value::from("sub-7"), None));
        assert_eq!(*hook.visible.lock(), Some(false));
        assert_eq!(task.status(), TaskStatus::Executed);
        assert_eq!(task.result(), Some(Value::from("sub-7")));
    }

    #[test]
    fn test_report_omits_result_when_aborted() {
        let done = task("/p/svc/res");
        done.set_result(Value::from(21.5), None);
        let json = done.to_json();
        assert_eq!(json["command"], "GET");
        assert_eq!(json["status"], "EXECUTED");
        assert_eq!(json["path"], "/p/svc/res");
        assert_eq!(json["result"], 21.5);
        assert!(json["completed"].is_i64());

        let aborted = task("/p/svc/res");
        aborted.abort(EMPTY_RESULT);
        let json = aborted.to_json();
        assert_eq!(json["status"], "ABORTED");
        assert!(json.get("result").is_none());
        assert!(json["launched"].is_null());
    }

    #[test]
    fn test_timeout_is_mutable() {
        let task = task("/p/svc/res");
        task.set_timeout(Duration::from_millis(250));
        assert_eq!(task.timeout(), Duration::from_millis(250));
    }
}
