/*!
 * Subscription id bookkeeping.
 *
 * Devices answer a SUBSCRIBE with their own subscription id. The registry
 * maps the subscribed target to that id so the matching UNSUBSCRIBE can carry
 * it back to the device.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use gatelink_core::types::Value;

use crate::task::{Task, TaskHook};

/// Target id -> device subscription id
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, String>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the subscription id of `target`, replacing any previous one
    pub fn register<T: Into<String>, S: Into<String>>(&self, target: T, subscription: S) {
        let (target, subscription) = (target.into(), subscription.into());
        debug!(target = %target, subscription = %subscription, "Subscription registered");
        self.entries.write().insert(target, subscription);
    }

    /// The subscription id of `target`
    pub fn resolve(&self, target: &str) -> Option<String> {
        self.entries.read().get(target).cloned()
    }

    /// Forget `target`
    pub fn remove(&self, target: &str) -> Option<String> {
        self.entries.write().remove(target)
    }

    /// Number of mappings
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no mapping is held
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// How subscription ids are read from tasks and their results
pub trait SubscriptionBinding: Send + Sync + Debug {
    /// The target a subscribe or unsubscribe task is about
    fn target_id(&self, task: &Task) -> Option<String> {
        Some(task.path().to_string())
    }

    /// The subscription id carried by a subscribe result
    fn subscription_id(&self, _task: &Task, result: &Value) -> Option<String> {
        match result {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Object(_) => match result.get("subscriptionId") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Integer(i)) => Some(i.to_string()),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Binding keyed by task path, reading plain or `subscriptionId` results
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSubscriptionBinding;

impl SubscriptionBinding for DefaultSubscriptionBinding {}

/// Records the subscription id when a subscribe task resolves
#[derive(Debug)]
pub struct SubscribeHook {
    binding: Arc<dyn SubscriptionBinding>,
    registry: Arc<SubscriptionRegistry>,
}

impl SubscribeHook {
    /// Create a hook writing into `registry`
    pub fn new(binding: Arc<dyn SubscriptionBinding>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { binding, registry }
    }
}

impl TaskHook for SubscribeHook {
    fn on_result(&self, task: &Task, result: &Value) {
        let target = self.binding.target_id(task);
        let subscription = self.binding.subscription_id(task, result);
        match (target, subscription) {
            (Some(target), Some(subscription)) => self.registry.register(target, subscription),
            _ => debug!(path = %task.path(), "Subscribe result carries no subscription id"),
        }
    }
}

/// Appends the known subscription id to an unsubscribe task at dispatch
#[derive(Debug)]
pub struct UnsubscribeHook {
    binding: Arc<dyn SubscriptionBinding>,
    registry: Arc<SubscriptionRegistry>,
}

impl UnsubscribeHook {
    /// Create a hook reading from `registry`
    pub fn new(binding: Arc<dyn SubscriptionBinding>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { binding, registry }
    }
}

impl TaskHook for UnsubscribeHook {
    fn before_dispatch(&self, task: &Task) {
        let subscription = self
            .binding
            .target_id(task)
            .and_then(|target| self.registry.resolve(&target));
        match subscription {
            Some(subscription) => task.push_parameter(Value::String(subscription)),
            None => warn!(path = %task.path(), "No subscription id known for unsubscribe target"),
        }
    }
}
