/*!
 * Model instances: the resource model's view of one provider.
 *
 * The connector creates, starts and tears down instances as providers come
 * and go, and hands them the non-correlated part of each fragment.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

use gatelink_core::types::Value;
use gatelink_core::utils::now_millis;

use crate::configuration::ResourceConfigCatalog;
use crate::error::{ProtocolError, Result};
use crate::packet::Fragment;
use crate::task::IDENTIFIER_SEPARATOR;

/// A live provider in the resource model
#[async_trait]
pub trait ModelInstance: Send + Sync + Debug {
    /// Provider name
    fn name(&self) -> &str;

    /// Profile the instance was built for
    fn profile_id(&self) -> &str;

    /// Whether the instance has been started
    async fn is_active(&self) -> bool;

    /// Bring the instance online
    async fn start(&self) -> Result<()>;

    /// Take the instance offline; it may be started again
    async fn stop(&self) -> Result<()>;

    /// Apply the payload of a fragment addressed to this provider
    async fn apply(&self, fragment: &Fragment) -> Result<()>;

    /// Remove the instance from the resource model. Must succeed when
    /// called on an already unregistered instance.
    async fn unregister(&self) -> Result<()>;
}

/// Builds model instances for providers the connector has not seen yet
pub trait ModelInstanceBuilder: Send + Sync + Debug {
    /// Build an instance of `provider` with the given profile
    fn build(
        &self,
        profile: &str,
        provider: &str,
        catalog: &ResourceConfigCatalog,
    ) -> Result<Arc<dyn ModelInstance>>;
}

/// Lifecycle of an in-memory instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    /// Built or stopped
    Inactive,
    /// Started
    Active,
    /// Removed from the model
    Unregistered,
}

/// Latest known value of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceValue {
    /// The value
    pub value: Value,
    /// When it was observed, epoch milliseconds
    pub timestamp: i64,
}

/// Change notification of an in-memory instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModelEvent {
    /// The instance changed state
    StateChanged {
        /// The provider name
        provider: String,
        /// The old state
        old_state: InstanceState,
        /// The new state
        new_state: InstanceState,
    },
    /// A resource received a new value
    ResourceChanged {
        /// The provider name
        provider: String,
        /// `service/resource[/attribute]`
        path: String,
        /// The previous value
        old_value: Option<Value>,
        /// The new value
        new_value: Value,
    },
}

/// A [`ModelInstance`] keeping the latest value of each resource in memory
#[derive(Debug)]
pub struct InMemoryModelInstance {
    name: String,
    profile_id: String,
    state: RwLock<InstanceState>,
    resources: RwLock<HashMap<String, ResourceValue>>,
    catalog: ResourceConfigCatalog,
    events: broadcast::Sender<ModelEvent>,
}

impl InMemoryModelInstance {
    /// Create an inactive instance
    pub fn new<N: Into<String>, P: Into<String>>(name: N, profile_id: P, catalog: ResourceConfigCatalog) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            name: name.into(),
            profile_id: profile_id.into(),
            state: RwLock::new(InstanceState::Inactive),
            resources: RwLock::new(HashMap::new()),
            catalog,
            events,
        }
    }

    /// Current state
    pub async fn state(&self) -> InstanceState {
        *self.state.read().await
    }

    /// Latest value of `path`
    pub async fn value(&self, path: &str) -> Option<ResourceValue> {
        self.resources.read().await.get(path).cloned()
    }

    /// Paths that have received a value
    pub async fn paths(&self) -> Vec<String> {
        self.resources.read().await.keys().cloned().collect()
    }

    /// Receive change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }

    async fn set_state(&self, new_state: InstanceState) -> InstanceState {
        let old_state = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, new_state)
        };
        if old_state != new_state {
            debug!(provider = %self.name, ?old_state, ?new_state, "Model instance state changed");
            let _ = self.events.send(ModelEvent::StateChanged {
                provider: self.name.clone(),
                old_state,
                new_state,
            });
        }
        old_state
    }

    fn accepts(&self, service: &str, resource: &str) -> bool {
        self.catalog.is_empty() || self.catalog.get(service, resource).is_some()
    }
}

#[async_trait]
impl ModelInstance for InMemoryModelInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn profile_id(&self) -> &str {
        &self.profile_id
    }

    async fn is_active(&self) -> bool {
        self.state().await == InstanceState::Active
    }

    async fn start(&self) -> Result<()> {
        match self.state().await {
            InstanceState::Active => Ok(()),
            InstanceState::Unregistered => Err(ProtocolError::Model(format!(
                "cannot start unregistered instance {}",
                self.name
            ))),
            InstanceState::Inactive => {
                self.set_state(InstanceState::Active).await;
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        if self.state().await == InstanceState::Active {
            self.set_state(InstanceState::Inactive).await;
        }
        Ok(())
    }

    async fn apply(&self, fragment: &Fragment) -> Result<()> {
        if self.state().await == InstanceState::Unregistered {
            return Err(ProtocolError::Model(format!(
                "instance {} is unregistered",
                self.name
            )));
        }

        for update in &fragment.updates {
            if !self.accepts(&update.service, &update.resource) {
                trace!(provider = %self.name, path = %update.path(), "Ignoring update for unknown resource");
                continue;
            }
            let path = update.path();
            let new = ResourceValue {
                value: update.value.clone(),
                timestamp: update.timestamp.unwrap_or_else(now_millis),
            };
            let old_value = self
                .resources
                .write()
                .await
                .insert(path.clone(), new)
                .map(|old| old.value);

            let _ = self.events.send(ModelEvent::ResourceChanged {
                provider: self.name.clone(),
                path,
                old_value,
                new_value: update.value.clone(),
            });
        }
        Ok(())
    }

    async fn unregister(&self) -> Result<()> {
        if self.set_state(InstanceState::Unregistered).await != InstanceState::Unregistered {
            debug!(provider = %self.name, "Model instance unregistered");
        }
        Ok(())
    }
}

/// Builds [`InMemoryModelInstance`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryModelBuilder;

impl ModelInstanceBuilder for InMemoryModelBuilder {
    fn build(
        &self,
        profile: &str,
        provider: &str,
        catalog: &ResourceConfigCatalog,
    ) -> Result<Arc<dyn ModelInstance>> {
        if provider.is_empty() {
            return Err(ProtocolError::provider_creation(provider, "empty provider name"));
        }
        if provider.contains(IDENTIFIER_SEPARATOR) || provider.contains('/') {
            return Err(ProtocolError::provider_creation(
                provider,
                "provider name contains a reserved character",
            ));
        }
        Ok(Arc::new(InMemoryModelInstance::new(provider, profile, catalog.clone())))
    }
}
