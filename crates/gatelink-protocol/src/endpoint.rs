/*!
 * The bridge's public surface.
 *
 * A [`ProtocolStackEndpoint`] binds a resource-model configuration to a
 * [`Connector`], offers a bounded-wait [`invoke`](ProtocolStackEndpoint::invoke)
 * over the asynchronous transport, and carries device subscription ids from
 * SUBSCRIBE results into the matching UNSUBSCRIBE tasks.
 */
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, info, warn, Instrument};

use gatelink_core::config::BridgeConfig;
use gatelink_core::error::Error as CoreError;
use gatelink_core::logging::operation_span;
use gatelink_core::types::Value;
use gatelink_core::utils::{millis_to_duration, with_timeout};

use crate::command::{Command, CommandCodes};
use crate::configuration::{ResourceConfig, ResourceModelConfiguration};
use crate::connector::{Connector, ConnectorHooks, NoHooks, ProcessSummary};
use crate::desynchronizer::TaskDesynchronizer;
use crate::error::{ProtocolError, Result};
use crate::model::{InMemoryModelBuilder, ModelInstanceBuilder};
use crate::packet::{Packet, PacketReader};
use crate::subscription::{SubscribeHook, SubscriptionBinding, SubscriptionRegistry, UnsubscribeHook};
use crate::task::{Task, TaskRequest, EMPTY_RESULT};
use crate::task_manager::TaskManager;
use crate::translator::Translator;

/// Everything needed to connect an endpoint
#[derive(Debug, Clone)]
pub struct StackConfiguration {
    /// The resource-model configuration
    pub model: Arc<dyn ResourceModelConfiguration>,
    /// Outbound translation
    pub translator: Arc<dyn Translator>,
    /// Inbound decoding
    pub reader: Arc<dyn PacketReader>,
    /// Model instance factory
    pub builder: Arc<dyn ModelInstanceBuilder>,
    /// Packet processing hooks
    pub hooks: Arc<dyn ConnectorHooks>,
    /// Timeouts and throttling
    pub bridge: BridgeConfig,
    /// Reads subscription ids from SUBSCRIBE results
    pub subscribe_binding: Option<Arc<dyn SubscriptionBinding>>,
    /// Locates the subscription id of UNSUBSCRIBE targets
    pub unsubscribe_binding: Option<Arc<dyn SubscriptionBinding>>,
}

impl StackConfiguration {
    /// Create a configuration with in-memory model instances and default settings
    pub fn new(
        model: Arc<dyn ResourceModelConfiguration>,
        translator: Arc<dyn Translator>,
        reader: Arc<dyn PacketReader>,
    ) -> Self {
        Self {
            model,
            translator,
            reader,
            builder: Arc::new(InMemoryModelBuilder),
            hooks: Arc::new(NoHooks),
            bridge: BridgeConfig::default(),
            subscribe_binding: None,
            unsubscribe_binding: None,
        }
    }

    /// Use another model instance factory
    pub fn with_builder(mut self, builder: Arc<dyn ModelInstanceBuilder>) -> Self {
        self.builder = builder;
        self
    }

    /// Install packet processing hooks
    pub fn with_hooks(mut self, hooks: Arc<dyn ConnectorHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Apply the `[bridge]` settings
    pub fn with_bridge_config(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    /// Use `binding` for both subscribe and unsubscribe wrapping
    pub fn with_subscription_binding(mut self, binding: Arc<dyn SubscriptionBinding>) -> Self {
        self.subscribe_binding = Some(binding.clone());
        self.unsubscribe_binding = Some(binding);
        self
    }

    /// Set the subscribe binding only
    pub fn with_subscribe_binding(mut self, binding: Arc<dyn SubscriptionBinding>) -> Self {
        self.subscribe_binding = Some(binding);
        self
    }

    /// Set the unsubscribe binding only
    pub fn with_unsubscribe_binding(mut self, binding: Arc<dyn SubscriptionBinding>) -> Self {
        self.unsubscribe_binding = Some(binding);
        self
    }
}

#[derive(Debug, Clone)]
struct Session {
    connector: Arc<Connector>,
    subscribe_binding: Option<Arc<dyn SubscriptionBinding>>,
    unsubscribe_binding: Option<Arc<dyn SubscriptionBinding>>,
}

/// Public entry point of the bridge
#[derive(Debug, Default)]
pub struct ProtocolStackEndpoint {
    session: RwLock<Option<Session>>,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl ProtocolStackEndpoint {
    /// Create a disconnected endpoint
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the connector for `configuration` and seed its fixed providers.
    ///
    /// A previous connection is stopped first. Fixed providers that fail to
    /// start are logged and skipped.
    pub async fn connect(&self, configuration: StackConfiguration) -> Result<()> {
        self.stop().await;

        let StackConfiguration {
            model,
            translator,
            reader,
            builder,
            hooks,
            bridge,
            subscribe_binding,
            unsubscribe_binding,
        } = configuration;

        let codes = if model.command_codes().is_empty() {
            CommandCodes::from_names(&bridge.command_codes)?
        } else {
            model.command_codes().clone()
        };

        let mut manager = TaskManager::new(translator)
            .with_command_codes(codes)
            .with_default_timeout(millis_to_duration(bridge.default_timeout_ms));
        if bridge.desynchronizer.enabled {
            let desynchronizer = Arc::new(TaskDesynchronizer::from_config(&bridge.desynchronizer));
            desynchronizer.start();
            manager = manager.with_desynchronizer(desynchronizer, bridge.desynchronizer.release);
        }

        let connector = Arc::new(
            Connector::new(model.clone(), Arc::new(manager), reader, builder).with_hooks(hooks),
        );
        *self.session.write() = Some(Session {
            connector: connector.clone(),
            subscribe_binding,
            unsubscribe_binding,
        });

        let fixed = model.fixed_providers();
        for (name, profile) in &fixed {
            if let Err(e) = connector.add_provider(profile, name).await {
                warn!(provider = %name, "Failed to seed fixed provider: {}", e);
            }
        }
        info!(
            fixed_providers = fixed.len(),
            throttled = bridge.desynchronizer.enabled,
            "Protocol stack endpoint connected"
        );
        Ok(())
    }

    /// Whether [`connect`](Self::connect) has been called and not stopped
    pub fn is_connected(&self) -> bool {
        self.session.read().is_some()
    }

    /// The active connector
    pub fn connector(&self) -> Option<Arc<Connector>> {
        self.session.read().as_ref().map(|s| s.connector.clone())
    }

    fn session(&self) -> Result<Session> {
        self.session.read().clone().ok_or(ProtocolError::NotConnected)
    }

    /// Hand an inbound packet to the connector
    pub async fn process(&self, packet: &Packet) -> Result<ProcessSummary> {
        let session = self.session()?;
        session.connector.process(packet).await
    }

    /// Build a task for `request`, wrapping subscribe and unsubscribe tasks
    pub fn create_task(&self, mut request: TaskRequest) -> Result<Arc<Task>> {
        let session = self.session()?;
        if request.profile_id.is_none() {
            request.profile_id = request
                .provider()
                .and_then(|p| session.connector.instance(p))
                .map(|i| i.profile_id().to_string());
        }

        let task = session.connector.task_manager().create_task(request);
        match task.command() {
            Command::Subscribe => {
                if let Some(binding) = session.subscribe_binding {
                    task.wrap(Arc::new(SubscribeHook::new(binding, self.subscriptions.clone())));
                }
            }
            Command::Unsubscribe => {
                if let Some(binding) = session.unsubscribe_binding {
                    task.wrap(Arc::new(UnsubscribeHook::new(binding, self.subscriptions.clone())));
                }
            }
            _ => {}
        }
        Ok(task)
    }

    /// Queue a task for dispatch
    pub async fn execute(&self, task: Arc<Task>) -> Result<()> {
        let session = self.session()?;
        session.connector.task_manager().execute(task).await;
        Ok(())
    }

    /// Run a command and wait for its result, at most the task's timeout.
    ///
    /// Returns [`EMPTY_RESULT`] on timeout, on any failure, or when not
    /// connected. A timed-out task is aborted.
    pub async fn invoke(
        &self,
        command: Command,
        path: &str,
        resource_config: Option<Arc<ResourceConfig>>,
        parameters: Vec<Value>,
    ) -> Value {
        let span = operation_span(command.as_str(), "endpoint");
        async move {
            let request = TaskRequest::new(command, path)
                .with_resource_config(resource_config)
                .with_parameters(parameters);
            let task = match self.create_task(request) {
                Ok(task) => task,
                Err(e) => {
                    warn!(path = %path, "Cannot invoke: {}", e);
                    return EMPTY_RESULT;
                }
            };

            let (tx, rx) = oneshot::channel();
            task.register_callback(move |done| {
                let _ = tx.send(done.result().unwrap_or(EMPTY_RESULT));
            });
            let Some(connector) = self.connector() else {
                warn!(path = %path, "Cannot invoke: {}", ProtocolError::NotConnected);
                task.abort(EMPTY_RESULT);
                return EMPTY_RESULT;
            };

            // Dispatch runs beside the wait so a slow transport cannot stretch it
            let manager = connector.task_manager().clone();
            let dispatched = task.clone();
            tokio::spawn(async move { manager.execute(dispatched).await }.in_current_span());

            let waited = with_timeout(task.timeout(), async {
                rx.await
                    .map_err(|_| CoreError::runtime("task dropped its completion signal"))
            })
            .await;
            match waited {
                Ok(value) => value,
                Err(e) => {
                    if e.is_timeout() {
                        debug!(path = %path, timeout_ms = task.timeout().as_millis() as u64, "Invocation timed out");
                    } else {
                        warn!(path = %path, "Invocation failed: {}", e);
                    }
                    task.abort(EMPTY_RESULT);
                    EMPTY_RESULT
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Record the device subscription id of `target`
    pub fn register_subscription_identifier<T: Into<String>, S: Into<String>>(&self, target: T, subscription: S) {
        self.subscriptions.register(target, subscription);
    }

    /// The device subscription id of `target`
    pub fn resolve_subscription_identifier(&self, target: &str) -> Option<String> {
        self.subscriptions.resolve(target)
    }

    /// Stop the connector. Idempotent.
    pub async fn stop(&self) {
        let session = self.session.write().take();
        if let Some(session) = session {
            session.connector.stop().await;
            info!("Protocol stack endpoint stopped");
        }
    }
}
