/*!
 * Packet routing between a transport and the resource model.
 *
 * The [`Connector`] decodes packets into fragments, resolves task responses
 * against its [`TaskManager`], keeps one [`ModelInstance`] per live provider
 * and hands the rest of each fragment to that instance.
 */
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn, Instrument};

use gatelink_core::logging::component_span;

use crate::configuration::ResourceModelConfiguration;
use crate::error::{ProtocolError, Result};
use crate::model::{ModelInstance, ModelInstanceBuilder};
use crate::packet::{Fragment, Packet, PacketReader};
use crate::task_manager::TaskManager;

/// Profile used for providers whose fragments carry none
pub const DEFAULT_PROFILE: &str = "default";

/// Provider lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// A model instance was created for a provider
    ProviderAdded {
        /// The provider name
        name: String,
        /// The profile it was built with
        profile: String,
    },
    /// A provider's instance was started
    ProviderStarted(String),
    /// A provider's instance was unregistered and dropped
    ProviderRemoved(String),
}

/// Extension points around packet processing
pub trait ConnectorHooks: Send + Sync + Debug {
    /// Return `false` to drop the packet before it is read
    fn pre_process(&self, _packet: &Packet) -> bool {
        true
    }

    /// Called after a fragment resolved at least one task
    fn acknowledge(&self, _fragment: &Fragment) {}

    /// Called after a fragment's payload reached its model instance
    fn post_process(&self, _fragment: &Fragment) {}
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl ConnectorHooks for NoHooks {}

/// Outcome of [`Connector::process`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    /// Fragments read from the packet
    pub fragments: usize,
    /// Tasks resolved by the packet
    pub resolved: usize,
    /// Fragments skipped because of an error
    pub rejected: usize,
    /// The pre-processing hook dropped the packet
    pub vetoed: bool,
}

/// Running totals of a connector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectorStats {
    /// Packets accepted for reading
    pub packets: u64,
    /// Fragments read
    pub fragments: u64,
    /// Tasks resolved
    pub resolved: u64,
    /// Response identifiers that matched no pending task
    pub correlation_failures: u64,
    /// Fragments skipped because of an error
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    packets: AtomicU64,
    fragments: AtomicU64,
    resolved: AtomicU64,
    correlation_failures: AtomicU64,
    rejected: AtomicU64,
}

/// Routes inbound packets to tasks and model instances
#[derive(Debug)]
pub struct Connector {
    configuration: Arc<dyn ResourceModelConfiguration>,
    task_manager: Arc<TaskManager>,
    reader: Arc<dyn PacketReader>,
    builder: Arc<dyn ModelInstanceBuilder>,
    hooks: Arc<dyn ConnectorHooks>,
    instances: RwLock<HashMap<String, Arc<dyn ModelInstance>>>,
    events: broadcast::Sender<ConnectorEvent>,
    counters: Counters,
}

impl Connector {
    /// Create a connector
    pub fn new(
        configuration: Arc<dyn ResourceModelConfiguration>,
        task_manager: Arc<TaskManager>,
        reader: Arc<dyn PacketReader>,
        builder: Arc<dyn ModelInstanceBuilder>,
    ) -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            configuration,
            task_manager,
            reader,
            builder,
            hooks: Arc::new(NoHooks),
            instances: RwLock::new(HashMap::new()),
            events,
            counters: Counters::default(),
        }
    }

    /// Install processing hooks
    pub fn with_hooks(mut self, hooks: Arc<dyn ConnectorHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The task manager resolving responses
    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    /// The resource-model configuration
    pub fn configuration(&self) -> &Arc<dyn ResourceModelConfiguration> {
        &self.configuration
    }

    /// Receive provider lifecycle notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.events.subscribe()
    }

    /// The live instance of `name`
    pub fn instance(&self, name: &str) -> Option<Arc<dyn ModelInstance>> {
        self.instances.read().get(name).cloned()
    }

    /// Names of the live providers
    pub fn providers(&self) -> Vec<String> {
        self.instances.read().keys().cloned().collect()
    }

    /// Snapshot of the processing counters
    pub fn stats(&self) -> ConnectorStats {
        let c = &self.counters;
        ConnectorStats {
            packets: c.packets.load(Ordering::Relaxed),
            fragments: c.fragments.load(Ordering::Relaxed),
            resolved: c.resolved.load(Ordering::Relaxed),
            correlation_failures: c.correlation_failures.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    /// Create and start the instance of `name`
    pub async fn add_provider(&self, profile: &str, name: &str) -> Result<Arc<dyn ModelInstance>> {
        let (instance, created) = self.create_provider(profile, name)?;
        if !created {
            return Err(ProtocolError::DuplicateProvider(name.to_string()));
        }
        self.start_provider(&instance).await?;
        Ok(instance)
    }

    /// Read a packet and route every fragment it contains.
    ///
    /// Fails only when the packet cannot be read at all; a bad fragment is
    /// skipped and counted in the summary.
    pub async fn process(&self, packet: &Packet) -> Result<ProcessSummary> {
        let span = component_span("connector", None);
        async move {
            let mut summary = ProcessSummary::default();
            if !self.hooks.pre_process(packet) {
                debug!(len = packet.len(), "Packet vetoed by pre-processing hook");
                summary.vetoed = true;
                return Ok(summary);
            }
            self.counters.packets.fetch_add(1, Ordering::Relaxed);

            let fragments = self.reader.read(packet).map_err(|e| {
                warn!(len = packet.len(), "Failed to read packet: {}", e);
                e
            })?;

            for fragment in fragments {
                summary.fragments += 1;
                self.counters.fragments.fetch_add(1, Ordering::Relaxed);
                let outcome = match fragment {
                    Ok(fragment) => self.process_fragment(fragment, &mut summary).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    warn!("Rejected fragment: {}", e);
                    summary.rejected += 1;
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn process_fragment(&self, mut fragment: Fragment, summary: &mut ProcessSummary) -> Result<()> {
        let resolved = self.resolve_responses(&fragment);
        summary.resolved += resolved;
        if resolved > 0 {
            fragment.mark_treated();
            self.hooks.acknowledge(&fragment);
        }

        let provider = match fragment.provider.clone() {
            Some(provider) => provider,
            None if fragment.has_payload() => {
                return Err(ProtocolError::UnresolvedProvider(
                    "fragment carries data but names no provider".into(),
                ));
            }
            None => return Ok(()),
        };

        if fragment.goodbye {
            self.remove_provider(&provider).await;
            return Ok(());
        }

        let instance = match self.instance(&provider) {
            Some(instance) => instance,
            None => {
                let profile = fragment.profile_id.as_deref().unwrap_or(DEFAULT_PROFILE);
                self.create_provider(profile, &provider)?.0
            }
        };

        if fragment.hello && !instance.is_active().await {
            self.start_provider(&instance).await?;
        }

        instance.apply(&fragment).await?;
        self.hooks.post_process(&fragment);
        Ok(())
    }

    fn resolve_responses(&self, fragment: &Fragment) -> usize {
        let mut resolved = 0;
        for response in &fragment.responses {
            let tasks = self.task_manager.remove(&response.identifier);
            if tasks.is_empty() {
                debug!(identifier = %response.identifier, "No pending task matches response");
                self.counters.correlation_failures.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            for task in tasks {
                if task.set_result(response.value.clone(), response.timestamp) {
                    resolved += 1;
                }
            }
        }
        self.counters.resolved.fetch_add(resolved as u64, Ordering::Relaxed);
        resolved
    }

    /// The instance registered under `name`, building one if none is.
    ///
    /// The flag is false when another caller registered `name` first; its
    /// instance is returned and the freshly built one is dropped.
    fn create_provider(&self, profile: &str, name: &str) -> Result<(Arc<dyn ModelInstance>, bool)> {
        let built = self
            .builder
            .build(profile, name, self.configuration.default_catalog())?;
        let instance = match self.instances.write().entry(name.to_string()) {
            Entry::Occupied(existing) => {
                debug!(provider = %name, "Provider registered concurrently, reusing it");
                return Ok((existing.get().clone(), false));
            }
            Entry::Vacant(slot) => slot.insert(built).clone(),
        };
        info!(provider = %name, profile = %profile, "Provider added");
        let _ = self.events.send(ConnectorEvent::ProviderAdded {
            name: name.to_string(),
            profile: profile.to_string(),
        });
        Ok((instance, true))
    }

    async fn start_provider(&self, instance: &Arc<dyn ModelInstance>) -> Result<()> {
        instance.start().await?;
        debug!(provider = %instance.name(), "Provider started");
        let _ = self
            .events
            .send(ConnectorEvent::ProviderStarted(instance.name().to_string()));
        Ok(())
    }

    async fn remove_provider(&self, name: &str) {
        let Some(instance) = self.instance(name) else {
            debug!(provider = %name, "Goodbye from unknown provider");
            return;
        };
        if let Err(e) = instance.unregister().await {
            warn!(provider = %name, "Failed to unregister provider: {}", e);
        }

        let removed = {
            let mut instances = self.instances.write();
            match instances.get(name) {
                Some(current) if same_instance(current, &instance) => instances.remove(name).is_some(),
                _ => false,
            }
        };
        if removed {
            info!(provider = %name, "Provider removed");
            let _ = self.events.send(ConnectorEvent::ProviderRemoved(name.to_string()));
        }
    }

    /// Stop dispatch and unregister every live instance. Idempotent.
    pub async fn stop(&self) {
        self.task_manager.stop();
        let instances: Vec<_> = self.instances.write().drain().collect();
        if instances.is_empty() {
            return;
        }

        let results = join_all(instances.iter().map(|(_, instance)| instance.unregister())).await;
        for ((name, _), result) in instances.iter().zip(results) {
            if let Err(e) = result {
                warn!(provider = %name, "Failed to unregister provider: {}", e);
            }
            let _ = self.events.send(ConnectorEvent::ProviderRemoved(name.clone()));
        }
        info!(count = instances.len(), "Connector stopped");
    }
}

fn same_instance(a: &Arc<dyn ModelInstance>, b: &Arc<dyn ModelInstance>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::configuration::{ModelConfiguration, ResourceConfigCatalog};
    use crate::model::InMemoryModelBuilder;
    use crate::packet::{ResourceUpdate, TaskResponse};
    use crate::task::{Task, TaskRequest, TaskStatus};
    use crate::translator::Translator;
    use async_trait::async_trait;
    use gatelink_core::types::Value;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct NullTranslator;

    #[async_trait]
    impl Translator for NullTranslator {
        async fn transmit(&self, _task: &Arc<Task>) -> Result<()> {
            Ok(())
        }
    }

    /// Hands out whatever fragments were queued for the next packet
    #[derive(Debug, Default)]
    struct QueuedReader {
        next: Mutex<Vec<Result<Fragment>>>,
    }

    impl QueuedReader {
        fn push(&self, fragment: Fragment) {
            self.next.lock().push(Ok(fragment));
        }

        fn push_error(&self) {
            self.next
                .lock()
                .push(Err(ProtocolError::InvalidPacket("bad fragment".into())));
        }
    }

    impl PacketReader for QueuedReader {
        fn read(&self, packet: &Packet) -> Result<Vec<Result<Fragment>>> {
            if packet.is_empty() {
                return Err(ProtocolError::InvalidPacket("empty packet".into()));
            }
            Ok(std::mem::take(&mut *self.next.lock()))
        }
    }

    #[derive(Debug, Default)]
    struct CountingHooks {
        veto: bool,
        acknowledged: AtomicU64,
        post_processed: AtomicU64,
    }

    impl ConnectorHooks for CountingHooks {
        fn pre_process(&self, _packet: &Packet) -> bool {
            !self.veto
        }

        fn acknowledge(&self, fragment: &Fragment) {
            assert!(fragment.is_treated());
            self.acknowledged.fetch_add(1, Ordering::Relaxed);
        }

        fn post_process(&self, _fragment: &Fragment) {
            self.post_processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn connector(hooks: Arc<CountingHooks>) -> (Connector, Arc<QueuedReader>) {
        let reader = Arc::new(QueuedReader::default());
        let manager = Arc::new(TaskManager::new(Arc::new(NullTranslator)));
        let connector = Connector::new(
            Arc::new(ModelConfiguration::new(ResourceConfigCatalog::new())),
            manager,
            reader.clone(),
            Arc::new(InMemoryModelBuilder),
        )
        .with_hooks(hooks);
        (connector, reader)
    }

    fn packet() -> Packet {
        Packet::new(&b"\x00"[..])
    }

    #[tokio::test]
    async fn test_hello_creates_and_starts_provider() {
        let (connector, reader) = connector(Arc::default());
        let mut events = connector.subscribe();
        reader.push(
            Fragment::for_provider("lamp-1")
                .with_profile("light")
                .hello()
                .with_update(ResourceUpdate::new("switch", "state", true)),
        );

        let summary = connector.process(&packet()).await.unwrap();
        assert_eq!(summary.fragments, 1);
        assert_eq!(summary.rejected, 0);

        let instance = connector.instance("lamp-1").unwrap();
        assert!(instance.is_active().await);
        assert_eq!(instance.profile_id(), "light");
        assert_eq!(
            events.try_recv().unwrap(),
            ConnectorEvent::ProviderAdded {
                name: "lamp-1".into(),
                profile: "light".into()
            }
        );
        assert_eq!(events.try_recv().unwrap(), ConnectorEvent::ProviderStarted("lamp-1".into()));
    }

    #[tokio::test]
    async fn test_update_without_hello_creates_inactive_provider() {
        let (connector, reader) = connector(Arc::default());
        reader.push(Fragment::for_provider("lamp-2").with_update(ResourceUpdate::new("switch", "state", false)));
        connector.process(&packet()).await.unwrap();

        let instance = connector.instance("lamp-2").unwrap();
        assert!(!instance.is_active().await);
        assert_eq!(instance.profile_id(), DEFAULT_PROFILE);
    }

    #[tokio::test]
    async fn test_goodbye_unregisters_then_removes() {
        let (connector, reader) = connector(Arc::default());
        reader.push(Fragment::for_provider("lamp-1").hello());
        connector.process(&packet()).await.unwrap();
        let first = connector.instance("lamp-1").unwrap();

        reader.push(Fragment::for_provider("lamp-1").goodbye());
        connector.process(&packet()).await.unwrap();
        assert!(connector.instance("lamp-1").is_none());
        assert!(first.unregister().await.is_ok());

        reader.push(Fragment::for_provider("lamp-1").hello());
        connector.process(&packet()).await.unwrap();
        let second = connector.instance("lamp-1").unwrap();
        assert!(!same_instance(&first, &second));
    }

    #[tokio::test]
    async fn test_responses_resolve_tasks_and_acknowledge() {
        let hooks = Arc::new(CountingHooks::default());
        let (connector, reader) = connector(hooks.clone());
        let manager = connector.task_manager().clone();
        let task = manager
            .execute_request(TaskRequest::new(Command::Get, "/thermo/climate/temperature"))
            .await;

        reader.push(
            Fragment::anonymous()
                .with_response(TaskResponse::new("thermo#GET#climate#temperature", 21.5).at(42))
                .with_response(TaskResponse::new("thermo#GET#climate#pressure", 1013)),
        );
        let summary = connector.process(&packet()).await.unwrap();

        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.rejected, 0);
        assert_eq!(task.status(), TaskStatus::Executed);
        assert_eq!(task.result(), Some(Value::from(21.5)));
        assert_eq!(task.timestamp(), Some(42));
        assert_eq!(hooks.acknowledged.load(Ordering::Relaxed), 1);
        assert_eq!(hooks.post_processed.load(Ordering::Relaxed), 0);

        let stats = connector.stats();
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.correlation_failures, 1);
        assert!(connector.providers().is_empty());
    }

    #[tokio::test]
    async fn test_bad_fragments_are_rejected_individually() {
        let (connector, reader) = connector(Arc::default());
        reader.push_error();
        reader.push(Fragment::anonymous().hello());
        reader.push(Fragment::for_provider("bad#name").hello());
        reader.push(Fragment::for_provider("lamp-3").hello());

        let summary = connector.process(&packet()).await.unwrap();
        assert_eq!(summary.fragments, 4);
        assert_eq!(summary.rejected, 3);
        assert_eq!(connector.providers(), vec!["lamp-3".to_string()]);
        assert_eq!(connector.stats().rejected, 3);
    }

    #[tokio::test]
    async fn test_unreadable_packet_is_an_error() {
        let (connector, _) = connector(Arc::default());
        let result = connector.process(&Packet::new(Vec::new())).await;
        assert!(matches!(result, Err(ProtocolError::InvalidPacket(_))));
    }

    #[tokio::test]
    async fn test_veto_skips_reading() {
        let hooks = Arc::new(CountingHooks {
            veto: true,
            ..CountingHooks::default()
        });
        let (connector, reader) = connector(hooks);
        reader.push(Fragment::for_provider("lamp-1").hello());

        let summary = connector.process(&packet()).await.unwrap();
        assert!(summary.vetoed);
        assert_eq!(summary.fragments, 0);
        assert!(connector.providers().is_empty());
        assert_eq!(connector.stats().packets, 0);
    }

    /// Builds slowly so concurrent packets race on the same provider
    #[derive(Debug)]
    struct SlowBuilder;

    impl ModelInstanceBuilder for SlowBuilder {
        fn build(
            &self,
            profile: &str,
            provider: &str,
            catalog: &ResourceConfigCatalog,
        ) -> Result<Arc<dyn ModelInstance>> {
            std::thread::sleep(std::time::Duration::from_millis(200));
            InMemoryModelBuilder.build(profile, provider, catalog)
        }
    }

    /// Every packet carries one update for the provider named by its payload
    #[derive(Debug)]
    struct UpdateReader;

    impl PacketReader for UpdateReader {
        fn read(&self, packet: &Packet) -> Result<Vec<Result<Fragment>>> {
            let provider = String::from_utf8_lossy(packet.payload()).to_string();
            Ok(vec![Ok(
                Fragment::for_provider(provider).with_update(ResourceUpdate::new("switch", "state", true))
            )])
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_contact_shares_one_instance() {
        let connector = Arc::new(Connector::new(
            Arc::new(ModelConfiguration::new(ResourceConfigCatalog::new())),
            Arc::new(TaskManager::new(Arc::new(NullTranslator))),
            Arc::new(UpdateReader),
            Arc::new(SlowBuilder),
        ));
        let mut events = connector.subscribe();

        let calls: Vec<_> = (0..2)
            .map(|_| {
                let connector = connector.clone();
                tokio::spawn(async move { connector.process(&Packet::new(&b"lamp"[..])).await })
            })
            .collect();
        for call in calls {
            let summary = call.await.unwrap().unwrap();
            assert_eq!(summary.rejected, 0);
        }

        assert_eq!(connector.providers(), vec!["lamp".to_string()]);
        assert_eq!(connector.stats().rejected, 0);
        let mut added = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ConnectorEvent::ProviderAdded { .. }) {
                added += 1;
            }
        }
        assert_eq!(added, 1);
    }

    #[tokio::test]
    async fn test_add_provider_and_stop() {
        let (connector, _) = connector(Arc::default());
        let instance = connector.add_provider("boiler", "heater").await.unwrap();
        assert!(instance.is_active().await);
        assert!(matches!(
            connector.add_provider("boiler", "heater").await,
            Err(ProtocolError::DuplicateProvider(_))
        ));

        connector.stop().await;
        connector.stop().await;
        assert!(connector.providers().is_empty());
        assert!(!instance.is_active().await);
    }
}
