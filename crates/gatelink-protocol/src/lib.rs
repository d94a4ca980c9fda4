/*!
 * gatelink Protocol
 *
 * Bridges a resource model and device transports: tasks correlated with
 * transport answers, optional dispatch throttling, packet routing to model
 * instances and a bounded-wait invocation surface.
 */

#![warn(missing_docs)]

// Re-export core types
pub use gatelink_core::prelude;

pub mod command;
pub mod configuration;
pub mod connector;
pub mod desynchronizer;
pub mod endpoint;
pub mod error;
pub mod model;
pub mod packet;
pub mod subscription;
pub mod task;
pub mod task_manager;
pub mod translator;

pub use command::{Command, CommandCodes};
pub use configuration::{
    ModelConfiguration, ResourceConfig, ResourceConfigCatalog, ResourceKind, ResourceModelConfiguration,
};
pub use connector::{Connector, ConnectorEvent, ConnectorHooks, ConnectorStats, NoHooks, ProcessSummary};
pub use desynchronizer::TaskDesynchronizer;
pub use endpoint::{ProtocolStackEndpoint, StackConfiguration};
pub use error::{ProtocolError, Result};
pub use model::{InMemoryModelBuilder, InMemoryModelInstance, ModelInstance, ModelInstanceBuilder};
pub use packet::{Fragment, Packet, PacketReader, ResourceUpdate, TaskResponse};
pub use subscription::{DefaultSubscriptionBinding, SubscriptionBinding, SubscriptionRegistry};
pub use task::{Task, TaskHook, TaskRequest, TaskStatus, EMPTY_RESULT, IDENTIFIER_SEPARATOR};
pub use task_manager::TaskManager;
pub use translator::Translator;

/// gatelink protocol crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the bridge: core logging from `config`, then announce the version
pub fn init(config: &gatelink_core::config::Config) -> Result<()> {
    gatelink_core::init(config)?;
    tracing::info!("gatelink protocol {} initialized", VERSION);
    Ok(())
}
