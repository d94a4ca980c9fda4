/*!
 * Resource-model configuration seen by the bridge.
 *
 * The resource model itself lives outside this crate. The bridge only needs
 * to look up resource descriptors, know which providers are always present,
 * and know the transport code for each command.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use gatelink_core::config::BridgeConfig;
use gatelink_core::types::Metadata;

use crate::command::CommandCodes;
use crate::error::Result;

/// The role a resource plays in its service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Measured value
    #[default]
    Sensor,
    /// Internal state variable
    State,
    /// Invocable action
    Action,
    /// Writable setting
    Property,
}

/// Descriptor of one resource of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Service name
    pub service: String,
    /// Resource name
    pub resource: String,
    /// Transport-specific identifier of the resource, if it has one
    pub identifier: Option<String>,
    /// Resource role
    #[serde(default)]
    pub kind: ResourceKind,
    /// Free-form descriptor metadata
    #[serde(default)]
    pub metadata: Metadata,
}

impl ResourceConfig {
    /// Create a descriptor for `service/resource`
    pub fn new<S: Into<String>, R: Into<String>>(service: S, resource: R) -> Self {
        Self {
            service: service.into(),
            resource: resource.into(),
            identifier: None,
            kind: ResourceKind::default(),
            metadata: Metadata::new(),
        }
    }

    /// Set the transport identifier
    pub fn with_identifier<S: Into<String>>(mut self, identifier: S) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Set the resource kind
    pub fn with_kind(mut self, kind: ResourceKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Resource descriptors used to populate new model instances
#[derive(Debug, Clone, Default)]
pub struct ResourceConfigCatalog {
    configs: Vec<Arc<ResourceConfig>>,
}

impl ResourceConfigCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor
    pub fn with(mut self, config: ResourceConfig) -> Self {
        self.configs.push(Arc::new(config));
        self
    }

    /// Find the descriptor of `service/resource`
    pub fn get(&self, service: &str, resource: &str) -> Option<Arc<ResourceConfig>> {
        self.configs
            .iter()
            .find(|c| c.service == service && c.resource == resource)
            .cloned()
    }

    /// Find a descriptor by its transport identifier
    pub fn by_identifier(&self, identifier: &str) -> Option<Arc<ResourceConfig>> {
        self.configs
            .iter()
            .find(|c| c.identifier.as_deref() == Some(identifier))
            .cloned()
    }

    /// Iterate over all descriptors
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResourceConfig>> {
        self.configs.iter()
    }

    /// Number of descriptors
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

/// What the bridge needs from the resource model's configuration
pub trait ResourceModelConfiguration: Send + Sync + Debug {
    /// Descriptor of `service/resource`
    fn resource_config(&self, service: &str, resource: &str) -> Option<Arc<ResourceConfig>> {
        self.default_catalog().get(service, resource)
    }

    /// Descriptor matching a transport-specific identifier
    fn resource_config_by_identifier(&self, identifier: &str) -> Option<Arc<ResourceConfig>> {
        self.default_catalog().by_identifier(identifier)
    }

    /// Providers that always exist, name -> profile
    fn fixed_providers(&self) -> HashMap<String, String>;

    /// Transport code of each command
    fn command_codes(&self) -> &CommandCodes;

    /// Catalog used to populate providers created on demand
    fn default_catalog(&self) -> &ResourceConfigCatalog;
}

/// A plain [`ResourceModelConfiguration`] built from settings and a catalog
#[derive(Debug, Clone, Default)]
pub struct ModelConfiguration {
    catalog: ResourceConfigCatalog,
    fixed_providers: HashMap<String, String>,
    command_codes: CommandCodes,
}

impl ModelConfiguration {
    /// Create a configuration around a catalog
    pub fn new(catalog: ResourceConfigCatalog) -> Self {
        Self {
            catalog,
            ..Self::default()
        }
    }

    /// Take fixed providers and command codes from the `[bridge]` section
    pub fn from_bridge_config(bridge: &BridgeConfig, catalog: ResourceConfigCatalog) -> Result<Self> {
        Ok(Self {
            catalog,
            fixed_providers: bridge.fixed_providers.clone(),
            command_codes: CommandCodes::from_names(&bridge.command_codes)?,
        })
    }

    /// Declare a fixed provider
    pub fn with_fixed_provider<N: Into<String>, P: Into<String>>(mut self, name: N, profile: P) -> Self {
        self.fixed_providers.insert(name.into(), profile.into());
        self
    }

    /// Replace the command-code table
    pub fn with_command_codes(mut self, codes: CommandCodes) -> Self {
        self.command_codes = codes;
        self
    }
}

impl ResourceModelConfiguration for ModelConfiguration {
    fn fixed_providers(&self) -> HashMap<String, String> {
        self.fixed_providers.clone()
    }

    fn command_codes(&self) -> &CommandCodes {
        &self.command_codes
    }

    fn default_catalog(&self) -> &ResourceConfigCatalog {
        &self.catalog
    }
}
