/*!
 * Error type for the protocol bridge.
 */
use thiserror::Error;

use gatelink_core::error::Error as CoreError;

/// Error type for bridge operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The endpoint has not been connected to a configuration yet
    #[error("Endpoint not connected")]
    NotConnected,

    /// The packet could not be decoded into fragments
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// A fragment carries data but names no provider
    #[error("Unresolved provider: {0}")]
    UnresolvedProvider(String),

    /// A model instance could not be built for a provider
    #[error("Failed to create provider {provider}: {reason}")]
    ProviderCreation {
        /// The provider name
        provider: String,
        /// Why the builder refused
        reason: String,
    },

    /// A provider with this name is already live
    #[error("Provider already exists: {0}")]
    DuplicateProvider(String),

    /// A task could not be built from a request
    #[error("Translation error: {0}")]
    Translation(String),

    /// The transport failed to send a task
    #[error("Transmission error: {0}")]
    Transmission(String),

    /// A model instance refused an operation
    #[error("Model error: {0}")]
    Model(String),

    /// Invalid bridge configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Build a provider creation error
    pub fn provider_creation<P: Into<String>, R: std::fmt::Display>(provider: P, reason: R) -> Self {
        ProtocolError::ProviderCreation {
            provider: provider.into(),
            reason: reason.to_string(),
        }
    }
}
