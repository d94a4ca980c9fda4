/*!
 * gatelink Core
 *
 * Shared foundation of the gatelink protocol bridge: error type, layered
 * configuration, logging setup, resource values and async helpers.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use chrono;
    pub use serde_json;
    pub use tokio;
    pub use tracing;
}

/// gatelink core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization: installs logging from the given configuration
pub fn init(config: &config::Config) -> Result<(), error::Error> {
    logging::init_with_config(&config.logging)?;
    tracing::info!(
        gateway = %config.general.gateway_name,
        "gatelink core {} initialized",
        VERSION
    );
    Ok(())
}
