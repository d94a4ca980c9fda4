/*!
 * Prelude module for gatelink core.
 *
 * Re-exports the types and helpers most bridge code needs.
 */

pub use crate::error::{Error, Result};

pub use crate::types::{Id, Metadata, Value};

pub use crate::config::{
    BridgeConfig, Config, ConfigBuilder, DesynchronizerConfig, ReleasePolicy, SharedConfig,
};

pub use crate::utils::{duration_to_millis, millis_to_duration, now_millis, spawn_and_log, with_timeout};

pub use tracing::{debug, error, info, trace, warn};

pub use crate::init;
