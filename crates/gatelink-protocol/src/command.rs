/*!
 * Resource commands and their transport codes.
 */
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// A generic resource operation issued against a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Read a resource attribute
    Get,
    /// Write a resource attribute
    Set,
    /// Invoke an action resource
    Act,
    /// Subscribe to resource changes
    Subscribe,
    /// Cancel a subscription
    Unsubscribe,
    /// List the services a provider exposes
    ServicesEnumeration,
}

impl Command {
    /// All commands, in declaration order
    pub const ALL: [Command; 6] = [
        Command::Get,
        Command::Set,
        Command::Act,
        Command::Subscribe,
        Command::Unsubscribe,
        Command::ServicesEnumeration,
    ];

    /// Wire-neutral command name
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Get => "GET",
            Command::Set => "SET",
            Command::Act => "ACT",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::ServicesEnumeration => "SERVICES_ENUMERATION",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        Command::ALL
            .into_iter()
            .find(|c| c.as_str() == upper)
            .ok_or_else(|| ProtocolError::Configuration(format!("Unknown command: {}", s)))
    }
}

/// Transport-specific code for each command, handed to translators on the task
#[derive(Debug, Clone, Default)]
pub struct CommandCodes {
    codes: HashMap<Command, Bytes>,
}

impl CommandCodes {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the code for a command
    pub fn with_code<B: Into<Bytes>>(mut self, command: Command, code: B) -> Self {
        self.codes.insert(command, code.into());
        self
    }

    /// Build from a name -> code map, as found in the `[bridge.command_codes]` section
    pub fn from_names(names: &HashMap<String, String>) -> Result<Self, ProtocolError> {
        let mut codes = HashMap::with_capacity(names.len());
        for (name, code) in names {
            codes.insert(name.parse::<Command>()?, Bytes::from(code.clone().into_bytes()));
        }
        Ok(Self { codes })
    }

    /// Get the code for a command
    pub fn code(&self, command: Command) -> Option<&Bytes> {
        self.codes.get(&command)
    }

    /// Number of commands with a code
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}
