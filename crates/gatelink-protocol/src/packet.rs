/*!
 * Inbound packets and the fragments transports decode them into.
 *
 * The wire format belongs to each transport. What the bridge relies on is
 * the [`Fragment`] shape every [`PacketReader`] produces.
 */
use std::fmt::Debug;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use gatelink_core::types::Value;

use crate::error::Result;

/// A raw packet received from a transport
#[derive(Debug, Clone)]
pub struct Packet {
    payload: Bytes,
    received_at: DateTime<Utc>,
}

impl Packet {
    /// Wrap a received payload
    pub fn new<B: Into<Bytes>>(payload: B) -> Self {
        Self {
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// The raw bytes
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// When the packet was handed to the bridge
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A value answering a previously dispatched task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResponse {
    /// Identifier of the task this answers
    pub identifier: String,
    /// The result value
    pub value: Value,
    /// Device timestamp in epoch milliseconds, when the transport has one
    pub timestamp: Option<i64>,
}

impl TaskResponse {
    /// Create a response
    pub fn new<I: Into<String>, V: Into<Value>>(identifier: I, value: V) -> Self {
        Self {
            identifier: identifier.into(),
            value: value.into(),
            timestamp: None,
        }
    }

    /// Attach a device timestamp
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A resource value pushed by a provider outside of any task
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUpdate {
    /// Service name
    pub service: String,
    /// Resource name
    pub resource: String,
    /// Attribute name; `None` means the resource's value attribute
    pub attribute: Option<String>,
    /// The new value
    pub value: Value,
    /// Device timestamp in epoch milliseconds
    pub timestamp: Option<i64>,
}

impl ResourceUpdate {
    /// Create an update of `service/resource`
    pub fn new<S: Into<String>, R: Into<String>, V: Into<Value>>(service: S, resource: R, value: V) -> Self {
        Self {
            service: service.into(),
            resource: resource.into(),
            attribute: None,
            value: value.into(),
            timestamp: None,
        }
    }

    /// Target a specific attribute
    pub fn attribute<A: Into<String>>(mut self, attribute: A) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    /// The `service/resource[/attribute]` path of the update
    pub fn path(&self) -> String {
        match &self.attribute {
            Some(attribute) => format!("{}/{}/{}", self.service, self.resource, attribute),
            None => format!("{}/{}", self.service, self.resource),
        }
    }
}

/// One self-contained unit of data extracted from a packet
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    /// Provider the fragment is about
    pub provider: Option<String>,
    /// Profile of the provider
    pub profile_id: Option<String>,
    /// The provider became reachable
    pub hello: bool,
    /// The provider became unreachable
    pub goodbye: bool,
    /// Answers to dispatched tasks
    pub responses: Vec<TaskResponse>,
    /// Unsolicited resource values
    pub updates: Vec<ResourceUpdate>,
    treated: bool,
}

impl Fragment {
    /// A fragment about `provider`
    pub fn for_provider<P: Into<String>>(provider: P) -> Self {
        Self {
            provider: Some(provider.into()),
            ..Self::default()
        }
    }

    /// A fragment that names no provider
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Set the profile
    pub fn with_profile<P: Into<String>>(mut self, profile: P) -> Self {
        self.profile_id = Some(profile.into());
        self
    }

    /// Mark as a hello
    pub fn hello(mut self) -> Self {
        self.hello = true;
        self
    }

    /// Mark as a goodbye
    pub fn goodbye(mut self) -> Self {
        self.goodbye = true;
        self
    }

    /// Add a task response
    pub fn with_response(mut self, response: TaskResponse) -> Self {
        self.responses.push(response);
        self
    }

    /// Add a resource update
    pub fn with_update(mut self, update: ResourceUpdate) -> Self {
        self.updates.push(update);
        self
    }

    /// Whether the fragment has anything besides task responses
    pub fn has_payload(&self) -> bool {
        self.hello || self.goodbye || !self.updates.is_empty()
    }

    /// Record that the fragment resolved at least one task
    pub fn mark_treated(&mut self) {
        self.treated = true;
    }

    /// Whether the fragment resolved at least one task
    pub fn is_treated(&self) -> bool {
        self.treated
    }
}

/// Decodes transport packets into fragments
///
/// An `Err` rejects the whole packet. An `Err` entry inside the returned list
/// rejects only that fragment; the others are still processed.
pub trait PacketReader: Send + Sync + Debug {
    /// Decompose a packet into ordered fragments
    fn read(&self, packet: &Packet) -> Result<Vec<Result<Fragment>>>;
}
