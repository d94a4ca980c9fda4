//! Stub transport side of the bridge for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;

use gatelink_core::config::BridgeConfig;
use gatelink_core::types::Value;
use gatelink_protocol::{
    Command, CommandCodes, DefaultSubscriptionBinding, Fragment, ModelConfiguration, Packet, PacketReader,
    ProtocolError, ResourceConfigCatalog, ResourceUpdate, Result, StackConfiguration, Task, TaskRequest,
    TaskResponse, Translator,
};

/// Records every transmitted task and forwards it to the test
#[derive(Debug)]
pub struct StubTranslator {
    pub sent: Mutex<Vec<Arc<Task>>>,
    outbox: mpsc::UnboundedSender<Arc<Task>>,
}

impl StubTranslator {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<Task>>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let translator = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            outbox,
        });
        (translator, rx)
    }

    pub fn sent_paths(&self) -> Vec<String> {
        self.sent.lock().iter().map(|t| t.path().to_string()).collect()
    }
}

#[async_trait]
impl Translator for StubTranslator {
    fn identify(&self, request: &TaskRequest) -> Result<Option<String>> {
        match request.command {
            Command::Act => Ok(None),
            _ => Ok(request.default_identifier()),
        }
    }

    async fn transmit(&self, task: &Arc<Task>) -> Result<()> {
        self.sent.lock().push(task.clone());
        let _ = self.outbox.send(task.clone());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: String,
    value: serde_json::Value,
    #[serde(default)]
    ts: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireUpdate {
    service: String,
    resource: String,
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireFragment {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    profile: Option<String>,
    #[serde(default)]
    hello: bool,
    #[serde(default)]
    goodbye: bool,
    #[serde(default)]
    responses: Vec<WireResponse>,
    #[serde(default)]
    updates: Vec<WireUpdate>,
}

/// Reads packets holding a JSON array of fragments
#[derive(Debug, Default)]
pub struct JsonReader;

impl PacketReader for JsonReader {
    fn read(&self, packet: &Packet) -> Result<Vec<Result<Fragment>>> {
        let items: Vec<serde_json::Value> =
            serde_json::from_slice(packet.payload()).map_err(|e| ProtocolError::InvalidPacket(e.to_string()))?;
        Ok(items
            .into_iter()
            .map(|item| {
                let wire: WireFragment =
                    serde_json::from_value(item).map_err(|e| ProtocolError::InvalidPacket(e.to_string()))?;
                let mut fragment = Fragment::anonymous();
                fragment.provider = wire.provider;
                fragment.profile_id = wire.profile;
                fragment.hello = wire.hello;
                fragment.goodbye = wire.goodbye;
                for r in wire.responses {
                    let mut response = TaskResponse::new(r.id, Value::from(r.value));
                    response.timestamp = r.ts;
                    fragment = fragment.with_response(response);
                }
                for u in wire.updates {
                    fragment = fragment.with_update(ResourceUpdate::new(u.service, u.resource, Value::from(u.value)));
                }
                Ok(fragment)
            })
            .collect())
    }
}

pub fn packet(fragments: serde_json::Value) -> Packet {
    Packet::new(fragments.to_string().into_bytes())
}

pub fn bridge(timeout: Duration) -> BridgeConfig {
    BridgeConfig {
        default_timeout_ms: timeout.as_millis() as u64,
        ..BridgeConfig::default()
    }
}

pub fn stack(translator: Arc<StubTranslator>, bridge: BridgeConfig) -> StackConfiguration {
    let model = ModelConfiguration::new(ResourceConfigCatalog::new())
        .with_command_codes(CommandCodes::new().with_code(Command::Get, &b"\x01"[..]));
    StackConfiguration::new(Arc::new(model), translator, Arc::new(JsonReader))
        .with_bridge_config(bridge)
        .with_subscription_binding(Arc::new(DefaultSubscriptionBinding))
}
