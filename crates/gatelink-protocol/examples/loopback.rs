//! A simulated device answering over an in-process loop.
//!
//! Every transmitted task is answered by a fake device as a line-oriented
//! text packet, which is fed back through the endpoint.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use gatelink_core::config::ConfigBuilder;
use gatelink_core::types::Value;
use gatelink_protocol::{
    Command, DefaultSubscriptionBinding, Fragment, ModelConfiguration, Packet, PacketReader, ProtocolError,
    ProtocolStackEndpoint, ResourceConfig, ResourceConfigCatalog, ResourceUpdate, Result, StackConfiguration, Task,
    TaskResponse, Translator,
};

/// Answers each task the way a cooperative device would
#[derive(Debug)]
struct LoopbackTranslator {
    wire: mpsc::UnboundedSender<Packet>,
    subscriptions: AtomicU32,
}

#[async_trait]
impl Translator for LoopbackTranslator {
    async fn transmit(&self, task: &Arc<Task>) -> Result<()> {
        let Some(identifier) = task.identifier() else {
            return Ok(());
        };
        let answer = match task.command() {
            Command::Get => "21.5".to_string(),
            Command::Subscribe => format!("sub-{}", self.subscriptions.fetch_add(1, Ordering::Relaxed) + 1),
            Command::Unsubscribe => format!("released:{}", task.parameters().last().map(Value::to_string).unwrap_or_default()),
            _ => "ok".to_string(),
        };
        let line = format!("RESP {} {}", identifier, answer);
        self.wire
            .send(Packet::new(line.into_bytes()))
            .map_err(|e| ProtocolError::Transmission(e.to_string()))
    }
}

/// One fragment per line: `HELLO <provider> <profile>`, `BYE <provider>`,
/// `UPD <provider> <service> <resource> <value>` or `RESP <identifier> <value>`
#[derive(Debug)]
struct LineReader;

impl LineReader {
    fn parse(line: &str) -> Result<Fragment> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["HELLO", provider, profile] => Ok(Fragment::for_provider(*provider).with_profile(*profile).hello()),
            ["BYE", provider] => Ok(Fragment::for_provider(*provider).goodbye()),
            ["UPD", provider, service, resource, value] => Ok(Fragment::for_provider(*provider)
                .with_update(ResourceUpdate::new(*service, *resource, parse_value(value)))),
            ["RESP", identifier, value] => {
                Ok(Fragment::anonymous().with_response(TaskResponse::new(*identifier, parse_value(value))))
            }
            _ => Err(ProtocolError::InvalidPacket(format!("unrecognised line: {}", line))),
        }
    }
}

fn parse_value(raw: &str) -> Value {
    raw.parse::<f64>().map(Value::from).unwrap_or_else(|_| Value::from(raw))
}

impl PacketReader for LineReader {
    fn read(&self, packet: &Packet) -> Result<Vec<Result<Fragment>>> {
        let text = std::str::from_utf8(packet.payload()).map_err(|e| ProtocolError::InvalidPacket(e.to_string()))?;
        Ok(text.lines().filter(|l| !l.trim().is_empty()).map(Self::parse).collect())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigBuilder::new()
        .with_environment_prefix("GATELINK")
        .build()
        .context("loading configuration")?;
    gatelink_protocol::init(&config)?;

    let (wire, mut inbound) = mpsc::unbounded_channel();
    let translator = Arc::new(LoopbackTranslator {
        wire: wire.clone(),
        subscriptions: AtomicU32::new(0),
    });

    let catalog = ResourceConfigCatalog::new().with(ResourceConfig::new("climate", "temperature"));
    let model = ModelConfiguration::from_bridge_config(&config.bridge, catalog)?.with_fixed_provider("gateway", "hub");
    let stack = StackConfiguration::new(Arc::new(model), translator, Arc::new(LineReader))
        .with_bridge_config(config.bridge.clone())
        .with_subscription_binding(Arc::new(DefaultSubscriptionBinding));

    let endpoint = Arc::new(ProtocolStackEndpoint::new());
    endpoint.connect(stack).await?;

    let pump = {
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            while let Some(packet) = inbound.recv().await {
                if let Err(e) = endpoint.process(&packet).await {
                    tracing::warn!("Dropped packet: {}", e);
                }
            }
        })
    };

    wire.send(Packet::new(&b"HELLO thermo thermostat\nUPD thermo climate temperature 20.0"[..]))?;

    let temperature = endpoint
        .invoke(Command::Get, "/thermo/climate/temperature", None, Vec::new())
        .await;
    info!("temperature = {}", temperature);

    let subscription = endpoint
        .invoke(Command::Subscribe, "/thermo/climate/temperature", None, Vec::new())
        .await;
    info!(
        "subscribed as {} (registered: {:?})",
        subscription,
        endpoint.resolve_subscription_identifier("/thermo/climate/temperature")
    );

    let released = endpoint
        .invoke(Command::Unsubscribe, "/thermo/climate/temperature", None, Vec::new())
        .await;
    info!("unsubscribe answered {}", released);

    if let Some(connector) = endpoint.connector() {
        info!("providers: {:?}, stats: {:?}", connector.providers(), connector.stats());
    }

    endpoint.stop().await;
    drop(wire);
    pump.abort();
    Ok(())
}
