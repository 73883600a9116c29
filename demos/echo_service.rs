/// Echo service demo
///
/// Three vessels share one in-process node. One hosts an echo service, one
/// locates and invokes it, and all of them exchange position broadcasts.
///
/// Run with `RUST_LOG=debug cargo run --example echo_service` to see the
/// routing logs.

use std::time::Duration;

use maritime_cloud::{
    BroadcastMessage, BroadcastMessageHeader, BroadcastOptions, ClientConfiguration, ConnectionEvent,
    InvocationContext, LocalNode, MaritimeCloudClient, PositionTime, Service, ServiceInitiationPoint, ServiceMessage,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HelloWorld {
    message: String,
}

impl BroadcastMessage for HelloWorld {
    const CHANNEL: &'static str = "imo.HelloWorld";
}

struct HelloService;

impl Service for HelloService {
    const NAME: &'static str = "imo.HelloService";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GetName;

impl ServiceMessage for GetName {
    type Service = HelloService;
    type Reply = String;
}

async fn vessel(node: &LocalNode, mmsi: &str, latitude: f64, longitude: f64) -> anyhow::Result<MaritimeCloudClient> {
    let id = format!("mmsi://{}", mmsi);
    let client = ClientConfiguration::create(id.as_str())
        .position_supplier(move || PositionTime::now(latitude, longitude))
        .keep_alive(Duration::from_millis(500))
        .add_listener(move |event: &ConnectionEvent| {
            if let ConnectionEvent::StateChanged { from, to } = event {
                tracing::info!("{} connection {} -> {}", id, from, to);
            }
        })
        .auto_connect(false)
        .build(node.transport())?;
    client.connection().connect().await?;
    Ok(client)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let node = LocalNode::new();
    let provider = vessel(&node, "219015063", 55.68, 12.57).await?;
    let caller = vessel(&node, "219015064", 55.70, 12.60).await?;
    let bystander = vessel(&node, "219015065", 57.05, 9.92).await?;

    let name = provider.client_id().to_string();
    let registration = provider.register(
        ServiceInitiationPoint::<GetName>::new(),
        move |_: GetName, context: InvocationContext<String>| {
            tracing::info!("asked for my name by {}", context.caller());
            context.complete(format!("Hello from {}", name));
        },
    )?;
    if !registration.await_registered(Duration::from_secs(2)).await {
        anyhow::bail!("node did not acknowledge {}", registration.service_name());
    }

    for listener in [&caller, &bystander] {
        let me = listener.client_id().clone();
        listener.listen::<HelloWorld, _>(move |header: &BroadcastMessageHeader, message: &HelloWorld| {
            tracing::info!("{} heard '{}' from {} at {}", me, message.message, header.sender, header.sender_position);
        })?;
    }

    let locator = caller.locate(ServiceInitiationPoint::<GetName>::new())?;
    match locator.nearest().await? {
        Some(endpoint) => {
            let reply = endpoint.invoke(&GetName)?.await?;
            tracing::info!("{} answered: {}", endpoint.id(), reply);
        }
        None => tracing::warn!("no provider of {} found", HelloService::NAME),
    }

    // the bystander is too far north for this one
    tokio::time::sleep(Duration::from_secs(1)).await;
    let options = BroadcastOptions::default()
        .with_receiver_ack(true)
        .with_receiver_filter(|_, position: &PositionTime| position.latitude < 56.0);
    let sent = provider.broadcast_with(
        &HelloWorld {
            message: "Hello nearby vessels".to_string(),
        },
        options,
    )?;
    sent.on_ack(|ack| tracing::info!("{} acknowledged broadcast {}", ack.receiver, ack.broadcast_id));
    sent.await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    for client in [&provider, &caller, &bystander] {
        client.close();
    }
    for client in [&provider, &caller, &bystander] {
        if !client.await_termination(Duration::from_secs(5)).await {
            tracing::warn!("{} did not terminate in time", client.client_id());
        }
    }
    Ok(())
}
