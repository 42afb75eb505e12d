//! In-process discovery example using `MemoryStore`.
//!
//! Registers a few `room-service` instances, then shows both discovery
//! paths from a `signaling` client: the managed connection pool and the
//! resolver-fed balance channel. Finally one instance shuts down and the
//! client views converge.
//!
//! No servers are started; channels are created lazily.
//!
//! # Environment Variables
//!
//! - `INSTANCE_COUNT`: Number of room-service instances (default: 3)
//! - `RUST_LOG`: Log filter (default: info)

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tonic_lb_etcd::{DialOption, Discovery, DiscoveryConfig, MemoryStore};
use tracing::{Level, info};

const NAMESPACE: &str = "/meet";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let instance_count: u16 = env::var("INSTANCE_COUNT")
        .ok()
        .and_then(|c| c.parse().ok())
        .unwrap_or(3);

    let store = Arc::new(MemoryStore::new());

    // Start the room-service instances
    let mut rooms = Vec::new();
    for i in 0..instance_count {
        let config = DiscoveryConfig::new("room-service", format!("10.0.0.{}:9000", i + 1))
            .namespace(NAMESPACE)
            .lease_ttl(Duration::from_secs(5))
            .metadata("zone", if i % 2 == 0 { "a" } else { "b" });

        let room = Discovery::new(config, store.clone())?;
        room.register().await?;
        rooms.push(room);
    }

    // Start the client process
    let config = DiscoveryConfig::new("signaling", "10.0.1.1:7000")
        .namespace(NAMESPACE)
        .resync_interval(Duration::from_secs(2));

    let signaling = Discovery::new(config, store.clone())?;
    signaling.add_option(DialOption::Lazy)?;
    signaling.add_option(DialOption::ConnectTimeout(Duration::from_secs(5)))?;
    signaling.start().await?;

    let conns = signaling.get_conns("room-service").await?;
    info!("Pool has {} room-service connections:", conns.len());
    for conn in &conns {
        info!("  {} (generation {})", conn.address(), conn.generation());
    }

    let (_channel, resolver) = signaling.balanced_channel("room-service").await?;
    let mut updates = resolver.subscribe();
    let before = conns.len();

    let current = updates.wait_for(|addresses| addresses.len() == before).await?.clone();
    info!("Resolver addresses: {current:?}");

    // Shut one instance down and watch both views follow

    if let Some(room) = rooms.pop() {
        info!("Closing {}", room.config().address);
        room.close().await;
    }

    let current = updates.wait_for(|addresses| addresses.len() < before).await?.clone();
    info!("Resolver addresses: {current:?}");

    sleep(Duration::from_millis(100)).await;
    let conns = signaling.get_conns("room-service").await?;
    info!("Pool has {} room-service connections", conns.len());

    resolver.shutdown().await;
    signaling.close().await;
    for room in rooms {
        room.close().await;
    }

    Ok(())
}
