#![allow(dead_code)]

use std::time::Duration;

use tokio::sync::broadcast;
use vertex_net_notifications::{
    ManagerEvent, NotificationService, PeerId, ProtocolConfig, ProtocolName, ReputationGate,
    SubstreamHandle,
};
use vertex_net_peer_score::AllowAll;
use vertex_net_transport::{
    TransportBackend,
    memory::{MemoryBackend, MemoryNetwork},
};

pub const PROTOCOL: &str = "/test/notify/1";

pub const WAIT: Duration = Duration::from_secs(10);

pub type MemoryService = NotificationService<MemoryBackend>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

pub fn protocol() -> ProtocolName {
    ProtocolName::from(PROTOCOL)
}

pub async fn service(
    network: &MemoryNetwork,
    gate: impl ReputationGate,
    config: ProtocolConfig,
) -> MemoryService {
    let service = NotificationService::new(network.endpoint(), gate);
    service.register_protocol(config).await.unwrap();
    service
}

/// Two services on one network, both speaking `config`.
pub async fn pair(network: &MemoryNetwork, config: ProtocolConfig) -> (MemoryService, MemoryService) {
    let a = service(network, AllowAll, config.clone()).await;
    let b = service(network, AllowAll, config).await;
    (a, b)
}

/// Opens a substream from `a` to `b` and accepts it on `b`.
pub async fn connect(a: &MemoryService, b: &MemoryService) -> (SubstreamHandle, SubstreamHandle) {
    connect_with(a, b, Vec::new()).await
}

pub async fn connect_with(
    a: &MemoryService,
    b: &MemoryService,
    handshake: Vec<u8>,
) -> (SubstreamHandle, SubstreamHandle) {
    let outbound = tokio::time::timeout(WAIT, a.open(peer_of(b), &protocol(), handshake))
        .await
        .unwrap()
        .unwrap();
    let inbound = tokio::time::timeout(WAIT, b.accept()).await.unwrap().unwrap();
    (outbound, inbound)
}

pub fn peer_of<B: TransportBackend>(service: &NotificationService<B>) -> PeerId {
    service.local_peer_id()
}

/// Waits for the first event matching `predicate`, skipping others.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<ManagerEvent>,
    mut predicate: impl FnMut(&ManagerEvent) -> bool,
) -> ManagerEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

/// Polls `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}
