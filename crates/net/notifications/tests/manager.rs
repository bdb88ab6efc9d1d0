mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::*;
use vertex_net_notifications::{
    Direction, ManagerEvent, NotificationError, NotificationService, PeerId, ProtocolConfig,
    ProtocolName, RejectReason, SubstreamState, ValidationResult,
};
use vertex_net_peer_score::AllowAll;
use vertex_net_transport::memory::MemoryNetwork;

#[tokio::test(flavor = "multi_thread")]
async fn second_open_replaces_first() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (a, b) = pair(&network, ProtocolConfig::new(PROTOCOL)).await;
    let mut events = a.manager().subscribe();

    let (first, _first_inbound) = connect(&a, &b).await;
    let (second, mut second_inbound) = connect(&a, &b).await;

    let event = wait_for_event(&mut events, |e| matches!(e, ManagerEvent::Replaced { .. })).await;
    assert_matches!(
        event,
        ManagerEvent::Replaced { old, new, direction: Direction::Outbound, .. }
            if old == first.id() && new == second.id()
    );
    // The old substream is fully released before the new one goes live.
    assert_eq!(first.state(), SubstreamState::Closed);
    assert_eq!(second.state(), SubstreamState::Open);

    let live = a.manager().substreams(&peer_of(&b)).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, second.id());

    second.send(b"still works".to_vec()).await.unwrap();
    assert_eq!(second_inbound.receive().await.unwrap().as_ref(), b"still works");
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_substream_leaves_table() {
    init_tracing();
    let network = MemoryNetwork::new();
    let config = ProtocolConfig::new(PROTOCOL).with_max_notification_size(16);
    let (a, b) = pair(&network, config).await;
    let mut events = a.manager().subscribe();
    let (outbound, _inbound) = connect(&a, &b).await;
    assert!(a.manager().is_open(&peer_of(&b), &protocol(), Direction::Outbound).await);

    outbound.send(vec![0u8; 17]).await.unwrap_err();

    let event = wait_for_event(&mut events, |e| matches!(e, ManagerEvent::Failed { .. })).await;
    assert_matches!(
        event,
        ManagerEvent::Failed { id, error: NotificationError::OversizedNotification { .. }, .. }
            if id == outbound.id()
    );
    assert!(a.manager().substreams(&peer_of(&b)).await.is_empty());
    assert!(!a.manager().is_open(&peer_of(&b), &protocol(), Direction::Outbound).await);
    assert!(a.manager().connected_peers().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn ban_peer_fails_live_substreams() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (a, b) = pair(&network, ProtocolConfig::new(PROTOCOL)).await;
    let (outbound, mut inbound) = connect(&a, &b).await;
    let b_id = peer_of(&b);

    tokio::time::timeout(WAIT, a.ban_peer(&b_id)).await.unwrap();

    assert_eq!(outbound.state(), SubstreamState::Failed);
    assert_matches!(
        outbound.send(vec![1]).await,
        Err(NotificationError::Banned(peer)) if peer == b_id
    );
    assert!(a.manager().connected_peers().is_empty());

    // The remote sees the substream end.
    assert!(tokio::time::timeout(WAIT, inbound.receive()).await.unwrap().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_peer_closes_everything() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (a, b) = pair(&network, ProtocolConfig::new(PROTOCOL)).await;
    let (outbound, _inbound) = connect(&a, &b).await;
    // A substream the other way round, so `a` holds one per direction.
    let (reverse_outbound, reverse_inbound) = connect(&b, &a).await;

    let b_id = peer_of(&b);
    assert_eq!(a.manager().substreams(&b_id).await.len(), 2);

    tokio::time::timeout(WAIT, a.disconnect_peer(&b_id)).await.unwrap();
    assert_eq!(outbound.state(), SubstreamState::Closed);
    assert_eq!(reverse_inbound.state(), SubstreamState::Closed);
    assert!(a.manager().substreams(&b_id).await.is_empty());

    eventually(|| reverse_outbound.state().is_terminal()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_closes_all_peers() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (a, b) = pair(&network, ProtocolConfig::new(PROTOCOL)).await;
    let c = service(&network, AllowAll, ProtocolConfig::new(PROTOCOL)).await;
    let (to_b, _b_inbound) = connect(&a, &b).await;
    let (to_c, _c_inbound) = connect(&a, &c).await;
    assert_eq!(a.manager().connected_peers().len(), 2);

    tokio::time::timeout(WAIT, a.shutdown()).await.unwrap();
    assert!(to_b.state().is_terminal());
    assert!(to_c.state().is_terminal());
    assert!(a.manager().connected_peers().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn open_after_shutdown_refused() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (a, b) = pair(&network, ProtocolConfig::new(PROTOCOL)).await;
    tokio::time::timeout(WAIT, a.shutdown()).await.unwrap();
    assert!(a.manager().is_shut_down());

    let err = a.open(peer_of(&b), &protocol(), Vec::new()).await.unwrap_err();
    assert_matches!(err, NotificationError::TransportClosed);
    assert!(a.manager().connected_peers().is_empty());
    assert!(!a.manager().is_open(&peer_of(&b), &protocol(), Direction::Outbound).await);

    let accepted = tokio::time::timeout(Duration::from_millis(100), b.accept()).await;
    assert!(accepted.is_err(), "no substream should reach the remote");
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_replacement_always_reported() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (a, b) = pair(&network, ProtocolConfig::new(PROTOCOL)).await;
    let mut events = a.manager().subscribe();

    let (mut previous, mut _inbound) = connect(&a, &b).await;
    for _ in 0..20 {
        let (next, next_inbound) = connect(&a, &b).await;
        let event =
            wait_for_event(&mut events, |e| matches!(e, ManagerEvent::Replaced { .. })).await;
        assert_matches!(
            event,
            ManagerEvent::Replaced { old, new, .. } if old == previous.id() && new == next.id()
        );
        assert!(previous.state().is_terminal());
        assert_eq!(a.manager().substreams(&peer_of(&b)).await.len(), 1);
        previous = next;
        _inbound = next_inbound;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn falls_back_to_older_protocol_name() {
    init_tracing();
    let network = MemoryNetwork::new();
    let v2 = ProtocolName::from("/test/notify/2");
    let a = service(
        &network,
        AllowAll,
        ProtocolConfig::new(v2.clone()).with_fallback_names([protocol()]),
    )
    .await;
    let b = service(&network, AllowAll, ProtocolConfig::new(PROTOCOL)).await;

    let outbound = tokio::time::timeout(WAIT, a.open(peer_of(&b), &v2, Vec::new()))
        .await
        .unwrap()
        .unwrap();
    let mut inbound = b.accept().await.unwrap();

    assert_eq!(outbound.protocol(), &v2);
    assert_eq!(outbound.negotiated_protocol(), &protocol());
    assert_eq!(inbound.protocol(), &protocol());

    outbound.send(b"hi".to_vec()).await.unwrap();
    assert_eq!(inbound.receive().await.unwrap().as_ref(), b"hi");
}

#[tokio::test(flavor = "multi_thread")]
async fn unsupported_protocol_reported() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = service(&network, AllowAll, ProtocolConfig::new("/test/other/1")).await;
    let b = service(&network, AllowAll, ProtocolConfig::new(PROTOCOL)).await;

    let err = a.open(peer_of(&b), &"/test/other/1".into(), Vec::new()).await.unwrap_err();
    assert_matches!(err, NotificationError::UnsupportedProtocol(_));

    let err = a.open(peer_of(&b), &protocol(), Vec::new()).await.unwrap_err();
    assert_matches!(err, NotificationError::UnknownProtocol(_));
}

#[tokio::test(flavor = "multi_thread")]
async fn validator_rejects_handshake() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = service(&network, AllowAll, ProtocolConfig::new(PROTOCOL)).await;
    let b = NotificationService::new(network.endpoint(), AllowAll);
    let validator = |_: &PeerId, handshake: &[u8]| {
        if handshake == b"ok" {
            ValidationResult::Accept
        } else {
            ValidationResult::Reject
        }
    };
    b.register_protocol_with_validator(ProtocolConfig::new(PROTOCOL), validator)
        .await
        .unwrap();
    let mut events = b.manager().subscribe();

    let err = a.open(peer_of(&b), &protocol(), b"bad".to_vec()).await.unwrap_err();
    assert_matches!(err, NotificationError::HandshakeFailed(_));
    let event = wait_for_event(&mut events, |e| matches!(e, ManagerEvent::Rejected { .. })).await;
    assert_matches!(event, ManagerEvent::Rejected { reason: RejectReason::Handshake, .. });

    let (outbound, _inbound) = connect_with(&a, &b, b"ok".to_vec()).await;
    assert_eq!(outbound.state(), SubstreamState::Open);
}

#[tokio::test(flavor = "multi_thread")]
async fn registration_errors() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = service(&network, AllowAll, ProtocolConfig::new(PROTOCOL)).await;

    let err = a.register_protocol(ProtocolConfig::new(PROTOCOL)).await.unwrap_err();
    assert_matches!(err, NotificationError::AlreadyRegistered(_));

    let err = a
        .register_protocol(ProtocolConfig::new("/test/new/1").with_fallback_names([protocol()]))
        .await
        .unwrap_err();
    assert_matches!(err, NotificationError::AlreadyRegistered(name) if name == protocol());

    let err = a
        .register_protocol(ProtocolConfig::new("/test/zero/1").with_credit_window(0))
        .await
        .unwrap_err();
    assert_matches!(err, NotificationError::InvalidConfig(_));

    // Nothing half-registered by the failures above.
    let err = a.open(peer_of(&a), &"/test/new/1".into(), Vec::new()).await.unwrap_err();
    assert_matches!(err, NotificationError::UnknownProtocol(_));
}
