mod common;

use common::*;
use vertex_net_notifications::{NotificationService, ProtocolConfig};
use vertex_net_peer_score::AllowAll;
use vertex_net_transport::swarm::{Libp2pBackend, Libp2pConfig};

#[tokio::test(flavor = "multi_thread")]
async fn notifications_over_tcp() {
    init_tracing();
    let spawn = || Libp2pBackend::spawn(Libp2pConfig::default()).unwrap();
    let a = NotificationService::new(spawn(), AllowAll);
    let b = NotificationService::new(spawn(), AllowAll);
    let config = ProtocolConfig::new(PROTOCOL).with_handshake(b"b-hello".to_vec());
    a.register_protocol(config.clone()).await.unwrap();
    b.register_protocol(config).await.unwrap();

    let addr = b
        .backend()
        .listen_on("/ip4/127.0.0.1/tcp/0".parse().unwrap())
        .await
        .unwrap();
    let b_id = a.backend().dial(addr).await.unwrap();
    assert_eq!(b_id, peer_of(&b));

    let name = protocol();
    let open = a.open(b_id, &name, b"a-hello".to_vec());
    let mut outbound = tokio::time::timeout(WAIT, open).await.unwrap().unwrap();
    let mut inbound = tokio::time::timeout(WAIT, b.accept()).await.unwrap().unwrap();
    assert_eq!(outbound.remote_handshake().as_ref(), b"b-hello");
    assert_eq!(inbound.remote_handshake().as_ref(), b"a-hello");
    assert_eq!(inbound.peer(), peer_of(&a));

    for i in 0..10u8 {
        outbound.send(vec![i; 1000]).await.unwrap();
        let received = tokio::time::timeout(WAIT, inbound.receive()).await.unwrap().unwrap();
        assert_eq!(received.as_ref(), vec![i; 1000].as_slice());
    }

    inbound.send(b"reply".to_vec()).await.unwrap();
    assert_eq!(outbound.receive().await.unwrap().as_ref(), b"reply");

    tokio::time::timeout(WAIT, outbound.close()).await.unwrap();
    assert!(tokio::time::timeout(WAIT, inbound.receive()).await.unwrap().is_err());
}
