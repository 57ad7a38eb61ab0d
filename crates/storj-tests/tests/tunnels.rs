//! Tunnel discovery and establishment over the live overlay.

use std::time::Duration;

use storj_net::{TunnelClient, TunnelEvent};
use storj_tests::TestNetwork;

#[tokio::test]
async fn test_tunneler_discovery_and_open() {
    let mut net = TestNetwork::new();

    // A publicly reachable relay announcing availability frequently.
    let mut relay_config = TestNetwork::config();
    relay_config.max_tunnel_slots = 2;
    relay_config.tunnel_announce_interval = Duration::from_millis(50);
    let relay = net.add_node_with_config(false, relay_config).await;

    // A client node; its subscription loop records the relay's beat.
    let client = net.add_renter().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(client
        .router()
        .tunnelers(8)
        .iter()
        .any(|t| t.node_id == relay.node_id()));

    // FIND_TUNNEL against ourselves surfaces the relay, OPEN_TUNNEL claims
    // a slot and hands back an alias at the relay's address.
    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(4);
    let tunnel_client = TunnelClient::new(client.transport().clone(), events_tx);

    let result = tunnel_client.establish(&[client.contact()]).await.unwrap();
    assert_eq!(result.alias.node_id, client.node_id());
    assert_eq!(result.alias.address, relay.contact().address);
    assert_eq!(result.alias.port, relay.contact().port);
    assert!(result.tunnel.starts_with("ws://"));

    match events_rx.recv().await {
        Some(TunnelEvent::Established { alias, .. }) => {
            assert_eq!(alias.node_id, client.node_id());
        }
        other => panic!("expected Established event, got {other:?}"),
    }

    net.shutdown().await;
}

#[tokio::test]
async fn test_no_tunnelers_no_tunnel() {
    let mut net = TestNetwork::new();
    let node = net.add_renter().await;

    let (events_tx, _events_rx) = tokio::sync::mpsc::channel(4);
    let tunnel_client = TunnelClient::new(node.transport().clone(), events_tx);

    let err = tunnel_client.establish(&[node.contact()]).await.unwrap_err();
    assert!(err.to_string().contains("No tunnel available"));

    net.shutdown().await;
}
