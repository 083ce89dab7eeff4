//! Multi-hop relay behavior over a three-node line

mod common;

use std::time::Duration;

use bitchat::mesh::{MeshEvent, MessageContent};
use bitchat::transport::memory::MemoryFabric;
use bitchat::SendOptions;
use common::{collect_events, connect, spawn_node, wait_for_event};

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_crosses_the_middle_node_exactly_once() {
    let fabric = MemoryFabric::new();
    let alice = spawn_node(&fabric, "alice").await;
    let bob = spawn_node(&fabric, "bob").await;
    let carol = spawn_node(&fabric, "carol").await;

    let mut carol_events = carol.app.events();
    // A - B - C line; B is the only path between A and C
    connect(&alice, &bob);
    connect(&bob, &carol);

    // Carol learns about Alice through Bob's relay of the announcement
    wait_for_event(
        &mut carol_events,
        "carol discovers alice",
        Duration::from_secs(5),
        |event| matches!(event, MeshEvent::PeerFound { peer_id, .. } if *peer_id == alice.peer_id),
    )
    .await;

    let mut bob_events = bob.app.events();
    alice
        .app
        .send(SendOptions {
            payload: Some(b"hello".to_vec()),
            peer_id: None,
        })
        .await
        .unwrap();

    // Carol delivers the broadcast exactly once despite the relay
    let from_alice = collect_events(&mut carol_events, Duration::from_secs(3), |event| {
        matches!(
            event,
            MeshEvent::MessageReceived { from, is_private: false, .. } if *from == alice.peer_id
        )
    })
    .await;
    assert_eq!(from_alice.len(), 1);
    match &from_alice[0] {
        MeshEvent::MessageReceived {
            content: MessageContent::Text(text),
            ..
        } => assert_eq!(text, "hello"),
        other => panic!("unexpected event {:?}", other),
    }

    // Bob, the relay, also delivers it locally exactly once
    let at_bob = collect_events(&mut bob_events, Duration::from_secs(1), |event| {
        matches!(
            event,
            MeshEvent::MessageReceived { from, .. } if *from == alice.peer_id
        )
    })
    .await;
    assert_eq!(at_bob.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_links_deliver_once() {
    let fabric = MemoryFabric::new();
    let alice = spawn_node(&fabric, "alice").await;
    let bob = spawn_node(&fabric, "bob").await;

    let mut bob_events = bob.app.events();
    // Two physical links between the same pair
    connect(&alice, &bob);
    connect(&alice, &bob);

    wait_for_event(
        &mut bob_events,
        "bob discovers alice",
        Duration::from_secs(5),
        |event| matches!(event, MeshEvent::PeerFound { peer_id, .. } if *peer_id == alice.peer_id),
    )
    .await;

    alice
        .app
        .send(SendOptions {
            payload: Some(b"once only".to_vec()),
            peer_id: None,
        })
        .await
        .unwrap();

    let deliveries = collect_events(&mut bob_events, Duration::from_secs(2), |event| {
        matches!(
            event,
            MeshEvent::MessageReceived { from, .. } if *from == alice.peer_id
        )
    })
    .await;
    assert_eq!(deliveries.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn leave_removes_the_peer() {
    let fabric = MemoryFabric::new();
    let alice = spawn_node(&fabric, "alice").await;
    let bob = spawn_node(&fabric, "bob").await;

    let mut bob_events = bob.app.events();
    connect(&alice, &bob);

    wait_for_event(
        &mut bob_events,
        "bob discovers alice",
        Duration::from_secs(5),
        |event| matches!(event, MeshEvent::PeerFound { peer_id, .. } if *peer_id == alice.peer_id),
    )
    .await;

    alice.app.stop().await.unwrap();

    wait_for_event(
        &mut bob_events,
        "bob sees alice leave",
        Duration::from_secs(5),
        |event| matches!(event, MeshEvent::PeerLost { peer_id } if *peer_id == alice.peer_id),
    )
    .await;
    assert!(bob
        .app
        .peers()
        .await
        .unwrap()
        .iter()
        .all(|record| record.peer_id != alice.peer_id));
}
