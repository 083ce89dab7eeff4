//! Two-node secure messaging: handshake, private message, delivery ack

mod common;

use std::time::Duration;

use bitchat::mesh::{MeshEvent, MessageContent};
use bitchat::transport::memory::MemoryFabric;
use bitchat::SendOptions;
use common::{connect, spawn_node, wait_for_event};

#[tokio::test(flavor = "multi_thread")]
async fn handshake_then_private_message_and_ack() {
    let fabric = MemoryFabric::new();
    let alice = spawn_node(&fabric, "alice").await;
    let bob = spawn_node(&fabric, "bob").await;

    let mut alice_events = alice.app.events();
    let mut bob_events = bob.app.events();
    connect(&alice, &bob);

    // Announcements discover both peers; the lower peer ID opens the
    // Noise session
    wait_for_event(
        &mut alice_events,
        "alice session",
        Duration::from_secs(5),
        |event| matches!(event, MeshEvent::SessionEstablished { peer_id, .. } if *peer_id == bob.peer_id),
    )
    .await;
    wait_for_event(
        &mut bob_events,
        "bob session",
        Duration::from_secs(5),
        |event| matches!(event, MeshEvent::SessionEstablished { peer_id, .. } if *peer_id == alice.peer_id),
    )
    .await;

    // Encrypted private message to Bob
    let message_id = alice
        .app
        .send(SendOptions {
            payload: Some(b"hi".to_vec()),
            peer_id: Some(bob.peer_id),
        })
        .await
        .unwrap();

    let received = wait_for_event(
        &mut bob_events,
        "bob private message",
        Duration::from_secs(5),
        |event| matches!(event, MeshEvent::MessageReceived { is_private: true, .. }),
    )
    .await;
    match received {
        MeshEvent::MessageReceived {
            from,
            message_id: Some(id),
            content: MessageContent::Text(text),
            is_private: true,
        } => {
            assert_eq!(from, alice.peer_id);
            assert_eq!(id, message_id);
            assert_eq!(text, "hi");
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Bob's DELIVERED ack maps back to the original message ID
    let delivered = wait_for_event(
        &mut alice_events,
        "delivery ack",
        Duration::from_secs(5),
        |event| matches!(event, MeshEvent::Delivered { .. }),
    )
    .await;
    match delivered {
        MeshEvent::Delivered { message_id: id, by } => {
            assert_eq!(id, message_id);
            assert_eq!(by, bob.peer_id);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn send_before_session_queues_and_flushes() {
    let fabric = MemoryFabric::new();
    let alice = spawn_node(&fabric, "alice").await;
    let bob = spawn_node(&fabric, "bob").await;

    let mut bob_events = bob.app.events();
    connect(&alice, &bob);

    // Fire immediately: the session may not exist yet, so the message
    // parks in the outbox and a handshake goes out
    let message_id = alice
        .app
        .send(SendOptions {
            payload: Some(b"early bird".to_vec()),
            peer_id: Some(bob.peer_id),
        })
        .await
        .unwrap();

    let received = wait_for_event(
        &mut bob_events,
        "queued private message",
        Duration::from_secs(10),
        |event| matches!(event, MeshEvent::MessageReceived { is_private: true, .. }),
    )
    .await;
    match received {
        MeshEvent::MessageReceived {
            message_id: Some(id),
            content: MessageContent::Text(text),
            ..
        } => {
            assert_eq!(id, message_id);
            assert_eq!(text, "early bird");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_payload_and_peer_are_reported() {
    let fabric = MemoryFabric::new();
    let node = spawn_node(&fabric, "solo").await;

    let err = node.app.send(SendOptions::default()).await.unwrap_err();
    assert!(matches!(err, bitchat::Error::MissingPayload));

    let err = node.app.establish_session(None).await.unwrap_err();
    assert!(matches!(err, bitchat::Error::MissingPeerId));
}
