//! Anti-entropy catch-up for a node that was offline

mod common;

use std::collections::HashSet;
use std::time::Duration;

use bitchat::mesh::{MeshEvent, MessageContent};
use bitchat::transport::memory::MemoryFabric;
use bitchat::SendOptions;
use common::{collect_events, connect, spawn_node, wait_for_event};

#[tokio::test(flavor = "multi_thread")]
async fn late_joiner_catches_up_in_one_round() {
    let fabric = MemoryFabric::new();
    let martha = spawn_node(&fabric, "martha").await;

    // Broadcasts sent while nobody is listening; they live on in the
    // sync store
    let mut sent = HashSet::new();
    for n in 1..=5 {
        let text = format!("m{}", n);
        sent.insert(text.clone());
        martha
            .app
            .send(SendOptions {
                payload: Some(text.into_bytes()),
                peer_id: None,
            })
            .await
            .unwrap();
    }

    let nina = spawn_node(&fabric, "nina").await;
    let mut nina_events = nina.app.events();
    connect(&martha, &nina);

    wait_for_event(
        &mut nina_events,
        "nina discovers martha",
        Duration::from_secs(5),
        |event| matches!(event, MeshEvent::PeerFound { peer_id, .. } if *peer_id == martha.peer_id),
    )
    .await;

    // One on-connect sync round brings over every missed message
    let caught_up = collect_events(&mut nina_events, Duration::from_secs(5), |event| {
        matches!(
            event,
            MeshEvent::MessageReceived { from, is_private: false, .. } if *from == martha.peer_id
        )
    })
    .await;

    let texts: HashSet<String> = caught_up
        .iter()
        .filter_map(|event| match event {
            MeshEvent::MessageReceived {
                content: MessageContent::Text(text),
                ..
            } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(texts, sent);
    // Exactly once each
    assert_eq!(caught_up.len(), sent.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn synced_peers_exchange_nothing_new() {
    let fabric = MemoryFabric::new();
    let martha = spawn_node(&fabric, "martha").await;
    let nina = spawn_node(&fabric, "nina").await;

    let mut nina_events = nina.app.events();
    connect(&martha, &nina);

    wait_for_event(
        &mut nina_events,
        "nina discovers martha",
        Duration::from_secs(5),
        |event| matches!(event, MeshEvent::PeerFound { peer_id, .. } if *peer_id == martha.peer_id),
    )
    .await;

    martha
        .app
        .send(SendOptions {
            payload: Some(b"live message".to_vec()),
            peer_id: None,
        })
        .await
        .unwrap();

    // Delivered live once; the following sync rounds must not repeat it
    let deliveries = collect_events(&mut nina_events, Duration::from_secs(3), |event| {
        matches!(
            event,
            MeshEvent::MessageReceived { from, .. } if *from == martha.peer_id
        )
    })
    .await;
    assert_eq!(deliveries.len(), 1);
}
