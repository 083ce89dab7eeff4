//! Shared harness: mesh nodes wired over the in-process fabric

use std::sync::Arc;
use std::time::Duration;

use bitchat::mesh::MeshEvent;
use bitchat::transport::memory::{MemoryFabric, MemoryTransport};
use bitchat::{BitchatApp, Config, PeerId};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::sync::mpsc::unbounded_channel;

pub struct TestNode {
    pub app: Arc<BitchatApp>,
    pub transport: Arc<MemoryTransport>,
    pub peer_id: PeerId,
    _data_dir: TempDir,
}

/// Start one node on the fabric with fast test-friendly schedules
pub async fn spawn_node(fabric: &MemoryFabric, nickname: &str) -> TestNode {
    let data_dir = TempDir::new().expect("temp dir");
    let mut config = Config::default();
    config.data_dir = data_dir.path().to_path_buf();
    config.nickname = Some(nickname.to_string());
    config.gossip.on_connect_delay = Duration::from_millis(200);

    let (events_tx, events_rx) = unbounded_channel();
    let transport = fabric.transport(events_tx);
    let app = Arc::new(BitchatApp::new(config, transport.clone(), events_rx));
    app.initialize().await.expect("initialize");
    let peer_id = app.start(None).await.expect("start");

    TestNode {
        app,
        transport,
        peer_id,
        _data_dir: data_dir,
    }
}

pub fn connect(a: &TestNode, b: &TestNode) {
    MemoryFabric::connect(&a.transport, &b.transport);
}

/// Wait until `matches` accepts an event, or panic on timeout
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<MeshEvent>,
    what: &str,
    timeout: Duration,
    mut matches: F,
) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| panic!("timed out waiting for {}", what));
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => {
                if matches(&event) {
                    return event;
                }
            }
            Ok(Err(_)) => panic!("event stream closed waiting for {}", what),
            Err(_) => panic!("timed out waiting for {}", what),
        }
    }
}

/// Collect events matching a predicate for a fixed observation window
pub async fn collect_events<F>(
    events: &mut broadcast::Receiver<MeshEvent>,
    window: Duration,
    mut matches: F,
) -> Vec<MeshEvent>
where
    F: FnMut(&MeshEvent) -> bool,
{
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now()).filter(|d| !d.is_zero()) {
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => {
                if matches(&event) {
                    collected.push(event);
                }
            }
            _ => break,
        }
    }
    collected
}
