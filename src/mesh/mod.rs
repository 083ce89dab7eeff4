//! Mesh relay engine: dedup, adaptive relay, routing and gossip sync

pub mod deduplication;
pub mod gcs;
pub mod gossip;
pub mod relay;
pub mod router;

use std::path::PathBuf;

use crate::protocol::PeerId;
use crate::transport::LinkId;

pub use deduplication::SeenSet;
pub use gossip::{GossipConfig, GossipSync};
pub use relay::RelayManager;
pub use router::MessageRouter;

/// Decoded body of a received chat message
#[derive(Debug, Clone)]
pub enum MessageContent {
    Text(String),
    File {
        file_name: String,
        mime_type: String,
        size: u64,
    },
}

/// Events surfaced by the mesh to the application layer
#[derive(Debug, Clone)]
pub enum MeshEvent {
    Started {
        peer_id: PeerId,
    },
    Stopped,
    LinkConnected {
        link: LinkId,
    },
    LinkDisconnected {
        link: LinkId,
    },
    PeerFound {
        peer_id: PeerId,
        nickname: String,
    },
    PeerLost {
        peer_id: PeerId,
    },
    PeerListUpdated,
    SessionEstablished {
        peer_id: PeerId,
        fingerprint: String,
    },
    MessageReceived {
        from: PeerId,
        message_id: Option<String>,
        content: MessageContent,
        is_private: bool,
    },
    /// The recipient acknowledged a private message
    Delivered {
        message_id: String,
        by: PeerId,
    },
    ReadReceipt {
        message_id: String,
        by: PeerId,
    },
    FileReceived {
        from: PeerId,
        file_name: String,
        path: PathBuf,
    },
    RssiUpdated {
        peer_id: PeerId,
        rssi: i16,
    },
}
