//! BitChat - a decentralized, peer-to-peer messaging mesh over BLE
//!
//! Every node is simultaneously a BLE peripheral (advertise + notify) and
//! a BLE central (scan + write); the union of links forms a multi-hop
//! mesh carrying signed announcements, public broadcasts, Noise-encrypted
//! private messages, file transfers and gossip sync traffic.

pub mod app;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod mesh;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;

// Re-export commonly used types
pub use app::{BitchatApp, SendOptions};
pub use config::Config;
pub use error::{Error, Result};
pub use mesh::{MeshEvent, MessageContent};
pub use protocol::{BitchatPacket, MessageType, PeerId, BROADCAST_PEER_ID};
