//! Transport layer for the BitChat mesh
//!
//! - `Transport` trait: link-addressed frame IO over BLE or test fabrics
//! - `ConnectionTracker`: the index of live links and their peer mapping
//! - Serialized broadcaster actor, scan/advertise duty cycling, and the
//!   notification stream assembler

pub mod assembler;
#[cfg(feature = "bluetooth")]
pub mod ble;
pub mod broadcaster;
pub mod memory;
pub mod scan;

use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{PeerId, PROTOCOL_VERSION_1};

pub use broadcaster::{BroadcastRequest, BroadcastTarget, Broadcaster, TransferEvent, TransferId};
pub use scan::{PowerMode, ScanAdvertiseController, CCCD_UUID, CHARACTERISTIC_UUID, SERVICE_UUID};

/// Identifier of one physical link (one GATT connection)
pub type LinkId = u64;

/// This node's role on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// We connected out; the remote is a peripheral we write to
    Central,
    /// The remote connected in; we notify it once it subscribes
    Peripheral,
}

/// Events surfaced by a transport implementation. Radio callbacks only
/// ever post here; they never block on application state.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LinkEstablished { link: LinkId, role: LinkRole },
    LinkClosed { link: LinkId, reason: String },
    /// One reassembled wire frame
    FrameReceived { link: LinkId, frame: Vec<u8> },
    /// CCCD subscription from a connected central
    Subscribed { link: LinkId },
    RssiUpdated { link: LinkId, rssi: i16 },
}

/// A link-addressed frame transport. Implementations push their events
/// into the sender handed to them at construction.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    /// Write one frame to one link; the broadcaster is the only caller
    async fn send_frame(&self, link: LinkId, frame: &[u8]) -> Result<()>;
    /// Toggle the scan window (duty cycling)
    async fn set_scanning(&self, on: bool) -> Result<()>;
    /// Toggle advertising
    async fn set_advertising(&self, on: bool) -> Result<()>;
}

/// Everything tracked about one live link
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub link: LinkId,
    pub role: LinkRole,
    pub peer_id: Option<PeerId>,
    pub rssi: Option<i16>,
    pub subscribed: bool,
    pub established_at: Instant,
    /// Frame version mirrored from the last frame this neighbor sent
    pub wire_version: u8,
}

/// Index of central-role and peripheral-role links with the peer-ID
/// mapping. Holds back-references only; radios belong to the transport.
pub struct ConnectionTracker {
    links: DashMap<LinkId, LinkInfo>,
    by_peer: DashMap<PeerId, LinkId>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            links: DashMap::new(),
            by_peer: DashMap::new(),
        }
    }

    pub fn add_link(&self, link: LinkId, role: LinkRole) {
        self.links.insert(
            link,
            LinkInfo {
                link,
                role,
                peer_id: None,
                rssi: None,
                subscribed: false,
                established_at: Instant::now(),
                wire_version: PROTOCOL_VERSION_1,
            },
        );
    }

    pub fn remove_link(&self, link: LinkId) -> Option<LinkInfo> {
        let info = self.links.remove(&link).map(|(_, info)| info)?;
        if let Some(peer_id) = info.peer_id {
            // Only drop the reverse mapping if it still points at us
            if let Some(mapped) = self.by_peer.get(&peer_id).map(|entry| *entry) {
                if mapped == link {
                    self.by_peer.remove(&peer_id);
                }
            }
        }
        Some(info)
    }

    /// Associate a link with the peer ID observed on it
    pub fn map_peer(&self, link: LinkId, peer_id: PeerId) {
        if let Some(mut info) = self.links.get_mut(&link) {
            info.peer_id = Some(peer_id);
        }
        self.by_peer.insert(peer_id, link);
    }

    pub fn link_for_peer(&self, peer_id: &PeerId) -> Option<LinkId> {
        self.by_peer.get(peer_id).map(|entry| *entry)
    }

    pub fn peer_for_link(&self, link: LinkId) -> Option<PeerId> {
        self.links.get(&link).and_then(|info| info.peer_id)
    }

    pub fn set_subscribed(&self, link: LinkId) {
        if let Some(mut info) = self.links.get_mut(&link) {
            info.subscribed = true;
        }
    }

    pub fn set_rssi(&self, link: LinkId, rssi: i16) {
        if let Some(mut info) = self.links.get_mut(&link) {
            info.rssi = Some(rssi);
        }
    }

    /// Record the frame version a neighbor last used so replies mirror it
    pub fn note_wire_version(&self, link: LinkId, version: u8) {
        if let Some(mut info) = self.links.get_mut(&link) {
            info.wire_version = version;
        }
    }

    pub fn wire_version(&self, link: LinkId) -> u8 {
        self.links
            .get(&link)
            .map(|info| info.wire_version)
            .unwrap_or(PROTOCOL_VERSION_1)
    }

    /// Links eligible for a fanout write: connected peripherals, plus
    /// subscribed centrals
    pub fn writable_links(&self) -> Vec<LinkInfo> {
        self.links
            .iter()
            .filter(|entry| match entry.role {
                LinkRole::Central => true,
                LinkRole::Peripheral => entry.subscribed,
            })
            .map(|entry| entry.clone())
            .collect()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn links_snapshot(&self) -> Vec<LinkInfo> {
        self.links.iter().map(|entry| entry.clone()).collect()
    }

    pub fn clear(&self) {
        self.links.clear();
        self.by_peer.clear();
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience alias for the event channel transports write into
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_mapping_round_trip() {
        let tracker = ConnectionTracker::new();
        tracker.add_link(1, LinkRole::Central);
        tracker.map_peer(1, [7u8; 8]);
        assert_eq!(tracker.link_for_peer(&[7u8; 8]), Some(1));
        assert_eq!(tracker.peer_for_link(1), Some([7u8; 8]));

        tracker.remove_link(1);
        assert_eq!(tracker.link_for_peer(&[7u8; 8]), None);
    }

    #[test]
    fn stale_reverse_mapping_survives_newer_link() {
        let tracker = ConnectionTracker::new();
        tracker.add_link(1, LinkRole::Central);
        tracker.map_peer(1, [7u8; 8]);
        // Peer reconnects on a new link before the old one is reaped
        tracker.add_link(2, LinkRole::Central);
        tracker.map_peer(2, [7u8; 8]);

        tracker.remove_link(1);
        assert_eq!(tracker.link_for_peer(&[7u8; 8]), Some(2));
    }

    #[test]
    fn writable_links_respect_subscription() {
        let tracker = ConnectionTracker::new();
        tracker.add_link(1, LinkRole::Central);
        tracker.add_link(2, LinkRole::Peripheral);
        tracker.add_link(3, LinkRole::Peripheral);
        tracker.set_subscribed(3);

        let writable: Vec<LinkId> = tracker.writable_links().iter().map(|l| l.link).collect();
        assert!(writable.contains(&1));
        assert!(!writable.contains(&2));
        assert!(writable.contains(&3));
    }

    #[test]
    fn wire_version_mirrors_neighbor() {
        let tracker = ConnectionTracker::new();
        tracker.add_link(1, LinkRole::Central);
        assert_eq!(tracker.wire_version(1), PROTOCOL_VERSION_1);
        tracker.note_wire_version(1, 2);
        assert_eq!(tracker.wire_version(1), 2);
    }
}
