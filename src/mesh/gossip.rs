//! Gossip-based anti-entropy sync
//!
//! Keeps bounded per-class stores of recently seen packets, summarizes
//! their IDs as a GCS filter inside REQUEST_SYNC, and answers incoming
//! requests with every fresh candidate the requester's filter misses.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tokio::sync::RwLock;
use tracing::debug;

use super::gcs::{GcsFilter, DEFAULT_GCS_M, DEFAULT_GCS_P};
use crate::error::{Error, Result};
use crate::protocol::{now_ms, BitchatPacket, MessageType, PeerId};

/// Schedules and bounds for the sync engine
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Entries older than this are neither stored nor served
    pub max_message_age: Duration,
    pub message_interval: Duration,
    pub fragment_interval: Duration,
    pub file_transfer_interval: Duration,
    pub maintenance_interval: Duration,
    /// Delay before the round that follows a new link
    pub on_connect_delay: Duration,
    pub filter_byte_cap: usize,
    pub gcs_p: u8,
    pub gcs_m: u32,
    pub max_messages: usize,
    pub max_fragments: usize,
    pub max_file_transfers: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            max_message_age: Duration::from_secs(15 * 60),
            message_interval: Duration::from_secs(15),
            fragment_interval: Duration::from_secs(30),
            file_transfer_interval: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(30),
            on_connect_delay: Duration::from_secs(5),
            filter_byte_cap: 400,
            gcs_p: DEFAULT_GCS_P,
            gcs_m: DEFAULT_GCS_M,
            max_messages: 500,
            max_fragments: 500,
            max_file_transfers: 100,
        }
    }
}

/// REQUEST_SYNC payload: Golomb parameter, modulus, filter bytes and the
/// class bitmap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSyncPayload {
    pub p: u8,
    pub m: u32,
    pub filter: Vec<u8>,
    pub type_bitmap: u64,
}

impl RequestSyncPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.filter.len() > u16::MAX as usize {
            return Err(Error::SizeExceeded("sync filter".into()));
        }
        let mut buffer = Vec::with_capacity(15 + self.filter.len());
        buffer.push(self.p);
        let mut scratch = [0u8; 8];
        BigEndian::write_u32(&mut scratch[..4], self.m);
        buffer.extend_from_slice(&scratch[..4]);
        BigEndian::write_u16(&mut scratch[..2], self.filter.len() as u16);
        buffer.extend_from_slice(&scratch[..2]);
        buffer.extend_from_slice(&self.filter);
        BigEndian::write_u64(&mut scratch, self.type_bitmap);
        buffer.extend_from_slice(&scratch);
        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 7 {
            return Err(Error::Malformed("sync payload too short".into()));
        }
        let p = data[0];
        let m = BigEndian::read_u32(&data[1..5]);
        let filter_len = BigEndian::read_u16(&data[5..7]) as usize;
        if data.len() < 7 + filter_len + 8 {
            return Err(Error::Malformed("sync payload truncated".into()));
        }
        let filter = data[7..7 + filter_len].to_vec();
        let type_bitmap = BigEndian::read_u64(&data[7 + filter_len..7 + filter_len + 8]);
        Ok(Self {
            p,
            m,
            filter,
            type_bitmap,
        })
    }
}

#[derive(Debug, Clone)]
struct StoredPacket {
    packet: BitchatPacket,
    id: [u8; 32],
    stored_at_ms: u64,
}

#[derive(Default)]
struct SyncStore {
    /// Latest announcement per sender
    announcements: HashMap<PeerId, StoredPacket>,
    messages: VecDeque<StoredPacket>,
    fragments: VecDeque<StoredPacket>,
    file_transfers: VecDeque<StoredPacket>,
}

/// The gossip sync engine
pub struct GossipSync {
    config: GossipConfig,
    store: RwLock<SyncStore>,
}

impl GossipSync {
    pub fn new(config: GossipConfig) -> Self {
        Self {
            config,
            store: RwLock::new(SyncStore::default()),
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    fn is_fresh(&self, timestamp_ms: u64) -> bool {
        let age_limit = self.config.max_message_age.as_millis() as u64;
        now_ms().saturating_sub(timestamp_ms) <= age_limit
    }

    /// Admit a packet into its class store. Stale packets and classes that
    /// are not synced are ignored.
    pub async fn insert(&self, packet: &BitchatPacket) {
        if !self.is_fresh(packet.timestamp) {
            return;
        }
        let stored = StoredPacket {
            packet: packet.clone(),
            id: packet.packet_id(),
            stored_at_ms: now_ms(),
        };

        let mut store = self.store.write().await;
        match packet.packet_type {
            MessageType::Announce => {
                store.announcements.insert(packet.sender_id, stored);
            }
            MessageType::Message => {
                push_bounded(&mut store.messages, stored, self.config.max_messages);
            }
            MessageType::Fragment => {
                push_bounded(&mut store.fragments, stored, self.config.max_fragments);
            }
            MessageType::FileTransfer => {
                push_bounded(&mut store.file_transfers, stored, self.config.max_file_transfers);
            }
            _ => {}
        }
    }

    /// Drop a departing peer's announcement
    pub async fn remove_peer(&self, peer: &PeerId) {
        self.store.write().await.announcements.remove(peer);
    }

    /// Build a REQUEST_SYNC payload summarizing what we already hold for
    /// the classes in `type_bitmap`.
    pub async fn build_request(&self, type_bitmap: u64) -> Result<Vec<u8>> {
        let store = self.store.read().await;
        let ids: Vec<[u8; 32]> = self
            .candidates(&store, type_bitmap)
            .map(|stored| stored.id)
            .collect();
        drop(store);

        let filter = GcsFilter::build(
            &ids,
            self.config.gcs_p,
            self.config.gcs_m,
            self.config.filter_byte_cap,
        );
        if filter.len() < ids.len() {
            debug!(
                dropped = ids.len() - filter.len(),
                "sync filter capped, remainder covered next round"
            );
        }
        RequestSyncPayload {
            p: self.config.gcs_p,
            m: self.config.gcs_m,
            filter: filter.to_bytes(),
            type_bitmap,
        }
        .encode()
    }

    /// Answer a REQUEST_SYNC: every fresh candidate of a requested class
    /// whose ID the peer's filter does not contain.
    pub async fn handle_request(&self, payload: &[u8]) -> Result<Vec<BitchatPacket>> {
        let request = RequestSyncPayload::decode(payload)?;
        let filter = GcsFilter::from_bytes(request.p, request.m, &request.filter)?;

        let store = self.store.read().await;
        let missing: Vec<BitchatPacket> = self
            .candidates(&store, request.type_bitmap)
            .filter(|stored| self.is_fresh(stored.packet.timestamp))
            .filter(|stored| !filter.contains(&stored.id))
            .map(|stored| stored.packet.clone())
            .collect();
        Ok(missing)
    }

    fn candidates<'a>(
        &self,
        store: &'a SyncStore,
        type_bitmap: u64,
    ) -> impl Iterator<Item = &'a StoredPacket> {
        let want = |message_type: MessageType| type_bitmap & (1 << message_type.sync_bit()) != 0;
        let announcements = want(MessageType::Announce)
            .then(|| store.announcements.values())
            .into_iter()
            .flatten();
        let messages = want(MessageType::Message)
            .then(|| store.messages.iter())
            .into_iter()
            .flatten();
        let fragments = want(MessageType::Fragment)
            .then(|| store.fragments.iter())
            .into_iter()
            .flatten();
        let files = want(MessageType::FileTransfer)
            .then(|| store.file_transfers.iter())
            .into_iter()
            .flatten();
        announcements.chain(messages).chain(fragments).chain(files)
    }

    /// Expire entries past the freshness window
    pub async fn sweep(&self) {
        let age_limit = self.config.max_message_age.as_millis() as u64;
        let cutoff = now_ms().saturating_sub(age_limit);
        let mut store = self.store.write().await;
        let store = &mut *store;
        store
            .announcements
            .retain(|_, stored| stored.stored_at_ms >= cutoff);
        for queue in [
            &mut store.messages,
            &mut store.fragments,
            &mut store.file_transfers,
        ] {
            queue.retain(|stored| stored.stored_at_ms >= cutoff);
        }
    }

    pub async fn clear(&self) {
        *self.store.write().await = SyncStore::default();
    }
}

fn push_bounded(queue: &mut VecDeque<StoredPacket>, stored: StoredPacket, bound: usize) {
    // Duplicate IDs come back through sync responses; keep one copy
    if queue.iter().any(|existing| existing.id == stored.id) {
        return;
    }
    queue.push_back(stored);
    while queue.len() > bound {
        queue.pop_front();
    }
}

/// Bitmap requesting every synced class
pub fn all_classes_bitmap() -> u64 {
    [
        MessageType::Announce,
        MessageType::Message,
        MessageType::Fragment,
        MessageType::FileTransfer,
    ]
    .iter()
    .fold(0u64, |bitmap, t| bitmap | (1 << t.sync_bit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: u8, timestamp: u64) -> BitchatPacket {
        let mut packet =
            BitchatPacket::new(MessageType::Message, [n; 8], format!("m{}", n).into_bytes());
        packet.timestamp = timestamp;
        packet
    }

    #[tokio::test]
    async fn request_response_covers_missing_packets() {
        let server = GossipSync::new(GossipConfig::default());
        let client = GossipSync::new(GossipConfig::default());

        let now = now_ms();
        let known = message(1, now);
        let missing_a = message(2, now);
        let missing_b = message(3, now);

        client.insert(&known).await;
        for packet in [&known, &missing_a, &missing_b] {
            server.insert(packet).await;
        }

        let request = client.build_request(all_classes_bitmap()).await.unwrap();
        let response = server.handle_request(&request).await.unwrap();

        let ids: Vec<[u8; 32]> = response.iter().map(|p| p.packet_id()).collect();
        assert!(ids.contains(&missing_a.packet_id()));
        assert!(ids.contains(&missing_b.packet_id()));
        assert!(!ids.contains(&known.packet_id()));
    }

    #[tokio::test]
    async fn stale_packets_not_served() {
        let server = GossipSync::new(GossipConfig::default());
        let stale = message(1, now_ms() - 16 * 60 * 1000);
        server.insert(&stale).await;

        let client = GossipSync::new(GossipConfig::default());
        let request = client.build_request(all_classes_bitmap()).await.unwrap();
        assert!(server.handle_request(&request).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bitmap_filters_classes() {
        let server = GossipSync::new(GossipConfig::default());
        let now = now_ms();
        server.insert(&message(1, now)).await;
        let mut file = BitchatPacket::new(MessageType::FileTransfer, [9; 8], vec![1, 2, 3]);
        file.timestamp = now;
        server.insert(&file).await;

        let client = GossipSync::new(GossipConfig::default());
        let only_files = 1u64 << MessageType::FileTransfer.sync_bit();
        let request = client.build_request(only_files).await.unwrap();
        let response = server.handle_request(&request).await.unwrap();
        assert_eq!(response.len(), 1);
        assert_eq!(response[0].packet_type, MessageType::FileTransfer);
    }

    #[tokio::test]
    async fn announcements_keyed_by_sender() {
        let gossip = GossipSync::new(GossipConfig::default());
        let now = now_ms();
        let mut first = BitchatPacket::new(MessageType::Announce, [5; 8], b"v1".to_vec());
        first.timestamp = now;
        let mut second = BitchatPacket::new(MessageType::Announce, [5; 8], b"v2".to_vec());
        second.timestamp = now + 1;
        gossip.insert(&first).await;
        gossip.insert(&second).await;

        let client = GossipSync::new(GossipConfig::default());
        let request = client.build_request(all_classes_bitmap()).await.unwrap();
        let response = gossip.handle_request(&request).await.unwrap();
        assert_eq!(response.len(), 1);
        assert_eq!(response[0].payload, b"v2");
    }

    #[tokio::test]
    async fn store_bound_holds() {
        let config = GossipConfig {
            max_messages: 5,
            ..GossipConfig::default()
        };
        let gossip = GossipSync::new(config);
        let now = now_ms();
        for n in 0..20u8 {
            let mut packet =
                BitchatPacket::new(MessageType::Message, [n; 8], vec![n]);
            packet.timestamp = now;
            gossip.insert(&packet).await;
        }
        assert_eq!(gossip.store.read().await.messages.len(), 5);
    }

    #[tokio::test]
    async fn sweep_expires_entries() {
        let gossip = GossipSync::new(GossipConfig::default());
        let fresh = message(1, now_ms());
        gossip.insert(&fresh).await;
        // Backdate the stored-at stamp past the window
        {
            let mut store = gossip.store.write().await;
            for stored in store.messages.iter_mut() {
                stored.stored_at_ms = now_ms() - 16 * 60 * 1000;
            }
        }
        gossip.sweep().await;
        assert!(gossip.store.read().await.messages.is_empty());
    }

    #[test]
    fn sync_payload_round_trip() {
        let payload = RequestSyncPayload {
            p: 7,
            m: 128,
            filter: vec![1, 2, 3, 4],
            type_bitmap: 0b1010_0011,
        };
        let decoded = RequestSyncPayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }
}
