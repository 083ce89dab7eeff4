//! Persistent identity and peer knowledge
//!
//! Owns the static and signing keypairs (created on first start, sealed in
//! the encrypted store under stable keys), the table of announced peers,
//! favorites, verification flags and blocks. Mutations mark the store
//! dirty; a 2 s debounced saver batches persistence, with `force_save` on
//! shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::crypto::{self, SigningKeypair, StaticKeypair};
use crate::error::{Error, Result};
use crate::protocol::tlv::Announcement;
use crate::protocol::{now_ms, short_id, PeerId, ANNOUNCE_STALE_WINDOW_MS};
use crate::storage::SecureStorage;

const KEY_STATIC_PRIVATE: &str = "static_private_key";
const KEY_STATIC_PUBLIC: &str = "static_public_key";
const KEY_SIGNING_PRIVATE: &str = "signing_private_key";
const KEY_SIGNING_PUBLIC: &str = "signing_public_key";
const KEY_FAVORITES: &str = "favorites";
const KEY_IDENTITY_CACHE: &str = "identity_cache_v2";

/// This node's own keys and derived identifiers
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub static_keypair: StaticKeypair,
    pub signing_keypair: SigningKeypair,
    pub peer_id: PeerId,
    pub fingerprint: String,
}

/// Everything known about an announced peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub nickname: String,
    pub noise_public_key: [u8; 32],
    pub signing_public_key: [u8; 32],
    pub fingerprint: String,
    pub last_seen_ms: u64,
    pub verified: bool,
}

/// Favorite relationship, persisted as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteEntry {
    pub peer_noise_public_key: String,
    pub peer_nickname: String,
    pub is_favorite: bool,
    pub they_favorited_us: bool,
    pub favorited_at: u64,
    pub last_updated: u64,
}

/// Cached social identity, keyed by fingerprint in the identity cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialIdentity {
    pub nickname: String,
    pub noise_public_key: String,
    pub signing_public_key: String,
    pub first_seen: u64,
    pub last_seen: u64,
}

/// Identity cache v2 blob, AES-GCM sealed in the store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdentityCache {
    pub social_identities: HashMap<String, SocialIdentity>,
    pub nickname_index: HashMap<String, String>,
    pub verified_fingerprints: HashSet<String>,
    pub blocked_nostr_pubkeys: HashSet<String>,
    pub last_interactions: HashMap<String, u64>,
}

/// Result of applying an announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// First verified sighting of this peer
    NewPeer,
    /// Refresh of an already known peer
    Updated,
    /// Claimed peer ID does not match the offered static key, or the key
    /// changed for a known ID; state untouched
    Rejected,
}

pub struct IdentityStore {
    storage: Arc<SecureStorage>,
    local: LocalIdentity,
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
    favorites: RwLock<HashMap<String, FavoriteEntry>>,
    cache: RwLock<IdentityCache>,
    dirty: AtomicBool,
}

impl IdentityStore {
    /// Load the identity from the encrypted store, creating keys on first
    /// start.
    pub async fn open(storage: Arc<SecureStorage>) -> Result<Self> {
        let static_keypair = match storage.get(KEY_STATIC_PRIVATE).await? {
            Some(bytes) => StaticKeypair::from_secret_bytes(key_bytes(&bytes)?),
            None => {
                let keypair = StaticKeypair::generate();
                storage
                    .put(KEY_STATIC_PRIVATE, keypair.secret_key_bytes().as_ref())
                    .await?;
                storage
                    .put(KEY_STATIC_PUBLIC, &keypair.public_key_bytes())
                    .await?;
                keypair
            }
        };
        let signing_keypair = match storage.get(KEY_SIGNING_PRIVATE).await? {
            Some(bytes) => SigningKeypair::from_secret_bytes(key_bytes(&bytes)?),
            None => {
                let keypair = SigningKeypair::generate();
                storage
                    .put(KEY_SIGNING_PRIVATE, keypair.secret_key_bytes().as_ref())
                    .await?;
                storage
                    .put(KEY_SIGNING_PUBLIC, &keypair.public_key_bytes())
                    .await?;
                keypair
            }
        };

        let favorites: HashMap<String, FavoriteEntry> = match storage.get(KEY_FAVORITES).await? {
            Some(bytes) => {
                let entries: Vec<FavoriteEntry> = serde_json::from_slice(&bytes)?;
                entries
                    .into_iter()
                    .map(|e| (e.peer_noise_public_key.clone(), e))
                    .collect()
            }
            None => HashMap::new(),
        };
        let cache: IdentityCache = match storage.get(KEY_IDENTITY_CACHE).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => IdentityCache::default(),
        };

        let local = LocalIdentity {
            peer_id: static_keypair.peer_id(),
            fingerprint: static_keypair.fingerprint(),
            static_keypair,
            signing_keypair,
        };
        debug!(peer_id = %short_id(&local.peer_id), "identity loaded");

        Ok(Self {
            storage,
            local,
            peers: RwLock::new(HashMap::new()),
            favorites: RwLock::new(favorites),
            cache: RwLock::new(cache),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    pub fn peer_id(&self) -> PeerId {
        self.local.peer_id
    }

    /// Apply a signature-verified announcement. Enforces the identity
    /// binding (peer ID must be derived from the offered static key) and
    /// rejects identity drift for known IDs.
    pub async fn record_announcement(
        &self,
        sender: PeerId,
        announce: &Announcement,
        timestamp_ms: u64,
    ) -> AnnounceOutcome {
        let derived = crypto::peer_id_from_public_key(&announce.noise_public_key);
        if derived != sender {
            warn!(claimed = %short_id(&sender), "announce claims foreign peer id");
            return AnnounceOutcome::Rejected;
        }

        let fingerprint = crypto::fingerprint(&announce.noise_public_key);
        let mut peers = self.peers.write().await;
        let outcome = match peers.get(&sender) {
            Some(existing) if existing.noise_public_key != announce.noise_public_key => {
                warn!(peer = %short_id(&sender), "announce with drifted static key dropped");
                return AnnounceOutcome::Rejected;
            }
            Some(_) => AnnounceOutcome::Updated,
            None => AnnounceOutcome::NewPeer,
        };

        peers.insert(
            sender,
            PeerRecord {
                peer_id: sender,
                nickname: announce.nickname.clone(),
                noise_public_key: announce.noise_public_key,
                signing_public_key: announce.signing_public_key,
                fingerprint: fingerprint.clone(),
                last_seen_ms: timestamp_ms,
                verified: true,
            },
        );
        drop(peers);

        let mut cache = self.cache.write().await;
        let now = now_ms();
        cache
            .social_identities
            .entry(fingerprint.clone())
            .and_modify(|identity| {
                identity.nickname = announce.nickname.clone();
                identity.last_seen = now;
            })
            .or_insert_with(|| SocialIdentity {
                nickname: announce.nickname.clone(),
                noise_public_key: hex::encode(announce.noise_public_key),
                signing_public_key: hex::encode(announce.signing_public_key),
                first_seen: now,
                last_seen: now,
            });
        cache
            .nickname_index
            .insert(announce.nickname.clone(), fingerprint);
        drop(cache);
        self.mark_dirty();

        outcome
    }

    pub async fn peer(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn peer_by_fingerprint(&self, fingerprint: &str) -> Option<PeerRecord> {
        self.peers
            .read()
            .await
            .values()
            .find(|record| record.fingerprint == fingerprint)
            .cloned()
    }

    pub async fn peers_snapshot(&self) -> Vec<PeerRecord> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn touch(&self, peer_id: &PeerId) {
        if let Some(record) = self.peers.write().await.get_mut(peer_id) {
            record.last_seen_ms = now_ms();
        }
    }

    pub async fn remove_peer(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers.write().await.remove(peer_id)
    }

    /// Drop peers not heard from within the stale window; returns the
    /// removed records for Lost events.
    pub async fn sweep_stale(&self) -> Vec<PeerRecord> {
        let cutoff = now_ms().saturating_sub(ANNOUNCE_STALE_WINDOW_MS);
        let mut peers = self.peers.write().await;
        let stale: Vec<PeerId> = peers
            .values()
            .filter(|record| record.last_seen_ms < cutoff)
            .map(|record| record.peer_id)
            .collect();
        stale
            .iter()
            .filter_map(|peer_id| peers.remove(peer_id))
            .collect()
    }

    /// Peers announced within the stale window; the relay probability
    /// ladder keys off this.
    pub async fn network_size_estimate(&self) -> usize {
        let cutoff = now_ms().saturating_sub(ANNOUNCE_STALE_WINDOW_MS);
        self.peers
            .read()
            .await
            .values()
            .filter(|record| record.last_seen_ms >= cutoff)
            .count()
    }

    pub async fn set_favorite(&self, record: &PeerRecord, is_favorite: bool) {
        let key = hex::encode(record.noise_public_key);
        let now = now_ms();
        let mut favorites = self.favorites.write().await;
        favorites
            .entry(key.clone())
            .and_modify(|entry| {
                entry.is_favorite = is_favorite;
                entry.peer_nickname = record.nickname.clone();
                entry.last_updated = now;
            })
            .or_insert_with(|| FavoriteEntry {
                peer_noise_public_key: key,
                peer_nickname: record.nickname.clone(),
                is_favorite,
                they_favorited_us: false,
                favorited_at: now,
                last_updated: now,
            });
        drop(favorites);
        self.mark_dirty();
    }

    pub async fn note_they_favorited(&self, record: &PeerRecord, flagged: bool) {
        let key = hex::encode(record.noise_public_key);
        let now = now_ms();
        let mut favorites = self.favorites.write().await;
        favorites
            .entry(key.clone())
            .and_modify(|entry| {
                entry.they_favorited_us = flagged;
                entry.last_updated = now;
            })
            .or_insert_with(|| FavoriteEntry {
                peer_noise_public_key: key,
                peer_nickname: record.nickname.clone(),
                is_favorite: false,
                they_favorited_us: flagged,
                favorited_at: now,
                last_updated: now,
            });
        drop(favorites);
        self.mark_dirty();
    }

    pub async fn is_mutual_favorite(&self, record: &PeerRecord) -> bool {
        let key = hex::encode(record.noise_public_key);
        self.favorites
            .read()
            .await
            .get(&key)
            .map(|entry| entry.is_favorite && entry.they_favorited_us)
            .unwrap_or(false)
    }

    pub async fn block(&self, fingerprint: &str) {
        self.cache
            .write()
            .await
            .blocked_nostr_pubkeys
            .insert(fingerprint.to_string());
        self.mark_dirty();
    }

    pub async fn unblock(&self, fingerprint: &str) {
        self.cache
            .write()
            .await
            .blocked_nostr_pubkeys
            .remove(fingerprint);
        self.mark_dirty();
    }

    pub async fn is_blocked(&self, fingerprint: &str) -> bool {
        self.cache
            .read()
            .await
            .blocked_nostr_pubkeys
            .contains(fingerprint)
    }

    pub async fn set_verified_fingerprint(&self, fingerprint: &str) {
        self.cache
            .write()
            .await
            .verified_fingerprints
            .insert(fingerprint.to_string());
        self.mark_dirty();
    }

    pub async fn note_interaction(&self, fingerprint: &str) {
        self.cache
            .write()
            .await
            .last_interactions
            .insert(fingerprint.to_string(), now_ms());
        self.mark_dirty();
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Persist favorites and the identity cache when anything changed since
    /// the last save. The supervisor drives this from a 2 s debounce timer.
    pub async fn maybe_save(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.persist().await {
            // Retry at the next tick
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    pub async fn force_save(&self) -> Result<()> {
        self.dirty.store(false, Ordering::Release);
        self.persist().await
    }

    async fn persist(&self) -> Result<()> {
        let favorites: Vec<FavoriteEntry> =
            self.favorites.read().await.values().cloned().collect();
        self.storage
            .put(KEY_FAVORITES, &serde_json::to_vec(&favorites)?)
            .await?;
        let cache = self.cache.read().await.clone();
        self.storage
            .put(KEY_IDENTITY_CACHE, &serde_json::to_vec(&cache)?)
            .await?;
        Ok(())
    }

    /// Panic-clear: wipe keys, favorites and cached identities
    pub async fn wipe(&self) -> Result<()> {
        self.peers.write().await.clear();
        self.favorites.write().await.clear();
        *self.cache.write().await = IdentityCache::default();
        self.storage.wipe().await
    }
}

fn key_bytes(bytes: &[u8]) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| Error::Storage("stored key is not 32 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, IdentityStore) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(SecureStorage::open(dir.path()).await.unwrap());
        let identity = IdentityStore::open(storage).await.unwrap();
        (dir, identity)
    }

    fn announce_for(keypair: &StaticKeypair) -> (PeerId, Announcement) {
        let announce = Announcement {
            nickname: "peer".to_string(),
            noise_public_key: keypair.public_key_bytes(),
            signing_public_key: [9u8; 32],
        };
        (keypair.peer_id(), announce)
    }

    #[tokio::test]
    async fn identity_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(SecureStorage::open(dir.path()).await.unwrap());
        let first = IdentityStore::open(storage.clone()).await.unwrap();
        let peer_id = first.peer_id();
        drop(first);

        let second = IdentityStore::open(storage).await.unwrap();
        assert_eq!(second.peer_id(), peer_id);
    }

    #[tokio::test]
    async fn announcement_updates_peer_table() {
        let (_dir, identity) = store().await;
        let remote = StaticKeypair::generate();
        let (peer_id, announce) = announce_for(&remote);

        let outcome = identity
            .record_announcement(peer_id, &announce, now_ms())
            .await;
        assert_eq!(outcome, AnnounceOutcome::NewPeer);
        let record = identity.peer(&peer_id).await.unwrap();
        assert_eq!(record.nickname, "peer");
        assert!(record.verified);

        let outcome = identity
            .record_announcement(peer_id, &announce, now_ms())
            .await;
        assert_eq!(outcome, AnnounceOutcome::Updated);
    }

    #[tokio::test]
    async fn foreign_peer_id_rejected() {
        let (_dir, identity) = store().await;
        let remote = StaticKeypair::generate();
        let (_, announce) = announce_for(&remote);

        // Claiming someone else's ID with our key must not stick
        let outcome = identity
            .record_announcement([0x42; 8], &announce, now_ms())
            .await;
        assert_eq!(outcome, AnnounceOutcome::Rejected);
        assert!(identity.peer(&[0x42; 8]).await.is_none());
    }

    #[tokio::test]
    async fn identity_drift_rejected() {
        let (_dir, identity) = store().await;
        let remote = StaticKeypair::generate();
        let (peer_id, announce) = announce_for(&remote);
        identity
            .record_announcement(peer_id, &announce, now_ms())
            .await;

        // Same claimed ID, different static key
        let drifted = Announcement {
            noise_public_key: StaticKeypair::generate().public_key_bytes(),
            ..announce.clone()
        };
        let outcome = identity
            .record_announcement(peer_id, &drifted, now_ms())
            .await;
        assert_eq!(outcome, AnnounceOutcome::Rejected);
        let record = identity.peer(&peer_id).await.unwrap();
        assert_eq!(record.noise_public_key, announce.noise_public_key);
    }

    #[tokio::test]
    async fn favorites_round_trip_through_save() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(SecureStorage::open(dir.path()).await.unwrap());
        let identity = IdentityStore::open(storage.clone()).await.unwrap();

        let remote = StaticKeypair::generate();
        let (peer_id, announce) = announce_for(&remote);
        identity
            .record_announcement(peer_id, &announce, now_ms())
            .await;
        let record = identity.peer(&peer_id).await.unwrap();
        identity.set_favorite(&record, true).await;
        identity.note_they_favorited(&record, true).await;
        assert!(identity.is_mutual_favorite(&record).await);
        identity.force_save().await.unwrap();

        let reopened = IdentityStore::open(storage).await.unwrap();
        // Peer table is runtime state, favorites persist
        assert!(reopened.is_mutual_favorite(&record).await);
    }

    #[tokio::test]
    async fn blocks_persist() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(SecureStorage::open(dir.path()).await.unwrap());
        let identity = IdentityStore::open(storage.clone()).await.unwrap();
        identity.block("abcd").await;
        identity.force_save().await.unwrap();

        let reopened = IdentityStore::open(storage).await.unwrap();
        assert!(reopened.is_blocked("abcd").await);
    }

    #[tokio::test]
    async fn stale_sweep_removes_old_peers() {
        let (_dir, identity) = store().await;
        let remote = StaticKeypair::generate();
        let (peer_id, announce) = announce_for(&remote);
        let old = now_ms() - ANNOUNCE_STALE_WINDOW_MS - 1_000;
        identity.record_announcement(peer_id, &announce, old).await;

        assert_eq!(identity.network_size_estimate().await, 0);
        let removed = identity.sweep_stale().await;
        assert_eq!(removed.len(), 1);
        assert!(identity.peer(&peer_id).await.is_none());
    }
}
