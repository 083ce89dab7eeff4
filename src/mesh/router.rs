//! Type dispatch of decoded frames
//!
//! The router is the junction every inbound frame passes through:
//! dedup → addressing → per-type policy → optional reply, with relay
//! decisions for traffic that is not ours.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::deduplication::SeenSet;
use super::gossip::GossipSync;
use super::relay::RelayManager;
use super::{MeshEvent, MessageContent};
use crate::crypto;
use crate::error::{Error, Result};
use crate::identity::{AnnounceOutcome, IdentityStore};
use crate::protocol::fragmentation::FragmentAssembler;
use crate::protocol::tlv::{
    Announcement, FilePacket, NoisePayload, NoisePayloadType, PrivateMessage,
};
use crate::protocol::{
    binary, now_ms, short_id, BitchatPacket, MessageType, PeerId, ANNOUNCE_STALE_WINDOW_MS,
    DEFAULT_TTL,
};
use crate::session::NoiseSessionManager;
use crate::storage::SecureStorage;
use crate::transport::{Broadcaster, ConnectionTracker, LinkId};

pub struct MessageRouter {
    identity: Arc<IdentityStore>,
    sessions: Arc<NoiseSessionManager>,
    gossip: Arc<GossipSync>,
    seen: Arc<SeenSet>,
    relay: RelayManager,
    assembler: Mutex<FragmentAssembler>,
    broadcaster: Arc<Broadcaster>,
    tracker: Arc<ConnectionTracker>,
    storage: Arc<SecureStorage>,
    events: broadcast::Sender<MeshEvent>,
    local_peer_id: PeerId,
}

impl MessageRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<IdentityStore>,
        sessions: Arc<NoiseSessionManager>,
        gossip: Arc<GossipSync>,
        seen: Arc<SeenSet>,
        broadcaster: Arc<Broadcaster>,
        tracker: Arc<ConnectionTracker>,
        storage: Arc<SecureStorage>,
        events: broadcast::Sender<MeshEvent>,
    ) -> Self {
        let local_peer_id = identity.peer_id();
        Self {
            identity,
            sessions,
            gossip,
            seen,
            relay: RelayManager::new(),
            assembler: Mutex::new(FragmentAssembler::new()),
            broadcaster,
            tracker,
            storage,
            events,
            local_peer_id,
        }
    }

    /// Entry point for one reassembled wire frame
    pub async fn handle_frame(&self, link: LinkId, frame: &[u8]) {
        let packet = match binary::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(link, error = %e, "dropping undecodable frame");
                return;
            }
        };
        self.tracker.note_wire_version(link, packet.version);
        self.handle_packet(link, packet).await;
    }

    /// Route one decoded packet
    pub async fn handle_packet(&self, link: LinkId, packet: BitchatPacket) {
        if packet.sender_id == self.local_peer_id {
            return; // our own traffic echoed back
        }
        if !self.seen.check_and_insert(packet.packet_id()) {
            return;
        }

        let for_us = packet.is_addressed_to(&self.local_peer_id);
        let broadcast = packet.is_broadcast();

        if !for_us && !broadcast {
            // Someone else's unicast: relay only
            self.maybe_relay(link, packet).await;
            return;
        }

        if let Err(e) = self.dispatch(link, &packet).await {
            debug!(link, packet_type = ?packet.packet_type, error = %e, "packet dropped");
        }

        if broadcast {
            self.maybe_relay(link, packet).await;
        }
    }

    async fn dispatch(&self, link: LinkId, packet: &BitchatPacket) -> Result<()> {
        match packet.packet_type {
            MessageType::Announce => self.handle_announce(link, packet).await,
            MessageType::Message => self.handle_message(link, packet).await,
            MessageType::Leave => self.handle_leave(packet).await,
            MessageType::NoiseHandshake => self.handle_handshake(link, packet).await,
            MessageType::NoiseEncrypted => self.handle_encrypted(link, packet).await,
            MessageType::Fragment => self.handle_fragment(link, packet).await,
            MessageType::RequestSync => self.handle_request_sync(link, packet).await,
            MessageType::FileTransfer => self.handle_file_transfer(packet).await,
        }
    }

    async fn handle_announce(&self, link: LinkId, packet: &BitchatPacket) -> Result<()> {
        if packet.signature.is_none() {
            return Err(Error::Unverified("unsigned announce".into()));
        }
        let age = now_ms().abs_diff(packet.timestamp);
        if age > ANNOUNCE_STALE_WINDOW_MS {
            return Err(Error::Unverified(format!("stale announce ({} ms)", age)));
        }

        let announce = Announcement::decode(&packet.payload)?;
        crypto::verify_packet(packet, &announce.signing_public_key)?;

        let outcome = self
            .identity
            .record_announcement(packet.sender_id, &announce, packet.timestamp)
            .await;
        if outcome == AnnounceOutcome::Rejected {
            return Err(Error::Unverified("announce rejected".into()));
        }

        // An undegraded TTL means the frame came from the adjacent node;
        // relayed announces must not remap the ingress link
        if packet.ttl == DEFAULT_TTL {
            self.tracker.map_peer(link, packet.sender_id);
        }
        self.gossip.insert(packet).await;

        if outcome == AnnounceOutcome::NewPeer {
            let _ = self.events.send(MeshEvent::PeerFound {
                peer_id: packet.sender_id,
                nickname: announce.nickname.clone(),
            });
            let _ = self.events.send(MeshEvent::PeerListUpdated);

            // Tie-break: the lower peer ID proactively opens the session
            if self.sessions.should_initiate(&packet.sender_id)
                && !self.sessions.is_established(&packet.sender_id).await
            {
                if let Err(e) = self.initiate_handshake(packet.sender_id).await {
                    debug!(peer = %short_id(&packet.sender_id), error = %e, "proactive handshake not started");
                }
            }
        }
        Ok(())
    }

    async fn handle_message(&self, _link: LinkId, packet: &BitchatPacket) -> Result<()> {
        let record = self
            .identity
            .peer(&packet.sender_id)
            .await
            .filter(|record| record.verified)
            .ok_or_else(|| Error::Unverified(short_id(&packet.sender_id)))?;
        if self.identity.is_blocked(&record.fingerprint).await {
            debug!(peer = %short_id(&packet.sender_id), "dropping message from blocked peer");
            return Ok(());
        }

        let is_private = packet.is_addressed_to(&self.local_peer_id);
        if is_private && packet.signature.is_some() {
            crypto::verify_packet(packet, &record.signing_public_key)?;
        }

        // A chat payload is either a FilePacket TLV or raw UTF-8 text
        let content = match FilePacket::decode(&packet.payload) {
            Ok(file) => MessageContent::File {
                file_name: file.file_name,
                mime_type: file.mime_type,
                size: file.file_size,
            },
            Err(_) => {
                let text = String::from_utf8(packet.payload.clone())
                    .map_err(|_| Error::Malformed("message neither file nor UTF-8".into()))?;
                MessageContent::Text(text)
            }
        };

        if !is_private {
            self.gossip.insert(packet).await;
        }
        self.identity.touch(&packet.sender_id).await;

        let _ = self.events.send(MeshEvent::MessageReceived {
            from: packet.sender_id,
            message_id: None,
            content,
            is_private,
        });
        Ok(())
    }

    async fn handle_leave(&self, packet: &BitchatPacket) -> Result<()> {
        let peer = packet.sender_id;
        self.identity.remove_peer(&peer).await;
        self.sessions.remove_session(&peer).await;
        self.gossip.remove_peer(&peer).await;
        let _ = self.events.send(MeshEvent::PeerLost { peer_id: peer });
        let _ = self.events.send(MeshEvent::PeerListUpdated);
        Ok(())
    }

    async fn handle_handshake(&self, link: LinkId, packet: &BitchatPacket) -> Result<()> {
        // Handshakes must be explicitly addressed
        if !packet.is_addressed_to(&self.local_peer_id) {
            return Err(Error::Malformed("handshake without recipient".into()));
        }
        let peer = packet.sender_id;

        let outcome = match self
            .sessions
            .handle_handshake_message(peer, &packet.payload)
            .await
        {
            Ok(outcome) => outcome,
            Err(Error::RateLimited(what)) => {
                debug!(%what, "handshake rate limited");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(response) = outcome.response {
            let reply = BitchatPacket::new(MessageType::NoiseHandshake, self.local_peer_id, response)
                .with_recipient(peer);
            self.broadcaster.send_to_link(reply, link);
        }

        if outcome.established {
            if let Some(remote_static) = outcome.remote_static {
                if !self.cross_check_identity(peer, remote_static).await {
                    self.sessions.remove_session(&peer).await;
                    return Err(Error::Unverified(format!(
                        "noise static mismatch for {}",
                        short_id(&peer)
                    )));
                }
                if packet.ttl == DEFAULT_TTL {
                    self.tracker.map_peer(link, peer);
                }
                let fingerprint = crypto::fingerprint(&remote_static);
                let _ = self.events.send(MeshEvent::SessionEstablished {
                    peer_id: peer,
                    fingerprint,
                });
            }
        }
        Ok(())
    }

    /// The Noise static learned in XX must derive the claimed peer ID and
    /// agree with the last verified announcement.
    async fn cross_check_identity(&self, peer: PeerId, remote_static: [u8; 32]) -> bool {
        if crypto::peer_id_from_public_key(&remote_static) != peer {
            warn!(peer = %short_id(&peer), "noise static does not derive peer id");
            return false;
        }
        match self.identity.peer(&peer).await {
            Some(record) if record.noise_public_key != remote_static => {
                warn!(peer = %short_id(&peer), "noise static differs from announced key");
                false
            }
            _ => true,
        }
    }

    async fn handle_encrypted(&self, link: LinkId, packet: &BitchatPacket) -> Result<()> {
        if !packet.is_addressed_to(&self.local_peer_id) {
            return Err(Error::Malformed("encrypted payload without recipient".into()));
        }
        let peer = packet.sender_id;

        // Blocked peers are discarded before any decryption work
        if let Some(record) = self.identity.peer(&peer).await {
            if self.identity.is_blocked(&record.fingerprint).await {
                return Ok(());
            }
        }

        let payload = match self.sessions.decrypt(&peer, &packet.payload).await {
            Ok(payload) => payload,
            Err(Error::NotEstablished(_)) | Err(Error::SessionExpired(_)) => {
                // No usable session: drop, and open one if the tie-break
                // says it is on us
                if self.sessions.should_initiate(&peer) {
                    if let Err(e) = self.initiate_handshake(peer).await {
                        debug!(peer = %short_id(&peer), error = %e, "reactive handshake not started");
                    }
                }
                return Ok(());
            }
            Err(Error::RateLimited(what)) => {
                debug!(%what, "inbound ciphertext rate limited");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.identity.touch(&peer).await;
        match payload.payload_type {
            NoisePayloadType::PrivateMessage => {
                let message = PrivateMessage::decode(&payload.data)?;
                let _ = self.events.send(MeshEvent::MessageReceived {
                    from: peer,
                    message_id: Some(message.message_id.clone()),
                    content: MessageContent::Text(message.content),
                    is_private: true,
                });
                if let Some(record) = self.identity.peer(&peer).await {
                    self.identity.note_interaction(&record.fingerprint).await;
                }
                self.send_delivered_ack(peer, &message.message_id).await;
            }
            NoisePayloadType::Delivered => {
                let message_id = String::from_utf8_lossy(&payload.data).to_string();
                let _ = self.events.send(MeshEvent::Delivered {
                    message_id,
                    by: peer,
                });
            }
            NoisePayloadType::ReadReceipt => {
                let message_id = String::from_utf8_lossy(&payload.data).to_string();
                let _ = self.events.send(MeshEvent::ReadReceipt {
                    message_id,
                    by: peer,
                });
            }
            NoisePayloadType::FileTransfer => {
                let file = FilePacket::decode(&payload.data)?;
                let path = self
                    .storage
                    .save_incoming_file(&file.file_name, &file.content)
                    .await
                    .map_err(|e| {
                        warn!(error = %e, "failed to persist incoming file");
                        e
                    })?;
                let _ = self.events.send(MeshEvent::FileReceived {
                    from: peer,
                    file_name: file.file_name,
                    path,
                });
            }
        }
        Ok(())
    }

    /// Every decrypted private message is acknowledged with an encrypted
    /// DELIVERED carrying the message ID.
    async fn send_delivered_ack(&self, peer: PeerId, message_id: &str) {
        let ack = NoisePayload::new(NoisePayloadType::Delivered, message_id.as_bytes().to_vec());
        match self.sessions.encrypt(&peer, &ack).await {
            Ok(ciphertext) => {
                let packet =
                    BitchatPacket::new(MessageType::NoiseEncrypted, self.local_peer_id, ciphertext)
                        .with_recipient(peer);
                self.broadcaster.send_to_peer(packet, peer);
            }
            Err(e) => debug!(peer = %short_id(&peer), error = %e, "delivery ack not sent"),
        }
    }

    async fn handle_fragment(&self, link: LinkId, packet: &BitchatPacket) -> Result<()> {
        self.gossip.insert(packet).await;
        let reassembled = self.assembler.lock().ingest(packet)?;
        if let Some(parent) = reassembled {
            // The synthesized packet re-enters the router as if received
            Box::pin(self.handle_packet(link, parent)).await;
        }
        Ok(())
    }

    async fn handle_request_sync(&self, link: LinkId, packet: &BitchatPacket) -> Result<()> {
        let missing = self.gossip.handle_request(&packet.payload).await?;
        debug!(link, count = missing.len(), "answering sync request");
        for mut response in missing {
            // Responses go straight back to the requester and stop there
            response.ttl = 0;
            self.broadcaster.send_to_link(response, link);
        }
        Ok(())
    }

    async fn handle_file_transfer(&self, packet: &BitchatPacket) -> Result<()> {
        let file = FilePacket::decode(&packet.payload)?;
        self.gossip.insert(packet).await;
        let path = self
            .storage
            .save_incoming_file(&file.file_name, &file.content)
            .await?;
        let _ = self.events.send(MeshEvent::FileReceived {
            from: packet.sender_id,
            file_name: file.file_name,
            path,
        });
        Ok(())
    }

    /// Forward traffic that is not ours, per the adaptive relay policy
    async fn maybe_relay(&self, ingress: LinkId, mut packet: BitchatPacket) {
        let network_size = self
            .identity
            .network_size_estimate()
            .await
            .max(self.tracker.link_count());

        let Some(next_ttl) = self.relay.decide(packet.ttl, network_size) else {
            return;
        };
        packet.ttl = next_ttl;

        let skip_peer = Some(packet.sender_id);
        match packet.recipient_id {
            Some(recipient) if !packet.is_broadcast() => {
                // Try the direct neighbor first, then fan out
                let target = crate::transport::BroadcastTarget::Peer {
                    peer: recipient,
                    skip_link: Some(ingress),
                    skip_peer,
                };
                self.broadcaster.enqueue(crate::transport::BroadcastRequest {
                    packet,
                    target,
                    transfer_id: None,
                });
            }
            _ => {
                self.broadcaster.fanout(packet, Some(ingress), skip_peer);
            }
        }
    }

    /// Open a session towards `peer` and ship message 1
    pub async fn initiate_handshake(&self, peer: PeerId) -> Result<()> {
        // Without a link the first message would be lost and the session
        // state would sit initiated with no response coming
        if self.tracker.writable_links().is_empty() {
            return Err(Error::LinkFailure("no links to carry a handshake".into()));
        }
        let message = self.sessions.initiate_handshake(peer).await?;
        let packet = BitchatPacket::new(MessageType::NoiseHandshake, self.local_peer_id, message)
            .with_recipient(peer);
        self.broadcaster.send_to_peer(packet, peer);
        Ok(())
    }

    /// Timer hook: purge stale fragment groups
    pub fn sweep_fragments(&self) -> usize {
        self.assembler.lock().sweep()
    }

    /// Stop hook: drop partial reassembly state
    pub fn clear_fragments(&self) {
        self.assembler.lock().clear();
    }
}
