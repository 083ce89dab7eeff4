//! Application supervisor
//!
//! `BitchatApp` wires the subsystems together and owns the lifecycle:
//! `initialize` loads identity and storage, `start` brings up the radio
//! surface and the timer pipeline, `stop` drains and shuts down. The
//! capability API (`send`, `establish_session`, events) lives here.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::crypto;
use crate::error::{Error, Result};
use crate::identity::IdentityStore;
use crate::mesh::{GossipSync, MeshEvent, MessageRouter, SeenSet};
use crate::protocol::fragmentation::FRAGMENT_SWEEP_INTERVAL;
use crate::protocol::tlv::{Announcement, NoisePayload, NoisePayloadType, PrivateMessage};
use crate::protocol::{short_id, BitchatPacket, MessageType, PeerId};
use crate::session::NoiseSessionManager;
use crate::storage::SecureStorage;
use crate::transport::{
    Broadcaster, ConnectionTracker, ScanAdvertiseController, Transport, TransportEvent,
};

/// Arguments to `send`: a missing payload or peer ID is reported as the
/// matching capability error rather than a type error, mirroring the
/// bridged API surface.
#[derive(Debug, Default)]
pub struct SendOptions {
    pub payload: Option<Vec<u8>>,
    pub peer_id: Option<PeerId>,
}

struct OutboxEntry {
    message_id: String,
    payload: Vec<u8>,
}

struct AppCore {
    identity: Arc<IdentityStore>,
    sessions: Arc<NoiseSessionManager>,
    gossip: Arc<GossipSync>,
    seen: Arc<SeenSet>,
    tracker: Arc<ConnectionTracker>,
    broadcaster: Arc<Broadcaster>,
    router: Arc<MessageRouter>,
    scanner: Arc<ScanAdvertiseController>,
    nickname: RwLock<String>,
    outbox: tokio::sync::Mutex<HashMap<PeerId, VecDeque<OutboxEntry>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl AppCore {
    /// Signed identity announcement with the current nickname
    async fn build_announce(&self) -> Result<BitchatPacket> {
        let local = self.identity.local();
        let announce = Announcement {
            nickname: self.nickname.read().await.clone(),
            noise_public_key: local.static_keypair.public_key_bytes(),
            signing_public_key: local.signing_keypair.public_key_bytes(),
        };
        let mut packet = BitchatPacket::new(
            MessageType::Announce,
            self.identity.peer_id(),
            announce.encode()?,
        );
        crypto::sign_packet(&mut packet, &local.signing_keypair)?;
        Ok(packet)
    }
}

/// The node supervisor and public capability surface
pub struct BitchatApp {
    config: Config,
    transport: Arc<dyn Transport>,
    transport_events: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    core: RwLock<Option<Arc<AppCore>>>,
    started: AtomicBool,
    events: broadcast::Sender<MeshEvent>,
}

impl BitchatApp {
    /// Create a node over an already-constructed transport. The receiver
    /// must be the read side of the channel the transport reports into.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let (events, _) = broadcast::channel(512);
        Self {
            config,
            transport,
            transport_events: parking_lot::Mutex::new(Some(transport_events)),
            core: RwLock::new(None),
            started: AtomicBool::new(false),
            events,
        }
    }

    /// Ensure identity keys exist, open encrypted storage and wire the
    /// component graph. Idempotent.
    pub async fn initialize(&self) -> Result<PeerId> {
        if let Some(core) = self.core.read().await.as_ref() {
            return Ok(core.identity.peer_id());
        }

        let storage = Arc::new(SecureStorage::open(&self.config.data_dir).await?);
        let identity = Arc::new(IdentityStore::open(storage.clone()).await?);
        let peer_id = identity.peer_id();

        let sessions = Arc::new(NoiseSessionManager::new(
            peer_id,
            identity.local().static_keypair.clone(),
            self.config.session.clone(),
        ));
        let gossip = Arc::new(GossipSync::new(self.config.gossip.clone()));
        let seen = Arc::new(SeenSet::new(self.config.seen_capacity));
        let tracker = Arc::new(ConnectionTracker::new());
        let broadcaster = Broadcaster::spawn(self.transport.clone(), tracker.clone());
        let router = Arc::new(MessageRouter::new(
            identity.clone(),
            sessions.clone(),
            gossip.clone(),
            seen.clone(),
            broadcaster.clone(),
            tracker.clone(),
            storage.clone(),
            self.events.clone(),
        ));
        let scanner = Arc::new(ScanAdvertiseController::new(
            self.transport.clone(),
            self.config.power_mode,
        ));

        let default_nickname = format!("anon{}", &short_id(&peer_id)[..4]);
        let nickname = self
            .config
            .nickname
            .clone()
            .unwrap_or(default_nickname);

        let core = Arc::new(AppCore {
            identity,
            sessions,
            gossip,
            seen,
            tracker,
            broadcaster,
            router,
            scanner,
            nickname: RwLock::new(nickname),
            outbox: tokio::sync::Mutex::new(HashMap::new()),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });
        *self.core.write().await = Some(core);

        info!(peer_id = %short_id(&peer_id), "node initialized");
        Ok(peer_id)
    }

    pub async fn is_initialized(&self) -> bool {
        self.core.read().await.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Bring up the radio surface, timers and event pump
    pub async fn start(&self, nickname: Option<String>) -> Result<PeerId> {
        let core = self.core().await?;
        let peer_id = core.identity.peer_id();
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(peer_id);
        }

        if let Some(name) = nickname.filter(|n| !n.is_empty()) {
            *core.nickname.write().await = name;
        }

        self.transport.start().await?;
        core.scanner.start().await?;

        let pump = self
            .transport_events
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState("transport event stream consumed".into()))?;
        self.spawn_event_pump(core.clone(), pump);
        self.spawn_timers(core.clone()).await;

        // First announcement goes out immediately
        if let Ok(announce) = core.build_announce().await {
            core.broadcaster.fanout(announce, None, None);
        }

        let _ = self.events.send(MeshEvent::Started { peer_id });
        info!(peer_id = %short_id(&peer_id), "node started");
        Ok(peer_id)
    }

    /// Graceful shutdown: LEAVE, drain the broadcaster, cancel timers,
    /// persist. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let core = self.core().await?;

        // Announce departure, then let the mailbox drain it FIFO
        let leave =
            BitchatPacket::new(MessageType::Leave, core.identity.peer_id(), Vec::new());
        core.broadcaster.fanout(leave, None, None);
        core.broadcaster.close();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        for task in core.tasks.lock().drain(..) {
            task.abort();
        }
        core.scanner.stop().await?;
        self.transport.stop().await?;
        core.router.clear_fragments();
        core.seen.clear();
        if let Err(e) = core.identity.force_save().await {
            warn!(error = %e, "final save failed");
        }

        let _ = self.events.send(MeshEvent::Stopped);
        info!("node stopped");
        Ok(())
    }

    /// Send a payload: broadcast without a peer ID, encrypted with one.
    /// Without an established session the message parks in the outbox and
    /// a handshake is opened.
    pub async fn send(&self, options: SendOptions) -> Result<String> {
        let core = self.core().await?;
        if !self.is_started() {
            return Err(Error::NotStarted);
        }
        let payload = options
            .payload
            .filter(|payload| !payload.is_empty())
            .ok_or(Error::MissingPayload)?;
        let message_id = Uuid::new_v4().to_string();

        match options.peer_id {
            None => {
                let mut packet = BitchatPacket::new(
                    MessageType::Message,
                    core.identity.peer_id(),
                    payload,
                );
                crypto::sign_packet(&mut packet, &core.identity.local().signing_keypair)?;
                // Own broadcasts join the sync store so offline peers can
                // catch up through gossip
                core.gossip.insert(&packet).await;
                core.broadcaster.fanout(packet, None, None);
            }
            Some(peer) => {
                if core.sessions.is_established(&peer).await {
                    self.send_private(&core, peer, &message_id, &payload).await?;
                } else {
                    self.park_in_outbox(&core, peer, &message_id, payload).await;
                    match core.router.initiate_handshake(peer).await {
                        Ok(()) => {}
                        // Already handshaking: the outbox flushes on establishment
                        Err(Error::InvalidState(_)) => {}
                        Err(e) => debug!(peer = %short_id(&peer), error = %e, "handshake not started"),
                    }
                }
            }
        }
        Ok(message_id)
    }

    /// Open (or re-open) a Noise session with a peer
    pub async fn establish_session(&self, peer_id: Option<PeerId>) -> Result<()> {
        let core = self.core().await?;
        if !self.is_started() {
            return Err(Error::NotStarted);
        }
        let peer = peer_id.ok_or(Error::MissingPeerId)?;
        core.router.initiate_handshake(peer).await
    }

    /// Subscribe to the application event stream
    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub async fn peer_id(&self) -> Result<PeerId> {
        Ok(self.core().await?.identity.peer_id())
    }

    pub async fn fingerprint(&self) -> Result<String> {
        Ok(self.core().await?.identity.local().fingerprint.clone())
    }

    pub async fn peers(&self) -> Result<Vec<crate::identity::PeerRecord>> {
        Ok(self.core().await?.identity.peers_snapshot().await)
    }

    /// Emergency wipe: identity, favorites, sessions, dedup and sync state
    pub async fn panic_clear(&self) -> Result<()> {
        let core = self.core().await?;
        core.sessions.clear().await;
        core.seen.clear();
        core.gossip.clear().await;
        core.router.clear_fragments();
        core.identity.wipe().await?;
        warn!("panic clear completed");
        Ok(())
    }

    async fn core(&self) -> Result<Arc<AppCore>> {
        self.core
            .read()
            .await
            .clone()
            .ok_or(Error::NotInitialized)
    }

    async fn send_private(
        &self,
        core: &Arc<AppCore>,
        peer: PeerId,
        message_id: &str,
        payload: &[u8],
    ) -> Result<()> {
        let message = PrivateMessage {
            message_id: message_id.to_string(),
            content: String::from_utf8_lossy(payload).into_owned(),
        };
        let envelope = NoisePayload::new(NoisePayloadType::PrivateMessage, message.encode()?);
        let ciphertext = core.sessions.encrypt(&peer, &envelope).await?;
        let packet = BitchatPacket::new(
            MessageType::NoiseEncrypted,
            core.identity.peer_id(),
            ciphertext,
        )
        .with_recipient(peer);
        core.broadcaster.send_to_peer(packet, peer);

        if core.sessions.rekey_recommended(&peer).await {
            debug!(peer = %short_id(&peer), "session near message ceiling, rekey recommended");
        }
        Ok(())
    }

    async fn park_in_outbox(
        &self,
        core: &Arc<AppCore>,
        peer: PeerId,
        message_id: &str,
        payload: Vec<u8>,
    ) {
        let mut outbox = core.outbox.lock().await;
        let queue = outbox.entry(peer).or_default();
        queue.push_back(OutboxEntry {
            message_id: message_id.to_string(),
            payload,
        });
        while queue.len() > self.config.outbox_capacity {
            queue.pop_front();
            debug!(peer = %short_id(&peer), "outbox overflow, oldest message dropped");
        }
    }

    fn spawn_event_pump(
        &self,
        core: Arc<AppCore>,
        mut pump: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let events = self.events.clone();
        let app_core = core.clone();
        let gossip_delay = self.config.gossip.on_connect_delay;

        let handle = tokio::spawn(async move {
            while let Some(event) = pump.recv().await {
                match event {
                    TransportEvent::LinkEstablished { link, role } => {
                        app_core.tracker.add_link(link, role);
                        let _ = events.send(MeshEvent::LinkConnected { link });

                        // Introduce ourselves on the new link
                        if let Ok(announce) = app_core.build_announce().await {
                            app_core.broadcaster.send_to_link(announce, link);
                        }
                        // Anti-entropy round shortly after the link comes up
                        let core = app_core.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(gossip_delay).await;
                            let bitmap = crate::mesh::gossip::all_classes_bitmap();
                            if let Ok(payload) = core.gossip.build_request(bitmap).await {
                                let packet = BitchatPacket::new(
                                    MessageType::RequestSync,
                                    core.identity.peer_id(),
                                    payload,
                                )
                                .with_ttl(0);
                                core.broadcaster.send_to_link(packet, link);
                            }
                        });
                    }
                    TransportEvent::LinkClosed { link, reason } => {
                        debug!(link, %reason, "link closed");
                        app_core.tracker.remove_link(link);
                        let _ = events.send(MeshEvent::LinkDisconnected { link });
                    }
                    TransportEvent::FrameReceived { link, frame } => {
                        app_core.router.handle_frame(link, &frame).await;
                    }
                    TransportEvent::Subscribed { link } => {
                        app_core.tracker.set_subscribed(link);
                        if let Ok(announce) = app_core.build_announce().await {
                            app_core.broadcaster.send_to_link(announce, link);
                        }
                    }
                    TransportEvent::RssiUpdated { link, rssi } => {
                        app_core.tracker.set_rssi(link, rssi);
                        if let Some(peer_id) = app_core.tracker.peer_for_link(link) {
                            let _ = events.send(MeshEvent::RssiUpdated { peer_id, rssi });
                        }
                    }
                }
            }
        });
        core.tasks.lock().push(handle);
    }

    async fn spawn_timers(&self, core: Arc<AppCore>) {
        let mut handles = Vec::new();

        // Periodic identity announcements
        {
            let core = core.clone();
            let interval = self.config.announce_interval;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // the immediate announce already went out
                loop {
                    ticker.tick().await;
                    if let Ok(announce) = core.build_announce().await {
                        core.broadcaster.fanout(announce, None, None);
                    }
                }
            }));
        }

        // Debounced identity persistence
        {
            let core = core.clone();
            let debounce = self.config.save_debounce;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(debounce);
                loop {
                    ticker.tick().await;
                    if let Err(e) = core.identity.maybe_save().await {
                        warn!(error = %e, "debounced save failed, will retry");
                    }
                }
            }));
        }

        // Fragment reassembly sweep
        {
            let core = core.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(FRAGMENT_SWEEP_INTERVAL);
                loop {
                    ticker.tick().await;
                    let purged = core.router.sweep_fragments();
                    if purged > 0 {
                        debug!(purged, "fragment groups timed out");
                    }
                }
            }));
        }

        // Per-class gossip rounds
        let gossip = self.config.gossip.clone();
        let classes: [(std::time::Duration, u64); 3] = [
            (
                gossip.message_interval,
                (1 << MessageType::Announce.sync_bit()) | (1 << MessageType::Message.sync_bit()),
            ),
            (gossip.fragment_interval, 1 << MessageType::Fragment.sync_bit()),
            (
                gossip.file_transfer_interval,
                1 << MessageType::FileTransfer.sync_bit(),
            ),
        ];
        for (interval, bitmap) in classes {
            let core = core.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if core.tracker.link_count() == 0 {
                        continue;
                    }
                    if let Ok(payload) = core.gossip.build_request(bitmap).await {
                        let packet = BitchatPacket::new(
                            MessageType::RequestSync,
                            core.identity.peer_id(),
                            payload,
                        )
                        .with_ttl(0);
                        core.broadcaster.fanout(packet, None, None);
                    }
                }
            }));
        }

        // Gossip store maintenance
        {
            let core = core.clone();
            let interval = gossip.maintenance_interval;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    core.gossip.sweep().await;
                }
            }));
        }

        // Stale peer sweep
        {
            let core = core.clone();
            let events = self.events.clone();
            let interval = self.config.peer_sweep_interval;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let lost = core.identity.sweep_stale().await;
                    for record in &lost {
                        core.sessions.remove_session(&record.peer_id).await;
                        core.gossip.remove_peer(&record.peer_id).await;
                        let _ = events.send(MeshEvent::PeerLost {
                            peer_id: record.peer_id,
                        });
                    }
                    if !lost.is_empty() {
                        let _ = events.send(MeshEvent::PeerListUpdated);
                    }
                }
            }));
        }

        // Session expiry / abandoned handshake sweep
        {
            let core = core.clone();
            let interval = self.config.session_sweep_interval;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let dropped = core.sessions.sweep().await;
                    for peer in dropped {
                        debug!(peer = %short_id(&peer), "session dropped by sweep");
                    }
                }
            }));
        }

        // Outbox flush on establishment — the supervisor listens to its
        // own event stream
        {
            let mut receiver = self.events.subscribe();
            let this_outbox = OutboxFlusher { core: core.clone() };
            handles.push(tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(MeshEvent::SessionEstablished { peer_id, .. }) => {
                            this_outbox.flush(peer_id).await;
                        }
                        // A handshake sent before any link was up is lost;
                        // discovering the peer is the cue to try again
                        Ok(MeshEvent::PeerFound { peer_id, .. }) => {
                            this_outbox.retry_handshake(peer_id).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        core.tasks.lock().extend(handles);
    }
}

/// Flushes parked messages once a session comes up
struct OutboxFlusher {
    core: Arc<AppCore>,
}

impl OutboxFlusher {
    /// Re-open the session for a peer that has parked messages
    async fn retry_handshake(&self, peer: PeerId) {
        let has_pending = self.core.outbox.lock().await.contains_key(&peer);
        if !has_pending || self.core.sessions.is_established(&peer).await {
            return;
        }
        match self.core.router.initiate_handshake(peer).await {
            Ok(()) => {}
            Err(Error::InvalidState(_)) => {} // already handshaking
            Err(e) => debug!(peer = %short_id(&peer), error = %e, "handshake retry failed"),
        }
    }

    async fn flush(&self, peer: PeerId) {
        let entries = {
            let mut outbox = self.core.outbox.lock().await;
            outbox.remove(&peer).unwrap_or_default()
        };
        for entry in entries {
            let message = PrivateMessage {
                message_id: entry.message_id.clone(),
                content: String::from_utf8_lossy(&entry.payload).into_owned(),
            };
            let Ok(body) = message.encode() else { continue };
            let envelope = NoisePayload::new(NoisePayloadType::PrivateMessage, body);
            match self.core.sessions.encrypt(&peer, &envelope).await {
                Ok(ciphertext) => {
                    let packet = BitchatPacket::new(
                        MessageType::NoiseEncrypted,
                        self.core.identity.peer_id(),
                        ciphertext,
                    )
                    .with_recipient(peer);
                    self.core.broadcaster.send_to_peer(packet, peer);
                }
                Err(e) => {
                    warn!(peer = %short_id(&peer), error = %e, "outbox flush failed");
                    break;
                }
            }
        }
    }
}
