//! Noise session management for BitChat
//!
//! Tracks one Noise XX session per peer: handshake orchestration with a
//! deterministic tie-break, AEAD transport for the tagged payload
//! envelope, sliding-window rate limits and the age/count rekey policy.

pub mod noise;
pub mod rate_limit;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::crypto::StaticKeypair;
use crate::error::{Error, Result};
use crate::protocol::tlv::NoisePayload;
use crate::protocol::{short_id, PeerId};
use noise::NoiseSession;
use rate_limit::SlidingWindow;

/// First XX message: one uncloaked ephemeral key, no payload
const XX_MESSAGE_1_LEN: usize = 32;

/// Session limits and rate caps (defaults per protocol policy)
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub per_peer_handshakes_per_minute: usize,
    pub per_peer_messages_per_second: usize,
    pub global_handshakes_per_minute: usize,
    pub global_messages_per_second: usize,
    pub max_session_age: Duration,
    pub max_messages_per_session: u64,
    pub rekey_hint_fraction: f64,
    pub handshake_timeout: Duration,
    pub max_transport_message: usize,
    pub max_handshake_message: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            per_peer_handshakes_per_minute: 10,
            per_peer_messages_per_second: 100,
            global_handshakes_per_minute: 30,
            global_messages_per_second: 500,
            max_session_age: Duration::from_secs(24 * 60 * 60),
            max_messages_per_session: 1_000_000_000,
            rekey_hint_fraction: 0.9,
            handshake_timeout: Duration::from_secs(60),
            max_transport_message: 64 * 1024,
            max_handshake_message: 2 * 1024,
        }
    }
}

/// Observable session phase for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    None,
    Initiated,
    Responded,
    Established,
}

/// Result of feeding one handshake message to the manager
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// Reply to send back to the peer, if the pattern calls for one
    pub response: Option<Vec<u8>>,
    /// Both transport keys are ready
    pub established: bool,
    /// Remote static key proven during XX (set when established)
    pub remote_static: Option<[u8; 32]>,
}

struct PeerLimiter {
    handshakes: SlidingWindow,
    messages: SlidingWindow,
}

/// Owns every live Noise session. Encrypt/decrypt serialize per peer and
/// run in parallel across peers.
pub struct NoiseSessionManager {
    local_peer_id: PeerId,
    static_keypair: StaticKeypair,
    limits: SessionLimits,
    sessions: RwLock<HashMap<PeerId, Arc<Mutex<NoiseSession>>>>,
    limiters: Mutex<HashMap<PeerId, Arc<PeerLimiter>>>,
    global_handshakes: SlidingWindow,
    global_messages: SlidingWindow,
}

impl NoiseSessionManager {
    pub fn new(local_peer_id: PeerId, static_keypair: StaticKeypair, limits: SessionLimits) -> Self {
        let global_handshakes =
            SlidingWindow::new(limits.global_handshakes_per_minute, Duration::from_secs(60));
        let global_messages =
            SlidingWindow::new(limits.global_messages_per_second, Duration::from_secs(1));
        Self {
            local_peer_id,
            static_keypair,
            limits,
            sessions: RwLock::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
            global_handshakes,
            global_messages,
        }
    }

    /// Tie-break for symmetric XX: the lexicographically lower peer ID
    /// initiates.
    pub fn should_initiate(&self, peer: &PeerId) -> bool {
        self.local_peer_id < *peer
    }

    /// Start a handshake towards `peer`, returning message 1
    pub async fn initiate_handshake(&self, peer: PeerId) -> Result<Vec<u8>> {
        self.admit_handshake(&peer)?;

        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get(&peer) {
            // Re-initiating over an established session is the rekey path;
            // a handshake already in flight must not be clobbered
            if entry.lock().is_handshaking() {
                return Err(Error::InvalidState(format!(
                    "handshake with {} already in progress",
                    short_id(&peer)
                )));
            }
        }

        let mut session = NoiseSession::new_initiator(&self.static_keypair)?;
        let message = session.write_handshake_message()?;
        sessions.insert(peer, Arc::new(Mutex::new(session)));
        debug!(peer = %short_id(&peer), "handshake initiated");
        Ok(message)
    }

    /// Feed one inbound NOISE_HANDSHAKE message.
    ///
    /// Crossed initiations resolve deterministically: when both sides sent
    /// message 1, the lower peer ID keeps its initiator role and the
    /// higher side restarts as responder.
    pub async fn handle_handshake_message(
        &self,
        peer: PeerId,
        message: &[u8],
    ) -> Result<HandshakeOutcome> {
        if message.len() > self.limits.max_handshake_message {
            return Err(Error::MessageTooLarge(message.len()));
        }
        self.admit_handshake(&peer)?;

        let mut sessions = self.sessions.write().await;
        let entry = sessions.get(&peer).cloned();

        let mut created_here = false;
        let entry = match entry {
            Some(entry) => {
                let handshaking = entry.lock().is_handshaking();
                if handshaking {
                    let is_initiator =
                        entry.lock().role == noise::NoiseRole::Initiator;
                    if is_initiator && message.len() == XX_MESSAGE_1_LEN {
                        // Both sides initiated and the messages crossed
                        if self.should_initiate(&peer) {
                            debug!(peer = %short_id(&peer), "crossed handshake, keeping initiator role");
                            return Ok(HandshakeOutcome {
                                response: None,
                                established: false,
                                remote_static: None,
                            });
                        }
                        debug!(peer = %short_id(&peer), "crossed handshake, yielding to lower peer id");
                        created_here = true;
                        let fresh = Arc::new(Mutex::new(NoiseSession::new_responder(
                            &self.static_keypair,
                        )?));
                        sessions.insert(peer, fresh.clone());
                        fresh
                    } else {
                        entry
                    }
                } else {
                    // Established or terminated: the peer lost its state and
                    // is starting over
                    created_here = true;
                    let fresh = Arc::new(Mutex::new(NoiseSession::new_responder(
                        &self.static_keypair,
                    )?));
                    sessions.insert(peer, fresh.clone());
                    fresh
                }
            }
            None => {
                created_here = true;
                let fresh =
                    Arc::new(Mutex::new(NoiseSession::new_responder(&self.static_keypair)?));
                sessions.insert(peer, fresh.clone());
                fresh
            }
        };
        drop(sessions);

        // The guard never crosses an await: advance the state machine in
        // one synchronous block, clean up afterwards
        let outcome = {
            let mut session = entry.lock();
            match session.read_handshake_message(message) {
                Err(e) => Err(e),
                Ok(()) => {
                    let response = if session.is_established() {
                        // Responder finished on reading message 3
                        Ok(None)
                    } else {
                        session.write_handshake_message().map(Some)
                    };
                    response.map(|response| HandshakeOutcome {
                        response,
                        established: session.is_established(),
                        remote_static: session.remote_static(),
                    })
                }
            }
        };

        match outcome {
            Ok(outcome) => {
                if outcome.established {
                    debug!(peer = %short_id(&peer), "noise session established");
                }
                Ok(outcome)
            }
            Err(e) => {
                // A session minted for this very message must not linger
                // when the message turns out to be garbage
                if created_here {
                    self.sessions.write().await.remove(&peer);
                    return Err(e);
                }
                if message.len() != XX_MESSAGE_1_LEN {
                    return Err(e);
                }
                // The peer restarted from message 1 while we held a stale
                // exchange; answer the fresh handshake instead
                debug!(peer = %short_id(&peer), "superseding stale handshake");
                let fresh =
                    Arc::new(Mutex::new(NoiseSession::new_responder(&self.static_keypair)?));
                let outcome = {
                    let mut session = fresh.lock();
                    session.read_handshake_message(message)?;
                    let response = session.write_handshake_message()?;
                    HandshakeOutcome {
                        response: Some(response),
                        established: false,
                        remote_static: None,
                    }
                };
                self.sessions.write().await.insert(peer, fresh);
                Ok(outcome)
            }
        }
    }

    /// Encrypt a tagged envelope for `peer` over the established session
    pub async fn encrypt(&self, peer: &PeerId, payload: &NoisePayload) -> Result<Vec<u8>> {
        let plaintext = payload.encode();
        if plaintext.len() > self.limits.max_transport_message {
            return Err(Error::MessageTooLarge(plaintext.len()));
        }
        self.admit_message(peer)?;

        let entry = self.established_entry(peer).await?;
        let mut session = entry.lock();
        self.check_session_budget(peer, &session)?;
        session.encrypt(&plaintext)
    }

    /// Decrypt an inbound NOISE_ENCRYPTED payload from `peer`
    pub async fn decrypt(&self, peer: &PeerId, ciphertext: &[u8]) -> Result<NoisePayload> {
        if ciphertext.len() > self.limits.max_transport_message + 16 {
            return Err(Error::MessageTooLarge(ciphertext.len()));
        }
        self.admit_message(peer)?;

        let entry = self.established_entry(peer).await?;
        let plaintext = {
            let mut session = entry.lock();
            self.check_session_budget(peer, &session)?;
            session.decrypt(ciphertext)?
        };
        NoisePayload::decode(&plaintext)
    }

    pub async fn phase(&self, peer: &PeerId) -> SessionPhase {
        let sessions = self.sessions.read().await;
        match sessions.get(peer) {
            None => SessionPhase::None,
            Some(entry) => {
                let session = entry.lock();
                if session.is_established() {
                    SessionPhase::Established
                } else if session.is_handshaking() {
                    match session.role {
                        noise::NoiseRole::Initiator => SessionPhase::Initiated,
                        noise::NoiseRole::Responder => SessionPhase::Responded,
                    }
                } else {
                    SessionPhase::None
                }
            }
        }
    }

    pub async fn is_established(&self, peer: &PeerId) -> bool {
        self.phase(peer).await == SessionPhase::Established
    }

    pub async fn remote_static(&self, peer: &PeerId) -> Option<[u8; 32]> {
        let sessions = self.sessions.read().await;
        sessions.get(peer).and_then(|entry| entry.lock().remote_static())
    }

    /// Rekey hint: the session consumed 90 % of its message ceiling
    pub async fn rekey_recommended(&self, peer: &PeerId) -> bool {
        let threshold = (self.limits.max_messages_per_session as f64
            * self.limits.rekey_hint_fraction) as u64;
        let sessions = self.sessions.read().await;
        sessions
            .get(peer)
            .map(|entry| {
                let session = entry.lock();
                session.is_established() && session.message_count() >= threshold
            })
            .unwrap_or(false)
    }

    pub async fn remove_session(&self, peer: &PeerId) {
        if let Some(entry) = self.sessions.write().await.remove(peer) {
            entry.lock().terminate();
        }
    }

    /// Expire overage sessions and abandon overdue handshakes. Returns the
    /// affected peers so the caller can reinitiate where the tie-break
    /// favors it.
    pub async fn sweep(&self) -> Vec<PeerId> {
        let mut dropped = Vec::new();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|peer, entry| {
            let session = entry.lock();
            let keep = if session.is_handshaking() {
                if session.age() > self.limits.handshake_timeout {
                    warn!(peer = %short_id(peer), "handshake abandoned after timeout");
                    false
                } else {
                    true
                }
            } else if session.is_established() {
                if session.age() > self.limits.max_session_age {
                    debug!(peer = %short_id(peer), "session expired by age");
                    false
                } else if session.message_count() >= self.limits.max_messages_per_session {
                    debug!(peer = %short_id(peer), "session exhausted its message budget");
                    false
                } else {
                    true
                }
            } else {
                false
            };
            if !keep {
                dropped.push(*peer);
            }
            keep
        });
        dropped
    }

    pub async fn established_peers(&self) -> Vec<PeerId> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter(|(_, entry)| entry.lock().is_established())
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Panic-clear: drop every session
    pub async fn clear(&self) {
        self.sessions.write().await.clear();
        self.limiters.lock().clear();
    }

    async fn established_entry(&self, peer: &PeerId) -> Result<Arc<Mutex<NoiseSession>>> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(peer)
            .ok_or_else(|| Error::NotEstablished(short_id(peer)))?;
        if !entry.lock().is_established() {
            return Err(Error::NotEstablished(short_id(peer)));
        }
        Ok(entry.clone())
    }

    fn check_session_budget(&self, peer: &PeerId, session: &NoiseSession) -> Result<()> {
        if session.age() > self.limits.max_session_age {
            return Err(Error::SessionExpired(short_id(peer)));
        }
        if session.message_count() >= self.limits.max_messages_per_session {
            return Err(Error::SessionExhausted(short_id(peer)));
        }
        Ok(())
    }

    fn admit_handshake(&self, peer: &PeerId) -> Result<()> {
        let limiter = self.limiter(peer);
        if !limiter.handshakes.try_acquire() {
            return Err(Error::RateLimited(format!(
                "handshakes from {}",
                short_id(peer)
            )));
        }
        if !self.global_handshakes.try_acquire() {
            return Err(Error::RateLimited("global handshake budget".into()));
        }
        Ok(())
    }

    fn admit_message(&self, peer: &PeerId) -> Result<()> {
        let limiter = self.limiter(peer);
        if !limiter.messages.try_acquire() {
            return Err(Error::RateLimited(format!(
                "messages from {}",
                short_id(peer)
            )));
        }
        if !self.global_messages.try_acquire() {
            return Err(Error::RateLimited("global message budget".into()));
        }
        Ok(())
    }

    fn limiter(&self, peer: &PeerId) -> Arc<PeerLimiter> {
        let mut limiters = self.limiters.lock();
        limiters
            .entry(*peer)
            .or_insert_with(|| {
                Arc::new(PeerLimiter {
                    handshakes: SlidingWindow::new(
                        self.limits.per_peer_handshakes_per_minute,
                        Duration::from_secs(60),
                    ),
                    messages: SlidingWindow::new(
                        self.limits.per_peer_messages_per_second,
                        Duration::from_secs(1),
                    ),
                })
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tlv::NoisePayloadType;

    fn manager_pair() -> (NoiseSessionManager, NoiseSessionManager, PeerId, PeerId) {
        let alice_static = StaticKeypair::generate();
        let bob_static = StaticKeypair::generate();
        let alice_id = alice_static.peer_id();
        let bob_id = bob_static.peer_id();
        let alice = NoiseSessionManager::new(alice_id, alice_static, SessionLimits::default());
        let bob = NoiseSessionManager::new(bob_id, bob_static, SessionLimits::default());
        (alice, bob, alice_id, bob_id)
    }

    async fn establish(
        alice: &NoiseSessionManager,
        bob: &NoiseSessionManager,
        alice_id: PeerId,
        bob_id: PeerId,
    ) {
        let msg1 = alice.initiate_handshake(bob_id).await.unwrap();
        let out1 = bob.handle_handshake_message(alice_id, &msg1).await.unwrap();
        let msg2 = out1.response.unwrap();
        let out2 = alice.handle_handshake_message(bob_id, &msg2).await.unwrap();
        assert!(out2.established);
        let msg3 = out2.response.unwrap();
        let out3 = bob.handle_handshake_message(alice_id, &msg3).await.unwrap();
        assert!(out3.established);
        assert!(out3.response.is_none());
    }

    #[tokio::test]
    async fn full_handshake_and_transport() {
        let (alice, bob, alice_id, bob_id) = manager_pair();
        establish(&alice, &bob, alice_id, bob_id).await;

        assert!(alice.is_established(&bob_id).await);
        assert!(bob.is_established(&alice_id).await);

        let payload = NoisePayload::new(NoisePayloadType::PrivateMessage, b"hi".to_vec());
        let ciphertext = alice.encrypt(&bob_id, &payload).await.unwrap();
        let decrypted = bob.decrypt(&alice_id, &ciphertext).await.unwrap();
        assert_eq!(decrypted, payload);
    }

    #[tokio::test]
    async fn tie_break_is_lexicographic() {
        let (alice, _, alice_id, bob_id) = manager_pair();
        assert_eq!(alice.should_initiate(&bob_id), alice_id < bob_id);
    }

    #[tokio::test]
    async fn crossed_initiation_resolves_to_lower_id() {
        let (alice, bob, alice_id, bob_id) = manager_pair();

        // Both sides initiate; messages cross in flight
        let alice_msg1 = alice.initiate_handshake(bob_id).await.unwrap();
        let bob_msg1 = bob.initiate_handshake(alice_id).await.unwrap();

        let (lower, lower_id, higher, higher_id, lower_msg1, higher_msg1) = if alice_id < bob_id {
            (&alice, alice_id, &bob, bob_id, alice_msg1, bob_msg1)
        } else {
            (&bob, bob_id, &alice, alice_id, bob_msg1, alice_msg1)
        };

        // Lower side ignores the crossed message 1
        let out = lower
            .handle_handshake_message(higher_id, &higher_msg1)
            .await
            .unwrap();
        assert!(out.response.is_none());
        assert!(!out.established);

        // Higher side yields and answers as responder
        let out = higher
            .handle_handshake_message(lower_id, &lower_msg1)
            .await
            .unwrap();
        let msg2 = out.response.expect("responder reply");

        let out = lower.handle_handshake_message(higher_id, &msg2).await.unwrap();
        assert!(out.established);
        let msg3 = out.response.unwrap();
        let out = higher
            .handle_handshake_message(lower_id, &msg3)
            .await
            .unwrap();
        assert!(out.established);
    }

    #[tokio::test]
    async fn transport_without_session_fails() {
        let (alice, _, _, bob_id) = manager_pair();
        let payload = NoisePayload::new(NoisePayloadType::PrivateMessage, b"x".to_vec());
        assert!(matches!(
            alice.encrypt(&bob_id, &payload).await,
            Err(Error::NotEstablished(_))
        ));
        assert!(matches!(
            alice.decrypt(&bob_id, b"junk").await,
            Err(Error::NotEstablished(_))
        ));
    }

    #[tokio::test]
    async fn handshake_rate_limit_applies() {
        let static_keypair = StaticKeypair::generate();
        let local = static_keypair.peer_id();
        let limits = SessionLimits {
            per_peer_handshakes_per_minute: 2,
            ..SessionLimits::default()
        };
        let manager = NoiseSessionManager::new(local, static_keypair, limits);

        let peer = [0xEE; 8];
        let _ = manager.initiate_handshake(peer).await.unwrap();
        manager.remove_session(&peer).await;
        let _ = manager.initiate_handshake(peer).await.unwrap();
        manager.remove_session(&peer).await;
        assert!(matches!(
            manager.initiate_handshake(peer).await,
            Err(Error::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn message_rate_limit_applies() {
        let alice_static = StaticKeypair::generate();
        let bob_static = StaticKeypair::generate();
        let alice_id = alice_static.peer_id();
        let bob_id = bob_static.peer_id();
        let limits = SessionLimits {
            per_peer_messages_per_second: 3,
            ..SessionLimits::default()
        };
        let alice = NoiseSessionManager::new(alice_id, alice_static, limits);
        let bob = NoiseSessionManager::new(bob_id, bob_static, SessionLimits::default());
        establish(&alice, &bob, alice_id, bob_id).await;

        let payload = NoisePayload::new(NoisePayloadType::PrivateMessage, b"x".to_vec());
        for _ in 0..3 {
            alice.encrypt(&bob_id, &payload).await.unwrap();
        }
        assert!(matches!(
            alice.encrypt(&bob_id, &payload).await,
            Err(Error::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn oversized_transport_message_rejected() {
        let (alice, bob, alice_id, bob_id) = manager_pair();
        establish(&alice, &bob, alice_id, bob_id).await;
        let payload = NoisePayload::new(
            NoisePayloadType::FileTransfer,
            vec![0u8; 64 * 1024 + 1],
        );
        assert!(matches!(
            alice.encrypt(&bob_id, &payload).await,
            Err(Error::MessageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn session_uniqueness_one_established_per_peer() {
        let (alice, bob, alice_id, bob_id) = manager_pair();
        establish(&alice, &bob, alice_id, bob_id).await;

        // A restarted handshake from the peer replaces the old session
        // rather than coexisting with it
        let bob2_msg1 = bob.initiate_handshake(alice_id).await.unwrap();
        let out = alice
            .handle_handshake_message(bob_id, &bob2_msg1)
            .await
            .unwrap();
        assert!(out.response.is_some());
        assert_eq!(alice.established_peers().await.len(), 0);
    }
}
